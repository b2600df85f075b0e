//! Plain-text extraction from RTF documents.
//!
//! Good enough to find replacement keys in the visible text: control
//! words are dropped, `\par`/`\line` become newlines, `\'hh` escapes are
//! decoded as windows-1252, `\uN` escapes as Unicode, and the
//! non-visible destination groups (font/colour tables, `{\*...}`) are
//! skipped.

use encoding_rs::WINDOWS_1252;

const SKIPPED_DESTINATIONS: &[&str] = &[
    "fonttbl",
    "colortbl",
    "stylesheet",
    "info",
    "pict",
    "header",
    "footer",
    "listtable",
    "listoverridetable",
    "rsidtbl",
    "generator",
    "xmlnstbl",
    "themedata",
    "datastore",
];

pub fn is_rtf_path(name: &str) -> bool {
    name.rsplit_once('.')
        .map(|(_, ext)| ext.eq_ignore_ascii_case("rtf"))
        .unwrap_or(false)
}

pub fn extract_text(source: &str) -> String {
    let chars: Vec<char> = source.chars().collect();
    let mut out = String::with_capacity(source.len() / 2);
    // Per-group "skip" flag; the top entry is the current group.
    let mut skip_stack: Vec<bool> = vec![false];
    let mut pending_fallback = 0usize;
    let mut idx = 0;

    while idx < chars.len() {
        let skipping = *skip_stack.last().unwrap_or(&false);
        match chars[idx] {
            '{' => {
                skip_stack.push(skipping);
                idx += 1;
            }
            '}' => {
                if skip_stack.len() > 1 {
                    skip_stack.pop();
                }
                idx += 1;
            }
            '\\' => {
                idx += 1;
                let Some(&next) = chars.get(idx) else { break };
                if next.is_ascii_alphabetic() {
                    let start = idx;
                    while idx < chars.len() && chars[idx].is_ascii_alphabetic() {
                        idx += 1;
                    }
                    let word: String = chars[start..idx].iter().collect();
                    let num_start = idx;
                    if idx < chars.len() && (chars[idx] == '-' || chars[idx].is_ascii_digit()) {
                        idx += 1;
                        while idx < chars.len() && chars[idx].is_ascii_digit() {
                            idx += 1;
                        }
                    }
                    let param: Option<i32> = chars[num_start..idx]
                        .iter()
                        .collect::<String>()
                        .parse()
                        .ok();
                    if chars.get(idx) == Some(&' ') {
                        idx += 1;
                    }

                    if SKIPPED_DESTINATIONS.contains(&word.as_str()) {
                        if let Some(top) = skip_stack.last_mut() {
                            *top = true;
                        }
                        continue;
                    }
                    if skipping {
                        continue;
                    }
                    match word.as_str() {
                        "par" | "line" | "sect" | "page" => out.push('\n'),
                        "tab" => out.push('\t'),
                        "uc" => pending_fallback = 0,
                        "u" => {
                            if let Some(code) = param {
                                let code = if code < 0 { code + 65536 } else { code };
                                if let Some(ch) = char::from_u32(code as u32) {
                                    out.push(ch);
                                }
                                pending_fallback = 1;
                            }
                        }
                        _ => {}
                    }
                } else {
                    idx += 1;
                    match next {
                        '*' => {
                            if let Some(top) = skip_stack.last_mut() {
                                *top = true;
                            }
                        }
                        '\'' => {
                            let hex: String = chars.iter().skip(idx).take(2).collect();
                            idx += hex.len();
                            if skipping {
                                continue;
                            }
                            if pending_fallback > 0 {
                                pending_fallback -= 1;
                                continue;
                            }
                            if let Ok(byte) = u8::from_str_radix(&hex, 16) {
                                let (decoded, _) = WINDOWS_1252
                                    .decode_without_bom_handling(std::slice::from_ref(&byte));
                                out.push_str(&decoded);
                            }
                        }
                        '\\' | '{' | '}' if !skipping => out.push(next),
                        '~' if !skipping => out.push('\u{00A0}'),
                        '\n' | '\r' if !skipping => out.push('\n'),
                        _ => {}
                    }
                }
            }
            '\n' | '\r' => idx += 1,
            ch => {
                idx += 1;
                if skipping {
                    continue;
                }
                if pending_fallback > 0 {
                    pending_fallback -= 1;
                    continue;
                }
                out.push(ch);
            }
        }
    }

    out
}
