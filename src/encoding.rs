use std::fmt;

use chardetng::EncodingDetector;
use encoding_rs::{Encoding, UTF_16BE, UTF_16LE, UTF_8, WINDOWS_1252};

/// Used when nothing better can be determined.
pub const DEFAULT_ENCODING: &Encoding = WINDOWS_1252;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodingSource {
    Bom,
    AssumedUtf8,
    Detector,
    Default,
}

impl fmt::Display for EncodingSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            EncodingSource::Bom => "bom",
            EncodingSource::AssumedUtf8 => "assumed-utf8",
            EncodingSource::Detector => "detector",
            EncodingSource::Default => "default",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone)]
pub struct EncodingDecision {
    pub encoding: &'static Encoding,
    pub source: EncodingSource,
}

#[derive(Debug, Clone)]
pub struct DecodedText {
    pub text: String,
    pub had_errors: bool,
    /// Leading byte-order mark, re-emitted verbatim when the text is written back.
    pub bom: Vec<u8>,
    pub encoding: &'static Encoding,
}

/// BOM, then clean UTF-8, then the statistical guess if it decodes
/// without errors, then [`DEFAULT_ENCODING`].
pub fn detect(bytes: &[u8]) -> EncodingDecision {
    if let Some((encoding, _)) = detect_bom(bytes) {
        return EncodingDecision {
            encoding,
            source: EncodingSource::Bom,
        };
    }

    if std::str::from_utf8(bytes).is_ok() {
        return EncodingDecision {
            encoding: UTF_8,
            source: EncodingSource::AssumedUtf8,
        };
    }

    let mut detector = EncodingDetector::new();
    detector.feed(bytes, true);
    let guess = detector.guess(None, true);
    let (_, had_errors) = guess.decode_without_bom_handling(bytes);
    if !had_errors {
        return EncodingDecision {
            encoding: guess,
            source: EncodingSource::Detector,
        };
    }

    EncodingDecision {
        encoding: DEFAULT_ENCODING,
        source: EncodingSource::Default,
    }
}

pub fn for_label(label: &str) -> Option<&'static Encoding> {
    Encoding::for_label(label.trim().as_bytes())
}

/// Decode with a known encoding, splitting off any BOM that belongs to it.
pub fn decode_with(bytes: &[u8], encoding: &'static Encoding) -> DecodedText {
    let bom_len = match detect_bom(bytes) {
        Some((bom_encoding, len)) if bom_encoding == encoding => len,
        _ => 0,
    };
    let (cow, had_errors) = encoding.decode_without_bom_handling(&bytes[bom_len..]);
    DecodedText {
        text: cow.into_owned(),
        had_errors,
        bom: bytes[..bom_len].to_vec(),
        encoding,
    }
}

pub fn decode_auto(bytes: &[u8]) -> (DecodedText, EncodingSource) {
    let decision = detect(bytes);
    (decode_with(bytes, decision.encoding), decision.source)
}

/// Encode `text` back into `decoded.encoding`, restoring its BOM.
/// encoding_rs only encodes UTF-16 as UTF-8, so those two are handled here.
pub fn encode_like(decoded: &DecodedText, text: &str) -> (Vec<u8>, bool) {
    let mut out = decoded.bom.clone();
    let encoding = decoded.encoding;
    if encoding == UTF_16LE {
        out.extend(text.encode_utf16().flat_map(|unit| unit.to_le_bytes()));
        return (out, false);
    }
    if encoding == UTF_16BE {
        out.extend(text.encode_utf16().flat_map(|unit| unit.to_be_bytes()));
        return (out, false);
    }
    let (bytes, _, had_errors) = encoding.encode(text);
    out.extend_from_slice(&bytes);
    (out, had_errors)
}

/// Split into lines, keeping each line's terminator (`\n`, `\r\n` or `\r`).
pub fn split_lines_keep_ends(text: &str) -> Vec<&str> {
    let bytes = text.as_bytes();
    let mut lines = Vec::new();
    let mut start = 0;
    let mut idx = 0;
    while idx < bytes.len() {
        match bytes[idx] {
            b'\n' => {
                lines.push(&text[start..=idx]);
                start = idx + 1;
            }
            b'\r' => {
                let end = if bytes.get(idx + 1) == Some(&b'\n') {
                    idx + 1
                } else {
                    idx
                };
                lines.push(&text[start..=end]);
                start = end + 1;
                idx = end;
            }
            _ => {}
        }
        idx += 1;
    }
    if start < bytes.len() {
        lines.push(&text[start..]);
    }
    lines
}

fn detect_bom(bytes: &[u8]) -> Option<(&'static Encoding, usize)> {
    if bytes.starts_with(&[0xEF, 0xBB, 0xBF]) {
        return Some((UTF_8, 3));
    }
    if bytes.starts_with(&[0xFF, 0xFE]) {
        return Some((UTF_16LE, 2));
    }
    if bytes.starts_with(&[0xFE, 0xFF]) {
        return Some((UTF_16BE, 2));
    }

    None
}
