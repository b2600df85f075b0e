use unicode_normalization::UnicodeNormalization;
use unicode_normalization::char::is_combining_mark;

/// Canonical form used for keys and for deciding whether a name or line
/// could contain a key: control characters removed, diacritics stripped,
/// result recomposed to NFC.
pub fn searchable_form(text: &str) -> String {
    let without_control: String = text.chars().filter(|ch| !is_control_char(*ch)).collect();
    strip_diacritics(&without_control)
}

pub fn strip_diacritics(text: &str) -> String {
    text.nfd()
        .filter(|ch| !is_combining_mark(*ch))
        .nfc()
        .collect()
}

fn is_control_char(ch: char) -> bool {
    ch.is_control() || is_zero_width_char(ch)
}

fn is_zero_width_char(ch: char) -> bool {
    matches!(ch, '\u{200B}' | '\u{200C}' | '\u{200D}' | '\u{FEFF}')
}
