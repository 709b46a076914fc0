//! Phone number extraction from the free text of a claim file.
//!
//! Sections are searched in priority order: manual observations, the claim
//! description, then the two structured phone fields. Only mobile numbers are
//! returned: Spanish numbers as 9 national digits, foreign ones as `+digits`
//! once the numbering plan of their country code types them as mobile.

use regex::Regex;
use std::sync::LazyLock;

const FREE_TEXT_SECTIONS: [&str; 2] = ["OBSERVACIONES MANUALES:", "DESCRIPCION:"];
const PHONE_FIELDS: [&str; 2] = ["TELEF-1", "TELEF-2"];
const SECTION_WINDOW: usize = 400;

static PHONE_CANDIDATE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:\+|00)?\s*\d[\d\s().,\-]{6,}\d").expect("valid regex"));

// Table headers and separators that end a free-text section.
static SECTION_END: LazyLock<[Regex; 3]> = LazyLock::new(|| {
    [
        Regex::new(r"\n\s*-{10,}\s*\n").expect("valid regex"),
        Regex::new(r"(?i)\n\s*SINIESTROS\s*\n").expect("valid regex"),
        Regex::new(r"(?i)\n\s*NUMERO\s+FECHA\s+RESERVA\s+").expect("valid regex"),
    ]
});

static HOUR_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bHORA\b").expect("valid regex"));

static PHONE_FIELD: LazyLock<[Regex; 2]> = LazyLock::new(|| {
    PHONE_FIELDS.map(|field| {
        Regex::new(&format!(
            r"(?i){}\s*:?\s*([+0-9][0-9\s().,\-]{{6,}})",
            regex::escape(field)
        ))
        .expect("valid regex")
    })
});

pub fn extract_phone(text: &str) -> Option<String> {
    if text.trim().is_empty() {
        return None;
    }
    for label in FREE_TEXT_SECTIONS {
        if let Some(phone) = search_section(text, label) {
            tracing::debug!(section = label, "Phone found");
            return Some(phone);
        }
    }
    for (field, pattern) in PHONE_FIELDS.iter().zip(PHONE_FIELD.iter()) {
        if let Some(phone) = search_field(text, pattern) {
            tracing::debug!(section = field, "Phone found");
            return Some(phone);
        }
    }
    None
}

fn search_section(text: &str, label: &str) -> Option<String> {
    let start = text.rfind(label)? + label.len();
    let mut chunk = &text[start..];

    if let Some(cut) = SECTION_END
        .iter()
        .filter_map(|re| re.find(chunk).map(|m| m.start()))
        .min()
    {
        chunk = &chunk[..cut];
    }
    first_mobile(truncate_chars(chunk, SECTION_WINDOW))
}

fn search_field(text: &str, pattern: &Regex) -> Option<String> {
    let value = pattern.captures(text)?.get(1)?.as_str();
    let value = HOUR_MARKER.split(value).next().unwrap_or(value).trim();
    first_mobile(value)
}

fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

fn first_mobile(text: &str) -> Option<String> {
    PHONE_CANDIDATE
        .find_iter(text)
        .filter_map(|m| normalize_phone(m.as_str()))
        .find(|phone| is_mobile(phone))
}

fn digits_only(text: &str) -> String {
    text.chars().filter(char::is_ascii_digit).collect()
}

/// Normalizes a raw candidate. Spanish numbers come back as 9 digits,
/// foreign ones as `+` followed by 8-15 digits.
pub fn normalize_phone(raw: &str) -> Option<String> {
    let mut s = raw.replace('\u{a0}', " ").trim().to_string();
    if s.is_empty() {
        return None;
    }

    // The portal writes Spanish numbers as "00" + 9 digits without a country code.
    if let Some(rest) = s.strip_prefix("00") {
        let rest_digits = digits_only(rest);
        if rest_digits.len() == 9 && rest_digits.starts_with(['6', '7', '8', '9']) {
            return Some(rest_digits);
        }
        s = format!("+{rest_digits}");
    }

    if let Some(rest) = s.strip_prefix('+') {
        let digits = digits_only(rest);
        return (8..=15).contains(&digits.len()).then(|| format!("+{digits}"));
    }

    let mut digits = digits_only(&s);
    if digits.is_empty() {
        return None;
    }
    if digits.len() == 10 && digits.starts_with('0') && digits[1..].starts_with(['6', '7', '8', '9']) {
        digits.remove(0);
    }
    if digits.len() == 11 && digits.starts_with("34") && digits[2..].starts_with(['6', '7', '8', '9']) {
        return Some(digits[2..].to_string());
    }
    if digits.len() == 9 {
        return Some(digits);
    }
    if (8..=15).contains(&digits.len()) {
        return Some(format!("+{digits}"));
    }
    None
}

/// Spanish national numbers are mobiles when they start with 6 or 7.
/// `+` numbers must be valid and typed mobile (or ambiguous fixed/mobile)
/// in the numbering plan of their country code.
pub fn is_mobile(normalized: &str) -> bool {
    if !normalized.starts_with('+') {
        return normalized.len() == 9 && normalized.starts_with(['6', '7']);
    }
    let Ok(number) = phonenumber::parse(None, normalized) else {
        return false;
    };
    phonenumber::is_valid(&number)
        && matches!(
            number.number_type(&phonenumber::metadata::DATABASE),
            phonenumber::Type::Mobile | phonenumber::Type::FixedLineOrMobile
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_spanish_variants() {
        assert_eq!(normalize_phone("600 111 222").as_deref(), Some("600111222"));
        assert_eq!(normalize_phone("0600111222").as_deref(), Some("600111222"));
        assert_eq!(normalize_phone("34600111222").as_deref(), Some("600111222"));
        assert_eq!(normalize_phone("00685789868").as_deref(), Some("685789868"));
        assert_eq!(normalize_phone("00 912 345 678").as_deref(), Some("912345678"));
    }

    #[test]
    fn keeps_international_numbers() {
        assert_eq!(normalize_phone("+34600111222").as_deref(), Some("+34600111222"));
        assert_eq!(normalize_phone("0049 151 2345 6789").as_deref(), Some("+4915123456789"));
        assert_eq!(normalize_phone("+12"), None);
    }

    #[test]
    fn landlines_are_not_mobiles() {
        assert!(is_mobile("600111222"));
        assert!(is_mobile("712345678"));
        assert!(!is_mobile("912345678"));
        assert!(is_mobile("+34600111222"));
        assert!(!is_mobile("+34912345678"));
    }

    #[test]
    fn foreign_numbers_are_checked_against_their_numbering_plan() {
        assert!(is_mobile("+4915123456789"));
        assert!(!is_mobile("+99912345678"));
    }

    #[test]
    fn international_landline_falls_through_to_phone_field() {
        let text = "OBSERVACIONES MANUALES: fijo +34 912 345 678\nTELEF-1: 611222333";
        assert_eq!(extract_phone(text).as_deref(), Some("611222333"));
    }

    #[test]
    fn manual_observations_win_over_phone_fields() {
        let text = "TELEF-1: 611 222 333\n\
                    DESCRIPCION: daños por agua\n\
                    OBSERVACIONES MANUALES: llamar al 622.333.444 por la tarde\n";
        assert_eq!(extract_phone(text).as_deref(), Some("622333444"));
    }

    #[test]
    fn description_section_stops_at_claims_table() {
        let text = "DESCRIPCION: sin datos de contacto\n\
                    SINIESTROS\n\
                    657356095 01/03/2024 600111222\n\
                    TELEF-1: 633444555 HORA 10:00\n";
        assert_eq!(extract_phone(text).as_deref(), Some("633444555"));
    }

    #[test]
    fn phone_field_ignores_trailing_hour() {
        let text = "TELEF-1:00685789868 HORA 12:30\nTELEF-2: 699000111";
        assert_eq!(extract_phone(text).as_deref(), Some("685789868"));
    }

    #[test]
    fn landline_only_file_has_no_phone() {
        let text = "OBSERVACIONES MANUALES: fijo 912 345 678\nTELEF-1: 912345678";
        assert_eq!(extract_phone(text), None);
        assert_eq!(extract_phone("   "), None);
    }

    #[test]
    fn international_number_in_observations() {
        let text = "OBSERVACIONES MANUALES: contacto +34600111222";
        assert_eq!(extract_phone(text).as_deref(), Some("+34600111222"));
    }
}
