//! Text normalization
//!
//! Canonicalizes merchant names, dates, and currency strings so that
//! semantically equal values compare as equal. Merchant normalization runs
//! in a fixed order: confirmation-code stripping, brand-cluster overrides,
//! travel-suffix stripping, then the generic lowercase/alphanumeric pass.

use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::alias::{loose_key, AliasHandle, MerchantAliasTable};

/// `#NNNN` store-number suffix (e.g. "TRADER JOE'S #552")
static STORE_NUMBER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"#\s*\d{1,6}\s*$").expect("store number regex"));

/// Trailing travel-industry suffixes, stripped only as the last token
const TRAVEL_SUFFIXES: &[&str] = &[
    "air", "airlines", "airways", "hotel", "hotels", "suites", "inn",
];

/// Merchant normalizer bound to a hot-reloadable alias table
#[derive(Clone)]
pub struct Normalizer {
    aliases: AliasHandle,
}

impl Normalizer {
    pub fn new(aliases: AliasHandle) -> Self {
        Self { aliases }
    }

    /// Canonicalize a raw merchant string
    pub fn normalize_merchant(&self, raw: &str) -> String {
        normalize_merchant_with(&self.aliases.current(), raw)
    }

    /// Alias-table version backing this normalizer
    pub fn alias_version(&self) -> u64 {
        self.aliases.version()
    }
}

impl Default for Normalizer {
    fn default() -> Self {
        Self::new(AliasHandle::new())
    }
}

/// Canonicalize a merchant string against an explicit table snapshot
///
/// Pure for a fixed table, which is what makes scoring deterministic per
/// alias-table version.
pub fn normalize_merchant_with(table: &MerchantAliasTable, raw: &str) -> String {
    let stripped = strip_confirmation_codes(raw);

    // Brand clusters collapse known franchise spellings before the generic
    // pass; they are a common source of false negatives otherwise.
    if let Some(canonical) = table.canonical(&stripped) {
        return canonical;
    }

    let without_suffix = strip_travel_suffix(&stripped);
    loose_key(&without_suffix)
}

/// Strip trailing confirmation/booking codes and store numbers
///
/// Removes, repeatedly: a `#NNNN` suffix, a trailing run of 8+ digits, or a
/// trailing 8+ character token mixing letters and digits.
pub fn strip_confirmation_codes(raw: &str) -> String {
    let mut out = raw.trim().to_string();
    loop {
        let trimmed = out.trim_end().to_string();

        if let Some(m) = STORE_NUMBER_RE.find(&trimmed) {
            out = trimmed[..m.start()].trim_end().to_string();
            continue;
        }

        if let Some((idx, tail)) = last_token(&trimmed) {
            if is_confirmation_code(tail) {
                out = trimmed[..idx].trim_end().to_string();
                continue;
            }
        }

        return trimmed;
    }
}

/// A token reads as a confirmation code when it is 8+ alphanumeric chars
/// that are either all digits or a letter/digit mix
fn is_confirmation_code(token: &str) -> bool {
    if token.chars().count() < 8 || !token.chars().all(|c| c.is_ascii_alphanumeric()) {
        return false;
    }
    let has_digit = token.chars().any(|c| c.is_ascii_digit());
    let has_alpha = token.chars().any(|c| c.is_ascii_alphabetic());
    has_digit && (has_alpha || token.chars().all(|c| c.is_ascii_digit()))
}

/// Strip a generic travel-industry suffix, but only as the trailing token
fn strip_travel_suffix(raw: &str) -> String {
    let trimmed = raw.trim_end();
    if let Some((idx, tail)) = last_token(trimmed) {
        let tail = tail.to_lowercase();
        let tail = tail.trim_matches(|c: char| !c.is_ascii_alphanumeric());
        if TRAVEL_SUFFIXES.contains(&tail) {
            return trimmed[..idx].trim_end().to_string();
        }
    }
    trimmed.to_string()
}

/// Final whitespace-separated token and the index of the whitespace before it
fn last_token(s: &str) -> Option<(usize, &str)> {
    let idx = s.rfind(char::is_whitespace)?;
    let ws = s[idx..].chars().next()?;
    Some((idx, &s[idx + ws.len_utf8()..]))
}

/// Date formats tried explicitly before the general fallback
const EXPLICIT_DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%m/%d/%Y", "%m/%d/%y", "%Y/%m/%d"];

/// Extra formats the general fallback accepts
const FALLBACK_DATE_FORMATS: &[&str] = &[
    "%m-%d-%Y", "%m-%d-%y", "%d %b %Y", "%d %B %Y", "%b %d %Y", "%B %d %Y", "%Y%m%d", "%m.%d.%Y",
];

/// Parse a date string; `None` on total failure, never an error
pub fn normalize_date(raw: &str) -> Option<NaiveDate> {
    normalize_date_detailed(raw).map(|(date, _)| date)
}

/// Like [`normalize_date`], also reporting whether one of the explicit
/// formats matched (the extractor pays a small confidence bonus for those)
pub fn normalize_date_detailed(raw: &str) -> Option<(NaiveDate, bool)> {
    let cleaned = raw.trim();
    if cleaned.is_empty() {
        return None;
    }

    for format in EXPLICIT_DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(cleaned, format) {
            return Some((date, true));
        }
    }

    // General fallback: drop commas ("Jun 10, 2024") and retry a wider set
    let decommaed = cleaned.replace(',', " ");
    let squeezed: String = decommaed.split_whitespace().collect::<Vec<_>>().join(" ");
    for format in FALLBACK_DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(&squeezed, format) {
            return Some((date, false));
        }
    }

    None
}

/// Parse a currency string leniently
///
/// Strips everything except digits, `.`, and `-`; returns 0.0 on empty or
/// unparseable input so upstream scoring degrades instead of failing the
/// whole candidate.
pub fn parse_amount(raw: &str) -> f64 {
    let filtered: String = raw
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
        .collect();
    if filtered.is_empty() {
        return 0.0;
    }
    filtered.parse::<f64>().unwrap_or(0.0)
}

/// Option-accepting variant of [`parse_amount`]
pub fn parse_amount_opt(raw: Option<&str>) -> f64 {
    raw.map(parse_amount).unwrap_or(0.0)
}

/// Words long enough to matter for merchant token overlap
pub fn significant_words(s: &str) -> Vec<String> {
    loose_key(s)
        .split_whitespace()
        .filter(|w| w.len() > 2)
        .map(|w| w.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> MerchantAliasTable {
        MerchantAliasTable::embedded()
    }

    #[test]
    fn test_confirmation_code_digits_stripped() {
        assert_eq!(
            strip_confirmation_codes("SOUTHWES 5262533925711"),
            "SOUTHWES"
        );
    }

    #[test]
    fn test_confirmation_code_alnum_stripped() {
        assert_eq!(strip_confirmation_codes("MARRIOTT RSV8823K19"), "MARRIOTT");
    }

    #[test]
    fn test_store_number_stripped() {
        assert_eq!(strip_confirmation_codes("TRADER JOE'S #552"), "TRADER JOE'S");
    }

    #[test]
    fn test_short_tokens_survive() {
        assert_eq!(strip_confirmation_codes("TERMINAL 5"), "TERMINAL 5");
        assert_eq!(strip_confirmation_codes("7-ELEVEN"), "7-ELEVEN");
    }

    #[test]
    fn test_normalization_stability_after_code_strip() {
        let t = table();
        assert_eq!(
            normalize_merchant_with(&t, "SOUTHWES 5262533925711"),
            normalize_merchant_with(&t, "SOUTHWES")
        );
    }

    #[test]
    fn test_alias_collapsing() {
        let t = table();
        let a = normalize_merchant_with(&t, "UBER *TRIP");
        let b = normalize_merchant_with(&t, "UBER BV");
        assert_eq!(a, b);
        assert_eq!(a, "uber");
    }

    #[test]
    fn test_travel_suffix_trailing_only() {
        let t = MerchantAliasTable::empty();
        assert_eq!(normalize_merchant_with(&t, "DELTA AIR"), "delta");
        assert_eq!(normalize_merchant_with(&t, "COMFORT INN"), "comfort");
        // Mid-string tokens are untouched
        assert_eq!(
            normalize_merchant_with(&t, "AIR CANADA VANCOUVER"),
            "air canada vancouver"
        );
    }

    #[test]
    fn test_generic_pass_lowercases_and_strips() {
        let t = MerchantAliasTable::empty();
        assert_eq!(
            normalize_merchant_with(&t, "Blue Bottle Coffee, LLC."),
            "blue bottle coffee llc"
        );
    }

    #[test]
    fn test_normalize_date_explicit_formats() {
        let expected = NaiveDate::from_ymd_opt(2024, 6, 10).unwrap();
        assert_eq!(normalize_date("2024-06-10"), Some(expected));
        assert_eq!(normalize_date("06/10/2024"), Some(expected));
        assert_eq!(normalize_date("06/10/24"), Some(expected));
        assert_eq!(normalize_date("2024/06/10"), Some(expected));
    }

    #[test]
    fn test_normalize_date_fallback_formats() {
        let expected = NaiveDate::from_ymd_opt(2024, 6, 10).unwrap();
        assert_eq!(normalize_date("Jun 10, 2024"), Some(expected));
        assert_eq!(normalize_date("10 June 2024"), Some(expected));
    }

    #[test]
    fn test_normalize_date_failure_is_none() {
        assert_eq!(normalize_date(""), None);
        assert_eq!(normalize_date("not a date"), None);
        assert_eq!(normalize_date("13/45/2024"), None);
    }

    #[test]
    fn test_parse_amount_robustness() {
        assert_eq!(parse_amount("$1,234.56"), 1234.56);
        assert_eq!(parse_amount("USD 42.00"), 42.00);
        assert_eq!(parse_amount("-28.75"), -28.75);
        assert_eq!(parse_amount(""), 0.0);
        assert_eq!(parse_amount("n/a"), 0.0);
        assert_eq!(parse_amount_opt(None), 0.0);
    }

    #[test]
    fn test_significant_words_filters_short() {
        assert_eq!(
            significant_words("SH NASHVILLE TN"),
            vec!["nashville".to_string()]
        );
    }
}
