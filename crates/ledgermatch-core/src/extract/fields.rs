//! Line-based field mining for receipt text
//!
//! When the model (or OCR engine) hands back free text instead of structured
//! fields, merchant, date, and total are mined line by line with positional
//! heuristics. Every function here is pure; all thresholds come from
//! [`ExtractionConfig`].

use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::alias::MerchantAliasTable;
use crate::config::ExtractionConfig;
use crate::normalize::{normalize_date, parse_amount};

/// Currency amount with cents ("125.00", "$1,234.56")
static AMOUNT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$?\s*\d{1,6}(?:,\d{3})*\.\d{2}").expect("amount regex"));

/// Numeric date shapes (06/10/2024, 2024-06-10, 6-10-24)
static NUMERIC_DATE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(?:\d{4}[-/]\d{1,2}[-/]\d{1,2}|\d{1,2}[-/]\d{1,2}[-/]\d{2,4})\b")
        .expect("numeric date regex")
});

/// Month-name date shapes (Jun 10, 2024 / 10 June 2024)
static MONTH_DATE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(?:\d{1,2}\s+)?(?:jan|feb|mar|apr|may|jun|jul|aug|sep|oct|nov|dec)[a-z]*\.?,?\s+(?:\d{1,2},?\s+)?\d{4}\b",
    )
    .expect("month date regex")
});

/// Proper-cased venue name ("Soho House", "Red Lion Inn")
static PROPER_VENUE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:[A-Z][a-z']+\s+)+(?:House|Inn|Hotel|Club|Bar|Grill)\b")
        .expect("venue regex")
});

/// All-caps business name with a corporate suffix ("ACME FOODS INC")
static ALLCAPS_BIZ_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Z][A-Z0-9'&.\s-]{2,}\s+(?:INC|LLC|CORP|LTD|CO)\.?$").expect("biz regex")
});

/// Keywords that mark a line as carrying the grand total
const TOTAL_KEYWORDS: &[&str] = &["total", "amount due", "balance due", "amount paid"];

/// Keywords that disqualify a line from being the grand total
const NOT_TOTAL_KEYWORDS: &[&str] = &["subtotal", "sub-total", "sub total", "tax", "tip",
    "gratuity", "discount", "change", "cash back"];

/// Keywords that make a line look like a merchant header
const MERCHANT_KEYWORDS: &[&str] = &[
    "house", "inn", "hotel", "club", "bar", "grill", "cafe", "coffee", "market", "store",
    "restaurant", "kitchen", "deli", "pizza", "bakery",
];

/// Digits the vision model is known to hallucinate in front of totals
const SPURIOUS_PREFIX_DIGITS: &[char] = &['5', '8'];

/// Fields mined from free receipt text
#[derive(Debug, Clone, Default)]
pub struct MinedFields {
    pub merchant: Option<String>,
    pub date: Option<NaiveDate>,
    /// Date matched one of the explicit formats (small confidence bonus)
    pub date_explicit_format: bool,
    pub total: Option<f64>,
    pub subtotal: Option<f64>,
    pub tip: Option<f64>,
}

/// Mine all fields from free receipt text
pub fn mine_fields(
    text: &str,
    table: &MerchantAliasTable,
    config: &ExtractionConfig,
) -> MinedFields {
    let lines: Vec<&str> = text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();

    let (date, date_explicit_format) = match find_date(&lines) {
        Some((d, explicit)) => (Some(d), explicit),
        None => (None, false),
    };

    MinedFields {
        merchant: find_merchant(&lines, table),
        date,
        date_explicit_format,
        total: find_total(&lines, config),
        subtotal: find_labeled_amount(&lines, &["subtotal", "sub-total", "sub total"]),
        tip: find_labeled_amount(&lines, &["tip", "gratuity"]),
    }
}

/// Merchant search order: known brand > proper-cased venue > all-caps
/// business suffix > best-scoring header line > first non-empty line
pub fn find_merchant(lines: &[&str], table: &MerchantAliasTable) -> Option<String> {
    let header = &lines[..lines.len().min(8)];

    // Known brands from the alias table win outright
    for line in header {
        if table.canonical(line).is_some() {
            return Some(line.to_string());
        }
    }

    for line in header {
        if PROPER_VENUE_RE.is_match(line) {
            return Some(line.to_string());
        }
    }

    for line in header {
        if ALLCAPS_BIZ_RE.is_match(line) {
            return Some(line.to_string());
        }
    }

    if let Some(line) = best_header_candidate(lines) {
        return Some(line);
    }

    lines.first().map(|l| l.to_string())
}

/// Score the first five non-numeric lines as merchant-name candidates
///
/// Length, uppercase ratio, proximity to the top, and merchant keywords all
/// count; the best-scoring line wins.
fn best_header_candidate(lines: &[&str]) -> Option<String> {
    let mut best: Option<(f64, usize, &str)> = None;

    for (position, line) in lines
        .iter()
        .copied()
        .filter(|l| !is_numeric_line(l))
        .take(5)
        .enumerate()
    {
        let mut score = 0.0;

        let len = line.chars().count();
        score += (len.min(30) as f64) / 30.0;

        let alpha: Vec<char> = line.chars().filter(|c| c.is_alphabetic()).collect();
        if !alpha.is_empty() {
            let upper = alpha.iter().filter(|c| c.is_uppercase()).count();
            score += upper as f64 / alpha.len() as f64;
        }

        score += (5 - position) as f64 * 0.4;

        let lower = line.to_lowercase();
        if MERCHANT_KEYWORDS.iter().any(|k| lower.contains(k)) {
            score += 1.0;
        }

        let better = match best {
            None => true,
            Some((best_score, _, _)) => score > best_score,
        };
        if better {
            best = Some((score, position, line));
        }
    }

    best.map(|(_, _, line)| line.to_string())
}

/// A line is numeric when most of its visible characters are digits or
/// amount punctuation
fn is_numeric_line(line: &str) -> bool {
    let visible: Vec<char> = line.chars().filter(|c| !c.is_whitespace()).collect();
    if visible.is_empty() {
        return true;
    }
    let numeric = visible
        .iter()
        .filter(|c| c.is_ascii_digit() || matches!(**c, '.' | ',' | '$' | '-' | '/' | ':' | '#'))
        .count();
    numeric as f64 / visible.len() as f64 > 0.6
}

/// Scan every line for date-shaped text and keep the best-scoring parse
///
/// Position in the top two-thirds is preferred and the footer is heavily
/// penalized; proximity to a total line and date/time/order keywords earn
/// bonuses.
pub fn find_date(lines: &[&str]) -> Option<(NaiveDate, bool)> {
    let total_lines: Vec<usize> = lines
        .iter()
        .enumerate()
        .filter(|(_, l)| {
            let lower = l.to_lowercase();
            TOTAL_KEYWORDS.iter().any(|k| lower.contains(k))
        })
        .map(|(i, _)| i)
        .collect();

    let mut best: Option<(f64, NaiveDate, bool)> = None;

    for (index, line) in lines.iter().enumerate() {
        for (text, explicit) in date_shaped_hits(line) {
            let Some(date) = normalize_date(&text) else {
                continue;
            };

            let mut score = 0.0;

            // Receipts date near the top; footer dates are usually return
            // policies or printing timestamps
            if index * 3 <= lines.len() * 2 {
                score += 2.0;
            }
            if lines.len() >= 10 && index * 10 >= lines.len() * 9 {
                score -= 3.0;
            }

            if total_lines.iter().any(|t| t.abs_diff(index) <= 3) {
                score += 2.0;
            }

            let lower = line.to_lowercase();
            if ["date", "time", "order"].iter().any(|k| lower.contains(k)) {
                score += 1.5;
            }

            let better = match best {
                None => true,
                Some((best_score, _, _)) => score > best_score,
            };
            if better {
                best = Some((score, date, explicit));
            }
        }
    }

    best.map(|(_, date, explicit)| (date, explicit))
}

/// All date-shaped substrings on a line, flagged for explicit-format shapes
fn date_shaped_hits(line: &str) -> Vec<(String, bool)> {
    let mut hits = Vec::new();
    for m in NUMERIC_DATE_RE.find_iter(line) {
        hits.push((m.as_str().to_string(), true));
    }
    for m in MONTH_DATE_RE.find_iter(line) {
        hits.push((m.as_str().to_string(), false));
    }
    hits
}

/// Find the grand total in the bottom half of the document
///
/// Lines carrying subtotal/tax/tip/discount keywords are excluded; among the
/// rest, total-type keywords score highest (an exact "total" not preceded by
/// "sub" earns extra), and the amount must pass the sanity bounds.
pub fn find_total(lines: &[&str], config: &ExtractionConfig) -> Option<f64> {
    let start = lines.len() / 2;
    let mut best: Option<(f64, f64, usize)> = None;

    for (index, line) in lines.iter().enumerate().skip(start) {
        let lower = line.to_lowercase();
        if NOT_TOTAL_KEYWORDS.iter().any(|k| lower.contains(k)) {
            continue;
        }

        for m in AMOUNT_RE.find_iter(line) {
            let Some(amount) = sanitize_total(parse_amount(m.as_str()), config) else {
                continue;
            };

            let mut score = 0.0;
            if TOTAL_KEYWORDS.iter().any(|k| lower.contains(k)) {
                score += 3.0;
            }
            if has_exact_total(&lower) {
                score += 2.0;
            }

            let better = match best {
                None => true,
                Some((best_score, best_amount, best_index)) => {
                    (score, amount, index) > (best_score, best_amount, best_index)
                }
            };
            if better {
                best = Some((score, amount, index));
            }
        }
    }

    best.map(|(_, amount, _)| amount)
}

/// "total" appearing as its own word, not as the tail of "subtotal"
fn has_exact_total(lower: &str) -> bool {
    let mut search_from = 0;
    while let Some(pos) = lower[search_from..].find("total") {
        let absolute = search_from + pos;
        let preceded_by_sub = absolute >= 3 && &lower[absolute - 3..absolute] == "sub";
        let word_start = absolute == 0
            || !lower[..absolute]
                .chars()
                .next_back()
                .map(|c| c.is_alphanumeric())
                .unwrap_or(false);
        if word_start && !preceded_by_sub {
            return true;
        }
        search_from = absolute + 5;
    }
    false
}

/// Bounds-check a candidate total, applying the leading-digit correction
/// when enabled
fn sanitize_total(amount: f64, config: &ExtractionConfig) -> Option<f64> {
    if amount >= config.total_min && amount <= config.total_max {
        return Some(amount);
    }
    if config.leading_digit_fix {
        if let Some(corrected) = strip_spurious_leading_digit(amount, config) {
            return Some(corrected);
        }
    }
    None
}

/// Isolated correction for one observed model failure mode: a spurious digit
/// prepended to the real amount (e.g. "8125.00" for "125.00")
///
/// Applies only when the original is out of bounds, the prefix digit is one
/// of the known-misread shapes, and the corrected value lands back in range.
pub fn strip_spurious_leading_digit(amount: f64, config: &ExtractionConfig) -> Option<f64> {
    if amount >= config.total_min && amount <= config.total_max {
        return None;
    }
    let text = format!("{:.2}", amount);
    let first = text.chars().next()?;
    if !SPURIOUS_PREFIX_DIGITS.contains(&first) {
        return None;
    }
    let corrected: f64 = text[1..].parse().ok()?;
    if corrected >= config.total_min && corrected <= config.total_max {
        Some(corrected)
    } else {
        None
    }
}

/// First amount on a line labeled with one of the given keywords
pub fn find_labeled_amount(lines: &[&str], keywords: &[&str]) -> Option<f64> {
    for line in lines {
        let lower = line.to_lowercase();
        if keywords.iter().any(|k| lower.contains(k)) {
            if let Some(m) = AMOUNT_RE.find(line) {
                let amount = parse_amount(m.as_str());
                if amount > 0.0 {
                    return Some(amount);
                }
            }
        }
    }
    None
}

/// Confidence from field presence and quality
///
/// Merchant 0.4 plus a 0.1 length bonus, date 0.25 plus a 0.05 explicit
/// format bonus, total 0.2; capped at 1.0.
pub fn confidence_for(fields: &MinedFields, config: &ExtractionConfig) -> f64 {
    let mut confidence: f64 = 0.0;

    if let Some(merchant) = &fields.merchant {
        if !merchant.trim().is_empty() {
            confidence += 0.4;
            if merchant.trim().chars().count() >= 5 {
                confidence += 0.1;
            }
        }
    }

    if fields.date.is_some() {
        confidence += 0.25;
        if fields.date_explicit_format {
            confidence += 0.05;
        }
    }

    if let Some(total) = fields.total {
        if total >= config.total_min && total <= config.total_max {
            confidence += 0.2;
        }
    }

    confidence.min(1.0)
}
