//! Transaction/candidate scoring
//!
//! Each similarity dimension is a pure component function returning a value
//! in [0,1]; the total is a fixed convex combination under the configured
//! weights, so rankings are comparable across runs and tunable without
//! touching the component logic. The matcher never mutates the transaction
//! and is deterministic for a fixed alias-table version.

use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::alias::{loose_key, AliasHandle, MerchantAliasTable};
use crate::config::MatchingConfig;
use crate::models::{
    CandidateSource, ExtractionResult, MatchScore, RankedCandidate, Transaction,
};
use crate::normalize::{normalize_merchant_with, significant_words};

/// Domains of payment processors and delivery platforms whose URLs are
/// near-certain receipt evidence
const TRUSTED_DOMAINS: &[&str] = &[
    "uber.com",
    "lyft.com",
    "doordash.com",
    "grubhub.com",
    "squareup.com",
    "square.site",
    "stripe.com",
    "paypal.com",
    "amazon.com",
    "toasttab.com",
    "instacart.com",
];

/// Generic receipt-ish URL keywords
static RECEIPT_URL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)receipt|invoice|order|billing").expect("receipt url regex"));

/// Direct document links (pdf or image)
static DOCUMENT_URL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\.(pdf|jpe?g|png|heic)(\?|$)").expect("document url regex"));

/// Everything the matcher needs to know about one candidate
#[derive(Debug, Clone)]
pub struct CandidateEvidence {
    pub source: CandidateSource,
    pub locator: String,
    /// Raw textual payload, when the candidate was text to begin with
    pub text: Option<String>,
    /// Extraction backing this candidate, when one ran
    pub extraction: Option<ExtractionResult>,
    /// Harvester's own quality prior, 0.0-1.0
    pub source_hint: f64,
    /// Date evidence to use when the extraction has none (file mtime,
    /// email date, message timestamp)
    pub fallback_date: Option<NaiveDate>,
}

/// Transaction/candidate matcher
#[derive(Clone)]
pub struct Matcher {
    config: MatchingConfig,
    aliases: AliasHandle,
}

impl Matcher {
    pub fn new(config: MatchingConfig, aliases: AliasHandle) -> Self {
        Self { config, aliases }
    }

    /// Score one candidate against a transaction
    pub fn score(&self, transaction: &Transaction, evidence: &CandidateEvidence) -> MatchScore {
        let table = self.aliases.current();

        let merchant = merchant_component(&table, &transaction.description, evidence);
        let amount = amount_component(transaction.amount, candidate_amount(evidence));
        let date = date_component(transaction.date, candidate_date(evidence));
        let quality = evidence_component(&evidence.locator, evidence.source_hint);

        let total = merchant * self.config.merchant_weight
            + amount * self.config.amount_weight
            + date * self.config.date_weight
            + quality * self.config.evidence_weight;

        MatchScore {
            merchant,
            amount,
            date,
            evidence: quality,
            total,
        }
    }

    /// Score and rank a candidate pool
    ///
    /// Candidates below the acceptance threshold are discarded. Ordering is
    /// total score descending, then evidence quality, then source priority
    /// (local > mailbox > message history), then pool index as the final
    /// deterministic tiebreak.
    pub fn rank(
        &self,
        transaction: &Transaction,
        evidences: &[CandidateEvidence],
    ) -> Vec<RankedCandidate> {
        let mut ranked: Vec<RankedCandidate> = evidences
            .iter()
            .enumerate()
            .map(|(index, evidence)| RankedCandidate {
                candidate_index: index,
                source: evidence.source,
                locator: evidence.locator.clone(),
                score: self.score(transaction, evidence),
                extraction: evidence.extraction.clone(),
            })
            .filter(|r| r.score.total >= self.config.acceptance_threshold)
            .collect();

        ranked.sort_by(|a, b| {
            b.score
                .total
                .partial_cmp(&a.score.total)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(
                    b.score
                        .evidence
                        .partial_cmp(&a.score.evidence)
                        .unwrap_or(std::cmp::Ordering::Equal),
                )
                .then(a.source.priority().cmp(&b.source.priority()))
                .then(a.candidate_index.cmp(&b.candidate_index))
        });

        ranked
    }
}

/// Amount evidence: the extracted total, falling back to nothing
fn candidate_amount(evidence: &CandidateEvidence) -> Option<f64> {
    evidence
        .extraction
        .as_ref()
        .and_then(|e| e.total)
        .filter(|t| *t > 0.0)
}

/// Date evidence: the extracted date, else the candidate's own timestamp
fn candidate_date(evidence: &CandidateEvidence) -> Option<NaiveDate> {
    evidence
        .extraction
        .as_ref()
        .and_then(|e| e.date)
        .or(evidence.fallback_date)
}

/// Merchant similarity in [0,1]
///
/// 1.0 on substring containment either direction after normalization;
/// otherwise token-overlap ratio (shared significant words over the
/// transaction merchant's word count) with a 1.5x boost before capping.
pub fn merchant_component(
    table: &MerchantAliasTable,
    transaction_description: &str,
    evidence: &CandidateEvidence,
) -> f64 {
    let tx_merchant = normalize_merchant_with(table, transaction_description);
    if tx_merchant.is_empty() {
        return 0.0;
    }

    // Candidate-side haystacks: the normalized extraction merchant, its raw
    // spelling (brand-cluster collapse can drop location tokens), and the
    // loose-keyed raw text
    let mut haystacks: Vec<String> = Vec::new();
    if let Some(extraction) = &evidence.extraction {
        if let Some(merchant) = &extraction.merchant_normalized {
            haystacks.push(merchant.clone());
        }
        if let Some(merchant) = &extraction.merchant_raw {
            haystacks.push(loose_key(merchant));
        }
    }
    if let Some(text) = &evidence.text {
        haystacks.push(loose_key(text));
    }
    if haystacks.is_empty() {
        return 0.0;
    }

    for haystack in &haystacks {
        if haystack.is_empty() {
            continue;
        }
        if haystack.contains(&tx_merchant) || tx_merchant.contains(haystack.as_str()) {
            return 1.0;
        }
    }

    // Token overlap against the union of candidate words
    let tx_words = significant_words(&tx_merchant);
    if tx_words.is_empty() {
        return 0.0;
    }
    let candidate_words: std::collections::HashSet<String> = haystacks
        .iter()
        .flat_map(|h| significant_words(h))
        .collect();
    let shared = tx_words
        .iter()
        .filter(|w| candidate_words.contains(*w))
        .count();

    let ratio = shared as f64 / tx_words.len() as f64;
    (ratio * 1.5).min(1.0)
}

/// Amount similarity ladder
///
/// Monotone in the absolute difference: exact (within a cent) 1.0, within
/// 1% of the amount 0.95, within $5 0.8, within $20 0.6, else 0.0.
pub fn amount_component(transaction_amount: f64, candidate_total: Option<f64>) -> f64 {
    let Some(total) = candidate_total else {
        return 0.0;
    };

    let tx = transaction_amount.abs();
    let diff = (tx - total.abs()).abs();

    if diff <= 0.01 {
        1.0
    } else if diff <= tx * 0.01 {
        0.95
    } else if diff <= 5.0 {
        0.8
    } else if diff <= 20.0 {
        0.6
    } else {
        0.0
    }
}

/// Date proximity ladder
///
/// Monotone in day distance: same day 1.0, within 1 day 0.9, within 3 days
/// 0.7, within 5 days 0.5, beyond that 0.0.
pub fn date_component(transaction_date: NaiveDate, candidate_date: Option<NaiveDate>) -> f64 {
    let Some(date) = candidate_date else {
        return 0.0;
    };

    let days = (transaction_date - date).num_days().abs();
    match days {
        0 => 1.0,
        1 => 0.9,
        2..=3 => 0.7,
        4..=5 => 0.5,
        _ => 0.0,
    }
}

/// Evidence-quality ladder over the candidate locator
///
/// Baseline 0.5 for carrying any locator at all; 1.0 for a known
/// payment/delivery platform, 0.9 for a generic receipt-keyword URL, 0.8
/// for a direct document link. The harvester's own hint acts as a floor.
pub fn evidence_component(locator: &str, source_hint: f64) -> f64 {
    let locator = locator.trim();
    if locator.is_empty() {
        return 0.0;
    }

    let lower = locator.to_lowercase();
    let ladder: f64 = if TRUSTED_DOMAINS.iter().any(|d| lower.contains(d)) {
        1.0
    } else if RECEIPT_URL_RE.is_match(locator) {
        0.9
    } else if DOCUMENT_URL_RE.is_match(locator) {
        0.8
    } else {
        0.5
    };

    ladder.max(source_hint.clamp(0.0, 1.0))
}
