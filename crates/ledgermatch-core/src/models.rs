//! Domain models for LedgerMatch

use std::collections::BTreeSet;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// A bank-ledger transaction, supplied per match request
///
/// Owned by the ledger/report system; the core never mutates one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub id: i64,
    /// Raw merchant string as it appears on the statement
    pub description: String,
    /// Signed amount (charges are negative on most ledgers)
    pub amount: f64,
    pub date: NaiveDate,
    pub category: Option<String>,
}

/// Which harvester source produced a candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateSource {
    /// Local receipt store on disk
    LocalFile,
    /// Per-account mailbox search
    Mailbox,
    /// Message-history scan (URLs in chat messages)
    MessageHistory,
}

impl CandidateSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LocalFile => "local_file",
            Self::Mailbox => "mailbox",
            Self::MessageHistory => "message_history",
        }
    }

    /// Deterministic tie-break priority; lower wins
    ///
    /// Local store beats mailbox beats message history when scores are equal.
    pub fn priority(&self) -> u8 {
        match self {
            Self::LocalFile => 0,
            Self::Mailbox => 1,
            Self::MessageHistory => 2,
        }
    }
}

impl std::str::FromStr for CandidateSource {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "local_file" | "local" => Ok(Self::LocalFile),
            "mailbox" | "mail" => Ok(Self::Mailbox),
            "message_history" | "messages" => Ok(Self::MessageHistory),
            _ => Err(format!("Unknown candidate source: {}", s)),
        }
    }
}

impl std::fmt::Display for CandidateSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Raw evidence payload carried by a candidate
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidatePayload {
    /// Image or document bytes requiring extraction
    Bytes(Vec<u8>),
    /// Already-textual evidence (message body, rendered HTML)
    Text(String),
}

impl CandidatePayload {
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Bytes(b) => b.is_empty(),
            Self::Text(t) => t.trim().is_empty(),
        }
    }
}

/// One unit of evidence produced by a harvester source
///
/// Created transiently per matching request; never persisted by the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceiptCandidate {
    pub source: CandidateSource,
    /// Path, URL, or message id identifying where the evidence came from
    pub locator: String,
    pub payload: CandidatePayload,
    pub discovered_at: DateTime<Utc>,
    /// Source-specific prior on evidence quality, 0.0-1.0
    pub source_hint: f64,
}

impl ReceiptCandidate {
    /// Content hash used for cross-source dedup and the extraction cache key
    pub fn content_hash(&self) -> String {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        match &self.payload {
            CandidatePayload::Bytes(b) => hasher.update(b),
            CandidatePayload::Text(t) => hasher.update(t.as_bytes()),
        }
        hex::encode(hasher.finalize())
    }
}

/// Which engine produced an extraction result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionMethod {
    /// Primary trained vision-to-text model
    #[default]
    Primary,
    /// Classical OCR fallback chain
    ClassicalOcr,
    /// Handwriting-capable pass (tip recovery)
    Handwriting,
}

impl ExtractionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::ClassicalOcr => "classical_ocr",
            Self::Handwriting => "handwriting",
        }
    }
}

impl std::fmt::Display for ExtractionMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Flags describing what went wrong (or is suspicious) in an extraction
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionIssue {
    MerchantMissing,
    DateMissing,
    TotalZero,
    TotalOutOfBounds,
    /// Cross-field check failed (e.g. subtotal above total)
    FieldsInconsistent,
}

impl ExtractionIssue {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MerchantMissing => "merchant_missing",
            Self::DateMissing => "date_missing",
            Self::TotalZero => "total_zero",
            Self::TotalOutOfBounds => "total_out_of_bounds",
            Self::FieldsInconsistent => "fields_inconsistent",
        }
    }
}

/// Why the garbled-output detector rejected a primary extraction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// Unique-token ratio in the trailing output fell below the floor
    RepetitiveOutput { unique_ratio: f64 },
    /// The extracted merchant string parses as a date or time
    MerchantLooksLikeDate,
    /// Total exceeded the hard ceiling
    TotalAboveCeiling { total: f64 },
    /// Structural issues flagged during extraction
    Issues(Vec<ExtractionIssue>),
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RepetitiveOutput { unique_ratio } => {
                write!(f, "repetitive output (unique ratio {:.2})", unique_ratio)
            }
            Self::MerchantLooksLikeDate => write!(f, "merchant parses as a date"),
            Self::TotalAboveCeiling { total } => {
                write!(f, "total {:.2} above hard ceiling", total)
            }
            Self::Issues(issues) => {
                let names: Vec<&str> = issues.iter().map(|i| i.as_str()).collect();
                write!(f, "issues: {}", names.join(", "))
            }
        }
    }
}

/// Output of the field extractor / fallback chain
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ExtractionResult {
    pub success: bool,
    pub merchant_raw: Option<String>,
    pub merchant_normalized: Option<String>,
    pub date: Option<NaiveDate>,
    pub total: Option<f64>,
    pub subtotal: Option<f64>,
    pub tip: Option<f64>,
    /// 0.0-1.0, reflects field completeness and quality
    pub confidence: f64,
    pub method: ExtractionMethod,
    pub issues: BTreeSet<ExtractionIssue>,
    /// Provenance for fallback results: why the primary was rejected
    pub rejection: Option<RejectReason>,
    /// Set when success is false
    pub error: Option<String>,
}

impl ExtractionResult {
    /// Fully-empty failure result; safe for callers to skip
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }

    /// A result is coherent when it carries a non-trivial merchant and a
    /// total inside the sane range
    pub fn is_coherent(&self, total_min: f64, total_max: f64) -> bool {
        let merchant_ok = self
            .merchant_normalized
            .as_deref()
            .or(self.merchant_raw.as_deref())
            .map(|m| m.trim().len() >= 3)
            .unwrap_or(false);
        let total_ok = self
            .total
            .map(|t| t >= total_min && t <= total_max)
            .unwrap_or(false);
        merchant_ok && total_ok
    }
}

/// Weighted similarity between one transaction and one candidate
///
/// Each component is in [0,1]; `total` is the convex combination of the
/// components under the configured weights, so scores from different runs
/// are comparable.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MatchScore {
    pub merchant: f64,
    pub amount: f64,
    pub date: f64,
    pub evidence: f64,
    pub total: f64,
}

/// One scored candidate in a ranked result list
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankedCandidate {
    /// Index into the candidate pool handed to the matcher
    pub candidate_index: usize,
    pub source: CandidateSource,
    pub locator: String,
    pub score: MatchScore,
    /// Extraction backing the score, when OCR was involved
    pub extraction: Option<ExtractionResult>,
}

/// Per-source outcome of a harvest run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceStatus {
    pub source: CandidateSource,
    pub state: SourceState,
}

/// What happened to one harvester source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceState {
    /// Source completed; carries the number of candidates it contributed
    Ok(usize),
    /// Source failed outright; the harvest proceeded without it
    Failed(String),
    /// Source exceeded its time budget
    TimedOut,
}

/// Union of whatever the harvester sources produced
#[derive(Debug, Clone, Default)]
pub struct HarvestOutcome {
    pub candidates: Vec<ReceiptCandidate>,
    pub statuses: Vec<SourceStatus>,
}

/// Final result of a match run for one transaction
#[derive(Debug, Clone)]
pub struct MatchOutcome {
    /// Best candidate above the acceptance threshold, if any
    pub best: Option<RankedCandidate>,
    /// All candidates above threshold, descending, for UI "other options"
    pub ranked: Vec<RankedCandidate>,
    /// Per-source harvest statuses
    pub harvest: Vec<SourceStatus>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_priority_ordering() {
        assert!(CandidateSource::LocalFile.priority() < CandidateSource::Mailbox.priority());
        assert!(CandidateSource::Mailbox.priority() < CandidateSource::MessageHistory.priority());
    }

    #[test]
    fn test_source_round_trip() {
        for s in [
            CandidateSource::LocalFile,
            CandidateSource::Mailbox,
            CandidateSource::MessageHistory,
        ] {
            let parsed: CandidateSource = s.as_str().parse().unwrap();
            assert_eq!(parsed, s);
        }
    }

    #[test]
    fn test_content_hash_stable() {
        let candidate = ReceiptCandidate {
            source: CandidateSource::LocalFile,
            locator: "/receipts/a.jpg".into(),
            payload: CandidatePayload::Bytes(vec![1, 2, 3]),
            discovered_at: Utc::now(),
            source_hint: 0.5,
        };
        assert_eq!(candidate.content_hash(), candidate.content_hash());
        assert_eq!(candidate.content_hash().len(), 64);
    }

    #[test]
    fn test_failed_result_is_skippable() {
        let result = ExtractionResult::failed("no engine available");
        assert!(!result.success);
        assert!(result.error.is_some());
        assert_eq!(result.confidence, 0.0);
        assert!(!result.is_coherent(0.01, 10000.0));
    }

    #[test]
    fn test_coherence_requires_merchant_and_total() {
        let mut result = ExtractionResult {
            success: true,
            merchant_raw: Some("WENDY'S".into()),
            ..Default::default()
        };
        assert!(!result.is_coherent(0.01, 10000.0));

        result.total = Some(8.42);
        assert!(result.is_coherent(0.01, 10000.0));

        result.total = Some(50000.0);
        assert!(!result.is_coherent(0.01, 10000.0));
    }
}
