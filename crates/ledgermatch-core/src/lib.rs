//! LedgerMatch Core Library
//!
//! Extracts structured fields from unstructured receipt evidence and matches
//! bank-ledger transactions against receipt candidates gathered from several
//! independent sources:
//! - Text normalization (merchants, dates, amounts) with a hot-reloadable
//!   merchant alias table
//! - Field extraction via a primary vision-to-text model with a garbled-output
//!   detector and cascading classical-OCR fallback
//! - Concurrent candidate harvesting (local store, mailboxes, message history)
//!   with per-source isolation
//! - Deterministic weighted scoring and ranking of candidates
//! - Post-extraction validation (bounds, presence, cross-field consistency)

pub mod alias;
pub mod config;
pub mod error;
pub mod extract;
pub mod harvest;
pub mod matcher;
pub mod models;
pub mod normalize;
pub mod pipeline;
pub mod prompts;
pub mod validate;

/// Test utilities including mock vision-model and mailbox-search servers
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use alias::{AliasHandle, MerchantAliasTable};
pub use config::{
    CoreConfig, ExtractionConfig, FallbackConfig, HarvestConfig, MatchingConfig, VisionConfig,
};
pub use error::{Error, Result};
pub use extract::{
    garble::{FallbackAction, Verdict},
    mock::{MockOcrEngine, MockVisionBackend},
    ocr::OcrClient,
    vision::{HttpVisionBackend, VisionBackend, VisionClient},
    FieldExtractor,
};
pub use harvest::{Harvester, LocalStoreSource, MailboxSource, MessageStoreSource, SourceAdapter};
pub use matcher::{CandidateEvidence, Matcher};
pub use models::{
    CandidatePayload, CandidateSource, ExtractionIssue, ExtractionMethod, ExtractionResult,
    HarvestOutcome, MatchOutcome, MatchScore, RankedCandidate, ReceiptCandidate, RejectReason,
    SourceState, SourceStatus, Transaction,
};
pub use normalize::{normalize_date, parse_amount, Normalizer};
pub use pipeline::MatchPipeline;
pub use prompts::{Prompt, PromptId, PromptLibrary};
pub use validate::Validator;
