//! Match pipeline
//!
//! Wires the harvester, extractor, matcher, and validator together for one
//! transaction: harvest candidates from every source, extract fields from
//! each candidate under a per-candidate time budget, score, rank, and return
//! the best match (or none) plus the full ranked list for UI disambiguation.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::CoreConfig;
use crate::extract::FieldExtractor;
use crate::harvest::{Harvester, SourceAdapter};
use crate::matcher::{CandidateEvidence, Matcher};
use crate::models::{
    CandidatePayload, MatchOutcome, ReceiptCandidate, Transaction,
};
use crate::validate::Validator;

/// End-to-end matcher for single transactions
pub struct MatchPipeline {
    harvester: Harvester,
    extractor: Arc<FieldExtractor>,
    matcher: Matcher,
    validator: Validator,
    config: CoreConfig,
}

impl MatchPipeline {
    /// Build a pipeline around a shared extractor
    ///
    /// The extractor is the expensive piece (model connection, caches); it is
    /// constructed once by the caller and shared here.
    pub fn new(config: CoreConfig, extractor: Arc<FieldExtractor>, matcher: Matcher) -> Self {
        Self {
            harvester: Harvester::new(config.harvest.clone()),
            validator: Validator::new(config.extraction.clone()),
            extractor,
            matcher,
            config,
        }
    }

    /// Register a harvester source
    pub fn with_source(mut self, source: Arc<dyn SourceAdapter>) -> Self {
        self.harvester = self.harvester.with_source(source);
        self
    }

    /// Harvest evidence for a transaction and find its best receipt
    pub async fn match_transaction(&self, transaction: &Transaction) -> MatchOutcome {
        // Extraction caching is per batch
        self.extractor.clear_cache();

        let harvest = self.harvester.harvest(transaction).await;
        info!(
            transaction = transaction.id,
            candidates = harvest.candidates.len(),
            "Harvest complete"
        );

        let mut outcome = self.find_best_match(transaction, &harvest.candidates).await;
        outcome.harvest = harvest.statuses;
        outcome
    }

    /// Score a pre-gathered candidate pool against a transaction
    ///
    /// Candidates below the acceptance threshold are dropped; the ranked
    /// remainder is returned alongside the best match so ambiguous cases
    /// stay visible to the caller.
    pub async fn find_best_match(
        &self,
        transaction: &Transaction,
        pool: &[ReceiptCandidate],
    ) -> MatchOutcome {
        let mut evidences = Vec::with_capacity(pool.len());

        for candidate in pool {
            evidences.push(self.evidence_for(candidate).await);
        }

        let ranked = self.matcher.rank(transaction, &evidences);
        if let Some(best) = ranked.first() {
            debug!(
                transaction = transaction.id,
                locator = %best.locator,
                score = best.score.total,
                "Best match selected"
            );
        } else {
            debug!(transaction = transaction.id, "No candidate above threshold");
        }

        MatchOutcome {
            best: ranked.first().cloned(),
            ranked,
            harvest: Vec::new(),
        }
    }

    /// Extract and validate one candidate into matcher evidence
    ///
    /// Image extraction runs under the per-candidate budget; a candidate that
    /// blows its budget is scored on its remaining evidence rather than
    /// aborting the batch.
    async fn evidence_for(&self, candidate: &ReceiptCandidate) -> CandidateEvidence {
        let (text, extraction) = match &candidate.payload {
            CandidatePayload::Text(text) => {
                let extraction = self.extractor.extract_from_text(text);
                (Some(text.clone()), extraction)
            }
            CandidatePayload::Bytes(bytes) => {
                let budget = self.config.harvest.candidate_budget;
                let extraction =
                    match tokio::time::timeout(budget, self.extractor.extract(bytes)).await {
                        Ok(result) => result,
                        Err(_) => {
                            warn!(
                                locator = %candidate.locator,
                                budget_secs = budget.as_secs(),
                                "Candidate extraction abandoned past its budget"
                            );
                            crate::models::ExtractionResult::failed(
                                "extraction abandoned past per-candidate budget",
                            )
                        }
                    };
                (None, extraction)
            }
        };

        let validated = self.validator.validate(extraction);

        CandidateEvidence {
            source: candidate.source,
            locator: candidate.locator.clone(),
            text,
            extraction: validated.success.then_some(validated),
            source_hint: candidate.source_hint,
            fallback_date: Some(candidate.discovered_at.date_naive()),
        }
    }
}
