//! Candidate harvesting
//!
//! Three independent source adapters gather receipt candidates for a
//! transaction: the local receipt store, per-account mailbox search, and the
//! local message history. Sources run concurrently, each under its own
//! timeout; a slow or failed source degrades evidence coverage, never the
//! match itself.

pub mod local;
pub mod mailbox;
pub mod messages;

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::config::HarvestConfig;
use crate::error::Result;
use crate::models::{
    CandidateSource, HarvestOutcome, ReceiptCandidate, SourceState, SourceStatus, Transaction,
};

pub use local::LocalStoreSource;
pub use mailbox::MailboxSource;
pub use messages::MessageStoreSource;

/// One evidence source the harvester can query
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    /// Which source this adapter speaks for
    fn source(&self) -> CandidateSource;

    /// Search for candidates around the transaction's date
    async fn search(
        &self,
        transaction: &Transaction,
        window_days: i64,
    ) -> Result<Vec<ReceiptCandidate>>;
}

/// Concurrent harvester over a set of source adapters
pub struct Harvester {
    sources: Vec<Arc<dyn SourceAdapter>>,
    config: HarvestConfig,
}

impl Harvester {
    pub fn new(config: HarvestConfig) -> Self {
        Self {
            sources: Vec::new(),
            config,
        }
    }

    pub fn with_source(mut self, source: Arc<dyn SourceAdapter>) -> Self {
        self.sources.push(source);
        self
    }

    /// Gather candidates from every source
    ///
    /// Each source runs in its own task with its own timeout and fails
    /// independently. The outcome is the union of whatever succeeded, deduped
    /// by content hash, plus a status per source.
    pub async fn harvest(&self, transaction: &Transaction) -> HarvestOutcome {
        let mut handles = Vec::with_capacity(self.sources.len());

        for adapter in &self.sources {
            let adapter = adapter.clone();
            let transaction = transaction.clone();
            let timeout = self.config.source_timeout;
            let window = self.config.date_window_days;

            handles.push((
                adapter.source(),
                tokio::spawn(async move {
                    tokio::time::timeout(timeout, adapter.search(&transaction, window)).await
                }),
            ));
        }

        let mut outcome = HarvestOutcome::default();
        let mut seen_hashes: HashSet<String> = HashSet::new();

        for (source, handle) in handles {
            let state = match handle.await {
                Ok(Ok(Ok(candidates))) => {
                    let mut kept = 0;
                    for candidate in candidates {
                        if candidate.payload.is_empty() {
                            continue;
                        }
                        if seen_hashes.insert(candidate.content_hash()) {
                            kept += 1;
                            outcome.candidates.push(candidate);
                        }
                    }
                    debug!(source = %source, candidates = kept, "Source completed");
                    SourceState::Ok(kept)
                }
                Ok(Ok(Err(e))) => {
                    warn!(source = %source, error = %e, "Source failed");
                    SourceState::Failed(e.to_string())
                }
                Ok(Err(_elapsed)) => {
                    warn!(source = %source, "Source timed out");
                    SourceState::TimedOut
                }
                Err(join_error) => {
                    warn!(source = %source, error = %join_error, "Source task failed");
                    SourceState::Failed(join_error.to_string())
                }
            };
            outcome.statuses.push(SourceStatus { source, state });
        }

        outcome
    }
}
