//! Local receipt-store source
//!
//! Recursive scan of a receipts directory, filtered by image/document
//! extension and by date proximity (filename date when present, otherwise
//! file modification time).

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::Result;
use crate::models::{CandidatePayload, CandidateSource, ReceiptCandidate, Transaction};

use super::SourceAdapter;

/// File extensions worth treating as receipt evidence
const RECEIPT_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "heic", "tif", "tiff", "bmp", "pdf"];

/// Cap on candidates per scan; harvesting is cheap, extraction is not
const MAX_CANDIDATES: usize = 25;

/// Dates embedded in filenames ("receipt_2024-06-10.jpg", "IMG_20240610.png")
static FILENAME_DATE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d{4})[-_]?(\d{2})[-_]?(\d{2})").expect("filename date regex"));

/// Filesystem receipt store
pub struct LocalStoreSource {
    root: PathBuf,
}

impl LocalStoreSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl SourceAdapter for LocalStoreSource {
    fn source(&self) -> CandidateSource {
        CandidateSource::LocalFile
    }

    async fn search(
        &self,
        transaction: &Transaction,
        window_days: i64,
    ) -> Result<Vec<ReceiptCandidate>> {
        let mut candidates = Vec::new();
        let mut skipped = 0usize;

        for entry in WalkDir::new(&self.root).follow_links(false) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(error = %e, "Skipping unreadable store entry");
                    continue;
                }
            };
            let path = entry.path();
            if !entry.file_type().is_file() || !has_receipt_extension(path) {
                continue;
            }

            let modified: Option<DateTime<Utc>> = entry
                .metadata()
                .ok()
                .and_then(|m| m.modified().ok())
                .map(DateTime::from);

            let file_date = filename_date(path).or_else(|| modified.map(|m| m.date_naive()));
            if !within_window(file_date, transaction.date, window_days) {
                continue;
            }

            if candidates.len() >= MAX_CANDIDATES {
                skipped += 1;
                continue;
            }

            let bytes = match std::fs::read(path) {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Cannot read receipt file");
                    continue;
                }
            };

            candidates.push(ReceiptCandidate {
                source: CandidateSource::LocalFile,
                locator: path.display().to_string(),
                payload: CandidatePayload::Bytes(bytes),
                discovered_at: file_timestamp(file_date, modified),
                source_hint: 0.5,
            });
        }

        if skipped > 0 {
            warn!(
                skipped,
                cap = MAX_CANDIDATES,
                "Local store scan hit the candidate cap; extra files dropped"
            );
        }
        debug!(
            root = %self.root.display(),
            candidates = candidates.len(),
            "Local store scan complete"
        );
        Ok(candidates)
    }
}

fn has_receipt_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| RECEIPT_EXTENSIONS.contains(&e.to_lowercase().as_str()))
        .unwrap_or(false)
}

/// Pull a plausible date out of the filename
fn filename_date(path: &Path) -> Option<NaiveDate> {
    let name = path.file_stem()?.to_str()?;
    for captures in FILENAME_DATE_RE.captures_iter(name) {
        let year: i32 = captures[1].parse().ok()?;
        let month: u32 = captures[2].parse().ok()?;
        let day: u32 = captures[3].parse().ok()?;
        if (2000..=2100).contains(&year) {
            if let Some(date) = NaiveDate::from_ymd_opt(year, month, day) {
                return Some(date);
            }
        }
    }
    None
}

fn within_window(candidate: Option<NaiveDate>, transaction: NaiveDate, window_days: i64) -> bool {
    match candidate {
        Some(date) => (transaction - date).num_days().abs() <= window_days,
        // No date evidence at all: keep the file, extraction will decide
        None => true,
    }
}

/// Candidate timestamp: the file's date evidence at midnight, else mtime
fn file_timestamp(date: Option<NaiveDate>, modified: Option<DateTime<Utc>>) -> DateTime<Utc> {
    if let Some(date) = date {
        if let Some(midnight) = date.and_hms_opt(0, 0, 0) {
            return DateTime::from_naive_utc_and_offset(midnight, Utc);
        }
    }
    modified.unwrap_or_else(Utc::now)
}
