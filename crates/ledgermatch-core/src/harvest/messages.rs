//! Message-history source
//!
//! Read-only scan of the local message store (SQLite) for a window around
//! the transaction date. Receipt-looking URLs are pulled out with a curated
//! pattern set (payment/delivery platforms score above generic
//! receipt/invoice/order URLs) and the linked resource is downloaded as the
//! candidate payload; messages whose text carries a near-matching amount
//! become text candidates on their own.
//!
//! The store schema belongs to the messaging app. This adapter targets the
//! minimal projection `messages(rowid, text, date)` with `date` in unix
//! seconds; schema drift surfaces as a per-source failure, never a pipeline
//! failure.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Client;
use rusqlite::{params, Connection, OpenFlags};
use tracing::{debug, warn};

use crate::error::Result;
use crate::models::{CandidatePayload, CandidateSource, ReceiptCandidate, Transaction};

use super::SourceAdapter;

/// URLs of payment processors and delivery platforms; near-certain receipts
static TRUSTED_URL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)https?://[^\s>\)]*(?:uber\.com|lyft\.com|doordash\.com|grubhub\.com|squareup\.com|square\.site|stripe\.com|paypal\.com|toasttab\.com|instacart\.com|amazon\.com)[^\s>\)]*",
    )
    .expect("trusted url regex")
});

/// Generic receipt-ish URLs
static RECEIPT_URL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)https?://[^\s>\)]*(?:receipt|invoice|order)[^\s>\)]*")
        .expect("receipt url regex")
});

/// Amounts inside message text
static MESSAGE_AMOUNT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\s*\d{1,6}(?:,\d{3})*\.\d{2}").expect("message amount regex"));

/// How close a message amount must be to the transaction to count as evidence
const AMOUNT_PROXIMITY: f64 = 0.50;

/// One row from the message store
struct MessageRow {
    rowid: i64,
    text: String,
    date: DateTime<Utc>,
}

/// Local message-history store
pub struct MessageStoreSource {
    db_path: PathBuf,
    http_client: Client,
    /// Download linked resources as payloads (disable for offline tests)
    download_urls: bool,
}

impl MessageStoreSource {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
            http_client: Client::new(),
            download_urls: true,
        }
    }

    /// Keep URL candidates but skip the network fetch; the message text
    /// stands in as the payload
    pub fn without_downloads(mut self) -> Self {
        self.download_urls = false;
        self
    }

    /// Window query against the store, oldest first for determinism
    fn rows_in_window(
        &self,
        transaction: &Transaction,
        window_days: i64,
    ) -> Result<Vec<MessageRow>> {
        let conn = Connection::open_with_flags(
            &self.db_path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;

        let from = day_start(transaction, -window_days);
        let to = day_start(transaction, window_days + 1);

        let mut stmt = conn.prepare(
            "SELECT rowid, text, date FROM messages
             WHERE date >= ? AND date < ? AND text IS NOT NULL
             ORDER BY date ASC, rowid ASC",
        )?;

        let rows = stmt
            .query_map(params![from, to], |row| {
                let rowid: i64 = row.get(0)?;
                let text: String = row.get(1)?;
                let epoch: i64 = row.get(2)?;
                Ok((rowid, text, epoch))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(rows
            .into_iter()
            .map(|(rowid, text, epoch)| MessageRow {
                rowid,
                text,
                date: DateTime::from_timestamp(epoch, 0).unwrap_or_else(Utc::now),
            })
            .collect())
    }

    /// Fetch a linked resource; errors degrade to the message text
    async fn fetch_url(&self, url: &str, message_text: &str) -> CandidatePayload {
        if !self.download_urls {
            return CandidatePayload::Text(message_text.to_string());
        }

        match self.http_client.get(url).send().await {
            Ok(response) if response.status().is_success() => {
                let is_text = response
                    .headers()
                    .get(reqwest::header::CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok())
                    .map(|ct| ct.starts_with("text/"))
                    .unwrap_or(false);
                if is_text {
                    match response.text().await {
                        Ok(body) => CandidatePayload::Text(body),
                        Err(e) => {
                            warn!(url, error = %e, "Linked resource body unreadable");
                            CandidatePayload::Text(message_text.to_string())
                        }
                    }
                } else {
                    match response.bytes().await {
                        Ok(bytes) => CandidatePayload::Bytes(bytes.to_vec()),
                        Err(e) => {
                            warn!(url, error = %e, "Linked resource bytes unreadable");
                            CandidatePayload::Text(message_text.to_string())
                        }
                    }
                }
            }
            Ok(response) => {
                warn!(url, status = %response.status(), "Linked resource fetch failed");
                CandidatePayload::Text(message_text.to_string())
            }
            Err(e) => {
                warn!(url, error = %e, "Linked resource unreachable");
                CandidatePayload::Text(message_text.to_string())
            }
        }
    }
}

#[async_trait]
impl SourceAdapter for MessageStoreSource {
    fn source(&self) -> CandidateSource {
        CandidateSource::MessageHistory
    }

    async fn search(
        &self,
        transaction: &Transaction,
        window_days: i64,
    ) -> Result<Vec<ReceiptCandidate>> {
        let rows = self.rows_in_window(transaction, window_days)?;
        let mut candidates = Vec::new();

        for row in &rows {
            let urls = receipt_urls(&row.text);

            for (url, hint) in &urls {
                let payload = self.fetch_url(url, &row.text).await;
                candidates.push(ReceiptCandidate {
                    source: CandidateSource::MessageHistory,
                    locator: url.clone(),
                    payload,
                    discovered_at: row.date,
                    source_hint: *hint,
                });
            }

            // Amount heuristic: a message quoting (roughly) the transaction
            // amount is evidence even without a link
            if urls.is_empty() && mentions_amount(&row.text, transaction.amount) {
                candidates.push(ReceiptCandidate {
                    source: CandidateSource::MessageHistory,
                    locator: format!("message://{}", row.rowid),
                    payload: CandidatePayload::Text(row.text.clone()),
                    discovered_at: row.date,
                    source_hint: 0.5,
                });
            }
        }

        debug!(
            store = %self.db_path.display(),
            messages = rows.len(),
            candidates = candidates.len(),
            "Message history scan complete"
        );
        Ok(candidates)
    }
}

fn day_start(transaction: &Transaction, offset_days: i64) -> i64 {
    let date = transaction.date + Duration::days(offset_days);
    date.and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc().timestamp())
        .unwrap_or(0)
}

/// Receipt-looking URLs with their quality hints, best patterns first
fn receipt_urls(text: &str) -> Vec<(String, f64)> {
    let mut urls = Vec::new();

    for m in TRUSTED_URL_RE.find_iter(text) {
        urls.push((m.as_str().to_string(), 0.9));
    }
    for m in RECEIPT_URL_RE.find_iter(text) {
        let url = m.as_str().to_string();
        if !urls.iter().any(|(existing, _)| existing == &url) {
            urls.push((url, 0.7));
        }
    }

    urls
}

/// The message quotes an amount close to the transaction's
fn mentions_amount(text: &str, transaction_amount: f64) -> bool {
    let target = transaction_amount.abs();
    MESSAGE_AMOUNT_RE.find_iter(text).any(|m| {
        let amount = crate::normalize::parse_amount(m.as_str());
        (amount - target).abs() <= AMOUNT_PROXIMITY
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn seed_store(path: &std::path::Path, rows: &[(i64, &str, i64)]) {
        let conn = Connection::open(path).unwrap();
        conn.execute(
            "CREATE TABLE messages (rowid INTEGER PRIMARY KEY, text TEXT, date INTEGER)",
            [],
        )
        .unwrap();
        for (rowid, text, date) in rows {
            conn.execute(
                "INSERT INTO messages (rowid, text, date) VALUES (?, ?, ?)",
                params![rowid, text, date],
            )
            .unwrap();
        }
    }

    fn transaction(amount: f64, date: NaiveDate) -> Transaction {
        Transaction {
            id: 1,
            description: "UBER TRIP".into(),
            amount,
            date,
            category: None,
        }
    }

    fn epoch(date: NaiveDate) -> i64 {
        date.and_hms_opt(12, 0, 0).unwrap().and_utc().timestamp()
    }

    #[test]
    fn test_receipt_url_scoring() {
        let urls = receipt_urls(
            "Your trip: https://www.uber.com/ride/abc and also \
             https://example.com/receipt/99 plus https://example.com/unrelated",
        );
        assert_eq!(urls.len(), 2);
        assert_eq!(urls[0].1, 0.9);
        assert!(urls[0].0.contains("uber.com"));
        assert_eq!(urls[1].1, 0.7);
        assert!(urls[1].0.contains("receipt"));
    }

    #[test]
    fn test_mentions_amount_tolerance() {
        assert!(mentions_amount("Dinner was $28.75 tonight", -28.75));
        assert!(mentions_amount("about $28.50 I think", -28.75));
        assert!(!mentions_amount("that was $45.00", -28.75));
        assert!(!mentions_amount("no amounts here", -28.75));
    }

    #[tokio::test]
    async fn test_window_query_and_amount_candidates() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("messages.db");
        let date = NaiveDate::from_ymd_opt(2024, 6, 10).unwrap();

        seed_store(
            &db,
            &[
                (1, "Uber trip receipt total $28.75", epoch(date)),
                (2, "lunch tomorrow?", epoch(date)),
                (
                    3,
                    "old charge $28.75",
                    epoch(NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()),
                ),
            ],
        );

        let source = MessageStoreSource::new(&db).without_downloads();
        let candidates = source.search(&transaction(-28.75, date), 5).await.unwrap();

        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].locator, "message://1");
        assert_eq!(candidates[0].source, CandidateSource::MessageHistory);
        assert_eq!(candidates[0].discovered_at.date_naive(), date);
    }

    #[tokio::test]
    async fn test_url_candidates_without_downloads() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("messages.db");
        let date = NaiveDate::from_ymd_opt(2024, 6, 10).unwrap();

        seed_store(
            &db,
            &[(1, "ride done https://www.uber.com/ride/abc123", epoch(date))],
        );

        let source = MessageStoreSource::new(&db).without_downloads();
        let candidates = source.search(&transaction(-28.75, date), 5).await.unwrap();

        assert_eq!(candidates.len(), 1);
        assert!(candidates[0].locator.contains("uber.com"));
        assert_eq!(candidates[0].source_hint, 0.9);
        assert!(matches!(candidates[0].payload, CandidatePayload::Text(_)));
    }

    #[tokio::test]
    async fn test_missing_store_is_source_error() {
        let source = MessageStoreSource::new("/nonexistent/messages.db");
        let tx = transaction(-28.75, NaiveDate::from_ymd_opt(2024, 6, 10).unwrap());
        assert!(source.search(&tx, 5).await.is_err());
    }
}
