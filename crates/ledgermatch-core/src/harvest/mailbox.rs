//! Mailbox search source
//!
//! Queries a collaborator-provided mail search endpoint (one adapter per
//! account). The endpoint owns authentication to the actual mail provider;
//! this adapter only builds the search query from merchant tokens and the
//! date window, and turns hits into candidates.
//!
//! Endpoint contract: `POST {endpoint}/search` with
//! `{"account", "query", "after", "before"}`, answering
//! `{"hits": [{"id", "date", "subject", "body_html", "attachments":
//! [{"filename", "content_base64"}]}]}`.

use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::models::{CandidatePayload, CandidateSource, ReceiptCandidate, Transaction};
use crate::normalize::significant_words;

use super::SourceAdapter;

/// One mail account behind the search endpoint
pub struct MailboxSource {
    http_client: Client,
    endpoint: String,
    account: String,
}

impl MailboxSource {
    pub fn new(endpoint: &str, account: &str) -> Self {
        Self {
            http_client: Client::new(),
            endpoint: endpoint.trim_end_matches('/').to_string(),
            account: account.to_string(),
        }
    }

    pub fn account(&self) -> &str {
        &self.account
    }

    /// Search query from the transaction's merchant tokens
    ///
    /// Falls back to receipt keywords when the description normalizes to
    /// nothing usable.
    fn build_query(&self, transaction: &Transaction) -> String {
        let words = significant_words(&transaction.description);
        if words.is_empty() {
            "receipt OR invoice OR order".to_string()
        } else {
            words.join(" ")
        }
    }
}

#[derive(Debug, Serialize)]
struct SearchRequest<'a> {
    account: &'a str,
    query: String,
    after: NaiveDate,
    before: NaiveDate,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    hits: Vec<MailHit>,
}

#[derive(Debug, Deserialize)]
struct MailHit {
    id: String,
    date: Option<DateTime<Utc>>,
    #[serde(default)]
    #[allow(dead_code)]
    subject: String,
    #[serde(default)]
    body_html: Option<String>,
    #[serde(default)]
    attachments: Vec<MailAttachment>,
}

#[derive(Debug, Deserialize)]
struct MailAttachment {
    filename: String,
    content_base64: String,
}

#[async_trait]
impl SourceAdapter for MailboxSource {
    fn source(&self) -> CandidateSource {
        CandidateSource::Mailbox
    }

    async fn search(
        &self,
        transaction: &Transaction,
        window_days: i64,
    ) -> Result<Vec<ReceiptCandidate>> {
        let request = SearchRequest {
            account: &self.account,
            query: self.build_query(transaction),
            after: transaction.date - Duration::days(window_days),
            before: transaction.date + Duration::days(window_days),
        };

        let response = self
            .http_client
            .post(format!("{}/search", self.endpoint))
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Error::Harvest(format!(
                "mail search for {} returned {}",
                self.account,
                response.status()
            )));
        }

        let search: SearchResponse = response.json().await?;
        let mut candidates = Vec::new();

        for hit in search.hits {
            let discovered_at = hit.date.unwrap_or_else(Utc::now);

            for attachment in hit.attachments {
                let bytes = match base64::engine::general_purpose::STANDARD
                    .decode(&attachment.content_base64)
                {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        warn!(
                            message = %hit.id,
                            attachment = %attachment.filename,
                            error = %e,
                            "Skipping undecodable attachment"
                        );
                        continue;
                    }
                };
                candidates.push(ReceiptCandidate {
                    source: CandidateSource::Mailbox,
                    locator: format!("mail://{}/{}/{}", self.account, hit.id, attachment.filename),
                    payload: CandidatePayload::Bytes(bytes),
                    discovered_at,
                    source_hint: 0.5,
                });
            }

            if let Some(body) = hit.body_html.filter(|b| !b.trim().is_empty()) {
                candidates.push(ReceiptCandidate {
                    source: CandidateSource::Mailbox,
                    locator: format!("mail://{}/{}", self.account, hit.id),
                    payload: CandidatePayload::Text(strip_html(&body)),
                    discovered_at,
                    source_hint: 0.5,
                });
            }
        }

        debug!(
            account = %self.account,
            candidates = candidates.len(),
            "Mailbox search complete"
        );
        Ok(candidates)
    }
}

/// Reduce rendered HTML to visible text, line per block element
fn strip_html(html: &str) -> String {
    let mut text = String::with_capacity(html.len());
    let mut in_tag = false;
    let mut tag = String::new();

    for c in html.chars() {
        match c {
            '<' => {
                in_tag = true;
                tag.clear();
            }
            '>' => {
                in_tag = false;
                let name = tag
                    .trim_start_matches('/')
                    .split_whitespace()
                    .next()
                    .unwrap_or("")
                    .to_lowercase();
                if matches!(name.as_str(), "br" | "p" | "div" | "tr" | "li" | "h1" | "h2" | "h3") {
                    text.push('\n');
                }
            }
            _ if in_tag => tag.push(c),
            _ => text.push(c),
        }
    }

    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}
