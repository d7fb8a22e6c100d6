//! Test utilities for ledgermatch-core
//!
//! Mock HTTP servers for the two network seams: the vision-model inference
//! server and the mailbox search endpoint. Used by unit tests here and
//! available to downstream integration tests via the `test-utils` feature.

use axum::{
    extract::{Json, State},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use tokio::sync::oneshot;

/// Mock vision-model inference server
pub struct MockVisionServer {
    addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl MockVisionServer {
    /// Start with a clean canned receipt response
    pub async fn start() -> Self {
        Self::start_with_response(
            r#"{"merchant": "Target", "date": "2024-01-15", "subtotal": 25.00, "total": 27.00}"#,
        )
        .await
    }

    /// Start with a looping-decoder response
    pub async fn start_garbled() -> Self {
        Self::start_with_response(
            "total total total total total total total total total total total total",
        )
        .await
    }

    /// Start the mock server on an available port with a fixed response for
    /// receipt-parse prompts; tip prompts always answer with no tip
    pub async fn start_with_response(response: &str) -> Self {
        let response = response.to_string();
        let app = Router::new()
            .route("/api/tags", get(handle_tags))
            .route("/api/generate", post(handle_generate))
            .with_state(response);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    shutdown_rx.await.ok();
                })
                .await
                .unwrap();
        });

        Self {
            addr,
            shutdown_tx: Some(shutdown_tx),
        }
    }

    /// Get the base URL for this mock server
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Stop the mock server
    pub fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for MockVisionServer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Tags endpoint response (health check)
async fn handle_tags() -> Json<TagsResponse> {
    Json(TagsResponse {
        models: vec![ModelInfo {
            name: "receipt-vision:latest".to_string(),
            modified_at: "2024-01-01T00:00:00Z".to_string(),
            size: 4_000_000_000,
        }],
    })
}

/// Generate endpoint: canned receipt for parse prompts, no tip otherwise
async fn handle_generate(
    State(canned): State<String>,
    Json(request): Json<GenerateRequest>,
) -> Json<GenerateResponse> {
    // The tip prompt asks about handwritten amounts; everything else is the
    // receipt-parse prompt
    let response = if request.prompt.contains("handwritten") {
        r#"{"tip": null}"#.to_string()
    } else {
        canned
    };

    Json(GenerateResponse {
        model: request.model,
        response,
        done: true,
    })
}

#[derive(Debug, Serialize)]
struct TagsResponse {
    models: Vec<ModelInfo>,
}

#[derive(Debug, Serialize)]
struct ModelInfo {
    name: String,
    modified_at: String,
    size: u64,
}

#[derive(Debug, Deserialize)]
struct GenerateRequest {
    model: String,
    prompt: String,
    #[serde(default)]
    #[allow(dead_code)]
    images: Vec<String>,
    #[allow(dead_code)]
    stream: bool,
}

#[derive(Debug, Serialize)]
struct GenerateResponse {
    model: String,
    response: String,
    done: bool,
}

/// A canned mail search hit
#[derive(Debug, Clone, Serialize)]
pub struct MailHitFixture {
    pub id: String,
    pub date: Option<chrono::DateTime<chrono::Utc>>,
    pub subject: String,
    pub body_html: Option<String>,
    pub attachments: Vec<MailAttachmentFixture>,
}

/// A canned mail attachment
#[derive(Debug, Clone, Serialize)]
pub struct MailAttachmentFixture {
    pub filename: String,
    pub content_base64: String,
}

/// Mock mailbox search endpoint
pub struct MockMailboxServer {
    addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl MockMailboxServer {
    /// Start with a fixed set of hits returned for every search
    pub async fn start(hits: Vec<MailHitFixture>) -> Self {
        let app = Router::new()
            .route("/search", post(handle_search))
            .with_state(hits);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    shutdown_rx.await.ok();
                })
                .await
                .unwrap();
        });

        Self {
            addr,
            shutdown_tx: Some(shutdown_tx),
        }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for MockMailboxServer {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn handle_search(
    State(hits): State<Vec<MailHitFixture>>,
    Json(_request): Json<serde_json::Value>,
) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "hits": hits }))
}
