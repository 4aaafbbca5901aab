//! Bulk delivery of documents to Elasticsearch.
//!
//! Documents are written with `create` actions whose `_id` is the document
//! fingerprint, so the store itself refuses a second copy of a document
//! (HTTP 409 per item) even if the in-process seen set was lost.

use crate::transform::OutputDocument;
use async_trait::async_trait;
use reqwest::{header::CONTENT_TYPE, Client, RequestBuilder, StatusCode};
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("Store returned error status {status}: {body}")]
    HttpStatus { status: StatusCode, body: String },
    #[error("Invalid bulk response: {0}")]
    InvalidResponse(#[from] serde_json::Error),
    #[error("Bulk response has {got} items for {expected} documents")]
    ItemCountMismatch { expected: usize, got: usize },
}

impl IndexError {
    /// Whether retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Request(e) => e.is_timeout() || e.is_connect() || e.is_request() || e.is_body(),
            Self::HttpStatus { status, .. } => is_retriable_status(*status),
            Self::InvalidResponse(_) | Self::ItemCountMismatch { .. } => false,
        }
    }
}

fn is_retriable_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

/// Per-document result of a bulk write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemStatus {
    Indexed,
    /// A document with this id already exists.
    Duplicate,
    /// Permanently refused by the store, e.g. a mapping conflict.
    Rejected { status: u16, reason: String },
    /// Still failing after every retry.
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemOutcome {
    /// Document `_id` (the fingerprint hex).
    pub id: String,
    pub status: ItemStatus,
}

/// Outcome of delivering one batch.
#[derive(Debug, Clone, Default)]
pub struct BatchResult {
    pub outcomes: Vec<ItemOutcome>,
}

impl BatchResult {
    fn count(&self, f: impl Fn(&ItemStatus) -> bool) -> usize {
        self.outcomes.iter().filter(|o| f(&o.status)).count()
    }

    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    pub fn indexed(&self) -> usize {
        self.count(|s| matches!(s, ItemStatus::Indexed))
    }

    pub fn duplicates(&self) -> usize {
        self.count(|s| matches!(s, ItemStatus::Duplicate))
    }

    pub fn rejected(&self) -> usize {
        self.count(|s| matches!(s, ItemStatus::Rejected { .. }))
    }

    pub fn failed(&self) -> usize {
        self.count(|s| matches!(s, ItemStatus::Failed { .. }))
    }

    /// Every document failed transiently; nothing reached the store.
    pub fn is_total_failure(&self) -> bool {
        !self.outcomes.is_empty() && self.failed() == self.outcomes.len()
    }

    /// Ids of documents that failed after retries.
    pub fn failed_ids(&self) -> impl Iterator<Item = &str> {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.status, ItemStatus::Failed { .. }))
            .map(|o| o.id.as_str())
    }
}

impl fmt::Display for BatchResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "indexed={}, duplicates={}, rejected={}, failed={}",
            self.indexed(),
            self.duplicates(),
            self.rejected(),
            self.failed()
        )
    }
}

/// Destination for transformed documents.
#[async_trait]
pub trait Indexer: Send + Sync {
    /// Deliver a batch. Never fails as a whole: problems are reported per item.
    async fn index_batch(&self, documents: &[OutputDocument]) -> BatchResult;
}

/// Exponential backoff for transient bulk failures.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay after the `attempt`-th failed attempt (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// Store credentials.
#[derive(Clone, Default)]
pub enum Credentials {
    #[default]
    None,
    Basic {
        username: String,
        password: String,
    },
    ApiKey(String),
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .field("password", &"[REDACTED]")
                .finish(),
            Self::ApiKey(_) => f.write_str("ApiKey([REDACTED])"),
        }
    }
}

/// Configuration for the Elasticsearch indexer.
#[derive(Debug, Clone)]
pub struct ElasticsearchConfig {
    /// Cluster base URL
    pub url: String,
    /// Target index or data stream
    pub index: String,
    pub credentials: Credentials,
    /// Timeout for each bulk attempt
    pub timeout: Duration,
    pub retry: RetryPolicy,
    /// Maximum documents per bulk request
    pub chunk_size: usize,
}

impl ElasticsearchConfig {
    pub fn new(url: String, index: String) -> Self {
        Self {
            url,
            index,
            credentials: Credentials::None,
            timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            chunk_size: 500,
        }
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }
}

#[derive(Debug, Deserialize)]
struct BulkResponse {
    #[serde(default)]
    errors: bool,
    items: Vec<HashMap<String, BulkItem>>,
}

#[derive(Debug, Deserialize)]
struct BulkItem {
    status: u16,
    #[serde(default)]
    error: Option<BulkItemError>,
}

#[derive(Debug, Deserialize)]
struct BulkItemError {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    reason: Option<String>,
}

impl BulkItem {
    /// Stand-in for a response item without an action key, so outcomes stay
    /// aligned with the documents sent.
    fn missing() -> Self {
        Self {
            status: 0,
            error: Some(BulkItemError {
                kind: "missing_item".to_string(),
                reason: Some("bulk response item has no action result".to_string()),
            }),
        }
    }

    fn reason(&self) -> String {
        match &self.error {
            Some(err) => match &err.reason {
                Some(reason) => format!("{}: {}", err.kind, reason),
                None => err.kind.clone(),
            },
            None => format!("status {}", self.status),
        }
    }
}

enum ItemVerdict {
    Done(ItemStatus),
    Retry(String),
}

fn classify(item: &BulkItem) -> ItemVerdict {
    match item.status {
        200..=299 => ItemVerdict::Done(ItemStatus::Indexed),
        409 => ItemVerdict::Done(ItemStatus::Duplicate),
        s if StatusCode::from_u16(s).map(is_retriable_status).unwrap_or(false) => {
            ItemVerdict::Retry(item.reason())
        }
        s => ItemVerdict::Done(ItemStatus::Rejected {
            status: s,
            reason: item.reason(),
        }),
    }
}

/// Render the NDJSON body of a bulk request.
fn render_bulk(index: &str, documents: &[&OutputDocument]) -> Result<String, serde_json::Error> {
    let mut body = String::with_capacity(documents.len() * 1024);
    for doc in documents {
        let action = serde_json::json!({ "create": { "_index": index, "_id": doc.hash } });
        body.push_str(&serde_json::to_string(&action)?);
        body.push('\n');
        body.push_str(&serde_json::to_string(doc)?);
        body.push('\n');
    }
    Ok(body)
}

fn parse_bulk_response(body: &[u8], expected: usize) -> Result<Vec<BulkItem>, IndexError> {
    let response: BulkResponse = serde_json::from_slice(body)?;
    if response.items.len() != expected {
        return Err(IndexError::ItemCountMismatch {
            expected,
            got: response.items.len(),
        });
    }
    if response.errors {
        tracing::debug!("Bulk response reports item errors");
    }
    Ok(response
        .items
        .into_iter()
        .map(|mut entry| {
            entry
                .drain()
                .next()
                .map(|(_, item)| item)
                .unwrap_or_else(BulkItem::missing)
        })
        .collect())
}

/// [`Indexer`] speaking the Elasticsearch `_bulk` API.
pub struct ElasticsearchIndexer {
    client: Client,
    config: ElasticsearchConfig,
    base_url: String,
}

impl ElasticsearchIndexer {
    pub fn new(config: ElasticsearchConfig) -> Result<Self, IndexError> {
        let client = Client::builder()
            .user_agent(concat!("transitgaze/", env!("CARGO_PKG_VERSION")))
            .timeout(config.timeout)
            .gzip(true)
            .build()?;

        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            config,
        })
    }

    pub fn index_name(&self) -> &str {
        &self.config.index
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.config.credentials {
            Credentials::None => request,
            Credentials::Basic { username, password } => {
                request.basic_auth(username, Some(password))
            }
            Credentials::ApiKey(key) => request.header("Authorization", format!("ApiKey {key}")),
        }
    }

    /// Check that the cluster answers with the configured credentials.
    pub async fn ping(&self) -> Result<(), IndexError> {
        let response = self
            .authorized(self.client.get(&self.base_url))
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(IndexError::HttpStatus { status, body })
        }
    }

    async fn send_bulk(&self, documents: &[&OutputDocument]) -> Result<Vec<BulkItem>, IndexError> {
        let body = render_bulk(&self.config.index, documents)?;

        let response = self
            .authorized(self.client.post(format!("{}/_bulk", self.base_url)))
            .header(CONTENT_TYPE, "application/x-ndjson")
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(IndexError::HttpStatus {
                status,
                body: body.chars().take(500).collect(),
            });
        }

        let bytes = response.bytes().await?;
        parse_bulk_response(&bytes, documents.len())
    }

    async fn index_chunk(&self, chunk: &[OutputDocument], outcomes: &mut Vec<ItemOutcome>) {
        let retry = self.config.retry;
        let mut pending: Vec<&OutputDocument> = chunk.iter().collect();
        let mut attempt = 0u32;

        loop {
            attempt += 1;

            let last_error = match self.send_bulk(&pending).await {
                Ok(items) => {
                    let mut still_pending = Vec::new();
                    let mut reason = String::new();

                    for (doc, item) in pending.iter().zip(&items) {
                        match classify(item) {
                            ItemVerdict::Done(status) => {
                                if let ItemStatus::Rejected { status, reason } = &status {
                                    tracing::warn!(
                                        "Dropping document {} (status {}): {}",
                                        doc.hash,
                                        status,
                                        reason
                                    );
                                }
                                outcomes.push(ItemOutcome {
                                    id: doc.hash.clone(),
                                    status,
                                });
                            }
                            ItemVerdict::Retry(r) => {
                                still_pending.push(*doc);
                                reason = r;
                            }
                        }
                    }

                    if still_pending.is_empty() {
                        return;
                    }
                    pending = still_pending;
                    reason
                }
                Err(e) if e.is_transient() => e.to_string(),
                Err(e) => {
                    tracing::error!(
                        "Bulk request to {} failed permanently: {}",
                        self.config.index,
                        e
                    );
                    fail_all(&pending, &e.to_string(), outcomes);
                    return;
                }
            };

            if attempt >= retry.max_attempts {
                tracing::error!(
                    "Giving up on {} documents after {} attempts: {}",
                    pending.len(),
                    attempt,
                    last_error
                );
                fail_all(&pending, &last_error, outcomes);
                return;
            }

            let wait = retry.backoff(attempt);
            tracing::warn!(
                "Bulk attempt {}/{} left {} documents pending ({}), retrying in {:?}",
                attempt,
                retry.max_attempts,
                pending.len(),
                last_error,
                wait
            );
            sleep(wait).await;
        }
    }
}

fn fail_all(pending: &[&OutputDocument], reason: &str, outcomes: &mut Vec<ItemOutcome>) {
    outcomes.extend(pending.iter().map(|doc| ItemOutcome {
        id: doc.hash.clone(),
        status: ItemStatus::Failed {
            reason: reason.to_string(),
        },
    }));
}

#[async_trait]
impl Indexer for ElasticsearchIndexer {
    async fn index_batch(&self, documents: &[OutputDocument]) -> BatchResult {
        let mut outcomes = Vec::with_capacity(documents.len());

        for chunk in documents.chunks(self.config.chunk_size.max(1)) {
            self.index_chunk(chunk, &mut outcomes).await;
        }

        let result = BatchResult { outcomes };
        tracing::debug!("Bulk to {}: {}", self.config.index, result);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::EventFields;
    use crate::types::{Position, VehicleDescriptor, VehiclePosition};
    use axum::{extract::State, routing::post, Json, Router};
    use parking_lot::Mutex;
    use serde_json::{json, Value};
    use std::sync::Arc;

    fn doc(hash: &str) -> OutputDocument {
        OutputDocument {
            timestamp: "2024-09-16T15:20:00Z".into(),
            id: hash.into(),
            is_deleted: false,
            hash: hash.into(),
            location: None,
            vehicle: VehiclePosition {
                trip: None,
                position: Position::default(),
                current_stop_sequence: None,
                current_status: None,
                timestamp: None,
                congestion_level: None,
                stop_id: None,
                vehicle: VehicleDescriptor {
                    id: hash.into(),
                    ..Default::default()
                },
                occupancy_status: None,
                occupancy_percentage: None,
            },
            event: EventFields {
                original: "{}".into(),
                ingested: "2024-09-16T15:20:00Z".into(),
            },
        }
    }

    fn fast_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
        }
    }

    type Responder = Box<dyn Fn(&[String]) -> (u16, Value) + Send>;

    /// Bulk endpoint answering the n-th request with the n-th responder,
    /// repeating the last one once the script runs out.
    #[derive(Clone, Default)]
    struct BulkScript {
        requests: Arc<Mutex<Vec<Vec<String>>>>,
        respond: Arc<Mutex<Vec<Responder>>>,
    }

    async fn bulk_handler(
        State(script): State<BulkScript>,
        body: String,
    ) -> (axum::http::StatusCode, Json<Value>) {
        // Every other line is a document source; collect their ids from the actions
        let ids: Vec<String> = body
            .lines()
            .step_by(2)
            .filter_map(|line| serde_json::from_str::<Value>(line).ok())
            .filter_map(|v| v["create"]["_id"].as_str().map(str::to_string))
            .collect();
        let n = {
            let mut requests = script.requests.lock();
            requests.push(ids.clone());
            requests.len() - 1
        };

        let (status, value) = {
            let respond = script.respond.lock();
            let f = &respond[n.min(respond.len() - 1)];
            f(&ids)
        };
        (
            axum::http::StatusCode::from_u16(status).unwrap(),
            Json(value),
        )
    }

    async fn serve(script: BulkScript) -> String {
        let app = Router::new()
            .route("/_bulk", post(bulk_handler))
            .with_state(script);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn items(ids: &[String], status_for: impl Fn(&str) -> u16) -> Value {
        let items: Vec<Value> = ids
            .iter()
            .map(|id| {
                let status = status_for(id);
                let mut item = json!({ "_id": id, "status": status });
                if status >= 300 {
                    item["error"] = json!({ "type": "document_parsing_exception", "reason": "bad" });
                }
                json!({ "create": item })
            })
            .collect();
        json!({ "took": 1, "errors": true, "items": items })
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(1),
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(4), Duration::from_millis(800));
        assert_eq!(policy.backoff(5), Duration::from_secs(1));
        assert_eq!(policy.backoff(60), Duration::from_secs(1));
    }

    #[test]
    fn test_render_bulk() {
        let a = doc("aaa");
        let b = doc("bbb");
        let body = render_bulk("vehicle-positions", &[&a, &b]).unwrap();
        let lines: Vec<&str> = body.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(body.ends_with('\n'));

        let action: Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(action["create"]["_index"], "vehicle-positions");
        assert_eq!(action["create"]["_id"], "aaa");
        let source: Value = serde_json::from_str(lines[3]).unwrap();
        assert_eq!(source["hash"], "bbb");
    }

    #[test]
    fn test_classify_items() {
        let item = |status, error: Option<(&str, &str)>| BulkItem {
            status,
            error: error.map(|(kind, reason)| BulkItemError {
                kind: kind.into(),
                reason: Some(reason.into()),
            }),
        };

        assert!(matches!(classify(&item(201, None)), ItemVerdict::Done(ItemStatus::Indexed)));
        assert!(matches!(
            classify(&item(409, Some(("version_conflict_engine_exception", "exists")))),
            ItemVerdict::Done(ItemStatus::Duplicate)
        ));
        assert!(matches!(
            classify(&item(429, Some(("es_rejected_execution_exception", "queue full")))),
            ItemVerdict::Retry(_)
        ));
        match classify(&item(400, Some(("mapper_parsing_exception", "bad geo_point")))) {
            ItemVerdict::Done(ItemStatus::Rejected { status, reason }) => {
                assert_eq!(status, 400);
                assert_eq!(reason, "mapper_parsing_exception: bad geo_point");
            }
            _ => panic!("expected rejection"),
        }
    }

    #[test]
    fn test_parse_bulk_response_count_mismatch() {
        let body = br#"{"errors":false,"items":[{"create":{"status":201}}]}"#;
        assert!(matches!(
            parse_bulk_response(body, 2),
            Err(IndexError::ItemCountMismatch { expected: 2, got: 1 })
        ));
        assert_eq!(parse_bulk_response(body, 1).unwrap().len(), 1);
    }

    #[test]
    fn test_empty_response_item_keeps_alignment() {
        let body = br#"{"errors":true,"items":[{},{"create":{"status":201}}]}"#;
        let items = parse_bulk_response(body, 2).unwrap();
        assert_eq!(items.len(), 2);
        assert!(matches!(
            classify(&items[0]),
            ItemVerdict::Done(ItemStatus::Rejected { status: 0, .. })
        ));
        assert!(matches!(classify(&items[1]), ItemVerdict::Done(ItemStatus::Indexed)));
    }

    #[tokio::test]
    async fn test_empty_response_item_is_rejected() {
        let script = BulkScript::default();
        script.respond.lock().push(Box::new(|ids: &[String]| {
            let mut body = items(ids, |_| 201);
            body["items"][0] = json!({});
            (200, body)
        }));
        let url = serve(script.clone()).await;

        let indexer = ElasticsearchIndexer::new(ElasticsearchConfig::new(url, "vp".into())).unwrap();
        let result = indexer.index_batch(&[doc("a"), doc("b")]).await;

        assert_eq!(result.len(), 2);
        assert_eq!(result.rejected(), 1);
        assert_eq!(result.indexed(), 1);
        assert_eq!(result.outcomes[1].id, "b");
        assert_eq!(result.outcomes[1].status, ItemStatus::Indexed);
    }

    #[tokio::test]
    async fn test_partial_failure_keeps_valid_documents() {
        let script = BulkScript::default();
        script.respond.lock().push(Box::new(|ids: &[String]| {
            (200, items(ids, |id| if id == "bad" { 400 } else { 201 }))
        }));
        let url = serve(script.clone()).await;

        let indexer = ElasticsearchIndexer::new(
            ElasticsearchConfig::new(url, "vp".into()).with_retry(fast_retry(3)),
        )
        .unwrap();

        let docs = vec![doc("a"), doc("b"), doc("bad"), doc("c")];
        let result = indexer.index_batch(&docs).await;

        assert_eq!(result.indexed(), 3);
        assert_eq!(result.rejected(), 1);
        assert_eq!(result.failed(), 0);
        assert_eq!(script.requests.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let script = BulkScript::default();
        {
            let mut respond = script.respond.lock();
            respond.push(Box::new(|_: &[String]| {
                (503, json!({ "error": "unavailable" }))
            }));
            // Second attempt: one item throttled, the rest stored
            respond.push(Box::new(|ids: &[String]| {
                (200, items(ids, |id| if id == "b" { 429 } else { 201 }))
            }));
            respond.push(Box::new(|ids: &[String]| (200, items(ids, |_| 201))));
        }
        let url = serve(script.clone()).await;

        let indexer = ElasticsearchIndexer::new(
            ElasticsearchConfig::new(url, "vp".into()).with_retry(fast_retry(5)),
        )
        .unwrap();

        let result = indexer.index_batch(&[doc("a"), doc("b")]).await;
        assert_eq!(result.indexed(), 2);

        let requests = script.requests.lock();
        assert_eq!(requests.len(), 3);
        assert_eq!(requests[2], vec!["b".to_string()]);
    }

    #[tokio::test]
    async fn test_retries_exhausted_reports_failed() {
        let script = BulkScript::default();
        script.respond.lock().push(Box::new(|_: &[String]| {
            (503, json!({ "error": "unavailable" }))
        }));
        let url = serve(script.clone()).await;

        let indexer = ElasticsearchIndexer::new(
            ElasticsearchConfig::new(url, "vp".into()).with_retry(fast_retry(3)),
        )
        .unwrap();

        let result = indexer.index_batch(&[doc("a"), doc("b")]).await;
        assert!(result.is_total_failure());
        assert_eq!(result.failed_ids().collect::<Vec<_>>(), ["a", "b"]);
        assert_eq!(script.requests.lock().len(), 3);
    }

    #[tokio::test]
    async fn test_documents_are_chunked() {
        let script = BulkScript::default();
        script
            .respond
            .lock()
            .push(Box::new(|ids: &[String]| (200, items(ids, |_| 201))));
        let url = serve(script.clone()).await;

        let indexer = ElasticsearchIndexer::new(
            ElasticsearchConfig::new(url, "vp".into()).with_chunk_size(2),
        )
        .unwrap();

        let docs: Vec<_> = ["a", "b", "c", "d", "e"].into_iter().map(doc).collect();
        let result = indexer.index_batch(&docs).await;

        assert_eq!(result.indexed(), 5);
        let sizes: Vec<usize> = script.requests.lock().iter().map(Vec::len).collect();
        assert_eq!(sizes, [2, 2, 1]);
    }
}
