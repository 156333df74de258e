//! OpenSearch implementation of [`VectorIndex`] and [`RecordSource`].
//!
//! Talks to the REST API directly with `reqwest`:
//!
//! | Operation | Endpoint |
//! |-----------|----------|
//! | ping | `GET /` |
//! | scan | `POST /{index}/_search?scroll=5m`, then `POST /_search/scroll` |
//! | bulk upsert | `POST /_bulk` (NDJSON `index` actions keyed by `_id`) |
//! | kNN search | `POST /{index}/_search` with a `knn` query |
//! | dimension | `GET /{index}/_mapping` |
//! | count | `GET /{index}/_count` |

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use qaseek_core::{
    BulkItemFailure, BulkOutcome, CanonicalRecord, IndexedDocument, KnnQuery, RawRecord, RecordError,
    RecordSource, RecordStream, SearchHit, StoreError, VectorCollection, VectorIndex,
};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::time::Duration;
use tracing::{debug, info, warn};

/// How long a scroll context stays alive between pages.
const SCROLL_KEEP_ALIVE: &str = "5m";

/// Connection settings for an OpenSearch cluster.
#[derive(Debug, Clone)]
pub struct OpenSearchConfig {
    /// Base URL, e.g. `https://localhost:9200`
    pub url: String,
    pub username: String,
    pub password: Option<String>,
    /// Accept self-signed certificates (development clusters)
    pub accept_invalid_certs: bool,
    /// Per-request timeout
    pub timeout: Duration,
    /// Request gzip-compressed responses
    pub compression: bool,
}

impl Default for OpenSearchConfig {
    fn default() -> Self {
        Self {
            url: "https://localhost:9200".to_string(),
            username: "admin".to_string(),
            password: None,
            accept_invalid_certs: true,
            timeout: Duration::from_secs(30),
            compression: true,
        }
    }
}

/// OpenSearch REST client.
pub struct OpenSearchStore {
    client: Client,
    base_url: String,
    username: String,
    password: Option<String>,
}

impl OpenSearchStore {
    /// Build a client. No request is made until the first call.
    pub fn new(config: OpenSearchConfig) -> Result<Self, StoreError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.timeout)
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .gzip(config.compression)
            .build()
            .map_err(|e| StoreError::Request(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            username: config.username,
            password: config.password,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}/{}", self.base_url, path.trim_start_matches('/'));
        let builder = self.client.request(method, url);
        match &self.password {
            Some(password) => builder.basic_auth(&self.username, Some(password)),
            None => builder,
        }
    }

    /// Send a request and map transport and status failures.
    async fn send(&self, builder: RequestBuilder) -> Result<Response, StoreError> {
        let response = builder.send().await.map_err(map_transport_error)?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        Err(match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                StoreError::Unauthorized(format!("{status}: {}", truncate(&body, 200)))
            }
            StatusCode::NOT_FOUND => StoreError::NotFound(truncate(&body, 200)),
            _ => StoreError::Status {
                status: status.as_u16(),
                body: truncate(&body, 500),
            },
        })
    }

    async fn send_json<T: for<'de> Deserialize<'de>>(
        &self,
        builder: RequestBuilder,
    ) -> Result<T, StoreError> {
        let response = self.send(builder).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| StoreError::Decode(e.to_string()))
    }

    async fn open_scroll(&self, collection: &str, page_size: usize) -> Result<ScrollPage, StoreError> {
        let body = json!({
            "size": page_size,
            "sort": ["_doc"],
            "query": { "match_all": {} },
        });
        let path = format!("{collection}/_search?scroll={SCROLL_KEEP_ALIVE}");
        self.send_json(self.request(Method::POST, &path).json(&body))
            .await
    }

    async fn next_scroll(&self, scroll_id: &str) -> Result<ScrollPage, StoreError> {
        let body = json!({ "scroll": SCROLL_KEEP_ALIVE, "scroll_id": scroll_id });
        self.send_json(self.request(Method::POST, "_search/scroll").json(&body))
            .await
    }

    fn clear_scroll_request(&self, scroll_id: &str) -> RequestBuilder {
        let body = json!({ "scroll_id": [scroll_id] });
        self.request(Method::DELETE, "_search/scroll").json(&body)
    }

    async fn clear_scroll(&self, scroll_id: &str) {
        if let Err(e) = self.send(self.clear_scroll_request(scroll_id)).await {
            warn!("Failed to clear scroll context: {}", e);
        }
    }

    /// Advance a scan by one page.
    async fn scan_step(
        &self,
        state: ScanState,
        collection: &str,
        page_size: usize,
    ) -> Option<(Vec<Result<CanonicalRecord, RecordError>>, ScanState)> {
        let (page, previous) = match state {
            ScanState::Start => (self.open_scroll(collection, page_size).await, None),
            ScanState::Scrolling(guard) => (self.next_scroll(guard.id()).await, Some(guard)),
            ScanState::Done => return None,
        };

        let page = match page {
            Ok(page) => page,
            Err(e) => {
                if let Some(guard) = previous {
                    self.clear_scroll(&guard.disarm()).await;
                }
                return Some((vec![Err(RecordError::Source(e))], ScanState::Done));
            }
        };

        // The current page carries the live scroll id from here on
        if let Some(guard) = previous {
            guard.disarm();
        }

        if page.hits.hits.is_empty() {
            if let Some(scroll_id) = page.scroll_id.as_deref() {
                self.clear_scroll(scroll_id).await;
            }
            return None;
        }

        let next = match page.scroll_id {
            Some(scroll_id) => {
                let release = self.clear_scroll_request(&scroll_id);
                ScanState::Scrolling(ScrollGuard::new(scroll_id, release))
            }
            None => {
                let err = StoreError::Decode("search response has no _scroll_id".to_string());
                return Some((vec![Err(RecordError::Source(err))], ScanState::Done));
            }
        };

        debug!("Fetched page of {} records from {}", page.hits.hits.len(), collection);
        let records = page
            .hits
            .hits
            .into_iter()
            .map(|hit| {
                let mut raw: RawRecord = serde_json::from_value(hit.source).map_err(|e| {
                    RecordError::Rejected {
                        id: Some(hit.id.clone()),
                        reason: e.to_string(),
                    }
                })?;
                raw.id = Some(hit.id);
                raw.into_canonical()
            })
            .collect();

        Some((records, next))
    }
}

fn map_transport_error(e: reqwest::Error) -> StoreError {
    if e.is_timeout() {
        StoreError::Timeout(e.to_string())
    } else if e.is_connect() {
        StoreError::Unreachable(e.to_string())
    } else if e.is_decode() {
        StoreError::Decode(e.to_string())
    } else {
        StoreError::Request(e.to_string())
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max_chars).collect();
        format!("{cut}...")
    }
}

enum ScanState {
    Start,
    Scrolling(ScrollGuard),
    Done,
}

/// Open scroll context that is cleared in the background if the scan is
/// dropped before it finishes.
struct ScrollGuard {
    scroll_id: String,
    release: Option<RequestBuilder>,
}

impl ScrollGuard {
    fn new(scroll_id: String, release: RequestBuilder) -> Self {
        Self {
            scroll_id,
            release: Some(release),
        }
    }

    fn id(&self) -> &str {
        &self.scroll_id
    }

    /// Hand the context back to the caller, who becomes responsible for it.
    fn disarm(mut self) -> String {
        self.release = None;
        std::mem::take(&mut self.scroll_id)
    }
}

impl Drop for ScrollGuard {
    fn drop(&mut self) {
        let Some(release) = self.release.take() else {
            return;
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!("No runtime to clear scroll context; it expires after {SCROLL_KEEP_ALIVE}");
            return;
        };
        debug!("Scan dropped early, clearing scroll context");
        handle.spawn(async move {
            if let Err(e) = release.send().await {
                warn!("Failed to clear scroll context: {}", e);
            }
        });
    }
}

#[derive(Deserialize)]
struct ScrollPage {
    #[serde(rename = "_scroll_id")]
    scroll_id: Option<String>,
    hits: HitsEnvelope,
}

#[derive(Deserialize)]
struct HitsEnvelope {
    #[serde(default)]
    hits: Vec<Hit>,
}

#[derive(Deserialize)]
struct Hit {
    #[serde(rename = "_id")]
    id: String,
    #[serde(rename = "_score", default)]
    score: Option<f32>,
    #[serde(rename = "_source", default)]
    source: Value,
}

#[derive(Deserialize, Default)]
struct StoredFields {
    #[serde(default)]
    asin: Option<String>,
    #[serde(default)]
    question: Option<String>,
    #[serde(default)]
    answer: Option<String>,
}

#[derive(Deserialize)]
struct SearchResponse {
    hits: HitsEnvelope,
}

#[derive(Deserialize)]
struct BulkResponse {
    #[serde(default)]
    errors: bool,
    #[serde(default)]
    items: Vec<Map<String, Value>>,
}

#[derive(Deserialize)]
struct CountResponse {
    count: u64,
}

/// Walk `properties` of a mapping along a dotted field path.
fn mapping_dimension(mapping: &Value, field: &str) -> Option<usize> {
    let mut node = mapping.get("mappings")?;
    for part in field.split('.') {
        node = node.get("properties")?.get(part)?;
    }
    if node.get("type")?.as_str()? != "knn_vector" {
        return None;
    }
    node.get("dimension")?.as_u64().map(|d| d as usize)
}

fn bulk_body(collection: &VectorCollection, documents: &[IndexedDocument]) -> String {
    let mut body = String::new();
    for doc in documents {
        let action = json!({ "index": { "_index": collection.name, "_id": doc.id } });
        let mut source = Map::new();
        source.insert("asin".to_string(), json!(doc.asin));
        source.insert("question".to_string(), json!(doc.question));
        source.insert("answer".to_string(), json!(doc.answer));
        source.insert(collection.vector_field.clone(), json!(doc.vector));
        body.push_str(&action.to_string());
        body.push('\n');
        body.push_str(&Value::Object(source).to_string());
        body.push('\n');
    }
    body
}

fn bulk_outcome(response: BulkResponse) -> BulkOutcome {
    let mut outcome = BulkOutcome::default();
    for item in response.items {
        let Some(result) = item.values().next() else {
            continue;
        };
        let status = result.get("status").and_then(Value::as_u64).unwrap_or(0);
        if (200..300).contains(&status) && result.get("error").is_none() {
            outcome.succeeded += 1;
            continue;
        }

        let id = result
            .get("_id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let reason = match result.get("error") {
            Some(error) => format!(
                "{}: {}",
                error.get("type").and_then(Value::as_str).unwrap_or("error"),
                error.get("reason").and_then(Value::as_str).unwrap_or("")
            ),
            None => format!("status {status}"),
        };
        outcome.failures.push(BulkItemFailure { id, reason });
    }
    outcome
}

impl RecordSource for OpenSearchStore {
    fn scan<'a>(&'a self, collection: &'a str, page_size: usize) -> RecordStream<'a> {
        let page_size = page_size.max(1);
        stream::unfold(ScanState::Start, move |state| {
            self.scan_step(state, collection, page_size)
        })
        .flat_map(stream::iter)
        .boxed()
    }
}

#[async_trait]
impl VectorIndex for OpenSearchStore {
    async fn ping(&self) -> Result<(), StoreError> {
        let info: Value = self.send_json(self.request(Method::GET, "")).await?;
        let version = info
            .pointer("/version/number")
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        info!("Connected to {} (version {})", self.base_url, version);
        Ok(())
    }

    async fn vector_dimension(
        &self,
        collection: &VectorCollection,
    ) -> Result<Option<usize>, StoreError> {
        let path = format!("{}/_mapping", collection.name);
        let mappings: Map<String, Value> =
            self.send_json(self.request(Method::GET, &path)).await?;

        // Keyed by concrete index name, which differs from the request when it is an alias
        Ok(mappings
            .values()
            .find_map(|mapping| mapping_dimension(mapping, &collection.vector_field)))
    }

    async fn bulk_upsert(
        &self,
        collection: &VectorCollection,
        documents: &[IndexedDocument],
    ) -> Result<BulkOutcome, StoreError> {
        if documents.is_empty() {
            return Ok(BulkOutcome::default());
        }

        let body = bulk_body(collection, documents);
        let response: BulkResponse = self
            .send_json(
                self.request(Method::POST, "_bulk")
                    .header(reqwest::header::CONTENT_TYPE, "application/x-ndjson")
                    .body(body),
            )
            .await?;

        let had_errors = response.errors;
        let outcome = bulk_outcome(response);
        if had_errors {
            warn!(
                "Bulk write to {}: {} succeeded, {} failed",
                collection.name,
                outcome.succeeded,
                outcome.failed()
            );
        } else {
            debug!("Bulk write to {}: {} documents", collection.name, outcome.succeeded);
        }
        Ok(outcome)
    }

    async fn knn_search(
        &self,
        collection: &VectorCollection,
        query: &KnnQuery,
    ) -> Result<Vec<SearchHit>, StoreError> {
        let mut knn = Map::new();
        knn.insert(
            collection.vector_field.clone(),
            json!({ "vector": query.vector, "k": query.k }),
        );
        let body = json!({
            "size": query.k,
            "_source": ["asin", "question", "answer"],
            "query": { "knn": knn },
        });

        let path = format!("{}/_search", collection.name);
        let response: SearchResponse = self
            .send_json(self.request(Method::POST, &path).json(&body))
            .await?;

        response
            .hits
            .hits
            .into_iter()
            .map(|hit| {
                let fields: StoredFields = serde_json::from_value(hit.source)
                    .map_err(|e| StoreError::Decode(format!("hit {}: {e}", hit.id)))?;
                Ok(SearchHit {
                    id: hit.id,
                    score: hit.score.unwrap_or(0.0),
                    asin: fields.asin.unwrap_or_default(),
                    question: fields.question.unwrap_or_default(),
                    answer: fields.answer.unwrap_or_default(),
                })
            })
            .collect()
    }

    async fn count(&self, collection: &str) -> Result<u64, StoreError> {
        let path = format!("{collection}/_count");
        let response: CountResponse = self.send_json(self.request(Method::GET, &path)).await?;
        Ok(response.count)
    }

    async fn refresh(&self, collection: &str) -> Result<(), StoreError> {
        let path = format!("{collection}/_refresh");
        self.send(self.request(Method::POST, &path)).await?;
        Ok(())
    }
}
