//! Core types for qaseek.
//!
//! This module contains the shared data structures used across qaseek:
//!
//! ## Records
//! - [`CanonicalRecord`]: A validated Q&A record read from a source
//! - [`RawRecord`]: The loosely-typed shape records arrive in, before validation
//!
//! ## Documents
//! - [`IndexedDocument`]: A record plus its embedding, ready to be written
//! - [`VectorCollection`]: A named kNN collection and its vector field
//! - [`BulkOutcome`]: Per-batch write result
//!
//! ## Search
//! - [`KnnQuery`]: Vector and `k` for a nearest-neighbour search
//! - [`SearchHit`]: A raw hit as returned by the vector index
//! - [`QueryRequest`] / [`QueryHit`]: Query engine input and output
//!
//! ## Indexing
//! - [`IndexingSummary`]: Counters returned by every indexing run
//! - [`RetryPolicy`]: Bounded exponential backoff for sink writes
//!
//! ## Embeddings
//! - [`EmbeddingConfig`]: Configuration for embedding generation
//! - [`EmbeddingOutput`]: Result of embedding a text

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::error::{Error, RecordError};

/// Vector field used when none is configured.
pub const DEFAULT_VECTOR_FIELD: &str = "question_vector";

/// Default page size for source scans.
pub const DEFAULT_PAGE_SIZE: usize = 500;

/// Default number of documents per bulk write.
pub const DEFAULT_BATCH_SIZE: usize = 500;

// ============================================================================
// Records
// ============================================================================

/// A canonical Q&A record.
///
/// `id` is stable across scans of an unchanged source and is used as the
/// document key in the vector index, so re-indexing overwrites.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    /// Stable unique identifier
    pub id: String,
    /// Product identifier
    pub asin: String,
    /// Question text (may be empty)
    pub question: String,
    /// Answer text (may be empty)
    pub answer: String,
}

/// A record as it appears on the wire, before validation.
///
/// Unknown fields (`questionType`, `unixTime`, ...) are ignored. Missing or
/// null `question`/`answer` become empty strings; a missing `asin` rejects
/// the record.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawRecord {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub asin: Option<String>,
    #[serde(default)]
    pub question: Option<String>,
    #[serde(default)]
    pub answer: Option<String>,
}

impl RawRecord {
    /// Validate into a [`CanonicalRecord`].
    ///
    /// When no explicit id is present, one is derived from the record
    /// content with [`content_id`].
    pub fn into_canonical(self) -> Result<CanonicalRecord, RecordError> {
        let id = self.id.filter(|id| !id.trim().is_empty());

        let asin = match self.asin {
            Some(asin) if !asin.trim().is_empty() => asin,
            _ => {
                return Err(RecordError::Rejected {
                    id,
                    reason: "missing required field `asin`".to_string(),
                })
            }
        };

        let question = self.question.unwrap_or_default();
        let answer = self.answer.unwrap_or_default();
        let id = id.unwrap_or_else(|| content_id(&asin, &question, &answer));

        Ok(CanonicalRecord {
            id,
            asin,
            question,
            answer,
        })
    }
}

/// Deterministic id for a record without one (blake3 of its fields).
pub fn content_id(asin: &str, question: &str, answer: &str) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(asin.as_bytes());
    hasher.update(&[0x1f]);
    hasher.update(question.as_bytes());
    hasher.update(&[0x1f]);
    hasher.update(answer.as_bytes());
    let hex = hasher.finalize().to_hex();
    hex.as_str()[..32].to_string()
}

// ============================================================================
// Documents
// ============================================================================

/// A record with its embedding, ready for the vector index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexedDocument {
    pub id: String,
    pub asin: String,
    pub question: String,
    pub answer: String,
    /// Embedding vector; its length equals the collection dimension
    pub vector: Vec<f32>,
}

impl IndexedDocument {
    /// Attach a vector to a record.
    pub fn from_record(record: CanonicalRecord, vector: Vec<f32>) -> Self {
        Self {
            id: record.id,
            asin: record.asin,
            question: record.question,
            answer: record.answer,
            vector,
        }
    }
}

/// A vector-indexed collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorCollection {
    /// Collection (index) name
    pub name: String,
    /// Name of the kNN vector field
    pub vector_field: String,
}

impl VectorCollection {
    /// Collection using the default vector field.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            vector_field: DEFAULT_VECTOR_FIELD.to_string(),
        }
    }

    #[must_use]
    pub fn with_vector_field(mut self, field: impl Into<String>) -> Self {
        self.vector_field = field.into();
        self
    }
}

/// Item-level failure inside a bulk write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkItemFailure {
    pub id: String,
    pub reason: String,
}

/// Result of one bulk write.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkOutcome {
    /// Documents accepted by the index
    pub succeeded: usize,
    /// Documents rejected individually
    pub failures: Vec<BulkItemFailure>,
}

impl BulkOutcome {
    /// Every document in the batch succeeded.
    pub fn all_succeeded(count: usize) -> Self {
        Self {
            succeeded: count,
            failures: Vec::new(),
        }
    }

    pub fn failed(&self) -> usize {
        self.failures.len()
    }
}

// ============================================================================
// Search
// ============================================================================

/// Nearest-neighbour search parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct KnnQuery {
    pub vector: Vec<f32>,
    /// Number of neighbours requested
    pub k: usize,
}

/// A hit returned by the vector index, in index order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub id: String,
    /// Similarity score (higher is closer)
    pub score: f32,
    pub asin: String,
    pub question: String,
    pub answer: String,
}

/// A free-text query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryRequest {
    pub text: String,
    pub top_k: usize,
}

impl QueryRequest {
    /// Build a request, rejecting `top_k == 0`.
    pub fn new(text: impl Into<String>, top_k: usize) -> Result<Self, Error> {
        if top_k == 0 {
            return Err(Error::InvalidRequest("top_k must be at least 1".to_string()));
        }
        Ok(Self {
            text: text.into(),
            top_k,
        })
    }

    /// Whether the text is empty after trimming.
    pub fn is_blank(&self) -> bool {
        self.text.trim().is_empty()
    }
}

/// One ranked query result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryHit {
    pub id: String,
    pub score: f32,
    pub asin: String,
    pub question: String,
    pub answer: String,
}

impl From<SearchHit> for QueryHit {
    fn from(hit: SearchHit) -> Self {
        Self {
            id: hit.id,
            score: hit.score,
            asin: hit.asin,
            question: hit.question,
            answer: hit.answer,
        }
    }
}

// ============================================================================
// Indexing
// ============================================================================

/// Counters for an indexing run.
///
/// `attempted` counts records whose fate was settled, so
/// `attempted == succeeded + skipped + failed` always holds. Records that
/// were read but dropped because the run was cancelled or aborted are
/// counted in `abandoned` instead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexingSummary {
    pub attempted: u64,
    pub succeeded: u64,
    pub skipped: u64,
    pub failed: u64,
    /// Read but never settled (cancellation or fatal error)
    pub abandoned: u64,
    /// Bulk writes that completed
    pub batches_submitted: u64,
    /// Whether the run stopped early on request
    pub cancelled: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl IndexingSummary {
    /// Empty summary starting now.
    pub fn start() -> Self {
        Self {
            attempted: 0,
            succeeded: 0,
            skipped: 0,
            failed: 0,
            abandoned: 0,
            batches_submitted: 0,
            cancelled: false,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn record_skipped(&mut self) {
        self.attempted += 1;
        self.skipped += 1;
    }

    pub fn record_failed(&mut self, count: u64) {
        self.attempted += count;
        self.failed += count;
    }

    pub fn record_succeeded(&mut self, count: u64) {
        self.attempted += count;
        self.succeeded += count;
    }

    /// Stamp the end time.
    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }

    /// Wall-clock duration, if finished.
    pub fn elapsed(&self) -> Option<chrono::Duration> {
        self.finished_at.map(|end| end - self.started_at)
    }
}

impl fmt::Display for IndexingSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "attempted={} succeeded={} skipped={} failed={}",
            self.attempted, self.succeeded, self.skipped, self.failed
        )?;
        if self.abandoned > 0 {
            write!(f, " abandoned={}", self.abandoned)?;
        }
        if self.cancelled {
            write!(f, " (cancelled)")?;
        }
        Ok(())
    }
}

/// Bounded exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Policy that allows `retries` retries after the first attempt.
    pub fn with_retries(retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: retries.saturating_add(1),
            base_delay,
            max_delay,
        }
    }

    /// No retries, no waiting.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay to wait after the given failed attempt (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let delay = self.base_delay.saturating_mul(1u32 << exp);
        delay.min(self.max_delay)
    }

    /// Whether another attempt is allowed after `attempt` failures.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

// ============================================================================
// Embeddings
// ============================================================================

/// Configuration for embedding generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// L2-normalize output vectors
    pub normalize: bool,
    /// Texts per micro-batch
    pub batch_size: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            normalize: true,
            batch_size: 32,
        }
    }
}

/// Embedding of one text.
#[derive(Debug, Clone)]
pub struct EmbeddingOutput {
    pub embedding: Vec<f32>,
    /// Tokens seen by the model
    pub token_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    // ==================== RawRecord Tests ====================

    #[test]
    fn test_raw_record_ignores_unknown_fields() {
        let line = r#"{"asin":"B00","question":"Is it good?","answer":"Yes","questionType":"yes/no","unixTime":1357027200}"#;
        let raw: RawRecord = serde_json::from_str(line).unwrap();
        let record = raw.into_canonical().unwrap();

        assert_eq!(record.asin, "B00");
        assert_eq!(record.question, "Is it good?");
        assert_eq!(record.answer, "Yes");
        assert_eq!(record.id.len(), 32);
    }

    #[test]
    fn test_raw_record_null_fields_become_empty() {
        let raw: RawRecord =
            serde_json::from_str(r#"{"id":"A3","asin":"B01","question":null}"#).unwrap();
        let record = raw.into_canonical().unwrap();

        assert_eq!(record.id, "A3");
        assert_eq!(record.question, "");
        assert_eq!(record.answer, "");
    }

    #[test]
    fn test_raw_record_missing_asin_rejected() {
        let raw: RawRecord =
            serde_json::from_str(r#"{"id":"A9","question":"q","answer":"a"}"#).unwrap();
        let err = raw.into_canonical().unwrap_err();

        match err {
            RecordError::Rejected { id, reason } => {
                assert_eq!(id.as_deref(), Some("A9"));
                assert!(reason.contains("asin"));
            }
            RecordError::Source(_) => panic!("expected rejection"),
        }
    }

    #[test]
    fn test_content_id_is_stable_and_field_sensitive() {
        let a = content_id("B00", "q", "a");
        let b = content_id("B00", "q", "a");
        assert_eq!(a, b);

        // Field boundaries matter
        assert_ne!(content_id("B00", "qa", ""), content_id("B00", "q", "a"));
    }

    // ==================== VectorCollection Tests ====================

    #[test]
    fn test_vector_collection_default_field() {
        let collection = VectorCollection::new("amazon_qa_software_vec");
        assert_eq!(collection.vector_field, "question_vector");

        let custom = collection.with_vector_field("qa_vector");
        assert_eq!(custom.vector_field, "qa_vector");
    }

    // ==================== QueryRequest Tests ====================

    #[test]
    fn test_query_request_rejects_zero_top_k() {
        let err = QueryRequest::new("gaming", 0).unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
    }

    #[test]
    fn test_query_request_blank() {
        assert!(QueryRequest::new("", 5).unwrap().is_blank());
        assert!(QueryRequest::new("  \t\n", 5).unwrap().is_blank());
        assert!(!QueryRequest::new(" linux ", 5).unwrap().is_blank());
    }

    #[test]
    fn test_query_hit_from_search_hit() {
        let hit = SearchHit {
            id: "A1".to_string(),
            score: 0.91,
            asin: "B00".to_string(),
            question: "q".to_string(),
            answer: "a".to_string(),
        };
        let query_hit = QueryHit::from(hit);
        assert_eq!(query_hit.id, "A1");
        assert!((query_hit.score - 0.91).abs() < f32::EPSILON);
    }

    // ==================== BulkOutcome Tests ====================

    #[test]
    fn test_bulk_outcome_counts() {
        let outcome = BulkOutcome {
            succeeded: 4,
            failures: vec![BulkItemFailure {
                id: "A2".to_string(),
                reason: "mapper_parsing_exception".to_string(),
            }],
        };
        assert_eq!(outcome.failed(), 1);
        assert_eq!(BulkOutcome::all_succeeded(3).failed(), 0);
    }

    // ==================== IndexingSummary Tests ====================

    #[test]
    fn test_summary_counters_balance() {
        let mut summary = IndexingSummary::start();
        summary.record_succeeded(2);
        summary.record_skipped();
        summary.record_failed(1);

        assert_eq!(summary.attempted, 4);
        assert_eq!(
            summary.attempted,
            summary.succeeded + summary.skipped + summary.failed
        );
    }

    #[test]
    fn test_summary_display() {
        let mut summary = IndexingSummary::start();
        summary.record_succeeded(2);
        summary.record_skipped();
        assert_eq!(
            summary.to_string(),
            "attempted=3 succeeded=2 skipped=1 failed=0"
        );

        summary.abandoned = 5;
        summary.cancelled = true;
        assert_eq!(
            summary.to_string(),
            "attempted=3 succeeded=2 skipped=1 failed=0 abandoned=5 (cancelled)"
        );
    }

    #[test]
    fn test_summary_elapsed() {
        let mut summary = IndexingSummary::start();
        assert!(summary.elapsed().is_none());
        summary.finish();
        assert!(summary.elapsed().unwrap() >= chrono::Duration::zero());
    }

    // ==================== RetryPolicy Tests ====================

    #[test]
    fn test_retry_policy_backoff_doubles_and_caps() {
        let policy = RetryPolicy::with_retries(
            5,
            Duration::from_millis(100),
            Duration::from_millis(500),
        );
        assert_eq!(policy.max_attempts, 6);
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(400));
        assert_eq!(policy.backoff(4), Duration::from_millis(500));
        assert_eq!(policy.backoff(40), Duration::from_millis(500));
    }

    #[test]
    fn test_retry_policy_should_retry() {
        let policy = RetryPolicy::default();
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(3));
        assert!(!policy.should_retry(4));

        assert!(!RetryPolicy::none().should_retry(1));
    }

    // ==================== EmbeddingConfig Tests ====================

    #[test]
    fn test_embedding_config_default() {
        let config = EmbeddingConfig::default();
        assert!(config.normalize);
        assert_eq!(config.batch_size, 32);
    }
}
