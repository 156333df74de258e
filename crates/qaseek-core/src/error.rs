//! Error types for qaseek.
//!
//! The top-level [`Error`] mirrors the failure taxonomy of the system: each
//! variant says which unit of work it is fatal to (startup, indexing run, or a
//! single query request). Per-record problems never reach [`Error`]; they are
//! carried by [`EmbedError`] and [`RecordError`] and counted by the pipeline.

use thiserror::Error;

/// Main error type for qaseek operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Startup-only misconfiguration (missing credentials, dimension mismatch).
    #[error("configuration error: {0}")]
    Config(String),

    /// Reading the record source failed; fatal to the current run.
    #[error("source read error: {0}")]
    SourceRead(#[source] StoreError),

    /// Embedding engine failure outside of per-record recovery (e.g. model load).
    #[error("embedding error: {0}")]
    Embedding(#[from] EmbedError),

    /// A bulk write kept failing after the retry budget was spent.
    #[error("sink write failed after {attempts} attempt(s): {source}")]
    SinkWrite {
        attempts: u32,
        #[source]
        source: StoreError,
    },

    /// The query text could not be embedded; fatal to that request only.
    #[error("query error: {0}")]
    Query(#[source] EmbedError),

    /// The vector index rejected or could not serve a request.
    #[error("backend error: {0}")]
    Backend(#[source] StoreError),

    /// Caller supplied an invalid request (e.g. `top_k == 0`).
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

/// Embedding errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EmbedError {
    #[error("model loading failed: {0}")]
    ModelLoad(String),

    #[error("inference failed: {0}")]
    Inference(String),

    #[error("input too long: {tokens} tokens, max {max}")]
    InputTooLong { tokens: usize, max: usize },

    #[error("empty input")]
    EmptyInput,

    #[error("embedding has dimension {actual}, expected {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
}

/// Vector index / record source backend errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("not authenticated: {0}")]
    Unauthorized(String),

    #[error("backend unreachable: {0}")]
    Unreachable(String),

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("backend returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("collection not found: {0}")]
    NotFound(String),

    #[error("malformed backend response: {0}")]
    Decode(String),

    #[error("invalid request: {0}")]
    Request(String),

    #[error("io error: {0}")]
    Io(String),
}

impl StoreError {
    /// Whether retrying the same request may succeed.
    ///
    /// Connection failures, timeouts, throttling (429) and server-side
    /// errors (5xx) are transient; authentication and client errors are not.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Unreachable(_) | Self::Timeout(_) => true,
            Self::Status { status, .. } => *status == 429 || *status >= 500,
            Self::Unauthorized(_)
            | Self::NotFound(_)
            | Self::Decode(_)
            | Self::Request(_)
            | Self::Io(_) => false,
        }
    }
}

/// Errors yielded by a record stream.
///
/// A [`RecordError::Rejected`] item is a single malformed record; the stream
/// keeps going after it. A [`RecordError::Source`] item ends the stream.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RecordError {
    #[error("record {} rejected: {reason}", .id.as_deref().unwrap_or("<unknown>"))]
    Rejected { id: Option<String>, reason: String },

    #[error("source read failed: {0}")]
    Source(#[from] StoreError),
}

impl RecordError {
    /// Whether this error terminates the scan.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Source(_))
    }
}

/// Result type alias for qaseek operations.
pub type Result<T> = std::result::Result<T, Error>;
