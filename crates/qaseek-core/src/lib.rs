//! # qaseek-core
//!
//! Core types and traits for qaseek, a semantic retrieval pipeline over
//! question/answer records.
//!
//! ## Architecture
//!
//! ```text
//! RecordSource ─scan→ CanonicalRecord ─TextComposer→ Embedder ─→ VectorIndex::bulk_upsert
//!                                                                      │
//!                    query text ─→ Embedder ─→ VectorIndex::knn_search ┘ → SearchHit
//! ```
//!
//! ## Key Types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`CanonicalRecord`] | Validated `{id, asin, question, answer}` record |
//! | [`IndexedDocument`] | Record plus its embedding vector |
//! | [`VectorCollection`] | Collection name and kNN vector field |
//! | [`IndexingSummary`] | `attempted/succeeded/skipped/failed` counters of a run |
//! | [`QueryRequest`] / [`QueryHit`] | Query input and ranked output |
//! | [`RetryPolicy`] | Bounded exponential backoff |
//!
//! ## Key Traits
//!
//! | Trait | Purpose |
//! |-------|---------|
//! | [`Embedder`] | Text to fixed-length vector |
//! | [`RecordSource`] | Lazy paginated scan of a collection |
//! | [`VectorIndex`] | Bulk upsert, kNN search, connection and mapping checks |
//!
//! ## Errors
//!
//! [`Error`] variants are scoped: `Config` is startup-fatal, `SourceRead` and
//! `SinkWrite` end an indexing run, `Query` and `Backend` end a single query.
//! Per-record problems ([`EmbedError`], [`RecordError::Rejected`]) are counted
//! by the pipeline and never abort it.
//!
//! ## Related Crates
//!
//! - `qaseek-embed`: Hash and Candle embedders, concurrency pool
//! - `qaseek-store`: OpenSearch backend, in-memory store, NDJSON source
//! - `qaseek-index`: Bulk indexing pipeline
//! - `qaseek-query`: Query engine

pub mod error;
pub mod text;
pub mod traits;
pub mod types;

pub use error::{EmbedError, Error, RecordError, Result, StoreError};
pub use text::{TextComposer, TextMode};
pub use traits::*;
pub use types::*;
