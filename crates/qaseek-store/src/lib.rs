//! Storage backends for qaseek.
//!
//! This crate provides the [`VectorIndex`](qaseek_core::VectorIndex) and
//! [`RecordSource`](qaseek_core::RecordSource) implementations:
//!
//! - [`OpenSearchStore`]: OpenSearch over HTTP (scroll scan, `_bulk`, kNN search)
//! - [`MemoryStore`]: in-process backend for tests and offline runs
//! - [`NdjsonSource`]: canonical NDJSON files as a record source
//!
//! # Example
//!
//! ```rust,ignore
//! use qaseek_store::{OpenSearchConfig, OpenSearchStore};
//! use qaseek_core::{VectorCollection, VectorIndex};
//!
//! let store = OpenSearchStore::new(OpenSearchConfig {
//!     password: Some(password),
//!     ..Default::default()
//! })?;
//! store.ping().await?;
//! let dim = store.vector_dimension(&VectorCollection::new("amazon_qa_software_vec")).await?;
//! ```

pub mod memory;
pub mod ndjson;
pub mod opensearch;

pub use memory::MemoryStore;
pub use ndjson::NdjsonSource;
pub use opensearch::{OpenSearchConfig, OpenSearchStore};
