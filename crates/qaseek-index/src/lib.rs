//! Bulk indexing for qaseek.
//!
//! This crate turns a stream of canonical records into vector documents:
//! compose text → embed (micro-batches, bounded workers) → bulk write
//! (bounded in-flight batches, retried with backoff).
//!
//! # Components
//!
//! - [`IndexingPipeline`]: Runs a scan through the embedder into a vector index
//! - [`PipelineConfig`]: Batch sizes, concurrency limits, retry policy
//! - [`IndexUpdate`]: Events emitted during a run
//! - [`CancelHandle`]: Cooperative cancellation
//! - [`IndexingFailure`]: Fatal error plus the summary of completed work
//!
//! # Example
//!
//! ```rust,ignore
//! use qaseek_index::{IndexingPipeline, IndexUpdate, PipelineConfig};
//!
//! let pipeline = IndexingPipeline::new(embedder, sink, PipelineConfig::default());
//! pipeline.preflight(&destination).await?;
//!
//! let mut updates = pipeline.subscribe();
//! tokio::spawn(async move {
//!     while let Ok(update) = updates.recv().await {
//!         if let IndexUpdate::Progress { attempted, .. } = update {
//!             println!("{attempted} records");
//!         }
//!     }
//! });
//!
//! let summary = pipeline.run(&source, "amazon_qa_software", &destination).await?;
//! ```

pub mod cancel;
pub mod pipeline;

pub use cancel::CancelHandle;
pub use pipeline::{IndexUpdate, IndexingFailure, IndexingPipeline, PipelineConfig};
