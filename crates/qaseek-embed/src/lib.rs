//! # qaseek-embed
//!
//! Embedding generation for qaseek.
//!
//! ## Cargo Features
//!
//! - `candle`: Enables [`CandleEmbedder`] (sentence-transformers via the Candle ML stack)
//! - Without `candle`: only [`HashEmbedder`] is available
//!
//! ## Models
//!
//! | Name | Type | Dimension | Notes |
//! |------|------|-----------|-------|
//! | `hash` | [`HashEmbedder`] | configurable, 384 by default | deterministic, no downloads |
//! | `sentence-transformers/all-MiniLM-L6-v2` | `CandleEmbedder` | 384 | single-flight inference |
//!
//! ## Usage
//!
//! ```rust,ignore
//! use qaseek_embed::{EmbedderPool, HashEmbedder};
//! use qaseek_core::{Embedder, EmbeddingConfig};
//! use std::sync::Arc;
//!
//! let pool = EmbedderPool::new(Arc::new(HashEmbedder::new()), 4);
//! let outputs = pool.embed_batch(&["Is Windows 8 good for gaming?"], &EmbeddingConfig::default()).await?;
//! assert_eq!(outputs[0].embedding.len(), 384);
//! ```
//!
//! ## Components
//!
//! | Type | Description |
//! |------|-------------|
//! | [`HashEmbedder`] | FNV-1a feature hashing (always available) |
//! | `CandleEmbedder` | BERT-family sentence embeddings (requires `candle` feature) |
//! | [`EmbedderPool`] | Concurrency gate honouring the model's own limit |

#[cfg(feature = "candle")]
pub mod candle;

#[cfg(feature = "candle")]
pub use candle::{CandleEmbedder, DEFAULT_MODEL_ID};

pub mod hash;
pub mod pool;

pub use hash::{HashEmbedder, HASH_MODEL_NAME};
pub use pool::EmbedderPool;
