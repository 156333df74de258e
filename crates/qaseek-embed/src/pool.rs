//! Embedder pool for concurrent embedding operations.

use async_trait::async_trait;
use qaseek_core::{EmbedError, Embedder, EmbeddingConfig, EmbeddingOutput};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::debug;

/// Embedder wrapper that bounds concurrent inference.
///
/// The permit count is the smaller of the requested concurrency and the
/// embedder's own [`Embedder::max_concurrency`], so a model that is not
/// natively concurrent runs single-flight while callers stay concurrent.
pub struct EmbedderPool {
    embedder: Arc<dyn Embedder>,
    semaphore: Semaphore,
    max_concurrent: usize,
}

impl EmbedderPool {
    /// Create a new embedder pool.
    pub fn new(embedder: Arc<dyn Embedder>, max_concurrent: usize) -> Self {
        let requested = max_concurrent.max(1);
        let max_concurrent = match embedder.max_concurrency() {
            Some(limit) => requested.min(limit.max(1)),
            None => requested,
        };
        debug!(
            "Embedder pool for {} with {} permit(s)",
            embedder.model_name(),
            max_concurrent
        );

        Self {
            embedder,
            semaphore: Semaphore::new(max_concurrent),
            max_concurrent,
        }
    }

    /// Get the underlying embedder.
    pub fn inner(&self) -> Arc<dyn Embedder> {
        Arc::clone(&self.embedder)
    }

    /// Embed a batch of texts.
    pub async fn embed_batch(
        &self,
        texts: &[&str],
        config: &EmbeddingConfig,
    ) -> Result<Vec<EmbeddingOutput>, EmbedError> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|e| EmbedError::Inference(format!("semaphore error: {e}")))?;

        self.embedder.embed_text(texts, config).await
    }

    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Effective concurrency limit.
    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }
}

#[async_trait]
impl Embedder for EmbedderPool {
    fn model_name(&self) -> &str {
        self.embedder.model_name()
    }

    fn dimension(&self) -> usize {
        self.embedder.dimension()
    }

    fn max_tokens(&self) -> usize {
        self.embedder.max_tokens()
    }

    fn max_concurrency(&self) -> Option<usize> {
        Some(self.max_concurrent)
    }

    async fn embed_text(
        &self,
        texts: &[&str],
        config: &EmbeddingConfig,
    ) -> Result<Vec<EmbeddingOutput>, EmbedError> {
        self.embed_batch(texts, config).await
    }
}
