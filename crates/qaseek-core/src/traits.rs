//! Core traits for qaseek components.
//!
//! - [`Embedder`]: Text to fixed-length vector
//! - [`RecordSource`]: Lazy paginated scan of canonical records
//! - [`VectorIndex`]: Bulk upsert and kNN search against a vector collection
//!
//! Implementations are constructed explicitly and injected; nothing here
//! holds global state.

use async_trait::async_trait;
use futures::stream::BoxStream;
use tracing::debug;

use crate::error::{EmbedError, Error, RecordError, StoreError};
use crate::types::{
    BulkOutcome, CanonicalRecord, EmbeddingConfig, EmbeddingOutput, IndexedDocument, KnnQuery,
    SearchHit, VectorCollection,
};

// ============================================================================
// Embedding
// ============================================================================

/// Trait for generating embeddings.
///
/// Output vectors always have length [`Embedder::dimension`], and the same
/// input yields a bit-identical vector within a process.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Model name/identifier.
    fn model_name(&self) -> &str;

    /// Embedding dimension.
    fn dimension(&self) -> usize;

    /// Maximum tokens per input.
    fn max_tokens(&self) -> usize;

    /// Number of calls the model can serve at once, if limited.
    ///
    /// `Some(1)` marks a model that is not natively concurrent; callers gate
    /// it behind a single-flight pool.
    fn max_concurrency(&self) -> Option<usize> {
        None
    }

    /// Embed a batch of texts. Fails as a whole if any text is rejected.
    async fn embed_text(
        &self,
        texts: &[&str],
        config: &EmbeddingConfig,
    ) -> Result<Vec<EmbeddingOutput>, EmbedError>;

    /// Embed a single text.
    async fn embed(&self, text: &str, config: &EmbeddingConfig) -> Result<Vec<f32>, EmbedError> {
        let results = self.embed_text(&[text], config).await?;
        results
            .into_iter()
            .next()
            .map(|output| output.embedding)
            .ok_or_else(|| EmbedError::Inference("empty embedding result".to_string()))
    }

    /// Embed a query.
    async fn embed_query(
        &self,
        query: &str,
        config: &EmbeddingConfig,
    ) -> Result<EmbeddingOutput, EmbedError> {
        let results = self.embed_text(&[query], config).await?;
        results
            .into_iter()
            .next()
            .ok_or_else(|| EmbedError::Inference("empty embedding result".to_string()))
    }
}

// ============================================================================
// Record Source
// ============================================================================

/// Lazy stream of records produced by a scan.
///
/// A [`RecordError::Source`] item is the last item of the stream.
pub type RecordStream<'a> = BoxStream<'a, Result<CanonicalRecord, RecordError>>;

/// A collection of canonical records that can be scanned.
pub trait RecordSource: Send + Sync {
    /// Start a fresh scan of `collection`, fetching `page_size` records per page.
    ///
    /// Nothing is fetched until the stream is polled. Each call restarts from
    /// the beginning.
    fn scan<'a>(&'a self, collection: &'a str, page_size: usize) -> RecordStream<'a>;
}

// ============================================================================
// Vector Index
// ============================================================================

/// Trait for the vector index backend.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Check the backend is reachable and the credentials are accepted.
    async fn ping(&self) -> Result<(), StoreError>;

    /// Configured dimension of the collection's vector field, if known.
    async fn vector_dimension(
        &self,
        collection: &VectorCollection,
    ) -> Result<Option<usize>, StoreError>;

    /// Insert or overwrite documents by id.
    ///
    /// `Err` means the batch as a whole was not accepted; item-level
    /// rejections are reported in [`BulkOutcome::failures`].
    async fn bulk_upsert(
        &self,
        collection: &VectorCollection,
        documents: &[IndexedDocument],
    ) -> Result<BulkOutcome, StoreError>;

    /// k-nearest-neighbour search. Hits come back in the index's ranking order.
    async fn knn_search(
        &self,
        collection: &VectorCollection,
        query: &KnnQuery,
    ) -> Result<Vec<SearchHit>, StoreError>;

    /// Number of documents in a collection.
    async fn count(&self, collection: &str) -> Result<u64, StoreError>;

    /// Make recent writes visible to search and count.
    async fn refresh(&self, _collection: &str) -> Result<(), StoreError> {
        Ok(())
    }
}

// ============================================================================
// Startup checks
// ============================================================================

/// Check that the embedder and the collection agree on the vector dimension.
///
/// Runs once at startup. A collection whose dimension cannot be determined is
/// treated as misconfigured.
pub async fn verify_dimension(
    embedder: &dyn Embedder,
    index: &dyn VectorIndex,
    collection: &VectorCollection,
) -> Result<usize, Error> {
    let expected = embedder.dimension();
    let actual = index
        .vector_dimension(collection)
        .await
        .map_err(Error::Backend)?;

    match actual {
        Some(dim) if dim == expected => {
            debug!(
                "Dimension check passed for {}.{}: {}",
                collection.name, collection.vector_field, dim
            );
            Ok(dim)
        }
        Some(dim) => Err(Error::Config(format!(
            "embedding model {} produces {}-dimensional vectors but {}.{} expects {}",
            embedder.model_name(),
            expected,
            collection.name,
            collection.vector_field,
            dim
        ))),
        None => Err(Error::Config(format!(
            "collection {} has no knn_vector field {}",
            collection.name, collection.vector_field
        ))),
    }
}
