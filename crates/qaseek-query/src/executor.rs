//! Query execution.

use qaseek_core::{
    EmbedError, Embedder, EmbeddingConfig, Error, KnnQuery, QueryHit, QueryRequest,
    VectorCollection, VectorIndex,
};
use std::sync::Arc;
use tracing::debug;

/// Answers free-text questions from a vector collection.
///
/// Holds shared handles only, so one engine can serve concurrent queries.
pub struct QueryEngine {
    /// Embedder for query text
    embedder: Arc<dyn Embedder>,
    /// Vector index to search
    index: Arc<dyn VectorIndex>,
    /// Collection to search
    collection: VectorCollection,
    config: EmbeddingConfig,
    /// Upper bound on `top_k`, if any
    max_top_k: Option<usize>,
}

impl QueryEngine {
    /// Create a new query engine.
    pub fn new(
        embedder: Arc<dyn Embedder>,
        index: Arc<dyn VectorIndex>,
        collection: VectorCollection,
    ) -> Self {
        Self {
            embedder,
            index,
            collection,
            config: EmbeddingConfig::default(),
            max_top_k: None,
        }
    }

    /// Reject requests asking for more than `max_top_k` hits.
    #[must_use]
    pub fn with_max_top_k(mut self, max_top_k: usize) -> Self {
        self.max_top_k = Some(max_top_k);
        self
    }

    #[must_use]
    pub fn with_embedding_config(mut self, config: EmbeddingConfig) -> Self {
        self.config = config;
        self
    }

    pub fn collection(&self) -> &VectorCollection {
        &self.collection
    }

    /// Run a query.
    ///
    /// Blank text returns no hits without touching the embedder or the index.
    /// Hits keep the index's ranking order.
    pub async fn query(&self, request: &QueryRequest) -> Result<Vec<QueryHit>, Error> {
        // Fields are public, so a request may not have gone through `QueryRequest::new`
        if request.top_k == 0 {
            return Err(Error::InvalidRequest("top_k must be at least 1".to_string()));
        }
        if request.is_blank() {
            debug!("Blank query, returning no hits");
            return Ok(Vec::new());
        }
        if let Some(max) = self.max_top_k {
            if request.top_k > max {
                return Err(Error::InvalidRequest(format!(
                    "top_k {} exceeds the limit of {}",
                    request.top_k, max
                )));
            }
        }

        let text = request.text.trim();
        debug!("Executing query: {} (top_k: {})", text, request.top_k);

        let embedding = self
            .embedder
            .embed_query(text, &self.config)
            .await
            .map_err(Error::Query)?;

        let expected = self.embedder.dimension();
        if embedding.embedding.len() != expected {
            return Err(Error::Query(EmbedError::DimensionMismatch {
                expected,
                actual: embedding.embedding.len(),
            }));
        }

        let knn = KnnQuery {
            vector: embedding.embedding,
            k: request.top_k,
        };
        let hits = self
            .index
            .knn_search(&self.collection, &knn)
            .await
            .map_err(Error::Backend)?;

        debug!("Found {} hits in {}", hits.len(), self.collection.name);
        Ok(hits.into_iter().map(QueryHit::from).collect())
    }

    /// Convenience wrapper building the request from parts.
    pub async fn search(&self, text: &str, top_k: usize) -> Result<Vec<QueryHit>, Error> {
        let request = QueryRequest::new(text, top_k)?;
        self.query(&request).await
    }
}
