//! In-memory backend for tests and offline runs.
//!
//! [`MemoryStore`] plays both roles of the OpenSearch backend: it holds
//! source collections of raw records that can be scanned page by page, and
//! vector collections that accept bulk upserts and answer kNN queries with
//! brute-force cosine similarity.

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use qaseek_core::{
    BulkItemFailure, BulkOutcome, CanonicalRecord, IndexedDocument, KnnQuery, RawRecord,
    RecordError, RecordSource, RecordStream, SearchHit, StoreError, VectorCollection,
    VectorIndex,
};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

struct VectorTable {
    dimension: usize,
    /// Keyed by id; iteration order is the tie-break order for equal scores
    documents: BTreeMap<String, IndexedDocument>,
}

/// In-memory record source and vector index.
///
/// # Example
///
/// ```rust
/// use qaseek_store::MemoryStore;
/// use qaseek_core::VectorIndex;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store = MemoryStore::new();
/// store.create_collection("qa_vec", 384).await;
/// assert_eq!(store.count("qa_vec").await?, 0);
/// # Ok(())
/// # }
/// ```
#[derive(Default)]
pub struct MemoryStore {
    sources: Arc<RwLock<HashMap<String, Vec<RawRecord>>>>,
    tables: Arc<RwLock<HashMap<String, VectorTable>>>,
    bulk_faults: Mutex<VecDeque<StoreError>>,
    bulk_calls: AtomicUsize,
    search_calls: AtomicUsize,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create (or reset) a vector collection with a fixed dimension.
    pub async fn create_collection(&self, name: &str, dimension: usize) {
        let mut tables = self.tables.write().await;
        tables.insert(
            name.to_string(),
            VectorTable {
                dimension,
                documents: BTreeMap::new(),
            },
        );
        debug!("Created collection {} (dimension: {})", name, dimension);
    }

    /// Append canonical records to a source collection.
    pub async fn insert_records(&self, collection: &str, records: Vec<CanonicalRecord>) {
        let raw = records
            .into_iter()
            .map(|r| RawRecord {
                id: Some(r.id),
                asin: Some(r.asin),
                question: Some(r.question),
                answer: Some(r.answer),
            })
            .collect();
        self.insert_raw(collection, raw).await;
    }

    /// Append unvalidated records to a source collection.
    pub async fn insert_raw(&self, collection: &str, records: Vec<RawRecord>) {
        let mut sources = self.sources.write().await;
        sources
            .entry(collection.to_string())
            .or_default()
            .extend(records);
    }

    /// Make the next bulk writes fail with the given errors, one per call.
    pub async fn fail_next_bulk(&self, errors: impl IntoIterator<Item = StoreError>) {
        self.bulk_faults.lock().await.extend(errors);
    }

    /// Stored document by id.
    pub async fn get(&self, collection: &str, id: &str) -> Option<IndexedDocument> {
        let tables = self.tables.read().await;
        tables.get(collection)?.documents.get(id).cloned()
    }

    /// All documents of a collection, ordered by id.
    pub async fn documents(&self, collection: &str) -> Vec<IndexedDocument> {
        let tables = self.tables.read().await;
        tables
            .get(collection)
            .map(|t| t.documents.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of bulk writes received, including injected failures.
    pub fn bulk_calls(&self) -> usize {
        self.bulk_calls.load(Ordering::SeqCst)
    }

    /// Number of kNN searches received.
    pub fn search_calls(&self) -> usize {
        self.search_calls.load(Ordering::SeqCst)
    }

    fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
        if a.len() != b.len() {
            return 0.0;
        }

        let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
        let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

        if norm_a == 0.0 || norm_b == 0.0 {
            return 0.0;
        }

        dot / (norm_a * norm_b)
    }

    async fn page(&self, collection: &str, offset: usize, size: usize) -> Option<Vec<RawRecord>> {
        let sources = self.sources.read().await;
        let records = sources.get(collection)?;
        Some(records.iter().skip(offset).take(size).cloned().collect())
    }
}

impl RecordSource for MemoryStore {
    fn scan<'a>(&'a self, collection: &'a str, page_size: usize) -> RecordStream<'a> {
        let page_size = page_size.max(1);

        stream::unfold(Some(0usize), move |offset| async move {
            let offset = offset?;
            match self.page(collection, offset, page_size).await {
                None => Some((
                    vec![Err(RecordError::Source(StoreError::NotFound(
                        collection.to_string(),
                    )))],
                    None,
                )),
                Some(page) if page.is_empty() => None,
                Some(page) => {
                    debug!("Scanned page of {} from {} at {}", page.len(), collection, offset);
                    let next = offset + page.len();
                    let items: Vec<_> = page.into_iter().map(RawRecord::into_canonical).collect();
                    Some((items, Some(next)))
                }
            }
        })
        .flat_map(stream::iter)
        .boxed()
    }
}

#[async_trait]
impl VectorIndex for MemoryStore {
    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn vector_dimension(
        &self,
        collection: &VectorCollection,
    ) -> Result<Option<usize>, StoreError> {
        let tables = self.tables.read().await;
        tables
            .get(&collection.name)
            .map(|t| Some(t.dimension))
            .ok_or_else(|| StoreError::NotFound(collection.name.clone()))
    }

    async fn bulk_upsert(
        &self,
        collection: &VectorCollection,
        documents: &[IndexedDocument],
    ) -> Result<BulkOutcome, StoreError> {
        self.bulk_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.bulk_faults.lock().await.pop_front() {
            debug!("Injected bulk failure for {}: {}", collection.name, err);
            return Err(err);
        }

        let mut tables = self.tables.write().await;
        let table = tables
            .get_mut(&collection.name)
            .ok_or_else(|| StoreError::NotFound(collection.name.clone()))?;

        let mut outcome = BulkOutcome::default();
        for doc in documents {
            if doc.vector.len() == table.dimension {
                table.documents.insert(doc.id.clone(), doc.clone());
                outcome.succeeded += 1;
            } else {
                outcome.failures.push(BulkItemFailure {
                    id: doc.id.clone(),
                    reason: format!(
                        "vector has {} dimensions, field expects {}",
                        doc.vector.len(),
                        table.dimension
                    ),
                });
            }
        }

        debug!(
            "Upserted {} documents into {} ({} rejected)",
            outcome.succeeded,
            collection.name,
            outcome.failed()
        );
        Ok(outcome)
    }

    async fn knn_search(
        &self,
        collection: &VectorCollection,
        query: &KnnQuery,
    ) -> Result<Vec<SearchHit>, StoreError> {
        self.search_calls.fetch_add(1, Ordering::SeqCst);

        let tables = self.tables.read().await;
        let table = tables
            .get(&collection.name)
            .ok_or_else(|| StoreError::NotFound(collection.name.clone()))?;

        let mut scored: Vec<(f32, &IndexedDocument)> = table
            .documents
            .values()
            .map(|doc| (Self::cosine_similarity(&query.vector, &doc.vector), doc))
            .collect();

        // Stable sort keeps id order among equal scores
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

        Ok(scored
            .into_iter()
            .take(query.k)
            .map(|(score, doc)| SearchHit {
                id: doc.id.clone(),
                score,
                asin: doc.asin.clone(),
                question: doc.question.clone(),
                answer: doc.answer.clone(),
            })
            .collect())
    }

    async fn count(&self, collection: &str) -> Result<u64, StoreError> {
        let tables = self.tables.read().await;
        tables
            .get(collection)
            .map(|t| t.documents.len() as u64)
            .ok_or_else(|| StoreError::NotFound(collection.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;

    fn record(id: &str, question: &str, answer: &str) -> CanonicalRecord {
        CanonicalRecord {
            id: id.to_string(),
            asin: format!("ASIN-{id}"),
            question: question.to_string(),
            answer: answer.to_string(),
        }
    }

    fn document(id: &str, vector: Vec<f32>) -> IndexedDocument {
        IndexedDocument::from_record(record(id, "q", "a"), vector)
    }

    #[tokio::test]
    async fn test_scan_pages_through_everything_once() {
        let store = MemoryStore::new();
        let records: Vec<_> = (0..7).map(|i| record(&format!("A{i}"), "q", "a")).collect();
        store.insert_records("qa", records.clone()).await;

        let scanned: Vec<CanonicalRecord> = store.scan("qa", 3).try_collect().await.unwrap();
        assert_eq!(scanned, records);

        // A fresh scan restarts from the beginning
        let again: Vec<CanonicalRecord> = store.scan("qa", 500).try_collect().await.unwrap();
        assert_eq!(again.len(), 7);
    }

    #[tokio::test]
    async fn test_scan_yields_rejections_and_continues() {
        let store = MemoryStore::new();
        store
            .insert_raw(
                "qa",
                vec![
                    RawRecord {
                        id: Some("bad".to_string()),
                        ..Default::default()
                    },
                    RawRecord {
                        id: Some("good".to_string()),
                        asin: Some("B00".to_string()),
                        ..Default::default()
                    },
                ],
            )
            .await;

        let items: Vec<_> = store.scan("qa", 10).collect().await;
        assert_eq!(items.len(), 2);
        assert!(matches!(items[0], Err(RecordError::Rejected { .. })));
        assert_eq!(items[1].as_ref().unwrap().id, "good");
    }

    #[tokio::test]
    async fn test_scan_missing_collection_is_fatal() {
        let store = MemoryStore::new();
        let items: Vec<_> = store.scan("nope", 10).collect().await;
        assert_eq!(items.len(), 1);
        assert!(items[0].as_ref().unwrap_err().is_fatal());
    }

    #[tokio::test]
    async fn test_bulk_upsert_overwrites_by_id() {
        let store = MemoryStore::new();
        store.create_collection("vec", 2).await;
        let collection = VectorCollection::new("vec");

        store
            .bulk_upsert(&collection, &[document("A1", vec![1.0, 0.0])])
            .await
            .unwrap();
        store
            .bulk_upsert(&collection, &[document("A1", vec![0.0, 1.0])])
            .await
            .unwrap();

        assert_eq!(store.count("vec").await.unwrap(), 1);
        assert_eq!(store.get("vec", "A1").await.unwrap().vector, vec![0.0, 1.0]);
    }

    #[tokio::test]
    async fn test_bulk_upsert_rejects_wrong_dimension_per_item() {
        let store = MemoryStore::new();
        store.create_collection("vec", 2).await;

        let outcome = store
            .bulk_upsert(
                &VectorCollection::new("vec"),
                &[document("A1", vec![1.0, 0.0]), document("A2", vec![1.0])],
            )
            .await
            .unwrap();

        assert_eq!(outcome.succeeded, 1);
        assert_eq!(outcome.failures[0].id, "A2");
    }

    #[tokio::test]
    async fn test_injected_bulk_failures_are_consumed_in_order() {
        let store = MemoryStore::new();
        store.create_collection("vec", 2).await;
        store
            .fail_next_bulk([StoreError::Timeout("bulk".to_string())])
            .await;
        let collection = VectorCollection::new("vec");
        let docs = [document("A1", vec![1.0, 0.0])];

        assert!(store.bulk_upsert(&collection, &docs).await.is_err());
        assert!(store.bulk_upsert(&collection, &docs).await.is_ok());
        assert_eq!(store.bulk_calls(), 2);
    }

    #[tokio::test]
    async fn test_knn_ranks_by_cosine_and_limits_k() {
        let store = MemoryStore::new();
        store.create_collection("vec", 2).await;
        let collection = VectorCollection::new("vec");
        store
            .bulk_upsert(
                &collection,
                &[
                    document("far", vec![0.0, 1.0]),
                    document("near", vec![1.0, 0.1]),
                    document("mid", vec![1.0, 1.0]),
                ],
            )
            .await
            .unwrap();

        let hits = store
            .knn_search(
                &collection,
                &KnnQuery {
                    vector: vec![1.0, 0.0],
                    k: 2,
                },
            )
            .await
            .unwrap();

        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].id, "near");
        assert_eq!(hits[1].id, "mid");
        assert!(hits[0].score > hits[1].score);
        assert_eq!(store.search_calls(), 1);
    }

    #[tokio::test]
    async fn test_knn_ties_are_deterministic() {
        let store = MemoryStore::new();
        store.create_collection("vec", 2).await;
        let collection = VectorCollection::new("vec");
        store
            .bulk_upsert(
                &collection,
                &[document("b", vec![1.0, 0.0]), document("a", vec![1.0, 0.0])],
            )
            .await
            .unwrap();

        let query = KnnQuery {
            vector: vec![1.0, 0.0],
            k: 2,
        };
        let first = store.knn_search(&collection, &query).await.unwrap();
        let second = store.knn_search(&collection, &query).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first[0].id, "a");
    }

    #[tokio::test]
    async fn test_vector_dimension() {
        let store = MemoryStore::new();
        store.create_collection("vec", 384).await;

        assert_eq!(
            store
                .vector_dimension(&VectorCollection::new("vec"))
                .await
                .unwrap(),
            Some(384)
        );
        assert!(store
            .vector_dimension(&VectorCollection::new("missing"))
            .await
            .is_err());
    }
}
