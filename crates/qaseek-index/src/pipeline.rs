//! Bulk indexing pipeline.

use futures::StreamExt;
use qaseek_core::{
    verify_dimension, CanonicalRecord, EmbedError, Embedder, EmbeddingConfig, Error,
    IndexedDocument, IndexingSummary, RecordError, RecordSource, RecordStream, RetryPolicy,
    StoreError, TextComposer, VectorCollection, VectorIndex, DEFAULT_BATCH_SIZE,
    DEFAULT_PAGE_SIZE,
};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::cancel::CancelHandle;

/// Events emitted during an indexing run.
#[derive(Debug, Clone)]
pub enum IndexUpdate {
    RunStarted {
        destination: String,
    },
    /// Emitted every `progress_every` settled records.
    Progress {
        attempted: u64,
        succeeded: u64,
        skipped: u64,
        failed: u64,
    },
    BatchWritten {
        batch: u64,
        succeeded: usize,
        failed: usize,
    },
    BatchRetry {
        batch: u64,
        attempt: u32,
        delay: Duration,
        error: String,
    },
    RecordFailed {
        id: Option<String>,
        error: String,
    },
    RunFinished {
        summary: IndexingSummary,
    },
}

/// Configuration for the pipeline.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Documents per bulk write
    pub batch_size: usize,
    /// Records per source page
    pub page_size: usize,
    /// Texts per embedding call
    pub micro_batch_size: usize,
    /// Embedding calls in flight
    pub embed_workers: usize,
    /// Bulk writes in flight; reading stalls once this many are outstanding
    pub max_inflight_batches: usize,
    /// Retry policy for whole-batch sink failures
    pub retry: RetryPolicy,
    /// Progress event interval in settled records (0 disables)
    pub progress_every: u64,
    pub embed_config: EmbeddingConfig,
    pub composer: TextComposer,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            page_size: DEFAULT_PAGE_SIZE,
            micro_batch_size: 32,
            embed_workers: 4,
            max_inflight_batches: 2,
            retry: RetryPolicy::default(),
            progress_every: 100,
            embed_config: EmbeddingConfig::default(),
            composer: TextComposer::default(),
        }
    }
}

/// A run that ended on a fatal error, with the work completed before it.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct IndexingFailure {
    #[source]
    pub error: Error,
    pub summary: IndexingSummary,
}

/// Outcome of one embedding micro-batch.
struct EmbedBatch {
    documents: Vec<IndexedDocument>,
    failures: Vec<(String, EmbedError)>,
    fatal: Option<Error>,
    size: usize,
}

/// Outcome of one bulk write, after retries.
struct WriteResult {
    batch: u64,
    size: usize,
    outcome: Result<qaseek_core::BulkOutcome, Error>,
}

/// Embeds records and writes them into a vector collection.
pub struct IndexingPipeline {
    embedder: Arc<dyn Embedder>,
    sink: Arc<dyn VectorIndex>,
    config: PipelineConfig,
    update_tx: broadcast::Sender<IndexUpdate>,
    cancel: CancelHandle,
}

impl IndexingPipeline {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        sink: Arc<dyn VectorIndex>,
        config: PipelineConfig,
    ) -> Self {
        let (update_tx, _) = broadcast::channel(256);
        Self {
            embedder,
            sink,
            config,
            update_tx,
            cancel: CancelHandle::new(),
        }
    }

    /// Subscribe to run updates.
    pub fn subscribe(&self) -> broadcast::Receiver<IndexUpdate> {
        self.update_tx.subscribe()
    }

    /// Handle that stops the run cooperatively.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Startup checks: the sink answers with our credentials and its vector
    /// field has the embedder's dimension.
    pub async fn preflight(&self, destination: &VectorCollection) -> Result<usize, Error> {
        self.sink.ping().await.map_err(Error::Backend)?;
        verify_dimension(self.embedder.as_ref(), self.sink.as_ref(), destination).await
    }

    /// Scan `source_collection` and index every record into `destination`.
    pub async fn run(
        &self,
        source: &dyn RecordSource,
        source_collection: &str,
        destination: &VectorCollection,
    ) -> Result<IndexingSummary, IndexingFailure> {
        info!(
            "Indexing {} into {} (batch size {})",
            source_collection, destination.name, self.config.batch_size
        );
        let records = source.scan(source_collection, self.config.page_size);
        self.run_stream(records, destination).await
    }

    /// Index a record stream into `destination`.
    pub async fn run_stream(
        &self,
        mut records: RecordStream<'_>,
        destination: &VectorCollection,
    ) -> Result<IndexingSummary, IndexingFailure> {
        let batch_size = self.config.batch_size.max(1);
        let micro_batch = self.config.micro_batch_size.max(1);
        let embed_workers = self.config.embed_workers.max(1);
        let max_inflight = self.config.max_inflight_batches.max(1);
        let progress_every = self.config.progress_every;

        let _ = self.update_tx.send(IndexUpdate::RunStarted {
            destination: destination.name.clone(),
        });

        let mut summary = IndexingSummary::start();
        let mut next_progress = progress_every;
        let mut fatal: Option<Error> = None;
        let mut reading = true;
        let mut cancelled = false;

        let mut pending: Vec<(CanonicalRecord, String)> = Vec::new();
        let mut ready: Vec<IndexedDocument> = Vec::new();
        let mut embed_tasks: JoinSet<EmbedBatch> = JoinSet::new();
        let mut write_tasks: JoinSet<WriteResult> = JoinSet::new();
        let mut embedding_records = 0usize;
        let mut writing_documents = 0usize;
        let mut batches_started = 0u64;

        loop {
            let stopping = cancelled || fatal.is_some();

            if !stopping {
                // Hand full micro-batches to idle workers
                while pending.len() >= micro_batch && embed_tasks.len() < embed_workers {
                    let chunk: Vec<_> = pending.drain(..micro_batch).collect();
                    embedding_records += chunk.len();
                    embed_tasks.spawn(self.embed_task(chunk));
                }
                // Submit full batches while under the in-flight limit
                while ready.len() >= batch_size && write_tasks.len() < max_inflight {
                    let docs: Vec<_> = ready.drain(..batch_size).collect();
                    batches_started += 1;
                    writing_documents += docs.len();
                    write_tasks.spawn(self.write_task(batches_started, docs, destination.clone()));
                }
                // End of stream: flush partial micro-batch, then the partial batch
                if !reading {
                    if !pending.is_empty() && embed_tasks.len() < embed_workers {
                        let chunk = std::mem::take(&mut pending);
                        embedding_records += chunk.len();
                        embed_tasks.spawn(self.embed_task(chunk));
                    }
                    if pending.is_empty()
                        && embed_tasks.is_empty()
                        && !ready.is_empty()
                        && write_tasks.len() < max_inflight
                    {
                        let docs = std::mem::take(&mut ready);
                        batches_started += 1;
                        writing_documents += docs.len();
                        write_tasks.spawn(self.write_task(
                            batches_started,
                            docs,
                            destination.clone(),
                        ));
                    }
                }
            }

            let can_read =
                reading && !stopping && pending.len() < micro_batch && ready.len() < batch_size;

            if !can_read && embed_tasks.is_empty() && write_tasks.is_empty() {
                break;
            }

            tokio::select! {
                biased;

                () = self.cancel.cancelled(), if !cancelled => {
                    info!("Cancellation requested; finishing in-flight batches");
                    cancelled = true;
                    reading = false;
                }

                Some(joined) = write_tasks.join_next(), if !write_tasks.is_empty() => {
                    let result = match joined {
                        Ok(result) => result,
                        Err(e) => {
                            error!("Bulk write task failed: {}", e);
                            fatal.get_or_insert(Error::SinkWrite {
                                attempts: 0,
                                source: StoreError::Request(format!("write task failed: {e}")),
                            });
                            continue;
                        }
                    };
                    writing_documents -= result.size;
                    self.settle_write(result, &mut summary, &mut fatal);
                }

                Some(joined) = embed_tasks.join_next(), if !embed_tasks.is_empty() => {
                    let batch = match joined {
                        Ok(batch) => batch,
                        Err(e) => {
                            error!("Embedding task failed: {}", e);
                            fatal.get_or_insert(Error::Embedding(EmbedError::Inference(
                                format!("embedding task failed: {e}"),
                            )));
                            continue;
                        }
                    };
                    embedding_records -= batch.size;
                    // Records after a fatal vector are neither documents nor failures
                    summary.abandoned +=
                        (batch.size - batch.documents.len() - batch.failures.len()) as u64;
                    for (id, err) in batch.failures {
                        warn!("Failed to embed record {}: {}", id, err);
                        summary.record_failed(1);
                        let _ = self.update_tx.send(IndexUpdate::RecordFailed {
                            id: Some(id),
                            error: err.to_string(),
                        });
                    }
                    if let Some(err) = batch.fatal {
                        error!("Aborting run: {}", err);
                        fatal.get_or_insert(err);
                    }
                    if cancelled || fatal.is_some() {
                        summary.abandoned += batch.documents.len() as u64;
                    } else {
                        ready.extend(batch.documents);
                    }
                }

                item = records.next(), if can_read => match item {
                    Some(Ok(record)) => match self.config.composer.compose(&record) {
                        Some(text) => pending.push((record, text)),
                        None => {
                            debug!("Skipping record {} with no text", record.id);
                            summary.record_skipped();
                        }
                    },
                    Some(Err(RecordError::Source(e))) => {
                        error!("Source read failed: {}", e);
                        fatal.get_or_insert(Error::SourceRead(e));
                        reading = false;
                    }
                    Some(Err(err)) => {
                        warn!("{}", err);
                        summary.record_failed(1);
                        let id = match &err {
                            RecordError::Rejected { id, .. } => id.clone(),
                            RecordError::Source(_) => None,
                        };
                        let _ = self.update_tx.send(IndexUpdate::RecordFailed {
                            id,
                            error: err.to_string(),
                        });
                    }
                    None => {
                        debug!("Record stream exhausted");
                        reading = false;
                    }
                },
            }

            while progress_every > 0 && summary.attempted >= next_progress {
                info!(
                    "Progress: {} records ({} indexed, {} skipped, {} failed)",
                    summary.attempted, summary.succeeded, summary.skipped, summary.failed
                );
                let _ = self.update_tx.send(IndexUpdate::Progress {
                    attempted: summary.attempted,
                    succeeded: summary.succeeded,
                    skipped: summary.skipped,
                    failed: summary.failed,
                });
                next_progress += progress_every;
            }
        }

        summary.abandoned +=
            (pending.len() + ready.len() + embedding_records + writing_documents) as u64;
        summary.cancelled = cancelled;

        if fatal.is_none() && summary.succeeded > 0 {
            if let Err(e) = self.sink.refresh(&destination.name).await {
                warn!("Failed to refresh {}: {}", destination.name, e);
            }
        }
        summary.finish();

        let _ = self.update_tx.send(IndexUpdate::RunFinished {
            summary: summary.clone(),
        });

        match fatal {
            None => {
                info!("Indexing finished: {}", summary);
                Ok(summary)
            }
            Some(error) => {
                error!("Indexing failed: {} ({})", error, summary);
                Err(IndexingFailure { error, summary })
            }
        }
    }

    fn settle_write(
        &self,
        result: WriteResult,
        summary: &mut IndexingSummary,
        fatal: &mut Option<Error>,
    ) {
        match result.outcome {
            Ok(outcome) => {
                summary.batches_submitted += 1;
                summary.record_succeeded(outcome.succeeded as u64);
                summary.record_failed(outcome.failed() as u64);
                for failure in &outcome.failures {
                    warn!("Document {} rejected: {}", failure.id, failure.reason);
                    let _ = self.update_tx.send(IndexUpdate::RecordFailed {
                        id: Some(failure.id.clone()),
                        error: failure.reason.clone(),
                    });
                }
                debug!(
                    "Batch {} written: {} ok, {} failed",
                    result.batch,
                    outcome.succeeded,
                    outcome.failed()
                );
                let _ = self.update_tx.send(IndexUpdate::BatchWritten {
                    batch: result.batch,
                    succeeded: outcome.succeeded,
                    failed: outcome.failed(),
                });
            }
            Err(err) => {
                error!("Batch {} failed: {}", result.batch, err);
                summary.abandoned += result.size as u64;
                fatal.get_or_insert(err);
            }
        }
    }

    /// Embed a micro-batch, isolating failing records if the batch call fails.
    fn embed_task(
        &self,
        chunk: Vec<(CanonicalRecord, String)>,
    ) -> impl std::future::Future<Output = EmbedBatch> + Send + 'static {
        let embedder = Arc::clone(&self.embedder);
        let config = self.config.embed_config.clone();

        async move {
            let size = chunk.len();
            let expected = embedder.dimension();
            let mut batch = EmbedBatch {
                documents: Vec::with_capacity(size),
                failures: Vec::new(),
                fatal: None,
                size,
            };

            let texts: Vec<&str> = chunk.iter().map(|(_, text)| text.as_str()).collect();
            let vectors: Vec<Result<Vec<f32>, EmbedError>> =
                match embedder.embed_text(&texts, &config).await {
                    Ok(outputs) if outputs.len() == size => {
                        outputs.into_iter().map(|o| Ok(o.embedding)).collect()
                    }
                    Ok(outputs) => {
                        batch.fatal = Some(Error::Embedding(EmbedError::Inference(format!(
                            "embedder returned {} vectors for {} texts",
                            outputs.len(),
                            size
                        ))));
                        return batch;
                    }
                    Err(e) if size == 1 => vec![Err(e)],
                    Err(e) => {
                        debug!("Micro-batch of {} failed ({}); embedding one by one", size, e);
                        let mut results = Vec::with_capacity(size);
                        for text in &texts {
                            results.push(embedder.embed(text, &config).await);
                        }
                        results
                    }
                };

            for ((record, _), vector) in chunk.into_iter().zip(vectors) {
                match vector {
                    Ok(vector) if vector.len() == expected => {
                        batch.documents.push(IndexedDocument::from_record(record, vector));
                    }
                    Ok(vector) => {
                        batch.fatal = Some(Error::Config(format!(
                            "embedding for {} has {} dimensions, expected {}",
                            record.id,
                            vector.len(),
                            expected
                        )));
                        break;
                    }
                    Err(EmbedError::DimensionMismatch { expected, actual }) => {
                        batch.fatal = Some(Error::Config(format!(
                            "embedding has {actual} dimensions, expected {expected}"
                        )));
                        break;
                    }
                    Err(e) => batch.failures.push((record.id, e)),
                }
            }

            batch
        }
    }

    /// Write one batch, retrying transient failures with backoff.
    fn write_task(
        &self,
        batch: u64,
        documents: Vec<IndexedDocument>,
        collection: VectorCollection,
    ) -> impl std::future::Future<Output = WriteResult> + Send + 'static {
        let sink = Arc::clone(&self.sink);
        let retry = self.config.retry;
        let update_tx = self.update_tx.clone();

        async move {
            let size = documents.len();
            let mut attempt = 0u32;
            loop {
                attempt += 1;
                match sink.bulk_upsert(&collection, &documents).await {
                    Ok(outcome) => {
                        return WriteResult {
                            batch,
                            size,
                            outcome: Ok(outcome),
                        }
                    }
                    Err(e) if e.is_transient() && retry.should_retry(attempt) => {
                        let delay = retry.backoff(attempt);
                        warn!(
                            "Batch {} attempt {} failed: {}; retrying in {:?}",
                            batch, attempt, e, delay
                        );
                        let _ = update_tx.send(IndexUpdate::BatchRetry {
                            batch,
                            attempt,
                            delay,
                            error: e.to_string(),
                        });
                        tokio::time::sleep(delay).await;
                    }
                    Err(e) => {
                        return WriteResult {
                            batch,
                            size,
                            outcome: Err(Error::SinkWrite {
                                attempts: attempt,
                                source: e,
                            }),
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use futures::stream;
    use qaseek_core::{BulkOutcome, EmbeddingOutput, KnnQuery, RawRecord, SearchHit};
    use qaseek_embed::HashEmbedder;
    use qaseek_store::MemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    const DIM: usize = 64;

    fn record(i: usize) -> CanonicalRecord {
        CanonicalRecord {
            id: format!("Q{i:04}"),
            asin: format!("B{i:04}"),
            question: format!("Does item {i} work for gaming?"),
            answer: format!("Yes, item {i} runs fine."),
        }
    }

    fn records(n: usize) -> Vec<CanonicalRecord> {
        (0..n).map(record).collect()
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy::with_retries(3, Duration::from_millis(1), Duration::from_millis(4))
    }

    fn config() -> PipelineConfig {
        PipelineConfig {
            retry: fast_retry(),
            ..Default::default()
        }
    }

    async fn setup(source: Vec<CanonicalRecord>) -> (Arc<MemoryStore>, VectorCollection) {
        let store = Arc::new(MemoryStore::new());
        store.insert_records("qa", source).await;
        store.create_collection("qa_vec", DIM).await;
        (store, VectorCollection::new("qa_vec"))
    }

    fn pipeline(store: &Arc<MemoryStore>, config: PipelineConfig) -> IndexingPipeline {
        IndexingPipeline::new(
            Arc::new(HashEmbedder::with_dimension(DIM)),
            Arc::clone(store) as Arc<dyn VectorIndex>,
            config,
        )
    }

    fn drain(rx: &mut broadcast::Receiver<IndexUpdate>) -> Vec<IndexUpdate> {
        let mut updates = Vec::new();
        while let Ok(update) = rx.try_recv() {
            updates.push(update);
        }
        updates
    }

    // ========== End-to-end Tests ==========

    #[tokio::test]
    async fn test_indexes_all_records() {
        let (store, dest) = setup(records(7)).await;
        let pipeline = pipeline(
            &store,
            PipelineConfig {
                batch_size: 3,
                micro_batch_size: 2,
                ..config()
            },
        );

        let summary = pipeline.run(store.as_ref(), "qa", &dest).await.unwrap();

        assert_eq!(summary.attempted, 7);
        assert_eq!(summary.succeeded, 7);
        assert_eq!(summary.failed, 0);
        assert_eq!(summary.abandoned, 0);
        assert_eq!(summary.batches_submitted, 3);
        assert!(!summary.cancelled);
        assert!(summary.finished_at.is_some());
        assert_eq!(store.count("qa_vec").await.unwrap(), 7);

        let doc = store.get("qa_vec", "Q0003").await.unwrap();
        assert_eq!(doc.asin, "B0003");
        assert_eq!(doc.vector.len(), DIM);
    }

    #[tokio::test]
    async fn test_blank_record_is_skipped() {
        let mut source = records(2);
        source.push(CanonicalRecord {
            id: "blank".to_string(),
            asin: "B9".to_string(),
            question: "  ".to_string(),
            answer: String::new(),
        });
        let (store, dest) = setup(source).await;

        let summary = pipeline(&store, config())
            .run(store.as_ref(), "qa", &dest)
            .await
            .unwrap();

        assert_eq!(summary.attempted, 3);
        assert_eq!(summary.succeeded, 2);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.failed, 0);
        assert!(store.get("qa_vec", "blank").await.is_none());
    }

    #[tokio::test]
    async fn test_poison_record_fails_alone() {
        let mut source = records(4);
        source.insert(
            2,
            CanonicalRecord {
                id: "poison".to_string(),
                asin: "B9".to_string(),
                question: "???".to_string(),
                answer: "!!!".to_string(),
            },
        );
        let (store, dest) = setup(source).await;
        let pipeline = pipeline(&store, config());
        let mut rx = pipeline.subscribe();

        let summary = pipeline.run(store.as_ref(), "qa", &dest).await.unwrap();

        assert_eq!(summary.attempted, 5);
        assert_eq!(summary.succeeded, 4);
        assert_eq!(summary.failed, 1);
        assert_eq!(store.count("qa_vec").await.unwrap(), 4);

        let failed: Vec<_> = drain(&mut rx)
            .into_iter()
            .filter_map(|u| match u {
                IndexUpdate::RecordFailed { id, .. } => id,
                _ => None,
            })
            .collect();
        assert_eq!(failed, vec!["poison".to_string()]);
    }

    #[tokio::test]
    async fn test_rejected_source_record_counts_as_failed() {
        let (store, dest) = setup(records(2)).await;
        store
            .insert_raw(
                "qa",
                vec![RawRecord {
                    id: Some("no-asin".to_string()),
                    question: Some("q".to_string()),
                    ..Default::default()
                }],
            )
            .await;

        let summary = pipeline(&store, config())
            .run(store.as_ref(), "qa", &dest)
            .await
            .unwrap();

        assert_eq!(summary.attempted, 3);
        assert_eq!(summary.succeeded, 2);
        assert_eq!(summary.failed, 1);
    }

    #[tokio::test]
    async fn test_rerun_is_idempotent() {
        let (store, dest) = setup(records(5)).await;
        let pipeline = pipeline(&store, config());

        pipeline.run(store.as_ref(), "qa", &dest).await.unwrap();
        let first = store.documents("qa_vec").await;
        pipeline.run(store.as_ref(), "qa", &dest).await.unwrap();
        let second = store.documents("qa_vec").await;

        assert_eq!(store.count("qa_vec").await.unwrap(), 5);
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_empty_source() {
        let (store, dest) = setup(Vec::new()).await;
        store.insert_raw("qa", Vec::new()).await;

        let summary = pipeline(&store, config())
            .run(store.as_ref(), "qa", &dest)
            .await
            .unwrap();

        assert_eq!(summary.attempted, 0);
        assert_eq!(store.bulk_calls(), 0);
    }

    // ========== Retry Tests ==========

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let (store, dest) = setup(records(3)).await;
        store
            .fail_next_bulk([
                StoreError::Timeout("bulk".to_string()),
                StoreError::Status {
                    status: 503,
                    body: "busy".to_string(),
                },
            ])
            .await;
        let pipeline = pipeline(&store, config());
        let mut rx = pipeline.subscribe();

        let summary = pipeline.run(store.as_ref(), "qa", &dest).await.unwrap();

        assert_eq!(summary.succeeded, 3);
        assert_eq!(store.bulk_calls(), 3);
        let retries = drain(&mut rx)
            .into_iter()
            .filter(|u| matches!(u, IndexUpdate::BatchRetry { .. }))
            .count();
        assert_eq!(retries, 2);
    }

    #[tokio::test]
    async fn test_exhausted_retries_abort_with_summary() {
        let (store, dest) = setup(records(3)).await;
        store
            .fail_next_bulk((0..4).map(|_| StoreError::Unreachable("refused".to_string())))
            .await;

        let failure = pipeline(&store, config())
            .run(store.as_ref(), "qa", &dest)
            .await
            .unwrap_err();

        match &failure.error {
            Error::SinkWrite { attempts, source } => {
                assert_eq!(*attempts, 4);
                assert!(matches!(source, StoreError::Unreachable(_)));
            }
            other => panic!("expected SinkWrite, got {other:?}"),
        }
        assert_eq!(failure.summary.succeeded, 0);
        assert_eq!(failure.summary.abandoned, 3);
        assert_eq!(store.bulk_calls(), 4);
    }

    #[tokio::test]
    async fn test_auth_failure_is_not_retried() {
        let (store, dest) = setup(records(3)).await;
        store
            .fail_next_bulk([StoreError::Unauthorized("bad password".to_string())])
            .await;

        let failure = pipeline(&store, config())
            .run(store.as_ref(), "qa", &dest)
            .await
            .unwrap_err();

        assert!(matches!(
            failure.error,
            Error::SinkWrite {
                attempts: 1,
                source: StoreError::Unauthorized(_)
            }
        ));
        assert_eq!(store.bulk_calls(), 1);
    }

    // ========== Fatal Error Tests ==========

    #[tokio::test]
    async fn test_source_failure_is_fatal() {
        let (store, dest) = setup(Vec::new()).await;
        let items = vec![
            Ok(record(1)),
            Err(RecordError::Source(StoreError::Timeout("scroll".to_string()))),
            Ok(record(2)),
        ];

        let failure = pipeline(&store, config())
            .run_stream(stream::iter(items).boxed(), &dest)
            .await
            .unwrap_err();

        assert!(matches!(failure.error, Error::SourceRead(StoreError::Timeout(_))));
        assert_eq!(failure.summary.attempted + failure.summary.abandoned, 1);
        assert_eq!(store.count("qa_vec").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_missing_source_collection_is_fatal() {
        let (store, dest) = setup(Vec::new()).await;

        let failure = pipeline(&store, config())
            .run(store.as_ref(), "nope", &dest)
            .await
            .unwrap_err();

        assert!(matches!(failure.error, Error::SourceRead(StoreError::NotFound(_))));
    }

    struct ShortEmbedder;

    #[async_trait]
    impl Embedder for ShortEmbedder {
        fn model_name(&self) -> &str {
            "short"
        }

        fn dimension(&self) -> usize {
            DIM
        }

        fn max_tokens(&self) -> usize {
            512
        }

        async fn embed_text(
            &self,
            texts: &[&str],
            _config: &EmbeddingConfig,
        ) -> Result<Vec<EmbeddingOutput>, EmbedError> {
            Ok(texts
                .iter()
                .map(|_| EmbeddingOutput {
                    embedding: vec![0.5; DIM - 1],
                    token_count: 1,
                })
                .collect())
        }
    }

    #[tokio::test]
    async fn test_wrong_vector_length_is_config_error() {
        let (store, dest) = setup(records(3)).await;
        let pipeline = IndexingPipeline::new(
            Arc::new(ShortEmbedder),
            Arc::clone(&store) as Arc<dyn VectorIndex>,
            config(),
        );

        let failure = pipeline.run(store.as_ref(), "qa", &dest).await.unwrap_err();

        assert!(matches!(failure.error, Error::Config(_)));
        assert_eq!(store.bulk_calls(), 0);
        assert_eq!(failure.summary.abandoned, 3);
    }

    #[tokio::test]
    async fn test_preflight_checks_dimension() {
        let store = Arc::new(MemoryStore::new());
        store.create_collection("qa_vec", 768).await;

        let err = pipeline(&store, config())
            .preflight(&VectorCollection::new("qa_vec"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));

        store.create_collection("qa_vec", DIM).await;
        let dim = pipeline(&store, config())
            .preflight(&VectorCollection::new("qa_vec"))
            .await
            .unwrap();
        assert_eq!(dim, DIM);
    }

    // ========== Cancellation Tests ==========

    #[tokio::test]
    async fn test_cancel_before_run() {
        let (store, dest) = setup(records(10)).await;
        let pipeline = pipeline(&store, config());
        pipeline.cancel_handle().cancel();

        let summary = pipeline.run(store.as_ref(), "qa", &dest).await.unwrap();

        assert!(summary.cancelled);
        assert_eq!(summary.attempted, 0);
        assert_eq!(store.bulk_calls(), 0);
    }

    /// Sink that requests cancellation on its first write.
    struct CancellingSink {
        inner: MemoryStore,
        cancel: StdMutex<Option<CancelHandle>>,
    }

    #[async_trait]
    impl VectorIndex for CancellingSink {
        async fn ping(&self) -> Result<(), StoreError> {
            Ok(())
        }

        async fn vector_dimension(
            &self,
            collection: &VectorCollection,
        ) -> Result<Option<usize>, StoreError> {
            self.inner.vector_dimension(collection).await
        }

        async fn bulk_upsert(
            &self,
            collection: &VectorCollection,
            documents: &[IndexedDocument],
        ) -> Result<BulkOutcome, StoreError> {
            if let Some(handle) = self.cancel.lock().unwrap().take() {
                handle.cancel();
            }
            self.inner.bulk_upsert(collection, documents).await
        }

        async fn knn_search(
            &self,
            collection: &VectorCollection,
            query: &KnnQuery,
        ) -> Result<Vec<SearchHit>, StoreError> {
            self.inner.knn_search(collection, query).await
        }

        async fn count(&self, collection: &str) -> Result<u64, StoreError> {
            self.inner.count(collection).await
        }
    }

    #[tokio::test]
    async fn test_cancel_mid_run_finishes_inflight_batches() {
        let inner = MemoryStore::new();
        inner.create_collection("qa_vec", DIM).await;
        let source = MemoryStore::new();
        source.insert_records("qa", records(1000)).await;

        let sink = Arc::new(CancellingSink {
            inner,
            cancel: StdMutex::new(None),
        });
        let pipeline = IndexingPipeline::new(
            Arc::new(HashEmbedder::with_dimension(DIM)),
            Arc::clone(&sink) as Arc<dyn VectorIndex>,
            PipelineConfig {
                batch_size: 10,
                micro_batch_size: 5,
                page_size: 50,
                ..config()
            },
        );
        *sink.cancel.lock().unwrap() = Some(pipeline.cancel_handle());

        let summary = pipeline
            .run(&source, "qa", &VectorCollection::new("qa_vec"))
            .await
            .unwrap();

        assert!(summary.cancelled);
        assert!(summary.succeeded >= 10);
        assert!(summary.succeeded < 1000);
        assert_eq!(summary.succeeded % 10, 0);
        assert_eq!(sink.inner.count("qa_vec").await.unwrap(), summary.succeeded);
        assert_eq!(
            summary.attempted,
            summary.succeeded + summary.skipped + summary.failed
        );
    }

    // ========== Backpressure Tests ==========

    /// Sink that records how many writes overlap.
    struct SlowSink {
        inner: MemoryStore,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl VectorIndex for SlowSink {
        async fn ping(&self) -> Result<(), StoreError> {
            Ok(())
        }

        async fn vector_dimension(
            &self,
            collection: &VectorCollection,
        ) -> Result<Option<usize>, StoreError> {
            self.inner.vector_dimension(collection).await
        }

        async fn bulk_upsert(
            &self,
            collection: &VectorCollection,
            documents: &[IndexedDocument],
        ) -> Result<BulkOutcome, StoreError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            let result = self.inner.bulk_upsert(collection, documents).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            result
        }

        async fn knn_search(
            &self,
            collection: &VectorCollection,
            query: &KnnQuery,
        ) -> Result<Vec<SearchHit>, StoreError> {
            self.inner.knn_search(collection, query).await
        }

        async fn count(&self, collection: &str) -> Result<u64, StoreError> {
            self.inner.count(collection).await
        }
    }

    #[tokio::test]
    async fn test_inflight_batches_are_bounded() {
        let inner = MemoryStore::new();
        inner.create_collection("qa_vec", DIM).await;
        let sink = Arc::new(SlowSink {
            inner,
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let pipeline = IndexingPipeline::new(
            Arc::new(HashEmbedder::with_dimension(DIM)),
            Arc::clone(&sink) as Arc<dyn VectorIndex>,
            PipelineConfig {
                batch_size: 2,
                micro_batch_size: 2,
                max_inflight_batches: 2,
                ..config()
            },
        );

        let items: Vec<_> = records(20).into_iter().map(Ok).collect();
        let summary = pipeline
            .run_stream(stream::iter(items).boxed(), &VectorCollection::new("qa_vec"))
            .await
            .unwrap();

        assert_eq!(summary.succeeded, 20);
        assert_eq!(summary.batches_submitted, 10);
        let peak = sink.peak.load(Ordering::SeqCst);
        assert!(peak >= 1 && peak <= 2, "peak in-flight writes: {peak}");
    }

    // ========== Progress Tests ==========

    #[tokio::test]
    async fn test_progress_and_lifecycle_events() {
        let (store, dest) = setup(records(6)).await;
        let pipeline = pipeline(
            &store,
            PipelineConfig {
                batch_size: 2,
                progress_every: 2,
                ..config()
            },
        );
        let mut rx = pipeline.subscribe();

        pipeline.run(store.as_ref(), "qa", &dest).await.unwrap();
        let updates = drain(&mut rx);

        assert!(matches!(updates.first(), Some(IndexUpdate::RunStarted { .. })));
        match updates.last() {
            Some(IndexUpdate::RunFinished { summary }) => assert_eq!(summary.succeeded, 6),
            other => panic!("expected RunFinished, got {other:?}"),
        }

        let progress: Vec<u64> = updates
            .iter()
            .filter_map(|u| match u {
                IndexUpdate::Progress { attempted, .. } => Some(*attempted),
                _ => None,
            })
            .collect();
        assert_eq!(progress.len(), 3);
        assert!(progress.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(progress.last(), Some(&6));

        let written = updates
            .iter()
            .filter(|u| matches!(u, IndexUpdate::BatchWritten { .. }))
            .count();
        assert_eq!(written, 3);
    }
}
