//! Benchmarks for the indexing pipeline.
//!
//! Measures end-to-end throughput of scan → embed → bulk write against the
//! in-memory backend.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use qaseek_core::{CanonicalRecord, TextComposer, VectorCollection, VectorIndex};
use qaseek_embed::HashEmbedder;
use qaseek_index::{IndexingPipeline, PipelineConfig};
use qaseek_store::MemoryStore;
use std::sync::Arc;

const DIM: usize = 384;

/// Generate synthetic Q&A records.
fn generate_records(count: usize) -> Vec<CanonicalRecord> {
    (0..count)
        .map(|i| CanonicalRecord {
            id: format!("Q{i:06}"),
            asin: format!("B{:05}", i / 7),
            question: format!("Does product {} support feature {}?", i / 7, i % 13),
            answer: format!("Yes, feature {} works after the update to version {}.", i % 13, i % 5),
        })
        .collect()
}

fn pipeline_benchmark(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    let mut group = c.benchmark_group("pipeline");
    group.sample_size(10);

    for record_count in [1_000, 10_000].iter() {
        let store = Arc::new(MemoryStore::new());
        rt.block_on(async {
            store.insert_records("qa", generate_records(*record_count)).await;
            store.create_collection("qa_vec", DIM).await;
        });

        for batch_size in [100, 500].iter() {
            let config = PipelineConfig {
                batch_size: *batch_size,
                progress_every: 0,
                ..Default::default()
            };

            group.throughput(Throughput::Elements(*record_count as u64));
            group.bench_with_input(
                BenchmarkId::new(format!("batch_{batch_size}"), record_count),
                record_count,
                |b, _| {
                    b.to_async(&rt).iter(|| async {
                        let pipeline = IndexingPipeline::new(
                            Arc::new(HashEmbedder::with_dimension(DIM)),
                            Arc::clone(&store) as Arc<dyn VectorIndex>,
                            config.clone(),
                        );
                        black_box(
                            pipeline
                                .run(store.as_ref(), "qa", &VectorCollection::new("qa_vec"))
                                .await
                                .unwrap(),
                        )
                    });
                },
            );
        }
    }

    group.finish();
}

fn compose_benchmark(c: &mut Criterion) {
    let records = generate_records(1_000);
    let composer = TextComposer::default();

    let mut group = c.benchmark_group("compose");
    group.throughput(Throughput::Elements(records.len() as u64));
    group.bench_function("question_answer", |b| {
        b.iter(|| {
            for record in &records {
                black_box(composer.compose(record));
            }
        });
    });
    group.finish();
}

criterion_group!(benches, pipeline_benchmark, compose_benchmark);
criterion_main!(benches);
