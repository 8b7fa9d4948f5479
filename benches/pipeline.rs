//! Benchmarks for docswarm hot paths
//!
//! Run: cargo bench
//! Run specific: cargo bench -- chunking
//! Compare: cargo bench -- --save-baseline v1 && cargo bench -- --baseline v1

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use docswarm::dedup::{DedupItem, Deduplicator, ResultKind};
use docswarm::swarm::{CapabilityIndex, ChunkConfig, Chunker, HashProjectionEmbedder};

fn document(words: usize) -> String {
    (0..words)
        .map(|i| match i % 13 {
            0 => "turbine".to_string(),
            5 => "sediment.".to_string(),
            _ => format!("term{}", i % 211),
        })
        .collect::<Vec<_>>()
        .join(" ")
}

// ============================================================================
// Chunking
// ============================================================================

fn benchmark_chunking(c: &mut Criterion) {
    let mut group = c.benchmark_group("chunking");
    let chunker = Chunker::new(ChunkConfig::default()).unwrap();

    for words in [1_000, 10_000, 50_000].iter() {
        let text = document(*words);
        group.throughput(Throughput::Bytes(text.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(words), &text, |b, text| {
            b.iter(|| black_box(chunker.chunk_document("bench", black_box(text)).unwrap()))
        });
    }

    group.finish();
}

// ============================================================================
// Capability ranking
// ============================================================================

fn benchmark_ranking(c: &mut Criterion) {
    let mut group = c.benchmark_group("ranking");

    for workers in [8, 64, 256].iter() {
        let index = CapabilityIndex::new(Arc::new(HashProjectionEmbedder::new(512, 4)));
        for i in 0..*workers {
            let tags = ["text".to_string(), format!("skill{}", i % 17)];
            index.register(&format!("w{}", i), &tags).unwrap();
        }

        group.bench_with_input(BenchmarkId::from_parameter(workers), workers, |b, _| {
            b.iter(|| {
                black_box(
                    index
                        .rank("summarize sediment findings", &["text"], |_| true)
                        .unwrap(),
                )
            })
        });
    }

    group.finish();
}

// ============================================================================
// Dedup
// ============================================================================

fn benchmark_dedup(c: &mut Criterion) {
    let mut group = c.benchmark_group("dedup");

    for count in [10, 100, 400].iter() {
        let items: Vec<DedupItem> = (0..*count)
            .map(|i| {
                let keywords = (0..10).map(|k| format!("kw{}", (i / 3) * 10 + k)).collect();
                DedupItem::new(format!("r{}", i), ResultKind::Analysis, format!("result {}", i / 3))
                    .with_keywords(keywords)
                    .with_scores((i % 10) as f64 / 10.0, 0.5, 100)
            })
            .collect();

        group.bench_with_input(BenchmarkId::from_parameter(count), &items, |b, items| {
            let dedup = Deduplicator::new();
            b.iter(|| black_box(dedup.deduplicate(items.clone())))
        });
    }

    group.finish();
}

criterion_group!(benches, benchmark_chunking, benchmark_ranking, benchmark_dedup);
criterion_main!(benches);
