use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::runtime::Runtime;

use chrono::Utc;
use strata::{
    DistributedQueryEngine, Embedder, HashEmbedder, NoopMetrics, QueryConfig, Record, SearchFilter,
    Shard, ShardReader, ShardRouter, StorageTier,
};

/// Build shards preloaded with `per_shard` records each.
fn seeded_shards(shard_count: u32, per_shard: usize) -> Vec<Arc<Shard>> {
    let rt = Runtime::new().unwrap();
    let embedder = HashEmbedder::new(128);
    (0..shard_count)
        .map(|id| {
            let shard = Arc::new(Shard::new(id, Default::default()));
            for i in 0..per_shard {
                let content = format!("record {i} on shard {id} about topic {}", i % 50);
                let embedding = rt.block_on(embedder.embed(&content)).unwrap();
                let record = Record::new(
                    format!("s{id}-r{i}"),
                    format!("owner-{}", i % 10),
                    content,
                    embedding,
                    Utc::now(),
                    BTreeMap::new(),
                );
                shard.hot.insert(record).unwrap();
            }
            shard
        })
        .collect()
}

fn engine_over(shards: Vec<Arc<Shard>>) -> DistributedQueryEngine {
    let router = Arc::new(ShardRouter::new(shards.len() as u32));
    let readers: Vec<Arc<dyn ShardReader>> = shards
        .into_iter()
        .map(|s| s as Arc<dyn ShardReader>)
        .collect();
    DistributedQueryEngine::new(router, readers, QueryConfig::default(), Arc::new(NoopMetrics))
}

/// Benchmark: fan-out latency as shard count grows, corpus size fixed.
fn bench_fanout_by_shard_count(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let embedder = HashEmbedder::new(128);
    let query = rt.block_on(embedder.embed("record about topic 7")).unwrap();

    let mut group = c.benchmark_group("fanout_by_shard_count");
    for shard_count in [1u32, 2, 4, 8] {
        let per_shard = 4096 / shard_count as usize;
        let engine = engine_over(seeded_shards(shard_count, per_shard));
        group.bench_with_input(
            BenchmarkId::from_parameter(shard_count),
            &shard_count,
            |b, _| {
                b.to_async(Runtime::new().unwrap()).iter(|| async {
                    black_box(
                        engine
                            .search(&query, 10, &SearchFilter::default())
                            .await
                            .unwrap(),
                    )
                })
            },
        );
    }
    group.finish();
}

/// Benchmark: single-shard search throughput by corpus size.
fn bench_single_shard_scan(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let embedder = HashEmbedder::new(128);
    let query = rt.block_on(embedder.embed("record about topic 7")).unwrap();

    let mut group = c.benchmark_group("single_shard_scan");
    for size in [1_000usize, 10_000] {
        group.throughput(Throughput::Elements(size as u64));
        let engine = engine_over(seeded_shards(1, size));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.to_async(Runtime::new().unwrap()).iter(|| async {
                black_box(
                    engine
                        .search(&query, 10, &SearchFilter::default())
                        .await
                        .unwrap(),
                )
            })
        });
    }
    group.finish();
}

/// Benchmark: owner-pinned query (one shard touched regardless of count).
fn bench_owner_pinned_query(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let embedder = HashEmbedder::new(128);
    let query = rt.block_on(embedder.embed("record about topic 7")).unwrap();
    let engine = engine_over(seeded_shards(8, 512));
    let filter = SearchFilter {
        owner_key: Some("owner-3".to_string()),
        ..Default::default()
    };

    c.bench_function("owner_pinned_query", |b| {
        b.to_async(Runtime::new().unwrap()).iter(|| async {
            black_box(engine.search(&query, 10, &filter).await.unwrap())
        })
    });
}

criterion_group!(
    benches,
    bench_fanout_by_shard_count,
    bench_single_shard_scan,
    bench_owner_pinned_query
);
criterion_main!(benches);
