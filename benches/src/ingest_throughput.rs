mod common;

use std::sync::Arc;

use common::{bench_config, generate_feed};
use criterion::{BatchSize, BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use feedsync::prelude::*;
use tokio::runtime::Runtime as TokioRuntime;

fn processor(lines: Vec<String>, store: Arc<ConcurrentTargetStore>, batch_size: usize) -> StreamProcessor<SilentSkip> {
    let state: Arc<dyn CheckpointStore> = Arc::new(MemoryCheckpointStore::new());
    let breaker = Arc::new(CircuitBreaker::new(
        "bench",
        Arc::clone(&state),
        Arc::new(SystemClock),
        Arc::new(EventDispatcher::default()),
        Arc::new(MemoryNotifier::new()),
        CircuitBreakerConfig::default(),
    ));
    StreamProcessor::new(
        Arc::new(MemoryFeedSource::from_lines(lines)),
        store,
        state,
        breaker,
        SilentSkip,
    )
    .with_config(bench_config(batch_size))
}

/// Fresh import into an empty store at several feed sizes
fn bench_fresh_import(c: &mut Criterion) {
    let mut group = c.benchmark_group("fresh_import");
    let runtime = TokioRuntime::new().unwrap();

    for records in [1_000usize, 10_000] {
        group.throughput(Throughput::Elements(records as u64));
        group.bench_with_input(BenchmarkId::from_parameter(records), &records, |b, &records| {
            b.to_async(&runtime).iter_batched(
                || generate_feed(records, 10),
                |lines| async move {
                    let store = Arc::new(ConcurrentTargetStore::new());
                    black_box(processor(lines, store, 25).run(false).await);
                },
                BatchSize::LargeInput,
            );
        });
    }

    group.finish();
}

/// Re-import where every record hits the dedup cache
fn bench_reimport(c: &mut Criterion) {
    let mut group = c.benchmark_group("reimport");
    let runtime = TokioRuntime::new().unwrap();
    let records = 5_000usize;
    group.throughput(Throughput::Elements(records as u64));

    let lines = generate_feed(records, 0);
    let store = Arc::new(ConcurrentTargetStore::new());
    runtime.block_on(processor(lines.clone(), Arc::clone(&store), 25).run(false));

    group.bench_function("cache_hits", |b| {
        b.to_async(&runtime).iter_batched(
            || (lines.clone(), Arc::clone(&store)),
            |(lines, store)| async move {
                black_box(processor(lines, store, 25).run(false).await);
            },
            BatchSize::LargeInput,
        );
    });

    group.finish();
}

/// Batch size against write throughput
fn bench_batch_sizes(c: &mut Criterion) {
    let mut group = c.benchmark_group("batch_size");
    let runtime = TokioRuntime::new().unwrap();
    let records = 5_000usize;
    group.throughput(Throughput::Elements(records as u64));

    for batch_size in [1usize, 25, 250] {
        group.bench_with_input(BenchmarkId::from_parameter(batch_size), &batch_size, |b, &batch_size| {
            b.to_async(&runtime).iter_batched(
                || generate_feed(records, 0),
                |lines| async move {
                    let store = Arc::new(ConcurrentTargetStore::new());
                    black_box(processor(lines, store, batch_size).run(false).await);
                },
                BatchSize::LargeInput,
            );
        });
    }

    group.finish();
}

criterion_group!(benches, bench_fresh_import, bench_reimport, bench_batch_sizes);
criterion_main!(benches);
