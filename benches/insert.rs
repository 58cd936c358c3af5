use std::sync::Arc;
use std::time::Duration;

use criterion::{black_box, BatchSize, BenchmarkId, Criterion};
use criterion::{criterion_group, criterion_main};
use tempfile::tempdir;

use bucketq::{FilePersistence, MemoryPersistence, PersistenceManager, QueueStore, StoreConfig};

const ENQUEUES_PER_ITER: usize = 10_000;

fn bench_enqueue(c: &mut Criterion, name: &str, open: fn() -> (Option<tempfile::TempDir>, Arc<dyn PersistenceManager>)) {
    let mut group = c.benchmark_group(name);
    for &size in &[64_usize, 256, 1024] {
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter_batched(
                || {
                    let (dir, persistence) = open();
                    let store = QueueStore::open("bench", StoreConfig::default(), persistence)
                        .expect("store");
                    (dir, store, vec![0u8; size])
                },
                |(_dir, store, payload)| {
                    for _ in 0..ENQUEUES_PER_ITER {
                        store
                            .enqueue(black_box(&payload), Duration::ZERO)
                            .expect("enqueue");
                    }
                    store.close().expect("close");
                },
                BatchSize::LargeInput,
            );
        });
    }
    group.finish();
}

fn bench_memory(c: &mut Criterion) {
    bench_enqueue(c, "enqueue_memory", || {
        (None, Arc::new(MemoryPersistence::new()) as Arc<dyn PersistenceManager>)
    });
}

fn bench_file(c: &mut Criterion) {
    bench_enqueue(c, "enqueue_file", || {
        let dir = tempdir().expect("tempdir");
        let persistence = FilePersistence::open(dir.path()).expect("persistence");
        (Some(dir), Arc::new(persistence) as Arc<dyn PersistenceManager>)
    });
}

criterion_group!(benches, bench_memory, bench_file);
criterion_main!(benches);
