use std::sync::Arc;
use std::time::Duration;

use bucketq::core::NoopMetrics;
use bucketq::persistence::entry_size;
use bucketq::{
    BucketConfig, BucketManager, BucketTypeParams, Error, MemoryPersistence, PersistenceManager,
    SequenceId, StorageType,
};

fn params(min_ms: u64, window_ms: u64, min_size: u64) -> BucketTypeParams {
    BucketTypeParams::new(
        Duration::from_millis(min_ms),
        Duration::from_millis(min_ms * 10),
        Duration::from_millis(window_ms),
        min_size,
    )
    .expect("params")
}

fn open_manager(persistence: Arc<dyn PersistenceManager>, config: BucketConfig) -> BucketManager {
    BucketManager::open("rollover", config, persistence, Arc::new(NoopMetrics)).expect("open manager")
}

fn id(time: u64) -> SequenceId {
    SequenceId::new(time, 0)
}

#[test]
fn three_minimum_periods_make_three_buckets() {
    let config = BucketConfig::uniform(params(3_000, 0, 1 << 20), u64::MAX).expect("config");
    let manager = open_manager(Arc::new(MemoryPersistence::new()), config);
    for t in [100, 3_101, 3_102, 6_200] {
        manager.insert(id(t), b"entry", id(t)).expect("insert");
    }

    assert_eq!(manager.num_buckets(), 3);
    let count = manager.count_after(None).expect("count");
    assert_eq!(count.entry_count, 4);
    assert_eq!(count.bucket_count, 3);

    let starts: Vec<u64> = manager
        .buckets()
        .iter()
        .map(|bucket| bucket.bucket_id().time())
        .collect();
    assert_eq!(starts, vec![0, 3_000, 6_000]);
}

#[test]
fn dedicated_storage_starts_with_the_next_bucket() {
    let threshold = entry_size(64) * 4;
    let config = BucketConfig::uniform(params(3_000, 0, 1 << 20), threshold).expect("config");
    let manager = open_manager(Arc::new(MemoryPersistence::new()), config);

    for i in 0..5 {
        manager.insert(id(100 + i), &[7u8; 64], id(100 + i)).expect("insert");
    }
    // The fifth entry pushed the store past the threshold, but its bucket keeps
    // the type it was created with.
    assert_eq!(manager.num_buckets(), 1);
    assert_eq!(manager.num_dedicated_buckets(), 0);

    manager.insert(id(3_100), &[7u8; 64], id(3_100)).expect("insert");
    assert_eq!(manager.num_buckets(), 2);
    assert_eq!(manager.num_dedicated_buckets(), 1);
    let buckets = manager.buckets();
    assert_eq!(buckets[0].storage_type(), StorageType::Shared);
    assert_eq!(buckets[1].storage_type(), StorageType::Dedicated);
}

#[test]
fn small_buckets_extend_into_the_enqueue_window() {
    let config = BucketConfig::uniform(params(3_000, 2_000, 1 << 20), u64::MAX).expect("config");
    let manager = open_manager(Arc::new(MemoryPersistence::new()), config);
    manager.insert(id(100), b"a", id(100)).expect("insert");
    manager.insert(id(4_500), b"b", id(4_500)).expect("extends first bucket");
    assert_eq!(manager.num_buckets(), 1);

    manager.insert(id(5_000), b"c", id(5_000)).expect("insert");
    assert_eq!(manager.num_buckets(), 2);
    let second = manager.buckets()[1].bucket_id();
    assert!(id(4_500) < second && second < id(5_000));
}

#[test]
fn full_buckets_do_not_extend() {
    let config = BucketConfig::uniform(params(3_000, 2_000, entry_size(8)), u64::MAX).expect("config");
    let manager = open_manager(Arc::new(MemoryPersistence::new()), config);
    manager.insert(id(100), &[0u8; 8], id(100)).expect("insert");
    manager.insert(id(3_500), b"b", id(3_500)).expect("insert");
    assert_eq!(manager.num_buckets(), 2);
}

#[test]
fn late_insert_behind_a_closed_bucket_is_rejected() {
    let config = BucketConfig::uniform(params(3_000, 0, 1 << 20), u64::MAX).expect("config");
    let manager = open_manager(Arc::new(MemoryPersistence::new()), config);
    manager.insert(id(100), b"a", id(100)).expect("insert");
    manager.insert(id(2_000), b"b", id(2_000)).expect("insert");
    manager.insert(id(6_500), b"c", id(6_500)).expect("insert");
    let closed = manager
        .close_finished_buckets(SequenceId::at_time(6_500))
        .expect("close finished");
    assert_eq!(closed, 1);

    let err = manager.insert(id(1_500), b"late", id(1_500)).unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));
    assert_eq!(manager.count_after(None).expect("count").entry_count, 3);
}
