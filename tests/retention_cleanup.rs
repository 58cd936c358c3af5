use std::sync::Arc;
use std::time::Duration;

use bucketq::core::NoopMetrics;
use bucketq::{
    BucketConfig, BucketTypeParams, Clock, ManualClock, MemoryPersistence, QueueStore,
    RetentionConfig, SequenceId, StoreConfig,
};

fn store_with_retention(clock: &Arc<ManualClock>, guaranteed: u64, lifetime: u64) -> Arc<QueueStore> {
    let _ = env_logger::builder().is_test(true).try_init();
    let params = BucketTypeParams::new(
        Duration::from_secs(5),
        Duration::from_secs(50),
        Duration::ZERO,
        1 << 20,
    )
    .expect("params");
    let config = StoreConfig {
        bucket: BucketConfig::uniform(params, u64::MAX).expect("bucket config"),
        retention: RetentionConfig::new(
            Duration::from_secs(guaranteed),
            Duration::from_secs(lifetime),
        )
        .expect("retention"),
        ..StoreConfig::default()
    };
    Arc::new(
        QueueStore::open_with(
            "events",
            config,
            Arc::new(MemoryPersistence::new()),
            Arc::clone(clock) as Arc<dyn Clock>,
            Arc::new(NoopMetrics),
        )
        .expect("open store"),
    )
}

#[test]
fn cleanup_keeps_guaranteed_retention_without_readers() {
    let clock = Arc::new(ManualClock::new(0));
    let store = store_with_retention(&clock, 30, 60);
    for second in 0..=62 {
        clock.set(second * 1_000);
        store.enqueue(b"tick", Duration::ZERO).expect("enqueue");
    }

    clock.set(62_000);
    let report = store.cleanup().expect("cleanup");
    assert_eq!(report.clean_level, Some(SequenceId::at_time(32_000)));
    assert_eq!(report.entries_deleted, 32);

    let mut cursor = bucketq::Cursor::new(Arc::clone(store.manager()));
    let first = cursor.next().expect("next").expect("entry");
    assert_eq!(first.id.time(), 32_000);
    let mut remaining = 1;
    while cursor.next().expect("next").is_some() {
        remaining += 1;
    }
    assert_eq!(remaining, 31);
    assert_eq!(store.manager().totals().entry_count, 31);
}

#[test]
fn committed_readers_release_entries_early() {
    let clock = Arc::new(ManualClock::new(0));
    let store = store_with_retention(&clock, 0, 3_600);
    let mut reader = store.reader("audit").expect("reader");
    for second in 0..10 {
        clock.set(second * 1_000);
        store.enqueue(b"tick", Duration::ZERO).expect("enqueue");
    }
    clock.set(20_000);

    for _ in 0..4 {
        reader.next().expect("next").expect("entry");
    }
    assert_eq!(store.cleanup().expect("cleanup").entries_deleted, 0);

    reader.commit().expect("commit");
    let report = store.cleanup().expect("cleanup");
    assert_eq!(report.entries_deleted, 4);
    assert_eq!(store.count_available().expect("count").entry_count, 6);

    let next = reader.next().expect("next").expect("entry");
    assert_eq!(next.id.time(), 4_000);
}

#[test]
fn cleanup_never_deletes_invisible_entries() {
    let clock = Arc::new(ManualClock::new(0));
    let store = store_with_retention(&clock, 0, 0);
    store.enqueue(b"now", Duration::ZERO).expect("enqueue");
    store
        .enqueue(b"delayed", Duration::from_secs(30))
        .expect("enqueue delayed");

    clock.set(10_000);
    let report = store.cleanup().expect("cleanup");
    assert_eq!(report.entries_deleted, 1);
    assert_eq!(store.manager().totals().entry_count, 1);

    clock.set(30_001);
    let mut reader = store.reader("late").expect("reader");
    let entry = reader.next().expect("next").expect("delayed entry");
    assert_eq!(entry.payload, b"delayed");
}
