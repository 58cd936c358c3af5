use std::collections::HashSet;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bucketq::core::NoopMetrics;
use bucketq::{
    BucketConfig, BucketTypeParams, Clock, ManualClock, MemoryPersistence, QueueStore, StoreConfig,
};

const PRODUCERS: u32 = 4;
const PER_PRODUCER: u32 = 250;

#[test]
fn concurrent_producers_are_read_exactly_once_in_order() {
    let params = BucketTypeParams::new(
        Duration::from_millis(100),
        Duration::from_secs(1),
        Duration::from_millis(50),
        1 << 20,
    )
    .expect("params");
    let clock = Arc::new(ManualClock::new(0));
    let store = Arc::new(
        QueueStore::open_with(
            "fan-in",
            StoreConfig {
                bucket: BucketConfig::uniform(params, 4 * 1024).expect("bucket config"),
                ..StoreConfig::default()
            },
            Arc::new(MemoryPersistence::new()),
            Arc::clone(&clock) as Arc<dyn Clock>,
            Arc::new(NoopMetrics),
        )
        .expect("open store"),
    );
    let mut reader = store.reader("consumer").expect("reader");

    let producers: Vec<_> = (0..PRODUCERS)
        .map(|producer| {
            let store = Arc::clone(&store);
            let clock = Arc::clone(&clock);
            thread::spawn(move || {
                for seq in 0..PER_PRODUCER {
                    let payload = (producer * PER_PRODUCER + seq).to_be_bytes();
                    store.enqueue(&payload, Duration::ZERO).expect("enqueue");
                    if seq % 3 == 0 {
                        clock.advance(1);
                    }
                }
            })
        })
        .collect();

    let total = (PRODUCERS * PER_PRODUCER) as usize;
    let mut ids = Vec::with_capacity(total);
    let mut payloads = HashSet::with_capacity(total);
    let deadline = Instant::now() + Duration::from_secs(30);
    let mut producers_done = false;
    let mut producers = Some(producers);
    while ids.len() < total && Instant::now() < deadline {
        match reader.next().expect("next") {
            Some(entry) => {
                ids.push(entry.id);
                let value = u32::from_be_bytes(entry.payload[..].try_into().expect("u32"));
                assert!(payloads.insert(value), "payload {value} delivered twice");
            }
            None if producers_done => clock.advance(1),
            None => {
                if producers
                    .as_ref()
                    .is_some_and(|handles| handles.iter().all(|handle| handle.is_finished()))
                {
                    for handle in producers.take().into_iter().flatten() {
                        handle.join().expect("producer");
                    }
                    producers_done = true;
                }
                thread::yield_now();
            }
        }
    }

    assert_eq!(ids.len(), total);
    assert!(ids.windows(2).all(|pair| pair[0] < pair[1]));
    assert!(store.manager().num_buckets() > 1);
    assert_eq!(store.manager().count_after(None).expect("count").entry_count, total as u64);
}
