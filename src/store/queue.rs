//! One durable queue: producers, named readers and cleanup around a
//! [`BucketManager`].

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::bucket::{BucketManager, Cursor, Position, StoredCount};
use crate::config::StoreConfig;
use crate::core::{
    Clock, Error, MetricsSink, NoopMetrics, PeriodicScheduler, Result, SequenceId, StoreClock,
    SystemClock, TaskContext, TaskId,
};
use crate::persistence::{PersistenceManager, ReaderLevel, StoredEntry};
use crate::store::retention::{clean_level, CleanupReport};
use crate::store::LastAvailableTracker;

/// How long `close` waits for a running cleanup pass.
const CLEANUP_STOP_TIMEOUT: Duration = Duration::from_secs(5);
/// Longest a waiting reader sleeps before checking again.
const MAX_WAIT_SLICE: Duration = Duration::from_millis(100);

struct CleanupTask {
    scheduler: Arc<dyn PeriodicScheduler>,
    task: TaskId,
}

pub struct QueueStore {
    store_id: Arc<str>,
    config: StoreConfig,
    clock: Arc<StoreClock>,
    persistence: Arc<dyn PersistenceManager>,
    manager: Arc<BucketManager>,
    tracker: LastAvailableTracker,
    /// Committed level of every registered reader.
    readers: Mutex<BTreeMap<String, SequenceId>>,
    cleanup_task: Mutex<Option<CleanupTask>>,
    closed: AtomicBool,
}

impl QueueStore {
    /// Opens `store_id` on the system clock without metrics.
    pub fn open(
        store_id: &str,
        config: StoreConfig,
        persistence: Arc<dyn PersistenceManager>,
    ) -> Result<Self> {
        Self::open_with(
            store_id,
            config,
            persistence,
            Arc::new(SystemClock),
            Arc::new(NoopMetrics),
        )
    }

    /// Opens `store_id`, restoring its buckets and committed reader levels.
    pub fn open_with(
        store_id: &str,
        config: StoreConfig,
        persistence: Arc<dyn PersistenceManager>,
        clock: Arc<dyn Clock>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Result<Self> {
        config.validate()?;
        let manager = Arc::new(BucketManager::open(
            store_id,
            config.bucket,
            Arc::clone(&persistence),
            metrics,
        )?);
        let clock = Arc::new(StoreClock::with_offset(clock, config.clock_offset_ms));
        let tracker = LastAvailableTracker::new(Arc::clone(&manager), Arc::clone(&clock))?;
        let readers: BTreeMap<String, SequenceId> = persistence
            .reader_levels(store_id)?
            .into_iter()
            .map(|reader| (reader.name, reader.level))
            .collect();
        log::info!(
            "opened store {store_id}: {} buckets, {} readers",
            manager.num_buckets(),
            readers.len()
        );
        Ok(Self {
            store_id: Arc::from(store_id),
            config,
            clock,
            persistence,
            manager,
            tracker,
            readers: Mutex::new(readers),
            cleanup_task: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    pub fn store_id(&self) -> &str {
        &self.store_id
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn manager(&self) -> &Arc<BucketManager> {
        &self.manager
    }

    pub fn tracker(&self) -> &LastAvailableTracker {
        &self.tracker
    }

    /// Current store time in milliseconds.
    pub fn now(&self) -> u64 {
        self.clock.now()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        Ok(())
    }

    /// Enqueues `payload` to become visible `delay` from now.
    pub fn enqueue(&self, payload: &[u8], delay: Duration) -> Result<SequenceId> {
        let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.enqueue_at(payload, self.clock.now().saturating_add(delay_ms))
    }

    /// Enqueues `payload` to become visible at store time `available_at_ms`.
    /// Times in the past mean "now".
    pub fn enqueue_at(&self, payload: &[u8], available_at_ms: u64) -> Result<SequenceId> {
        self.ensure_open()?;
        if !self.persistence.is_healthy() {
            return Err(Error::persistence(format!(
                "persistence of {} is unhealthy",
                self.store_id
            )));
        }
        let id = self.tracker.request_ack_id(available_at_ms);
        let stored = self
            .manager
            .insert(id, payload, self.tracker.min_enqueue_level());
        self.tracker.enqueue_finished(id);
        stored.map(|()| id)
    }

    /// Opens the named reader, registering it on first use. A registered
    /// reader holds back cleanup until it commits, up to `max_lifetime`.
    pub fn reader(self: &Arc<Self>, name: &str) -> Result<StoreReader> {
        self.ensure_open()?;
        let (level, registered) = {
            let mut readers = self.readers.lock();
            match readers.get(name) {
                Some(level) => (*level, false),
                None => {
                    readers.insert(name.to_string(), SequenceId::MINIMUM);
                    (SequenceId::MINIMUM, true)
                }
            }
        };
        if registered {
            self.persist_readers()?;
            log::info!("registered reader {name} on {}", self.store_id);
        }
        let mut cursor = Cursor::new(Arc::clone(&self.manager));
        if level > SequenceId::MINIMUM {
            cursor.advance_to(level)?;
        }
        Ok(StoreReader {
            store: Arc::clone(self),
            name: name.to_string(),
            cursor,
        })
    }

    /// Forgets a reader so it no longer holds back cleanup.
    pub fn remove_reader(&self, name: &str) -> Result<bool> {
        self.ensure_open()?;
        if self.readers.lock().remove(name).is_none() {
            return Ok(false);
        }
        self.persist_readers()?;
        log::info!("removed reader {name} from {}", self.store_id);
        Ok(true)
    }

    /// Committed level of every registered reader.
    pub fn reader_levels(&self) -> Vec<ReaderLevel> {
        self.readers
            .lock()
            .iter()
            .map(|(name, level)| ReaderLevel::new(name.clone(), *level))
            .collect()
    }

    fn commit_reader(&self, name: &str, level: SequenceId) -> Result<()> {
        self.ensure_open()?;
        {
            let mut readers = self.readers.lock();
            let committed = readers
                .entry(name.to_string())
                .or_insert(SequenceId::MINIMUM);
            if level <= *committed {
                return Ok(());
            }
            *committed = level;
        }
        self.persist_readers()
    }

    fn persist_readers(&self) -> Result<()> {
        let levels = self.reader_levels();
        self.persistence
            .persist_reader_levels(&self.store_id, &levels)
    }

    /// Visible entries still stored.
    pub fn count_available(&self) -> Result<StoredCount> {
        self.ensure_open()?;
        if self.tracker.update_available()?.is_none() {
            return Ok(StoredCount::ZERO);
        }
        let visible = self.tracker.position();
        self.manager.count_between(None, Some(&visible))
    }

    /// Runs one cleanup pass at the current store time.
    pub fn cleanup(&self) -> Result<CleanupReport> {
        self.cleanup_at(self.clock.now())
    }

    /// Runs one cleanup pass as if store time were `now_ms`: deletes what
    /// retention allows, closes finished buckets and idle stores, and
    /// persists changed bucket metadata.
    pub fn cleanup_at(&self, now_ms: u64) -> Result<CleanupReport> {
        self.ensure_open()?;
        let last_available = self.tracker.update_available()?;
        let committed: Vec<SequenceId> = self.readers.lock().values().copied().collect();
        let level = clean_level(now_ms, committed.iter().copied(), &self.config.retention);
        let min_enqueue_level = self.tracker.min_enqueue_level();

        let mut report = CleanupReport {
            last_available,
            clean_level: last_available.map(|available| level.min(available)),
            ..CleanupReport::default()
        };
        report.entries_deleted = self
            .manager
            .delete_up_to(level, last_available, min_enqueue_level)?;
        if let Some(capped) = report.clean_level {
            report.entries_deleted += self.manager.delete_unneeded_buckets(
                capped,
                &committed,
                last_available,
                min_enqueue_level,
            )?;
        }
        report.buckets_recounted = self.manager.recount_inaccurate_buckets()?;
        report.buckets_closed = self.manager.close_finished_buckets(min_enqueue_level)?;
        if let Some(available) = last_available {
            let slowest = committed.iter().copied().min().unwrap_or(available);
            report.stores_closed = self
                .manager
                .close_unused_bucket_stores(slowest.min(available))?;
        }
        report.metadata_synced = self.manager.sync_metadata()?;

        if report.entries_deleted > 0 || report.buckets_closed > 0 {
            log::info!(
                "cleanup of {}: deleted {} entries, closed {} buckets",
                self.store_id,
                report.entries_deleted,
                report.buckets_closed
            );
        }
        Ok(report)
    }

    /// Runs [`QueueStore::cleanup`] every `cleanup_interval` on `scheduler`.
    /// The task holds the store weakly and stops doing work once it is gone.
    pub fn start_cleanup(self: &Arc<Self>, scheduler: Arc<dyn PeriodicScheduler>) -> Result<TaskId> {
        self.ensure_open()?;
        self.stop_cleanup();
        let store: Weak<QueueStore> = Arc::downgrade(self);
        let task = scheduler.execute_periodically(
            &format!("cleanup-{}", self.store_id),
            Box::new(move |ctx: &TaskContext| run_cleanup(&store, ctx)),
            self.config.cleanup_interval,
            false,
        )?;
        *self.cleanup_task.lock() = Some(CleanupTask {
            scheduler,
            task,
        });
        Ok(task)
    }

    /// Cancels background cleanup, waiting briefly for a running pass.
    /// Returns false if none was scheduled.
    pub fn stop_cleanup(&self) -> bool {
        self.cancel_cleanup(Some(CLEANUP_STOP_TIMEOUT))
    }

    fn cancel_cleanup(&self, wait: Option<Duration>) -> bool {
        let Some(cleanup) = self.cleanup_task.lock().take() else {
            return false;
        };
        if !cleanup.scheduler.cancel(cleanup.task, true, wait) {
            log::warn!("cleanup of {} still running after cancel", self.store_id);
        }
        true
    }

    /// Stops cleanup and closes every bucket store. Idempotent.
    pub fn close(&self) -> Result<()> {
        self.close_inner(Some(CLEANUP_STOP_TIMEOUT))
    }

    fn close_inner(&self, wait: Option<Duration>) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.cancel_cleanup(wait);
        self.manager.close()?;
        log::info!("closed store {}", self.store_id);
        Ok(())
    }
}

fn run_cleanup(store: &Weak<QueueStore>, ctx: &TaskContext) {
    if ctx.is_interrupted() {
        return;
    }
    let Some(store) = store.upgrade() else {
        return;
    };
    match store.cleanup() {
        Ok(report) => log::debug!("cleanup of {}: {report:?}", store.store_id),
        Err(Error::Closed) => {}
        Err(err) => log::warn!("cleanup of {} failed: {err}", store.store_id),
    }
}

impl Drop for QueueStore {
    fn drop(&mut self) {
        // May run on the scheduler thread when a cleanup pass held the last
        // reference, so do not wait for the pass to finish.
        if let Err(err) = self.close_inner(None) {
            log::warn!("closing store {} on drop failed: {err}", self.store_id);
        }
    }
}

impl std::fmt::Debug for QueueStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueStore")
            .field("store_id", &self.store_id)
            .field("manager", &self.manager)
            .field("tracker", &self.tracker)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// A named reader of a [`QueueStore`].
///
/// Reads only return visible entries. Progress survives restarts through
/// [`StoreReader::commit`]; uncommitted reads are returned again after reopen.
pub struct StoreReader {
    store: Arc<QueueStore>,
    name: String,
    cursor: Cursor,
}

impl StoreReader {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn position(&self) -> Position {
        self.cursor.position()
    }

    /// Id of the last entry returned.
    pub fn last_read(&self) -> Option<SequenceId> {
        self.cursor.last_returned()
    }

    pub fn next(&mut self) -> Result<Option<StoredEntry>> {
        self.store.ensure_open()?;
        let Some(limit) = self.store.tracker.update_available()? else {
            return Ok(None);
        };
        self.cursor.next_up_to(limit)
    }

    /// Waits up to `timeout` for the next visible entry.
    pub fn wait_next(&mut self, timeout: Duration) -> Result<Option<StoredEntry>> {
        let deadline = Instant::now() + timeout;
        loop {
            let seen = self.store.manager.insert_sequence();
            if let Some(entry) = self.next()? {
                return Ok(Some(entry));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            let position = self.cursor.position();
            match self.store.tracker.time_of_next_message(Some(&position))? {
                Some(due) => {
                    let until_due = due.saturating_sub(self.store.clock.now()).saturating_add(1);
                    let pause = Duration::from_millis(until_due).min(remaining).min(MAX_WAIT_SLICE);
                    std::thread::sleep(pause);
                }
                None => {
                    self.store
                        .manager
                        .wait_for_insert(seen, remaining.min(MAX_WAIT_SLICE));
                }
            }
        }
    }

    /// Persists the last returned entry as this reader's level.
    pub fn commit(&mut self) -> Result<()> {
        let Some(level) = self.cursor.last_returned() else {
            return Ok(());
        };
        self.store.commit_reader(&self.name, level)
    }

    /// Visible entries not yet read.
    pub fn count_pending(&self) -> Result<StoredCount> {
        self.store.ensure_open()?;
        if self.store.tracker.update_available()?.is_none() {
            return Ok(StoredCount::ZERO);
        }
        let visible = self.store.tracker.position();
        let position = self.cursor.position();
        self.store
            .manager
            .count_between(Some(&position), Some(&visible))
    }
}

impl std::fmt::Debug for StoreReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreReader")
            .field("store_id", &self.store.store_id)
            .field("name", &self.name)
            .field("position", &self.cursor.position())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucket::{BucketConfig, BucketTypeParams};
    use crate::core::{ManualClock, ThreadScheduler};
    use crate::persistence::MemoryPersistence;
    use crate::store::RetentionConfig;

    fn config() -> StoreConfig {
        let params = BucketTypeParams::new(
            Duration::from_secs(3),
            Duration::from_secs(30),
            Duration::ZERO,
            1 << 20,
        )
        .expect("params");
        StoreConfig {
            bucket: BucketConfig::uniform(params, u64::MAX).expect("config"),
            retention: RetentionConfig::new(Duration::from_secs(30), Duration::from_secs(60))
                .expect("retention"),
            cleanup_interval: Duration::from_millis(10),
            ..StoreConfig::default()
        }
    }

    fn open(
        persistence: &Arc<MemoryPersistence>,
        clock: &Arc<ManualClock>,
    ) -> Arc<QueueStore> {
        Arc::new(
            QueueStore::open_with(
                "queue",
                config(),
                Arc::clone(persistence) as Arc<dyn PersistenceManager>,
                Arc::clone(clock) as Arc<dyn Clock>,
                Arc::new(NoopMetrics),
            )
            .expect("open"),
        )
    }

    #[test]
    fn reader_sees_entries_once_visible() {
        let persistence = Arc::new(MemoryPersistence::new());
        let clock = Arc::new(ManualClock::new(1_000));
        let store = open(&persistence, &clock);
        let mut reader = store.reader("r").expect("reader");

        store.enqueue(b"now", Duration::ZERO).expect("enqueue");
        store
            .enqueue(b"later", Duration::from_secs(2))
            .expect("enqueue");
        assert!(reader.next().expect("next").is_none());

        clock.set(1_001);
        let entry = reader.next().expect("next").expect("visible");
        assert_eq!(entry.payload, b"now");
        assert!(reader.next().expect("next").is_none());
        assert_eq!(reader.count_pending().expect("pending").entry_count, 0);

        clock.set(3_001);
        assert_eq!(reader.count_pending().expect("pending").entry_count, 1);
        let entry = reader.next().expect("next").expect("visible");
        assert_eq!(entry.payload, b"later");
        assert_eq!(store.count_available().expect("count").entry_count, 2);
    }

    #[test]
    fn delayed_entry_does_not_hide_later_immediate_ones() {
        let persistence = Arc::new(MemoryPersistence::new());
        let clock = Arc::new(ManualClock::new(1_000));
        let store = open(&persistence, &clock);
        let mut reader = store.reader("r").expect("reader");

        let delayed = store
            .enqueue(b"delayed", Duration::from_secs(600))
            .expect("enqueue");
        let now = store.enqueue(b"now", Duration::ZERO).expect("enqueue");
        assert_eq!(delayed, SequenceId::new(601_000, 0));
        assert_eq!(now, SequenceId::new(1_000, 0));

        clock.set(2_000);
        let entry = reader.next().expect("next").expect("immediate entry visible");
        assert_eq!(entry.payload, b"now");
        assert!(reader.next().expect("next").is_none());

        clock.set(601_001);
        let entry = reader.next().expect("next").expect("delayed entry visible");
        assert_eq!(entry.payload, b"delayed");
    }

    #[test]
    fn committed_level_survives_reopen() {
        let persistence = Arc::new(MemoryPersistence::new());
        let clock = Arc::new(ManualClock::new(1_000));
        {
            let store = open(&persistence, &clock);
            let mut reader = store.reader("r").expect("reader");
            for payload in [b"a", b"b", b"c"] {
                store.enqueue(payload, Duration::ZERO).expect("enqueue");
            }
            clock.set(2_000);
            reader.next().expect("next").expect("a");
            reader.next().expect("next").expect("b");
            reader.commit().expect("commit");
            reader.next().expect("next").expect("c");
            store.close().expect("close");
        }

        let store = open(&persistence, &clock);
        let mut reader = store.reader("r").expect("reader");
        let entry = reader.next().expect("next").expect("entry");
        assert_eq!(entry.payload, b"c");
    }

    #[test]
    fn reader_holds_back_cleanup_until_max_lifetime() {
        let persistence = Arc::new(MemoryPersistence::new());
        let clock = Arc::new(ManualClock::new(0));
        let store = open(&persistence, &clock);
        let _reader = store.reader("slow").expect("reader");
        for t in (0..=40_000).step_by(1_000) {
            clock.set(t);
            store.enqueue(b"x", Duration::ZERO).expect("enqueue");
        }

        clock.set(40_001);
        let report = store.cleanup().expect("cleanup");
        assert_eq!(report.entries_deleted, 0);

        clock.set(62_000);
        let report = store.cleanup().expect("cleanup");
        assert_eq!(report.clean_level, Some(SequenceId::at_time(2_000)));
        assert_eq!(report.entries_deleted, 2);

        assert!(store.remove_reader("slow").expect("remove"));
        let report = store.cleanup().expect("cleanup");
        assert_eq!(report.clean_level, Some(SequenceId::at_time(32_000)));
        assert_eq!(report.entries_deleted, 30);
    }

    #[test]
    fn closed_store_rejects_operations() {
        let persistence = Arc::new(MemoryPersistence::new());
        let clock = Arc::new(ManualClock::new(1_000));
        let store = open(&persistence, &clock);
        store.close().expect("close");
        store.close().expect("second close");
        assert!(matches!(
            store.enqueue(b"x", Duration::ZERO),
            Err(Error::Closed)
        ));
        assert!(matches!(store.reader("r"), Err(Error::Closed)));
    }

    #[test]
    fn unhealthy_persistence_rejects_enqueue() {
        let persistence = Arc::new(MemoryPersistence::new());
        let clock = Arc::new(ManualClock::new(1_000));
        let store = open(&persistence, &clock);
        persistence.set_healthy(false);
        let err = store.enqueue(b"x", Duration::ZERO).unwrap_err();
        assert!(err.is_persistence());
        assert_eq!(store.tracker().in_flight(), 0);
    }

    #[test]
    fn scheduled_cleanup_runs_and_stops() {
        let persistence = Arc::new(MemoryPersistence::new());
        let clock = Arc::new(ManualClock::new(0));
        let store = open(&persistence, &clock);
        store.enqueue(b"old", Duration::ZERO).expect("enqueue");
        clock.set(70_000);

        let scheduler = Arc::new(ThreadScheduler::new("cleanup-test").expect("scheduler"));
        store
            .start_cleanup(Arc::clone(&scheduler) as Arc<dyn PeriodicScheduler>)
            .expect("start");
        let deadline = Instant::now() + Duration::from_secs(5);
        while store.manager().totals().entry_count > 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(store.manager().totals().entry_count, 0);
        assert!(store.stop_cleanup());
        assert!(!store.stop_cleanup());
        assert_eq!(scheduler.task_count(), 0);
    }
}
