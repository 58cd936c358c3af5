//! The ordered bucket table of one queue.
//!
//! Locking:
//! - `buckets` (table lock): readers for routing, iteration and inserts into
//!   existing buckets; the writer for creating or removing a bucket. Inserts
//!   hold the read side for the whole store write, so removal waits for them.
//! - per-bucket locks inside [`Bucket`]; never held while taking the table lock.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::bucket::{
    Bucket, BucketConfig, BucketCount, BucketIterator, BucketState, Position, StorageType,
    StoredCount,
};
use crate::core::metrics::{self, report, MetricsSink};
use crate::core::{Error, Result, SequenceId};
use crate::persistence::PersistenceManager;

static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

type BucketTable = BTreeMap<SequenceId, Arc<Bucket>>;

#[derive(Debug, Default)]
struct Totals {
    entries: AtomicU64,
    bytes: AtomicU64,
}

impl Totals {
    fn add(&self, entries: u64, bytes: u64) {
        self.entries.fetch_add(entries, Ordering::AcqRel);
        self.bytes.fetch_add(bytes, Ordering::AcqRel);
    }

    fn sub(&self, entries: u64, bytes: u64) {
        let _ = self
            .entries
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some(n.saturating_sub(entries)));
        let _ = self
            .bytes
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some(n.saturating_sub(bytes)));
    }
}

pub struct BucketManager {
    store_id: Arc<str>,
    generation: u64,
    config: BucketConfig,
    persistence: Arc<dyn PersistenceManager>,
    metrics: Arc<dyn MetricsSink>,
    buckets: RwLock<BucketTable>,
    totals: Totals,
    /// Bytes ever inserted into shared buckets; deletions do not lower it.
    shared_bytes: AtomicU64,
    /// Latched once a dedicated bucket exists; new buckets stay dedicated.
    dedicated: AtomicBool,
    pending_deletes: Mutex<Vec<SequenceId>>,
    inserts: Mutex<u64>,
    inserted: Condvar,
    closed: AtomicBool,
}

impl BucketManager {
    /// Opens the bucket table of `store_id`, restoring it from persisted
    /// metadata. Buckets flagged deleted have their deletion finished.
    pub fn open(
        store_id: &str,
        config: BucketConfig,
        persistence: Arc<dyn PersistenceManager>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Result<Self> {
        config.validate()?;
        let manager = Self {
            store_id: Arc::from(store_id),
            generation: NEXT_GENERATION.fetch_add(1, Ordering::Relaxed),
            config,
            persistence,
            metrics,
            buckets: RwLock::new(BTreeMap::new()),
            totals: Totals::default(),
            shared_bytes: AtomicU64::new(0),
            dedicated: AtomicBool::new(false),
            pending_deletes: Mutex::new(Vec::new()),
            inserts: Mutex::new(0),
            inserted: Condvar::new(),
            closed: AtomicBool::new(false),
        };
        manager.restore()?;
        Ok(manager)
    }

    fn restore(&self) -> Result<()> {
        let mut table = self.buckets.write();
        for meta in self.persistence.bucket_metadata_for_store(&self.store_id)? {
            if meta.deleted {
                log::info!(
                    "finishing interrupted deletion of bucket {} in {}",
                    meta.bucket_id,
                    self.store_id
                );
                self.persistence
                    .delete_bucket_store(&self.store_id, meta.bucket_id)?;
                continue;
            }
            let Some(store) = self
                .persistence
                .get_bucket_store(&self.store_id, meta.bucket_id)?
            else {
                log::warn!(
                    "bucket {} of {} has metadata but no store; dropping it",
                    meta.bucket_id,
                    self.store_id
                );
                self.persistence
                    .delete_bucket_store(&self.store_id, meta.bucket_id)?;
                continue;
            };
            let first = store.first_id()?;
            let last = store.last_id()?;
            drop(store);
            self.persistence
                .close_bucket_store(&self.store_id, meta.bucket_id)?;

            self.totals.add(meta.entry_count, meta.byte_count);
            match meta.storage_type {
                StorageType::Shared => {
                    self.shared_bytes.fetch_add(meta.byte_count, Ordering::AcqRel);
                }
                StorageType::Dedicated => self.dedicated.store(true, Ordering::Release),
            }
            table.insert(
                meta.bucket_id,
                Arc::new(Bucket::restored(
                    Arc::clone(&self.store_id),
                    Arc::clone(&self.persistence),
                    &meta,
                    first,
                    last,
                )),
            );
        }
        if !table.is_empty() {
            log::info!("restored {} buckets of {}", table.len(), self.store_id);
        }
        Ok(())
    }

    pub fn store_id(&self) -> &str {
        &self.store_id
    }

    /// Identifies this instance; positions from other instances are rejected.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn config(&self) -> &BucketConfig {
        &self.config
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

    /// Stores `payload` under `id`, creating a bucket when none can take it.
    ///
    /// Either the entry is stored and counted, or nothing is recorded.
    ///
    /// # Errors
    ///
    /// - `Error::InvalidArgument`: `id` is not a real id, or it falls behind a
    ///   closed bucket or inside an open bucket's minimum period.
    /// - `Error::Closed`: the manager has been closed.
    /// - persistence errors from the store write or bucket creation.
    pub fn insert(&self, id: SequenceId, payload: &[u8], min_enqueue_level: SequenceId) -> Result<()> {
        if !id.is_exact() {
            return Err(Error::invalid(format!("cannot insert range bound {id}")));
        }
        let id = id.without_position();
        let result = self.insert_routed(id, payload, min_enqueue_level);
        match &result {
            Ok((size, storage_type)) => {
                self.totals.add(1, *size);
                if *storage_type == StorageType::Shared {
                    self.shared_bytes.fetch_add(*size, Ordering::AcqRel);
                }
                report(&*self.metrics, |m| {
                    m.increment(metrics::ENTRIES_INSERTED, 1);
                    m.increment(metrics::BYTES_INSERTED, *size);
                });
                let mut inserts = self.inserts.lock();
                *inserts += 1;
                drop(inserts);
                self.inserted.notify_all();
            }
            Err(err) => {
                log::debug!("insert of {id} into {} failed: {err}", self.store_id);
                report(&*self.metrics, |m| m.increment(metrics::INSERT_FAILURES, 1));
            }
        }
        result.map(|_| ())
    }

    /// Stored size of the entry and the storage type of the bucket taking it.
    fn insert_routed(
        &self,
        id: SequenceId,
        payload: &[u8],
        min_enqueue_level: SequenceId,
    ) -> Result<(u64, StorageType)> {
        {
            let table = self.buckets.read();
            self.ensure_open()?;
            if let Some(bucket) = self.route(&table, id, min_enqueue_level) {
                let bucket = Arc::clone(bucket);
                return bucket
                    .insert(id, payload)
                    .map(|size| (size, bucket.storage_type()));
            }
        }

        let mut table = self.buckets.write();
        self.ensure_open()?;
        let bucket = match self.route(&table, id, min_enqueue_level) {
            Some(bucket) => Arc::clone(bucket),
            None => self.create_bucket(&mut table, id)?,
        };
        let fresh = bucket.count().entries == 0 && bucket.last_id().is_none();
        let table = RwLockWriteGuard::downgrade(table);
        let result = bucket.insert(id, payload);
        drop(table);
        if result.is_err() && fresh {
            self.roll_back_creation(&bucket);
        }
        result.map(|size| (size, bucket.storage_type()))
    }

    /// The only bucket that may take `id`: the one starting at or before it.
    fn route<'a>(
        &self,
        table: &'a BucketTable,
        id: SequenceId,
        min_enqueue_level: SequenceId,
    ) -> Option<&'a Arc<Bucket>> {
        let (_, bucket) = table.range(..=id).next_back()?;
        self.config
            .could_bucket_contain_key(&bucket.snapshot(), id, min_enqueue_level)
            .then_some(bucket)
    }

    fn create_bucket(&self, table: &mut BucketTable, id: SequenceId) -> Result<Arc<Bucket>> {
        let previous = table.range(..=id).next_back().map(|(_, bucket)| bucket.snapshot());
        let supported = self.persistence.supported_new_bucket_types();
        let storage_type =
            if self.dedicated.load(Ordering::Acquire) && supported.contains(&StorageType::Dedicated) {
                StorageType::Dedicated
            } else {
                self.config
                    .storage_type_for(self.shared_bytes.load(Ordering::Acquire), &supported)
            };
        let bucket_id = self.config.new_bucket_id(previous.as_ref(), id, storage_type)?;
        if table.contains_key(&bucket_id) {
            return Err(Error::invalid(format!("bucket {bucket_id} already exists")));
        }

        let store = self
            .persistence
            .create_bucket_store(&self.store_id, bucket_id, storage_type)?;
        let bucket = Arc::new(Bucket::created(
            Arc::clone(&self.store_id),
            Arc::clone(&self.persistence),
            id,
            store,
        ));
        if let Err(err) = self
            .persistence
            .update_bucket_metadata(&self.store_id, &bucket.metadata())
        {
            bucket.release_store();
            if let Err(cleanup) = self.persistence.delete_bucket_store(&self.store_id, bucket_id) {
                log::warn!("could not remove store of unrecorded bucket {bucket_id}: {cleanup}");
            }
            return Err(err);
        }
        table.insert(bucket_id, Arc::clone(&bucket));
        if storage_type == StorageType::Dedicated {
            self.dedicated.store(true, Ordering::Release);
        }
        log::debug!(
            "created {:?} bucket {bucket_id} in {} for {id}",
            bucket.storage_type(),
            self.store_id
        );
        report(&*self.metrics, |m| {
            m.increment(metrics::BUCKETS_CREATED, 1);
            m.level(metrics::LIVE_BUCKETS, table.len() as u64);
        });
        Ok(bucket)
    }

    fn roll_back_creation(&self, bucket: &Arc<Bucket>) {
        let mut table = self.buckets.write();
        if bucket.count().entries != 0 || bucket.last_id().is_some() || bucket.leases() != 0 {
            return;
        }
        let bucket_id = bucket.bucket_id();
        if table.remove(&bucket_id).is_none() {
            return;
        }
        bucket.mark_deleted();
        bucket.release_store();
        drop(table);
        if let Err(err) = self.persistence.delete_bucket_store(&self.store_id, bucket_id) {
            log::warn!("rollback of bucket {bucket_id} in {} deferred: {err}", self.store_id);
            self.pending_deletes.lock().push(bucket_id);
        } else {
            log::debug!("rolled back empty bucket {bucket_id} in {}", self.store_id);
        }
    }

    fn table(&self) -> RwLockReadGuard<'_, BucketTable> {
        self.buckets.read()
    }

    /// Buckets in id order.
    pub fn buckets(&self) -> Vec<Arc<Bucket>> {
        self.table().values().cloned().collect()
    }

    /// Bucket starting exactly at `bucket_id`.
    pub fn bucket(&self, bucket_id: SequenceId) -> Option<Arc<Bucket>> {
        self.table().get(&bucket_id).cloned()
    }

    /// Bucket whose window holds `id`, if any.
    pub fn bucket_for(&self, id: SequenceId) -> Option<Arc<Bucket>> {
        self.table()
            .range(..=id)
            .next_back()
            .map(|(_, bucket)| Arc::clone(bucket))
    }

    pub fn num_buckets(&self) -> usize {
        self.table().len()
    }

    pub fn num_dedicated_buckets(&self) -> usize {
        self.table()
            .values()
            .filter(|bucket| bucket.storage_type() == StorageType::Dedicated)
            .count()
    }

    /// Highest id ever inserted into a live bucket.
    pub fn max_id(&self) -> Option<SequenceId> {
        self.table().values().rev().find_map(|bucket| bucket.last_id())
    }

    /// Running totals over live buckets; counts may be approximate after restore.
    pub fn totals(&self) -> StoredCount {
        StoredCount {
            entry_count: self.totals.entries.load(Ordering::Acquire),
            retained_bytes: self.totals.bytes.load(Ordering::Acquire),
            bucket_count: self.num_buckets() as u64,
        }
    }

    pub fn count_after(&self, position: Option<&Position>) -> Result<StoredCount> {
        self.count_between(position, None)
    }

    /// Entries after `from` up to and including `to`'s last entry.
    /// `None` means the start and the end respectively.
    ///
    /// # Errors
    ///
    /// - `Error::InvalidArgument`: a position came from another manager generation.
    pub fn count_between(&self, from: Option<&Position>, to: Option<&Position>) -> Result<StoredCount> {
        self.ensure_open()?;
        for position in from.iter().chain(to.iter()) {
            self.check_generation(position)?;
        }
        let after = from.map_or(SequenceId::MINIMUM, Position::resume_after);
        let up_to = to.map_or(SequenceId::MAXIMUM, Position::resume_after);
        if up_to <= after {
            return Ok(StoredCount::ZERO);
        }

        let buckets = self.buckets();
        let mut total = StoredCount::ZERO;
        for (i, bucket) in buckets.iter().enumerate() {
            let next_start = buckets.get(i + 1).map(|next| next.bucket_id());
            if next_start.is_some_and(|next| next <= after) {
                continue;
            }
            if bucket.bucket_id() > up_to {
                break;
            }
            let snap = bucket.snapshot();
            let covers_start = after == SequenceId::MINIMUM || after < bucket.bucket_id();
            let covers_end = snap.last_id.map_or(true, |last| last <= up_to);
            if covers_start && covers_end {
                let mut count = bucket.count();
                if count.needs_recount() {
                    count = self.recount(bucket)?;
                }
                total += count.as_stored();
                continue;
            }
            let Some(lease) = bucket.lease()? else {
                continue;
            };
            let partial = lease.count_between(after, up_to)?;
            if !partial.is_empty() {
                total += StoredCount {
                    bucket_count: 1,
                    ..partial
                };
            }
        }
        Ok(total)
    }

    fn check_generation(&self, position: &Position) -> Result<()> {
        if position.generation != self.generation {
            return Err(Error::invalid(format!(
                "position {position} is from another generation than {}",
                self.generation
            )));
        }
        Ok(())
    }

    fn recount(&self, bucket: &Arc<Bucket>) -> Result<BucketCount> {
        let (before, after) = bucket.recount()?;
        self.totals.sub(before.entries, before.bytes);
        self.totals.add(after.entries, after.bytes);
        report(&*self.metrics, |m| m.increment(metrics::BUCKET_RECOUNTS, 1));
        if before.entries != after.entries {
            log::debug!(
                "recounted bucket {} in {}: {} -> {} entries",
                bucket.bucket_id(),
                self.store_id,
                before.entries,
                after.entries
            );
        }
        Ok(after)
    }

    /// Exact recount of every bucket whose count is untrusted.
    pub fn recount_inaccurate_buckets(&self) -> Result<usize> {
        self.ensure_open()?;
        let mut recounted = 0;
        for bucket in self.buckets() {
            if !bucket.count().accurate {
                self.recount(&bucket)?;
                recounted += 1;
            }
        }
        Ok(recounted)
    }

    /// Iterator for the bucket after `previous`'s, or the first bucket.
    /// `None` when no such bucket exists yet.
    pub fn next_bucket_iterator(&self, previous: Option<&BucketIterator>) -> Result<Option<BucketIterator>> {
        self.ensure_open()?;
        let lower = match previous {
            Some(iter) => Bound::Excluded(iter.bucket_id()),
            None => Bound::Unbounded,
        };
        let candidates: Vec<Arc<Bucket>> = self
            .table()
            .range((lower, Bound::Unbounded))
            .map(|(_, bucket)| Arc::clone(bucket))
            .collect();
        for bucket in candidates {
            if let Some(lease) = bucket.lease()? {
                let start = bucket.bucket_id().before();
                return Ok(Some(BucketIterator::new(lease, start, 0)));
            }
        }
        Ok(None)
    }

    /// Iterator over the bucket holding `position`, resuming after it.
    pub fn iterator_from(&self, position: &Position) -> Result<Option<BucketIterator>> {
        self.ensure_open()?;
        self.check_generation(position)?;
        let after = position.resume_after();
        let candidates: Vec<Arc<Bucket>> = {
            let table = self.table();
            let start = table
                .range(..=after)
                .next_back()
                .map_or(SequenceId::MINIMUM, |(id, _)| *id);
            table
                .range(start..)
                .map(|(_, bucket)| Arc::clone(bucket))
                .collect()
        };
        for bucket in candidates {
            let Some(lease) = bucket.lease()? else {
                continue;
            };
            let ordinal = if bucket.bucket_id() == position.bucket_id {
                position.ordinal
            } else {
                0
            };
            return Ok(Some(BucketIterator::new(lease, after, ordinal)));
        }
        Ok(None)
    }

    /// Position just after `id`. `None` when no bucket could hold `id`.
    pub fn store_position(&self, id: SequenceId) -> Result<Option<Position>> {
        self.ensure_open()?;
        let Some(bucket) = self.bucket_for(id) else {
            return Ok(None);
        };
        let Some(lease) = bucket.lease()? else {
            return Ok(None);
        };
        let id = id.without_position();
        let ordinal = lease.position_of(id.after())?;
        Ok(Some(Position {
            generation: self.generation,
            bucket_id: bucket.bucket_id(),
            ordinal,
            last_id: Some(id),
        }))
    }

    /// Value that changes on every successful insert.
    pub fn insert_sequence(&self) -> u64 {
        *self.inserts.lock()
    }

    /// Waits until an insert happens after `seen` was observed, the manager
    /// closes, or `timeout` passes. Returns false on timeout.
    pub fn wait_for_insert(&self, seen: u64, timeout: Duration) -> bool {
        let mut inserts = self.inserts.lock();
        if *inserts != seen || self.is_closed() {
            return true;
        }
        let timed_out = self.inserted.wait_for(&mut inserts, timeout).timed_out();
        !timed_out || *inserts != seen
    }

    /// Deletes entries up to `clean_level`, never past `last_available`.
    ///
    /// Buckets emptied this way are only removed from the table once
    /// `min_enqueue_level` has passed their insert window. Returns the
    /// number of entries deleted.
    pub fn delete_up_to(
        &self,
        clean_level: SequenceId,
        last_available: Option<SequenceId>,
        min_enqueue_level: SequenceId,
    ) -> Result<u64> {
        self.ensure_open()?;
        self.retry_pending_deletes();
        let Some(last_available) = last_available else {
            return Ok(0);
        };
        let level = clean_level.min(last_available);

        let mut deleted = 0;
        for bucket in self.buckets() {
            if bucket.bucket_id() > level {
                break;
            }
            let snap = bucket.snapshot();
            let spans_past = snap.last_id.is_some_and(|last| last > level);
            if !spans_past && self.config.is_past_insert_window(&snap, min_enqueue_level) {
                deleted += self.remove_bucket(&bucket)?;
                continue;
            }
            if snap.first_id.is_some_and(|first| first <= level) {
                let removed = bucket.trim(level)?;
                self.totals.sub(removed.entry_count, removed.retained_bytes);
                if !removed.is_empty() {
                    report(&*self.metrics, |m| {
                        m.increment(metrics::ENTRIES_DELETED, removed.entry_count)
                    });
                }
                deleted += removed.entry_count;
            }
        }
        Ok(deleted)
    }

    /// Removes whole buckets nobody can need any more: wholly below
    /// `max_delete_level`, holding none of `required_ids`, behind
    /// `last_available` and past their insert window. Returns the number of
    /// entries removed with them.
    pub fn delete_unneeded_buckets(
        &self,
        max_delete_level: SequenceId,
        required_ids: &[SequenceId],
        last_available: Option<SequenceId>,
        min_enqueue_level: SequenceId,
    ) -> Result<u64> {
        self.ensure_open()?;
        self.retry_pending_deletes();
        let buckets = self.buckets();
        let mut deleted = 0;
        for (i, bucket) in buckets.iter().enumerate() {
            let snap = bucket.snapshot();
            if let Some(last) = snap.last_id {
                if last >= max_delete_level {
                    continue;
                }
                match last_available {
                    Some(available) if last < available => {}
                    _ => continue,
                }
            }
            if !self.config.is_past_insert_window(&snap, min_enqueue_level) {
                continue;
            }
            let next_start = buckets.get(i + 1).map(|next| next.bucket_id());
            let required = required_ids.iter().any(|id| {
                *id >= snap.bucket_id && next_start.map_or(true, |next| *id < next)
            });
            if required {
                continue;
            }
            deleted += self.remove_bucket(bucket)?;
        }
        Ok(deleted)
    }

    /// Removes a bucket from the table and its store. The deleted flag is
    /// persisted first so an interrupted removal completes on the next open.
    fn remove_bucket(&self, bucket: &Arc<Bucket>) -> Result<u64> {
        let bucket_id = bucket.bucket_id();
        let mut meta = bucket.metadata();
        meta.deleted = true;
        self.persistence.update_bucket_metadata(&self.store_id, &meta)?;

        let remaining = {
            let mut table = self.buckets.write();
            if table.remove(&bucket_id).is_none() {
                return Ok(0);
            }
            let remaining = bucket.count();
            bucket.mark_deleted();
            bucket.release_store();
            remaining
        };
        self.totals.sub(remaining.entries, remaining.bytes);
        report(&*self.metrics, |m| {
            m.increment(metrics::BUCKETS_DELETED, 1);
            m.increment(metrics::ENTRIES_DELETED, remaining.entries);
        });

        if let Err(err) = self.persistence.delete_bucket_store(&self.store_id, bucket_id) {
            log::warn!(
                "deleting store of bucket {bucket_id} in {} failed, will retry: {err}",
                self.store_id
            );
            self.pending_deletes.lock().push(bucket_id);
            return Err(err);
        }
        log::info!(
            "deleted bucket {bucket_id} of {} ({} entries)",
            self.store_id,
            remaining.entries
        );
        Ok(remaining.entries)
    }

    fn retry_pending_deletes(&self) {
        let pending = std::mem::take(&mut *self.pending_deletes.lock());
        for bucket_id in pending {
            if let Err(err) = self.persistence.delete_bucket_store(&self.store_id, bucket_id) {
                log::warn!("retrying deletion of bucket {bucket_id} in {} failed: {err}", self.store_id);
                self.pending_deletes.lock().push(bucket_id);
            }
        }
    }

    /// Bucket ids whose store deletion is still outstanding.
    pub fn pending_deletes(&self) -> Vec<SequenceId> {
        self.pending_deletes.lock().clone()
    }

    /// Closes the stores of buckets that lie wholly below `below_level` and
    /// have no open iterator. The first bucket not below the level is opened
    /// so the next read does not pay for it. Returns how many were closed.
    pub fn close_unused_bucket_stores(&self, below_level: SequenceId) -> Result<usize> {
        self.ensure_open()?;
        let buckets = self.buckets();
        let mut closed = 0;
        for (i, bucket) in buckets.iter().enumerate() {
            let Some(next) = buckets.get(i + 1) else {
                break;
            };
            if next.bucket_id() > below_level {
                if let Some(lease) = next.lease()? {
                    drop(lease);
                }
                break;
            }
            if bucket.close_store_if_unused()? {
                closed += 1;
            }
        }
        if closed > 0 {
            report(&*self.metrics, |m| m.increment(metrics::STORES_CLOSED, closed as u64));
        }
        Ok(closed)
    }

    /// Marks open buckets whose insert window `min_enqueue_level` has passed
    /// as closed and persists the change. Returns how many were closed.
    pub fn close_finished_buckets(&self, min_enqueue_level: SequenceId) -> Result<usize> {
        self.ensure_open()?;
        let mut closed = 0;
        for bucket in self.buckets() {
            let snap = bucket.snapshot();
            if snap.state != BucketState::Open
                || !self.config.is_past_insert_window(&snap, min_enqueue_level)
            {
                continue;
            }
            if bucket.mark_closed() {
                self.persistence
                    .update_bucket_metadata(&self.store_id, &bucket.metadata())?;
                bucket.take_dirty();
                log::debug!("closed bucket {} of {}", snap.bucket_id, self.store_id);
                closed += 1;
            }
        }
        Ok(closed)
    }

    /// Persists metadata of buckets changed since the last sync.
    pub fn sync_metadata(&self) -> Result<usize> {
        let mut synced = 0;
        for bucket in self.buckets() {
            if !bucket.take_dirty() {
                continue;
            }
            if let Err(err) = self
                .persistence
                .update_bucket_metadata(&self.store_id, &bucket.metadata())
            {
                bucket.mark_dirty();
                return Err(err);
            }
            synced += 1;
        }
        let totals = self.totals();
        report(&*self.metrics, |m| {
            m.level(metrics::LIVE_ENTRIES, totals.entry_count);
            m.level(metrics::LIVE_BYTES, totals.retained_bytes);
            m.level(metrics::LIVE_BUCKETS, totals.bucket_count);
        });
        Ok(synced)
    }

    /// Persists bucket metadata and closes every store. Idempotent; later
    /// operations fail with [`Error::Closed`].
    pub fn close(&self) -> Result<()> {
        let table = self.buckets.write();
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        drop(table);
        self.inserted.notify_all();

        let mut first_err = None;
        if let Err(err) = self.sync_metadata() {
            first_err.get_or_insert(err);
        }
        for bucket in self.buckets() {
            if let Err(err) = bucket.force_close_store() {
                log::warn!("closing store of bucket {} failed: {err}", bucket.bucket_id());
                first_err.get_or_insert(err);
            }
        }
        log::debug!("closed bucket manager of {}", self.store_id);
        first_err.map_or(Ok(()), Err)
    }
}

impl Drop for BucketManager {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            log::warn!("closing bucket manager of {} on drop failed: {err}", self.store_id);
        }
    }
}

impl std::fmt::Debug for BucketManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BucketManager")
            .field("store_id", &self.store_id)
            .field("generation", &self.generation)
            .field("buckets", &self.num_buckets())
            .field("closed", &self.is_closed())
            .finish()
    }
}
