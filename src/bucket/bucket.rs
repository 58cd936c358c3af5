//! One time-windowed storage unit.
//!
//! A [`Bucket`] keeps the bookkeeping for its window (id range, size, count and
//! lifecycle state) and a lazily-opened handle to its [`BucketStore`]. Handles
//! are leased by iterators and inserts; the handle is only closed while no
//! lease is outstanding.

use std::ops::Deref;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::bucket::{BucketCount, StorageType, StoredCount};
use crate::core::{Error, Result, SequenceId};
use crate::persistence::{entry_size, BucketMetadata, BucketStore, PersistenceManager};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BucketState {
    /// May still receive inserts.
    Open,
    /// No insert can land here any more; contents are still readable.
    Closed,
    /// Removed from the table; any remaining handle is stale.
    Deleted,
}

/// Point-in-time view of a bucket's bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketSnapshot {
    pub bucket_id: SequenceId,
    pub storage_type: StorageType,
    pub state: BucketState,
    pub first_id: Option<SequenceId>,
    /// Highest id ever stored. Kept after trimming so later buckets stay ordered.
    pub last_id: Option<SequenceId>,
    pub entry_count: u64,
    pub byte_count: u64,
    pub count_accurate: bool,
}

#[derive(Debug)]
struct BucketStats {
    state: BucketState,
    first: Option<SequenceId>,
    last: Option<SequenceId>,
    entries: u64,
    bytes: u64,
    accurate: bool,
    dirty: bool,
}

struct StoreSlot {
    store: Option<Arc<dyn BucketStore>>,
    leases: usize,
    // Set at shutdown; the store must not be reopened afterwards.
    shut: bool,
}

pub struct Bucket {
    store_id: Arc<str>,
    bucket_id: SequenceId,
    storage_type: StorageType,
    creation_id: SequenceId,
    persistence: Arc<dyn PersistenceManager>,
    stats: Mutex<BucketStats>,
    // Inserts hold it shared; trims and recounts hold it exclusively so the
    // tracked count moves in step with the store.
    gate: RwLock<()>,
    slot: Mutex<StoreSlot>,
}

impl Bucket {
    /// A freshly created, empty bucket whose store is already open.
    pub(crate) fn created(
        store_id: Arc<str>,
        persistence: Arc<dyn PersistenceManager>,
        creation_id: SequenceId,
        store: Arc<dyn BucketStore>,
    ) -> Self {
        Self {
            store_id,
            bucket_id: store.bucket_id(),
            storage_type: store.storage_type(),
            creation_id,
            persistence,
            stats: Mutex::new(BucketStats {
                state: BucketState::Open,
                first: None,
                last: None,
                entries: 0,
                bytes: 0,
                accurate: true,
                dirty: true,
            }),
            gate: RwLock::new(()),
            slot: Mutex::new(StoreSlot {
                store: Some(store),
                leases: 0,
                shut: false,
            }),
        }
    }

    /// A bucket rebuilt from persisted metadata. Counts are untrusted until
    /// recounted.
    pub(crate) fn restored(
        store_id: Arc<str>,
        persistence: Arc<dyn PersistenceManager>,
        metadata: &BucketMetadata,
        first: Option<SequenceId>,
        last: Option<SequenceId>,
    ) -> Self {
        let state = if metadata.closed {
            BucketState::Closed
        } else {
            BucketState::Open
        };
        Self {
            store_id,
            bucket_id: metadata.bucket_id,
            storage_type: metadata.storage_type,
            creation_id: metadata.creation_id,
            persistence,
            stats: Mutex::new(BucketStats {
                state,
                first,
                last,
                entries: metadata.entry_count,
                bytes: metadata.byte_count,
                accurate: false,
                dirty: false,
            }),
            gate: RwLock::new(()),
            slot: Mutex::new(StoreSlot {
                store: None,
                leases: 0,
                shut: false,
            }),
        }
    }

    pub fn bucket_id(&self) -> SequenceId {
        self.bucket_id
    }

    pub fn storage_type(&self) -> StorageType {
        self.storage_type
    }

    pub fn creation_id(&self) -> SequenceId {
        self.creation_id
    }

    pub fn state(&self) -> BucketState {
        self.stats.lock().state
    }

    pub fn snapshot(&self) -> BucketSnapshot {
        let stats = self.stats.lock();
        BucketSnapshot {
            bucket_id: self.bucket_id,
            storage_type: self.storage_type,
            state: stats.state,
            first_id: stats.first,
            last_id: stats.last,
            entry_count: stats.entries,
            byte_count: stats.bytes,
            count_accurate: stats.accurate,
        }
    }

    pub fn count(&self) -> BucketCount {
        let stats = self.stats.lock();
        BucketCount {
            entries: stats.entries,
            bytes: stats.bytes,
            accurate: stats.accurate,
        }
    }

    pub fn last_id(&self) -> Option<SequenceId> {
        self.stats.lock().last
    }

    pub fn metadata(&self) -> BucketMetadata {
        let stats = self.stats.lock();
        BucketMetadata {
            creation_id: self.creation_id,
            bucket_id: self.bucket_id,
            storage_type: self.storage_type,
            entry_count: stats.entries,
            byte_count: stats.bytes,
            closed: stats.state == BucketState::Closed,
            deleted: stats.state == BucketState::Deleted,
        }
    }

    /// Clears and returns the changed-since-last-sync flag.
    pub(crate) fn take_dirty(&self) -> bool {
        std::mem::take(&mut self.stats.lock().dirty)
    }

    pub(crate) fn mark_dirty(&self) {
        self.stats.lock().dirty = true;
    }

    /// Writes `payload` under `id` and accounts for it. Nothing is recorded
    /// when the store write fails.
    pub(crate) fn insert(self: &Arc<Self>, id: SequenceId, payload: &[u8]) -> Result<u64> {
        let _gate = self.gate.read();
        if self.state() != BucketState::Open {
            return Err(Error::invalid(format!(
                "bucket {} no longer accepts inserts",
                self.bucket_id
            )));
        }
        let lease = self.lease()?.ok_or_else(|| {
            Error::persistence(format!("store of bucket {} is missing", self.bucket_id))
        })?;
        lease.put(id, payload)?;
        drop(lease);

        let size = entry_size(payload.len());
        let mut stats = self.stats.lock();
        stats.entries += 1;
        stats.bytes += size;
        stats.first = Some(stats.first.map_or(id, |first| first.min(id)));
        stats.last = Some(stats.last.map_or(id, |last| last.max(id)));
        stats.dirty = true;
        Ok(size)
    }

    /// Removes entries `<= level` from the store.
    pub(crate) fn trim(self: &Arc<Self>, level: SequenceId) -> Result<StoredCount> {
        let _gate = self.gate.write();
        let Some(lease) = self.lease()? else {
            return Ok(StoredCount::ZERO);
        };
        let removed = lease.delete_up_to(level)?;
        let first = lease.first_id()?;
        drop(lease);

        let mut stats = self.stats.lock();
        stats.entries = stats.entries.saturating_sub(removed.entry_count);
        stats.bytes = stats.bytes.saturating_sub(removed.retained_bytes);
        stats.first = first;
        if first.is_none() {
            stats.entries = 0;
            stats.bytes = 0;
            stats.accurate = true;
        }
        stats.dirty |= !removed.is_empty();
        Ok(removed)
    }

    /// Rescans the store and replaces the tracked count with the exact one.
    /// Returns the count before and after.
    pub(crate) fn recount(self: &Arc<Self>) -> Result<(BucketCount, BucketCount)> {
        let _gate = self.gate.write();
        let Some(lease) = self.lease()? else {
            return Ok((self.count(), self.count()));
        };
        let exact = lease.count_between(SequenceId::MINIMUM, SequenceId::MAXIMUM)?;
        let first = lease.first_id()?;
        let last = lease.last_id()?;
        drop(lease);

        let mut stats = self.stats.lock();
        let before = BucketCount {
            entries: stats.entries,
            bytes: stats.bytes,
            accurate: stats.accurate,
        };
        stats.entries = exact.entry_count;
        stats.bytes = exact.retained_bytes;
        stats.accurate = true;
        stats.first = first;
        stats.last = match (stats.last, last) {
            (Some(known), Some(stored)) => Some(known.max(stored)),
            (known, stored) => known.or(stored),
        };
        stats.dirty = true;
        let after = BucketCount {
            entries: stats.entries,
            bytes: stats.bytes,
            accurate: true,
        };
        Ok((before, after))
    }

    /// Moves `Open` to `Closed`. Returns whether the state changed.
    pub(crate) fn mark_closed(&self) -> bool {
        let mut stats = self.stats.lock();
        if stats.state != BucketState::Open {
            return false;
        }
        stats.state = BucketState::Closed;
        stats.dirty = true;
        true
    }

    pub(crate) fn mark_deleted(&self) {
        let mut stats = self.stats.lock();
        stats.state = BucketState::Deleted;
        stats.dirty = false;
    }

    /// Leases the store handle, opening it if needed. `None` once the bucket
    /// is deleted or its store has gone.
    ///
    /// # Errors
    ///
    /// - `Error::Closed`: the store was shut by [`Bucket::force_close_store`].
    pub fn lease(self: &Arc<Self>) -> Result<Option<StoreLease>> {
        if self.state() == BucketState::Deleted {
            return Ok(None);
        }
        let mut slot = self.slot.lock();
        if slot.shut {
            return Err(Error::Closed);
        }
        let store = match &slot.store {
            Some(store) => Arc::clone(store),
            None => {
                let Some(store) = self
                    .persistence
                    .get_bucket_store(&self.store_id, self.bucket_id)?
                else {
                    return Ok(None);
                };
                log::debug!("reopened store of bucket {} in {}", self.bucket_id, self.store_id);
                slot.store = Some(Arc::clone(&store));
                store
            }
        };
        slot.leases += 1;
        Ok(Some(StoreLease {
            bucket: Arc::clone(self),
            store,
        }))
    }

    pub fn leases(&self) -> usize {
        self.slot.lock().leases
    }

    pub fn is_store_open(&self) -> bool {
        self.slot.lock().store.is_some()
    }

    /// Flushes and closes the store handle if nothing holds a lease.
    pub(crate) fn close_store_if_unused(&self) -> Result<bool> {
        let mut slot = self.slot.lock();
        if slot.leases > 0 {
            return Ok(false);
        }
        let Some(store) = slot.store.take() else {
            return Ok(false);
        };
        if let Err(err) = store.flush() {
            slot.store = Some(store);
            return Err(err);
        }
        self.persistence
            .close_bucket_store(&self.store_id, self.bucket_id)?;
        log::debug!("closed store of bucket {} in {}", self.bucket_id, self.store_id);
        Ok(true)
    }

    /// Closes the handle even if leases are outstanding and refuses any
    /// later lease; used at shutdown. Outstanding leases keep their own
    /// reference until dropped.
    pub(crate) fn force_close_store(&self) -> Result<()> {
        let store = {
            let mut slot = self.slot.lock();
            slot.shut = true;
            slot.store.take()
        };
        if let Some(store) = store {
            store.flush()?;
            self.persistence
                .close_bucket_store(&self.store_id, self.bucket_id)?;
        }
        Ok(())
    }

    /// Drops the handle without touching persistence; the store is being deleted.
    pub(crate) fn release_store(&self) {
        self.slot.lock().store = None;
    }

    fn release_lease(&self) {
        let mut slot = self.slot.lock();
        slot.leases = slot.leases.saturating_sub(1);
    }
}

impl std::fmt::Debug for Bucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bucket")
            .field("store_id", &self.store_id)
            .field("bucket_id", &self.bucket_id)
            .field("storage_type", &self.storage_type)
            .field("stats", &*self.stats.lock())
            .finish()
    }
}

/// Counted reference to an open bucket store.
pub struct StoreLease {
    bucket: Arc<Bucket>,
    store: Arc<dyn BucketStore>,
}

impl StoreLease {
    pub fn bucket(&self) -> &Arc<Bucket> {
        &self.bucket
    }
}

impl Deref for StoreLease {
    type Target = dyn BucketStore;

    fn deref(&self) -> &Self::Target {
        &*self.store
    }
}

impl Drop for StoreLease {
    fn drop(&mut self) {
        self.bucket.release_lease();
    }
}
