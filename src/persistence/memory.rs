//! In-process persistence with fault injection.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::bucket::{StorageType, StoredCount};
use crate::core::{Error, Result, SequenceId};
use crate::persistence::{
    entry_size, BucketMetadata, BucketStore, PersistenceManager, ReaderLevel, StoredEntry,
};

/// Ordered entries of one bucket. Shared by the memory and file stores.
#[derive(Debug, Default)]
pub(crate) struct EntryMap {
    entries: BTreeMap<SequenceId, Vec<u8>>,
}

impl EntryMap {
    pub(crate) fn insert(&mut self, id: SequenceId, payload: Vec<u8>) -> Result<()> {
        let id = id.without_position();
        if self.entries.contains_key(&id) {
            return Err(Error::invalid(format!("id {id} is already stored")));
        }
        self.entries.insert(id, payload);
        Ok(())
    }

    /// Insert used by replay, where a later record wins.
    pub(crate) fn replace(&mut self, id: SequenceId, payload: Vec<u8>) {
        self.entries.insert(id.without_position(), payload);
    }

    pub(crate) fn contains(&self, id: SequenceId) -> bool {
        self.entries.contains_key(&id)
    }

    pub(crate) fn get(&self, id: SequenceId) -> Option<Vec<u8>> {
        self.entries.get(&id).cloned()
    }

    pub(crate) fn scan_after(&self, after: SequenceId, limit: usize) -> Vec<StoredEntry> {
        self.entries
            .range((Bound::Excluded(after), Bound::Unbounded))
            .take(limit)
            .map(|(id, payload)| StoredEntry {
                id: *id,
                payload: payload.clone(),
            })
            .collect()
    }

    pub(crate) fn count_between(&self, after: SequenceId, up_to: SequenceId) -> StoredCount {
        if up_to <= after {
            return StoredCount::ZERO;
        }
        self.entries
            .range((Bound::Excluded(after), Bound::Included(up_to)))
            .fold(StoredCount::ZERO, |acc, (_, payload)| {
                acc + StoredCount::entries(1, entry_size(payload.len()))
            })
    }

    pub(crate) fn floor(&self, id: SequenceId) -> Option<SequenceId> {
        self.entries.range(..=id).next_back().map(|(id, _)| *id)
    }

    pub(crate) fn position_of(&self, id: SequenceId) -> u64 {
        self.entries.range(..id).count() as u64
    }

    pub(crate) fn first_id(&self) -> Option<SequenceId> {
        self.entries.keys().next().copied()
    }

    pub(crate) fn last_id(&self) -> Option<SequenceId> {
        self.entries.keys().next_back().copied()
    }

    pub(crate) fn delete_up_to(&mut self, level: SequenceId) -> StoredCount {
        let first_kept = self
            .entries
            .range((Bound::Excluded(level), Bound::Unbounded))
            .next()
            .map(|(id, _)| *id);
        let kept = match first_kept {
            Some(id) => self.entries.split_off(&id),
            None => BTreeMap::new(),
        };
        let removed = std::mem::replace(&mut self.entries, kept);
        removed
            .values()
            .fold(StoredCount::ZERO, |acc, payload| {
                acc + StoredCount::entries(1, entry_size(payload.len()))
            })
    }
}

#[derive(Debug, Default)]
struct Faults {
    failing_puts: AtomicUsize,
    failing_deletes: AtomicBool,
    unhealthy: AtomicBool,
}

impl Faults {
    fn take_put_failure(&self) -> bool {
        self.failing_puts
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }
}

pub struct MemoryBucketStore {
    bucket_id: SequenceId,
    storage_type: StorageType,
    entries: RwLock<EntryMap>,
    faults: Arc<Faults>,
}

impl BucketStore for MemoryBucketStore {
    fn bucket_id(&self) -> SequenceId {
        self.bucket_id
    }

    fn storage_type(&self) -> StorageType {
        self.storage_type
    }

    fn put(&self, id: SequenceId, payload: &[u8]) -> Result<()> {
        if self.faults.take_put_failure() {
            return Err(Error::persistence(format!("injected put failure for {id}")));
        }
        self.entries.write().insert(id, payload.to_vec())
    }

    fn get(&self, id: SequenceId) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.read().get(id))
    }

    fn scan_after(&self, after: SequenceId, limit: usize) -> Result<Vec<StoredEntry>> {
        Ok(self.entries.read().scan_after(after, limit))
    }

    fn count_between(&self, after: SequenceId, up_to: SequenceId) -> Result<StoredCount> {
        Ok(self.entries.read().count_between(after, up_to))
    }

    fn floor(&self, id: SequenceId) -> Result<Option<SequenceId>> {
        Ok(self.entries.read().floor(id))
    }

    fn position_of(&self, id: SequenceId) -> Result<u64> {
        Ok(self.entries.read().position_of(id))
    }

    fn first_id(&self) -> Result<Option<SequenceId>> {
        Ok(self.entries.read().first_id())
    }

    fn last_id(&self) -> Result<Option<SequenceId>> {
        Ok(self.entries.read().last_id())
    }

    fn delete_up_to(&self, level: SequenceId) -> Result<StoredCount> {
        Ok(self.entries.write().delete_up_to(level))
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

struct StoreSlot {
    store: Arc<MemoryBucketStore>,
    open: bool,
}

#[derive(Default)]
struct StoreData {
    buckets: HashMap<SequenceId, StoreSlot>,
    metadata: BTreeMap<SequenceId, BucketMetadata>,
    readers: Vec<ReaderLevel>,
}

/// Keeps every store in memory. Contents survive close and reopen of a
/// handle, but not the process.
pub struct MemoryPersistence {
    stores: Mutex<HashMap<String, StoreData>>,
    supported: Vec<StorageType>,
    faults: Arc<Faults>,
}

impl Default for MemoryPersistence {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::with_supported_types(vec![StorageType::Shared, StorageType::Dedicated])
    }

    pub fn with_supported_types(supported: Vec<StorageType>) -> Self {
        Self {
            stores: Mutex::new(HashMap::new()),
            supported,
            faults: Arc::new(Faults::default()),
        }
    }

    /// Makes the next `count` puts on any bucket store fail.
    pub fn fail_next_puts(&self, count: usize) {
        self.faults.failing_puts.store(count, Ordering::Release);
    }

    /// While set, `delete_bucket_store` fails.
    pub fn fail_deletes(&self, failing: bool) {
        self.faults.failing_deletes.store(failing, Ordering::Release);
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.faults.unhealthy.store(!healthy, Ordering::Release);
    }

    /// Number of bucket handles currently open for `store_id`.
    pub fn open_handles(&self, store_id: &str) -> usize {
        self.stores
            .lock()
            .get(store_id)
            .map_or(0, |data| data.buckets.values().filter(|slot| slot.open).count())
    }

    /// Number of buckets with contents for `store_id`, open or not.
    pub fn bucket_stores(&self, store_id: &str) -> usize {
        self.stores
            .lock()
            .get(store_id)
            .map_or(0, |data| data.buckets.len())
    }
}

impl PersistenceManager for MemoryPersistence {
    fn create_bucket_store(
        &self,
        store_id: &str,
        bucket_id: SequenceId,
        preferred: StorageType,
    ) -> Result<Arc<dyn BucketStore>> {
        let storage_type = if self.supported.contains(&preferred) {
            preferred
        } else {
            self.supported.first().copied().unwrap_or(preferred)
        };
        let mut stores = self.stores.lock();
        let data = stores.entry(store_id.to_string()).or_default();
        if data.buckets.contains_key(&bucket_id) {
            return Err(Error::invalid(format!(
                "bucket {bucket_id} of {store_id} already exists"
            )));
        }
        let store = Arc::new(MemoryBucketStore {
            bucket_id,
            storage_type,
            entries: RwLock::new(EntryMap::default()),
            faults: Arc::clone(&self.faults),
        });
        data.buckets.insert(
            bucket_id,
            StoreSlot {
                store: Arc::clone(&store),
                open: true,
            },
        );
        Ok(store)
    }

    fn get_bucket_store(
        &self,
        store_id: &str,
        bucket_id: SequenceId,
    ) -> Result<Option<Arc<dyn BucketStore>>> {
        let mut stores = self.stores.lock();
        let Some(slot) = stores
            .get_mut(store_id)
            .and_then(|data| data.buckets.get_mut(&bucket_id))
        else {
            return Ok(None);
        };
        slot.open = true;
        Ok(Some(Arc::clone(&slot.store) as Arc<dyn BucketStore>))
    }

    fn close_bucket_store(&self, store_id: &str, bucket_id: SequenceId) -> Result<()> {
        if let Some(slot) = self
            .stores
            .lock()
            .get_mut(store_id)
            .and_then(|data| data.buckets.get_mut(&bucket_id))
        {
            slot.open = false;
        }
        Ok(())
    }

    fn delete_bucket_store(&self, store_id: &str, bucket_id: SequenceId) -> Result<()> {
        if self.faults.failing_deletes.load(Ordering::Acquire) {
            return Err(Error::persistence(format!(
                "injected delete failure for bucket {bucket_id}"
            )));
        }
        if let Some(data) = self.stores.lock().get_mut(store_id) {
            data.buckets.remove(&bucket_id);
            data.metadata.remove(&bucket_id);
        }
        Ok(())
    }

    fn bucket_metadata_for_store(&self, store_id: &str) -> Result<Vec<BucketMetadata>> {
        Ok(self
            .stores
            .lock()
            .get(store_id)
            .map(|data| data.metadata.values().cloned().collect())
            .unwrap_or_default())
    }

    fn update_bucket_metadata(&self, store_id: &str, metadata: &BucketMetadata) -> Result<()> {
        self.stores
            .lock()
            .entry(store_id.to_string())
            .or_default()
            .metadata
            .insert(metadata.bucket_id, metadata.clone());
        Ok(())
    }

    fn persist_reader_levels(&self, store_id: &str, levels: &[ReaderLevel]) -> Result<()> {
        self.stores
            .lock()
            .entry(store_id.to_string())
            .or_default()
            .readers = levels.to_vec();
        Ok(())
    }

    fn reader_levels(&self, store_id: &str) -> Result<Vec<ReaderLevel>> {
        Ok(self
            .stores
            .lock()
            .get(store_id)
            .map(|data| data.readers.clone())
            .unwrap_or_default())
    }

    fn supported_new_bucket_types(&self) -> Vec<StorageType> {
        self.supported.clone()
    }

    fn is_healthy(&self) -> bool {
        !self.faults.unhealthy.load(Ordering::Acquire)
    }

    fn store_ids(&self) -> Result<Vec<String>> {
        let mut ids: Vec<String> = self.stores.lock().keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(time: u64) -> SequenceId {
        SequenceId::new(time, 0)
    }

    #[test]
    fn entry_map_range_queries() {
        let mut map = EntryMap::default();
        for t in [10, 20, 30, 40] {
            map.insert(id(t), vec![0u8; 7]).expect("insert");
        }
        assert!(map.insert(id(20), vec![]).is_err());

        let scanned: Vec<_> = map.scan_after(id(20), 10).into_iter().map(|e| e.id).collect();
        assert_eq!(scanned, vec![id(30), id(40)]);
        assert_eq!(map.scan_after(SequenceId::MINIMUM, 1)[0].id, id(10));

        let count = map.count_between(id(10), id(30));
        assert_eq!(count.entry_count, 2);
        assert_eq!(count.retained_bytes, 2 * entry_size(7));
        assert_eq!(map.count_between(id(30), id(10)), StoredCount::ZERO);

        assert_eq!(map.floor(id(25)), Some(id(20)));
        assert_eq!(map.floor(id(5)), None);
        assert_eq!(map.position_of(id(30)), 2);
        assert_eq!(map.position_of(id(30).after()), 3);
    }

    #[test]
    fn entry_map_delete_up_to_is_inclusive() {
        let mut map = EntryMap::default();
        for t in [10, 20, 30] {
            map.insert(id(t), vec![1]).expect("insert");
        }
        let removed = map.delete_up_to(id(20));
        assert_eq!(removed.entry_count, 2);
        assert_eq!(map.first_id(), Some(id(30)));
        assert_eq!(map.delete_up_to(SequenceId::at_time(30)).entry_count, 0);
        assert_eq!(map.delete_up_to(SequenceId::MAXIMUM).entry_count, 1);
        assert_eq!(map.last_id(), None);
    }

    #[test]
    fn injected_put_failures_are_consumed() {
        let persistence = MemoryPersistence::new();
        let store = persistence
            .create_bucket_store("q", SequenceId::at_time(0), StorageType::Shared)
            .expect("create");
        persistence.fail_next_puts(1);
        assert!(store.put(id(1), b"a").is_err());
        store.put(id(1), b"a").expect("second put succeeds");
        assert_eq!(store.get(id(1)).expect("get"), Some(b"a".to_vec()));
    }

    #[test]
    fn contents_survive_close_and_reopen() {
        let persistence = MemoryPersistence::new();
        let bucket = SequenceId::at_time(0);
        let store = persistence
            .create_bucket_store("q", bucket, StorageType::Dedicated)
            .expect("create");
        store.put(id(5), b"x").expect("put");
        assert_eq!(persistence.open_handles("q"), 1);
        persistence.close_bucket_store("q", bucket).expect("close");
        assert_eq!(persistence.open_handles("q"), 0);

        let reopened = persistence
            .get_bucket_store("q", bucket)
            .expect("get")
            .expect("store exists");
        assert_eq!(reopened.last_id().expect("last"), Some(id(5)));
        assert_eq!(reopened.storage_type(), StorageType::Dedicated);

        persistence.delete_bucket_store("q", bucket).expect("delete");
        assert!(persistence.get_bucket_store("q", bucket).expect("get").is_none());
    }

    #[test]
    fn unsupported_preference_falls_back() {
        let persistence = MemoryPersistence::with_supported_types(vec![StorageType::Shared]);
        let store = persistence
            .create_bucket_store("q", SequenceId::at_time(0), StorageType::Dedicated)
            .expect("create");
        assert_eq!(store.storage_type(), StorageType::Shared);
    }
}
