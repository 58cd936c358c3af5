//! Contract with the durable engine that stores bucket contents.
//!
//! The bucket engine never touches disk itself. It asks a
//! [`PersistenceManager`] for per-bucket [`BucketStore`] handles and keeps
//! per-bucket bookkeeping in [`BucketMetadata`] records so the table can be
//! rebuilt after a restart.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::bucket::{StorageType, StoredCount};
use crate::core::sequence::KEY_LEN;
use crate::core::{Result, SequenceId};

#[cfg(feature = "file")]
pub mod file;
pub mod memory;

#[cfg(feature = "file")]
pub use file::FilePersistence;
pub use memory::MemoryPersistence;

/// Bytes an entry accounts for: payload plus its encoded key.
pub fn entry_size(payload_len: usize) -> u64 {
    (payload_len + KEY_LEN) as u64
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEntry {
    pub id: SequenceId,
    pub payload: Vec<u8>,
}

impl StoredEntry {
    pub fn size(&self) -> u64 {
        entry_size(self.payload.len())
    }
}

/// Handle to the physical contents of one bucket.
///
/// Ids are stored without their in-bucket position. Range arguments may be
/// synthetic bounds (see [`SequenceId::after`]).
pub trait BucketStore: Send + Sync {
    fn bucket_id(&self) -> SequenceId;

    fn storage_type(&self) -> StorageType;

    fn put(&self, id: SequenceId, payload: &[u8]) -> Result<()>;

    fn get(&self, id: SequenceId) -> Result<Option<Vec<u8>>>;

    /// Up to `limit` entries strictly after `after`, ascending.
    fn scan_after(&self, after: SequenceId, limit: usize) -> Result<Vec<StoredEntry>>;

    /// Entries in `(after, up_to]`. `bucket_count` is left at zero.
    fn count_between(&self, after: SequenceId, up_to: SequenceId) -> Result<StoredCount>;

    /// Greatest stored id that is `<= id`.
    fn floor(&self, id: SequenceId) -> Result<Option<SequenceId>>;

    /// Number of stored entries ordered before `id`.
    fn position_of(&self, id: SequenceId) -> Result<u64>;

    fn first_id(&self) -> Result<Option<SequenceId>>;

    fn last_id(&self) -> Result<Option<SequenceId>>;

    /// Removes every entry `<= level` and returns what was removed.
    fn delete_up_to(&self, level: SequenceId) -> Result<StoredCount>;

    fn flush(&self) -> Result<()>;
}

/// Persisted bookkeeping for one bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketMetadata {
    /// Id generated when the bucket was created; orders creations.
    pub creation_id: SequenceId,
    pub bucket_id: SequenceId,
    pub storage_type: StorageType,
    pub entry_count: u64,
    pub byte_count: u64,
    #[serde(default)]
    pub closed: bool,
    /// Set before the store is removed so an interrupted delete can finish.
    #[serde(default)]
    pub deleted: bool,
}

/// Committed level of one named reader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReaderLevel {
    pub name: String,
    pub level: SequenceId,
}

impl ReaderLevel {
    pub fn new(name: impl Into<String>, level: SequenceId) -> Self {
        Self {
            name: name.into(),
            level,
        }
    }
}

pub trait PersistenceManager: Send + Sync {
    /// Creates an empty store for a new bucket.
    ///
    /// `preferred` is a hint; the returned handle reports the type actually used.
    fn create_bucket_store(
        &self,
        store_id: &str,
        bucket_id: SequenceId,
        preferred: StorageType,
    ) -> Result<Arc<dyn BucketStore>>;

    /// Opens the existing store of a bucket, or `None` if it has none.
    fn get_bucket_store(
        &self,
        store_id: &str,
        bucket_id: SequenceId,
    ) -> Result<Option<Arc<dyn BucketStore>>>;

    /// Releases resources of an open handle. Contents are kept.
    fn close_bucket_store(&self, store_id: &str, bucket_id: SequenceId) -> Result<()>;

    /// Removes a bucket's contents and metadata. Deleting a missing bucket is not an error.
    fn delete_bucket_store(&self, store_id: &str, bucket_id: SequenceId) -> Result<()>;

    fn bucket_metadata_for_store(&self, store_id: &str) -> Result<Vec<BucketMetadata>>;

    /// Inserts or replaces the record for `metadata.bucket_id`.
    fn update_bucket_metadata(&self, store_id: &str, metadata: &BucketMetadata) -> Result<()>;

    fn persist_reader_levels(&self, store_id: &str, levels: &[ReaderLevel]) -> Result<()>;

    fn reader_levels(&self, store_id: &str) -> Result<Vec<ReaderLevel>>;

    fn supported_new_bucket_types(&self) -> Vec<StorageType>;

    fn is_healthy(&self) -> bool;

    /// Ids of every store with persisted state.
    fn store_ids(&self) -> Result<Vec<String>>;
}
