//! File-backed persistence.
//!
//! Layout under the root directory:
//!
//! ```text
//! <store_id>/buckets.json          bucket metadata
//! <store_id>/readers.json          committed reader levels
//! <store_id>/shared/<key>.log      one append-only log per shared bucket
//! <store_id>/dedicated/<key>.log   one append-only log per dedicated bucket
//! ```
//!
//! Log records are `len:u32 | crc32:u32 | kind:u8 | id:[u8; 13] | payload`,
//! little-endian header, crc over everything after it. A trim record carries
//! the delete level and no payload. Opening a bucket replays its log through a
//! read-only map; a torn or corrupt tail is truncated away.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use memmap2::Mmap;
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::bucket::{StorageType, StoredCount};
use crate::core::sequence::KEY_LEN;
use crate::core::{Error, Result, SequenceId};
use crate::persistence::memory::EntryMap;
use crate::persistence::{BucketMetadata, BucketStore, PersistenceManager, ReaderLevel, StoredEntry};

const RECORD_HEADER_LEN: usize = 8;
const KIND_PUT: u8 = 1;
const KIND_TRIM: u8 = 2;
const METADATA_FILE: &str = "buckets.json";
const READERS_FILE: &str = "readers.json";

/// Append target of a bucket log.
trait LogFile: Write + Send + Sync {
    fn truncate(&mut self, len: u64) -> io::Result<()>;
    fn sync(&self) -> io::Result<()>;
}

impl LogFile for File {
    fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)
    }

    fn sync(&self) -> io::Result<()> {
        self.sync_data()
    }
}

struct LogState {
    entries: EntryMap,
    file: Box<dyn LogFile>,
    // Length of the valid prefix; a failed append is cut back to it.
    len: u64,
    broken: bool,
}

impl LogState {
    fn append(&mut self, path: &Path, record: &[u8]) -> Result<()> {
        if self.broken {
            return Err(Error::persistence(format!(
                "bucket log {} holds a torn record",
                path.display()
            )));
        }
        if let Err(err) = self.file.write_all(record) {
            if let Err(rollback) = self.file.truncate(self.len) {
                log::error!(
                    "could not cut torn record from {}: {rollback}",
                    path.display()
                );
                self.broken = true;
            }
            return Err(err.into());
        }
        self.len += record.len() as u64;
        Ok(())
    }
}

pub struct FileBucketStore {
    bucket_id: SequenceId,
    storage_type: StorageType,
    path: PathBuf,
    state: RwLock<LogState>,
}

impl FileBucketStore {
    fn create(path: PathBuf, bucket_id: SequenceId, storage_type: StorageType) -> Result<Self> {
        let file = OpenOptions::new()
            .create_new(true)
            .append(true)
            .open(&path)?;
        Ok(Self::with_log(
            path,
            bucket_id,
            storage_type,
            EntryMap::default(),
            Box::new(file),
            0,
        ))
    }

    fn with_log(
        path: PathBuf,
        bucket_id: SequenceId,
        storage_type: StorageType,
        entries: EntryMap,
        file: Box<dyn LogFile>,
        len: u64,
    ) -> Self {
        Self {
            bucket_id,
            storage_type,
            path,
            state: RwLock::new(LogState {
                entries,
                file,
                len,
                broken: false,
            }),
        }
    }

    fn open(path: PathBuf, bucket_id: SequenceId, storage_type: StorageType) -> Result<Self> {
        let (entries, valid_len) = replay(&path)?;
        let file = OpenOptions::new().append(true).open(&path)?;
        let len = file.metadata()?.len();
        if valid_len < len {
            log::warn!(
                "truncating {} bytes of torn tail from {}",
                len - valid_len,
                path.display()
            );
            file.set_len(valid_len)?;
        }
        log::debug!("opened bucket log {}", path.display());
        Ok(Self::with_log(
            path,
            bucket_id,
            storage_type,
            entries,
            Box::new(file),
            valid_len,
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl BucketStore for FileBucketStore {
    fn bucket_id(&self) -> SequenceId {
        self.bucket_id
    }

    fn storage_type(&self) -> StorageType {
        self.storage_type
    }

    fn put(&self, id: SequenceId, payload: &[u8]) -> Result<()> {
        let id = id.without_position();
        let mut state = self.state.write();
        if state.entries.contains(id) {
            return Err(Error::invalid(format!("id {id} is already stored")));
        }
        state.append(&self.path, &encode_record(KIND_PUT, id, payload))?;
        state.entries.insert(id, payload.to_vec())
    }

    fn get(&self, id: SequenceId) -> Result<Option<Vec<u8>>> {
        Ok(self.state.read().entries.get(id))
    }

    fn scan_after(&self, after: SequenceId, limit: usize) -> Result<Vec<StoredEntry>> {
        Ok(self.state.read().entries.scan_after(after, limit))
    }

    fn count_between(&self, after: SequenceId, up_to: SequenceId) -> Result<StoredCount> {
        Ok(self.state.read().entries.count_between(after, up_to))
    }

    fn floor(&self, id: SequenceId) -> Result<Option<SequenceId>> {
        Ok(self.state.read().entries.floor(id))
    }

    fn position_of(&self, id: SequenceId) -> Result<u64> {
        Ok(self.state.read().entries.position_of(id))
    }

    fn first_id(&self) -> Result<Option<SequenceId>> {
        Ok(self.state.read().entries.first_id())
    }

    fn last_id(&self) -> Result<Option<SequenceId>> {
        Ok(self.state.read().entries.last_id())
    }

    fn delete_up_to(&self, level: SequenceId) -> Result<StoredCount> {
        let mut state = self.state.write();
        state.append(&self.path, &encode_record(KIND_TRIM, level, &[]))?;
        Ok(state.entries.delete_up_to(level))
    }

    fn flush(&self) -> Result<()> {
        let state = self.state.read();
        state.file.sync()?;
        Ok(())
    }
}

fn encode_record(kind: u8, id: SequenceId, payload: &[u8]) -> Vec<u8> {
    let body_len = 1 + KEY_LEN + payload.len();
    let mut buf = Vec::with_capacity(RECORD_HEADER_LEN + body_len);
    buf.extend_from_slice(&(body_len as u32).to_le_bytes());
    buf.extend_from_slice(&[0u8; 4]);
    buf.push(kind);
    buf.extend_from_slice(&id.to_key());
    buf.extend_from_slice(payload);
    let crc = crc32fast::hash(&buf[RECORD_HEADER_LEN..]);
    buf[4..8].copy_from_slice(&crc.to_le_bytes());
    buf
}

/// Rebuilds the entries of a log and returns them with the length of its
/// valid prefix.
fn replay(path: &Path) -> Result<(EntryMap, u64)> {
    let file = File::open(path)?;
    let mut entries = EntryMap::default();
    if file.metadata()?.len() == 0 {
        return Ok((entries, 0));
    }
    // Safety: the log is only appended through this process's handle.
    let map = unsafe { Mmap::map(&file)? };
    let bytes: &[u8] = &map;
    let mut offset = 0usize;
    while let Some((kind, id, payload, next)) = decode_record(bytes, offset) {
        match kind {
            KIND_PUT => entries.replace(id, payload.to_vec()),
            KIND_TRIM => {
                entries.delete_up_to(id);
            }
            _ => break,
        }
        offset = next;
    }
    Ok((entries, offset as u64))
}

fn decode_record(bytes: &[u8], offset: usize) -> Option<(u8, SequenceId, &[u8], usize)> {
    let header = bytes.get(offset..offset.checked_add(RECORD_HEADER_LEN)?)?;
    let body_len = u32::from_le_bytes(header[0..4].try_into().ok()?) as usize;
    let crc = u32::from_le_bytes(header[4..8].try_into().ok()?);
    if body_len < 1 + KEY_LEN {
        return None;
    }
    let start = offset + RECORD_HEADER_LEN;
    let end = start.checked_add(body_len)?;
    let body = bytes.get(start..end)?;
    if crc32fast::hash(body) != crc {
        return None;
    }
    let id = SequenceId::decode(&body[1..1 + KEY_LEN]).ok()?;
    Some((body[0], id, &body[1 + KEY_LEN..], end))
}

/// Persists stores as files under one root directory.
pub struct FilePersistence {
    root: PathBuf,
    open: Mutex<HashMap<(String, SequenceId), Arc<FileBucketStore>>>,
    supported: Vec<StorageType>,
}

impl FilePersistence {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        log::info!("file persistence rooted at {}", root.display());
        Ok(Self {
            root,
            open: Mutex::new(HashMap::new()),
            supported: vec![StorageType::Shared, StorageType::Dedicated],
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn store_dir(&self, store_id: &str) -> Result<PathBuf> {
        if store_id.is_empty()
            || store_id.starts_with('.')
            || store_id.contains(['/', '\\'])
        {
            return Err(Error::invalid(format!("invalid store id {store_id:?}")));
        }
        Ok(self.root.join(store_id))
    }

    fn bucket_path(&self, store_id: &str, bucket_id: SequenceId, storage_type: StorageType) -> Result<PathBuf> {
        let dir = match storage_type {
            StorageType::Shared => "shared",
            StorageType::Dedicated => "dedicated",
        };
        let key = bucket_id.to_key();
        let name = format!(
            "{:016x}-{:08x}-{}.log",
            bucket_id.time(),
            bucket_id.counter(),
            key[KEY_LEN - 1]
        );
        Ok(self.store_dir(store_id)?.join(dir).join(name))
    }

    fn locate(&self, store_id: &str, bucket_id: SequenceId) -> Result<Option<(PathBuf, StorageType)>> {
        for storage_type in [StorageType::Shared, StorageType::Dedicated] {
            let path = self.bucket_path(store_id, bucket_id, storage_type)?;
            if path.exists() {
                return Ok(Some((path, storage_type)));
            }
        }
        Ok(None)
    }

    fn load_metadata(&self, store_id: &str) -> Result<Vec<BucketMetadata>> {
        load_json(&self.store_dir(store_id)?.join(METADATA_FILE))
    }

    fn store_metadata(&self, store_id: &str, metadata: &[BucketMetadata]) -> Result<()> {
        store_json(&self.store_dir(store_id)?.join(METADATA_FILE), &metadata)
    }
}

impl PersistenceManager for FilePersistence {
    fn create_bucket_store(
        &self,
        store_id: &str,
        bucket_id: SequenceId,
        preferred: StorageType,
    ) -> Result<Arc<dyn BucketStore>> {
        let mut open = self.open.lock();
        if self.locate(store_id, bucket_id)?.is_some() {
            return Err(Error::invalid(format!(
                "bucket {bucket_id} of {store_id} already exists"
            )));
        }
        let path = self.bucket_path(store_id, bucket_id, preferred)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let store = Arc::new(FileBucketStore::create(path, bucket_id, preferred)?);
        open.insert((store_id.to_string(), bucket_id), Arc::clone(&store));
        log::debug!("created {preferred:?} bucket log {}", store.path().display());
        Ok(store as Arc<dyn BucketStore>)
    }

    fn get_bucket_store(
        &self,
        store_id: &str,
        bucket_id: SequenceId,
    ) -> Result<Option<Arc<dyn BucketStore>>> {
        let mut open = self.open.lock();
        let key = (store_id.to_string(), bucket_id);
        if let Some(store) = open.get(&key) {
            return Ok(Some(Arc::clone(store) as Arc<dyn BucketStore>));
        }
        let Some((path, storage_type)) = self.locate(store_id, bucket_id)? else {
            return Ok(None);
        };
        let store = Arc::new(FileBucketStore::open(path, bucket_id, storage_type)?);
        open.insert(key, Arc::clone(&store));
        Ok(Some(store as Arc<dyn BucketStore>))
    }

    fn close_bucket_store(&self, store_id: &str, bucket_id: SequenceId) -> Result<()> {
        let removed = self.open.lock().remove(&(store_id.to_string(), bucket_id));
        if let Some(store) = removed {
            store.flush()?;
        }
        Ok(())
    }

    fn delete_bucket_store(&self, store_id: &str, bucket_id: SequenceId) -> Result<()> {
        let mut open = self.open.lock();
        open.remove(&(store_id.to_string(), bucket_id));
        if let Some((path, _)) = self.locate(store_id, bucket_id)? {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
        let mut metadata = self.load_metadata(store_id)?;
        let before = metadata.len();
        metadata.retain(|meta| meta.bucket_id != bucket_id);
        if metadata.len() != before {
            self.store_metadata(store_id, &metadata)?;
        }
        Ok(())
    }

    fn bucket_metadata_for_store(&self, store_id: &str) -> Result<Vec<BucketMetadata>> {
        let _guard = self.open.lock();
        self.load_metadata(store_id)
    }

    fn update_bucket_metadata(&self, store_id: &str, metadata: &BucketMetadata) -> Result<()> {
        let _guard = self.open.lock();
        let mut all = self.load_metadata(store_id)?;
        match all.iter_mut().find(|meta| meta.bucket_id == metadata.bucket_id) {
            Some(existing) => *existing = metadata.clone(),
            None => {
                all.push(metadata.clone());
                all.sort_by_key(|meta| meta.bucket_id);
            }
        }
        self.store_metadata(store_id, &all)
    }

    fn persist_reader_levels(&self, store_id: &str, levels: &[ReaderLevel]) -> Result<()> {
        let _guard = self.open.lock();
        store_json(&self.store_dir(store_id)?.join(READERS_FILE), &levels)
    }

    fn reader_levels(&self, store_id: &str) -> Result<Vec<ReaderLevel>> {
        let _guard = self.open.lock();
        load_json(&self.store_dir(store_id)?.join(READERS_FILE))
    }

    fn supported_new_bucket_types(&self) -> Vec<StorageType> {
        self.supported.clone()
    }

    fn is_healthy(&self) -> bool {
        self.root.is_dir()
    }

    fn store_ids(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                ids.push(name.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }
}

fn load_json<T: DeserializeOwned + Default>(path: &Path) -> Result<T> {
    match fs::read(path) {
        Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(T::default()),
        Err(err) => Err(err.into()),
    }
}

fn store_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let temp = path.with_extension("json.tmp");
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&temp)?;
    serde_json::to_writer_pretty(&mut file, value)?;
    file.sync_all()?;
    fs::rename(&temp, path)?;
    Ok(())
}
