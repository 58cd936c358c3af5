//! Durable, time-ordered, multi-reader queue storage.
//!
//! Entries are keyed by [`SequenceId`] and stored in time-windowed buckets
//! managed by a [`BucketManager`]. A [`QueueStore`] adds delayed visibility,
//! named readers with persisted progress, and retention-driven cleanup on top.

pub mod bucket;
pub mod config;
pub mod core;
pub mod persistence;
pub mod store;

pub use crate::bucket::{BucketConfig, BucketManager, BucketTypeParams, Cursor, Position, StorageType};
pub use crate::config::StoreConfig;
pub use crate::core::{Clock, Error, ManualClock, Result, SequenceId, StoreClock, SystemClock};
pub use crate::persistence::{MemoryPersistence, PersistenceManager, StoredEntry};
#[cfg(feature = "file")]
pub use crate::persistence::FilePersistence;
pub use crate::store::{CleanupReport, QueueStore, RetentionConfig, StoreReader, StoreRegistry};
