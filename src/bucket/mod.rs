//! The bucket engine: time-windowed storage units and the manager routing
//! inserts, reads, counts and deletes across them.

#[allow(clippy::module_inception)]
mod bucket;
pub mod config;
mod count;
pub mod cursor;
pub mod manager;
mod position;

pub use bucket::{Bucket, BucketSnapshot, BucketState, StoreLease};
pub use config::{BucketConfig, BucketTypeParams, StorageType};
pub use count::{BucketCount, StoredCount, MIN_INACCURATE_COUNT};
pub use cursor::{BucketIterator, Cursor};
pub use manager::BucketManager;
pub use position::Position;
