//! Bucket sizing and placement policy.
//!
//! Pure functions over a [`BucketSnapshot`]: no I/O and no interior state.
//! Each storage type has its own window parameters:
//!
//! ```text
//! start            start+min_period        start+min_period+max_enqueue_window
//!   |------ always ------|------ extendable while small ------|   (capped at max_period)
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::bucket::{BucketSnapshot, BucketState};
use crate::config::duration_ms;
use crate::core::{Error, Result, SequenceId};

/// Physical backing strategy of a bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageType {
    /// Buckets share physical space with other buckets of the store.
    Shared,
    /// The bucket owns its own physical space.
    Dedicated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketTypeParams {
    /// Every id within this period of the bucket start belongs to the bucket.
    #[serde(with = "duration_ms")]
    pub min_period: Duration,
    /// Hard cap on how far past its start a bucket may be extended.
    #[serde(with = "duration_ms")]
    pub max_period: Duration,
    /// Extension allowed beyond `min_period` while the bucket is small.
    #[serde(with = "duration_ms")]
    pub max_enqueue_window: Duration,
    /// Byte size at which a bucket stops accepting extensions.
    pub min_size: u64,
}

impl BucketTypeParams {
    pub const SHARED_DEFAULT: BucketTypeParams = BucketTypeParams {
        min_period: Duration::from_secs(30),
        max_period: Duration::from_secs(5 * 60),
        max_enqueue_window: Duration::from_secs(60),
        min_size: 256 * 1024,
    };

    pub const DEDICATED_DEFAULT: BucketTypeParams = BucketTypeParams {
        min_period: Duration::from_secs(5 * 60),
        max_period: Duration::from_secs(60 * 60),
        max_enqueue_window: Duration::from_secs(5 * 60),
        min_size: 32 * 1024 * 1024,
    };

    pub fn new(
        min_period: Duration,
        max_period: Duration,
        max_enqueue_window: Duration,
        min_size: u64,
    ) -> Result<Self> {
        let params = Self {
            min_period,
            max_period,
            max_enqueue_window,
            min_size,
        };
        params.validate()?;
        Ok(params)
    }

    pub fn validate(&self) -> Result<()> {
        if self.min_period_ms() == 0 {
            return Err(Error::invalid("bucket min_period must be at least 1ms"));
        }
        if self.max_period < self.min_period {
            return Err(Error::invalid("bucket max_period must not be below min_period"));
        }
        Ok(())
    }

    pub fn min_period_ms(&self) -> u64 {
        millis(self.min_period)
    }

    pub fn max_period_ms(&self) -> u64 {
        millis(self.max_period)
    }

    pub fn max_enqueue_window_ms(&self) -> u64 {
        millis(self.max_enqueue_window)
    }

    /// Offset from the bucket start past which extension is never allowed.
    fn extension_limit_ms(&self) -> u64 {
        self.min_period_ms()
            .saturating_add(self.max_enqueue_window_ms())
            .min(self.max_period_ms())
            .max(self.min_period_ms())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BucketConfig {
    pub shared: BucketTypeParams,
    pub dedicated: BucketTypeParams,
    /// Bytes accumulated in shared buckets above which new buckets get
    /// dedicated storage.
    pub dedicated_transition_bytes: u64,
}

impl Default for BucketConfig {
    fn default() -> Self {
        Self {
            shared: BucketTypeParams::SHARED_DEFAULT,
            dedicated: BucketTypeParams::DEDICATED_DEFAULT,
            dedicated_transition_bytes: 16 * 1024 * 1024,
        }
    }
}

impl BucketConfig {
    pub fn new(
        shared: BucketTypeParams,
        dedicated: BucketTypeParams,
        dedicated_transition_bytes: u64,
    ) -> Result<Self> {
        let config = Self {
            shared,
            dedicated,
            dedicated_transition_bytes,
        };
        config.validate()?;
        Ok(config)
    }

    /// Same window parameters for both storage types.
    pub fn uniform(params: BucketTypeParams, dedicated_transition_bytes: u64) -> Result<Self> {
        Self::new(params, params, dedicated_transition_bytes)
    }

    pub fn validate(&self) -> Result<()> {
        self.shared.validate()?;
        self.dedicated.validate()
    }

    pub fn params(&self, storage_type: StorageType) -> &BucketTypeParams {
        match storage_type {
            StorageType::Shared => &self.shared,
            StorageType::Dedicated => &self.dedicated,
        }
    }

    /// Whether an insert of `candidate` may land in `bucket`.
    pub fn could_bucket_contain_key(
        &self,
        bucket: &BucketSnapshot,
        candidate: SequenceId,
        min_enqueue_level: SequenceId,
    ) -> bool {
        if bucket.state != BucketState::Open || candidate < bucket.bucket_id {
            return false;
        }
        let params = self.params(bucket.storage_type);
        let offset = candidate.time().saturating_sub(bucket.bucket_id.time());
        if offset < params.min_period_ms() {
            return true;
        }
        if bucket.last_id.is_some_and(|last| candidate <= last) {
            return true;
        }
        if candidate < min_enqueue_level {
            return false;
        }
        if bucket.byte_count >= params.min_size || offset >= params.max_period_ms() {
            return false;
        }
        offset < params.extension_limit_ms()
    }

    /// Start id for a new bucket receiving `candidate`, placed after `previous`.
    ///
    /// # Errors
    ///
    /// - `Error::InvalidArgument`: `candidate` overlaps the minimum period of an
    ///   open previous bucket, or does not follow a closed previous bucket.
    pub fn new_bucket_id(
        &self,
        previous: Option<&BucketSnapshot>,
        candidate: SequenceId,
        storage_type: StorageType,
    ) -> Result<SequenceId> {
        let period = self.params(storage_type).min_period_ms();
        let mut start = SequenceId::at_time(candidate.time() - candidate.time() % period);

        if let Some(prev) = previous {
            if candidate <= prev.bucket_id {
                return Err(Error::invalid(format!(
                    "id {candidate} does not follow bucket {}",
                    prev.bucket_id
                )));
            }
            if let Some(last) = prev.last_id {
                if candidate <= last {
                    return Err(Error::invalid(format!(
                        "id {candidate} falls behind {:?} bucket {} ending at {last}",
                        prev.state, prev.bucket_id
                    )));
                }
                start = start.max(last.after());
            }
            if prev.state == BucketState::Open {
                let prev_period = self.params(prev.storage_type).min_period_ms();
                let min_period_end =
                    SequenceId::at_time(prev.bucket_id.time().saturating_add(prev_period));
                if candidate < min_period_end {
                    return Err(Error::invalid(format!(
                        "id {candidate} overlaps the minimum period of bucket {}",
                        prev.bucket_id
                    )));
                }
                start = start.max(min_period_end);
            }
        }

        if start > candidate {
            return Err(Error::invalid(format!(
                "bucket start {start} would follow id {candidate}"
            )));
        }
        Ok(start)
    }

    /// Exclusive upper time bound for any insert that could still land in
    /// `bucket`. Size is ignored since trimming can shrink a bucket again.
    pub fn insertable_until(&self, bucket: &BucketSnapshot) -> u64 {
        let last_end = bucket
            .last_id
            .map_or(bucket.bucket_id.time(), |last| last.time().saturating_add(1));
        if bucket.state != BucketState::Open {
            return last_end;
        }
        let params = self.params(bucket.storage_type);
        bucket
            .bucket_id
            .time()
            .saturating_add(params.extension_limit_ms())
            .max(last_end)
    }

    /// Last millisecond an insert could still land in `bucket`.
    pub fn max_insertable_time(&self, bucket: &BucketSnapshot) -> u64 {
        self.insertable_until(bucket).saturating_sub(1)
    }

    /// True once no insert at or above `min_enqueue_level` can reach `bucket`.
    pub fn is_past_insert_window(&self, bucket: &BucketSnapshot, min_enqueue_level: SequenceId) -> bool {
        min_enqueue_level >= SequenceId::at_time(self.insertable_until(bucket))
    }

    /// Storage type for the next new bucket given the bytes ever inserted
    /// into shared buckets.
    pub fn storage_type_for(&self, accumulated_bytes: u64, supported: &[StorageType]) -> StorageType {
        let wants_dedicated = accumulated_bytes > self.dedicated_transition_bytes;
        if wants_dedicated && supported.contains(&StorageType::Dedicated) {
            StorageType::Dedicated
        } else if supported.contains(&StorageType::Shared) || supported.is_empty() {
            StorageType::Shared
        } else {
            StorageType::Dedicated
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(min_ms: u64, max_ms: u64, window_ms: u64, min_size: u64) -> BucketTypeParams {
        BucketTypeParams::new(
            Duration::from_millis(min_ms),
            Duration::from_millis(max_ms),
            Duration::from_millis(window_ms),
            min_size,
        )
        .expect("params")
    }

    fn snapshot(start: u64, last: Option<u64>, bytes: u64, state: BucketState) -> BucketSnapshot {
        BucketSnapshot {
            bucket_id: SequenceId::at_time(start),
            storage_type: StorageType::Shared,
            state,
            first_id: last.map(|t| SequenceId::new(t, 0)),
            last_id: last.map(|t| SequenceId::new(t, 0)),
            entry_count: u64::from(last.is_some()),
            byte_count: bytes,
            count_accurate: true,
        }
    }

    fn config() -> BucketConfig {
        BucketConfig::uniform(params(3_000, 10_000, 2_000, 1_000), 10_000).expect("config")
    }

    #[test]
    fn min_period_always_contains() {
        let c = config();
        let b = snapshot(0, Some(100), 5_000, BucketState::Open);
        assert!(c.could_bucket_contain_key(&b, SequenceId::new(2_999, 0), SequenceId::MAXIMUM));
    }

    #[test]
    fn extension_only_while_small_and_inside_window() {
        let c = config();
        let small = snapshot(0, Some(100), 10, BucketState::Open);
        let big = snapshot(0, Some(100), 1_000, BucketState::Open);
        let id = SequenceId::new(4_000, 0);
        assert!(c.could_bucket_contain_key(&small, id, SequenceId::MINIMUM));
        assert!(!c.could_bucket_contain_key(&big, id, SequenceId::MINIMUM));
        assert!(!c.could_bucket_contain_key(&small, SequenceId::new(5_000, 0), SequenceId::MINIMUM));
        assert!(!c.could_bucket_contain_key(&small, id, SequenceId::new(4_500, 0)));
    }

    #[test]
    fn known_span_contains_even_when_big() {
        let c = config();
        let b = snapshot(0, Some(4_500), 5_000, BucketState::Open);
        assert!(c.could_bucket_contain_key(&b, SequenceId::new(4_000, 0), SequenceId::MINIMUM));
    }

    #[test]
    fn closed_and_deleted_never_match() {
        let c = config();
        for state in [BucketState::Closed, BucketState::Deleted] {
            let b = snapshot(0, Some(100), 0, state);
            assert!(!c.could_bucket_contain_key(&b, SequenceId::new(50, 0), SequenceId::MINIMUM));
        }
    }

    #[test]
    fn new_bucket_id_aligns_to_window() {
        let c = config();
        let id = c
            .new_bucket_id(None, SequenceId::new(7_250, 0), StorageType::Shared)
            .expect("bucket id");
        assert_eq!(id, SequenceId::at_time(6_000));
    }

    #[test]
    fn new_bucket_id_follows_previous_bucket() {
        let c = config();
        let prev = snapshot(0, Some(4_900), 5_000, BucketState::Open);
        let id = c
            .new_bucket_id(Some(&prev), SequenceId::new(5_100, 0), StorageType::Shared)
            .expect("bucket id");
        assert_eq!(id, SequenceId::new(4_900, 0).after());

        let prev = snapshot(0, Some(100), 10, BucketState::Open);
        let id = c
            .new_bucket_id(Some(&prev), SequenceId::new(3_100, 0), StorageType::Shared)
            .expect("bucket id");
        assert_eq!(id, SequenceId::at_time(3_000));
    }

    #[test]
    fn new_bucket_id_rejects_overlap() {
        let c = config();
        let open = snapshot(0, Some(100), 10, BucketState::Open);
        let err = c
            .new_bucket_id(Some(&open), SequenceId::new(1_500, 0), StorageType::Shared)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));

        let closed = snapshot(0, Some(2_000), 10, BucketState::Closed);
        let err = c
            .new_bucket_id(Some(&closed), SequenceId::new(1_500, 0), StorageType::Shared)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));

        let id = c
            .new_bucket_id(Some(&closed), SequenceId::new(2_500, 0), StorageType::Shared)
            .expect("follows closed bucket");
        assert_eq!(id, SequenceId::new(2_000, 0).after());
    }

    #[test]
    fn insert_window_tracks_extension_limit() {
        let c = config();
        let open = snapshot(0, Some(100), 10, BucketState::Open);
        assert_eq!(c.insertable_until(&open), 5_000);
        assert!(!c.is_past_insert_window(&open, SequenceId::at_time(4_999)));
        assert!(c.is_past_insert_window(&open, SequenceId::at_time(5_000)));

        let closed = snapshot(0, Some(100), 10, BucketState::Closed);
        assert_eq!(c.insertable_until(&closed), 101);
    }

    #[test]
    fn storage_type_switches_after_threshold() {
        let c = config();
        let both = [StorageType::Shared, StorageType::Dedicated];
        assert_eq!(c.storage_type_for(10_000, &both), StorageType::Shared);
        assert_eq!(c.storage_type_for(10_001, &both), StorageType::Dedicated);
        assert_eq!(c.storage_type_for(10_001, &[StorageType::Shared]), StorageType::Shared);
        assert_eq!(c.storage_type_for(0, &[StorageType::Dedicated]), StorageType::Dedicated);
    }

    #[test]
    fn invalid_params_are_rejected() {
        assert!(BucketTypeParams::new(Duration::ZERO, Duration::from_secs(1), Duration::ZERO, 0).is_err());
        assert!(BucketTypeParams::new(
            Duration::from_secs(2),
            Duration::from_secs(1),
            Duration::ZERO,
            0
        )
        .is_err());
    }
}
