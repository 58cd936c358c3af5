use std::ops::{Add, AddAssign};

use serde::{Deserialize, Serialize};

/// Restored bucket counts below this many entries are recounted before being
/// reported. Counts at or above it are trusted as approximations until the
/// background recount reaches the bucket.
pub const MIN_INACCURATE_COUNT: u64 = 1_000;

/// Entries, bytes and buckets covered by a count query.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredCount {
    pub entry_count: u64,
    pub retained_bytes: u64,
    pub bucket_count: u64,
}

impl StoredCount {
    pub const ZERO: StoredCount = StoredCount {
        entry_count: 0,
        retained_bytes: 0,
        bucket_count: 0,
    };

    pub fn entries(entry_count: u64, retained_bytes: u64) -> Self {
        Self {
            entry_count,
            retained_bytes,
            bucket_count: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entry_count == 0
    }
}

impl Add for StoredCount {
    type Output = StoredCount;

    fn add(self, rhs: StoredCount) -> StoredCount {
        StoredCount {
            entry_count: self.entry_count + rhs.entry_count,
            retained_bytes: self.retained_bytes + rhs.retained_bytes,
            bucket_count: self.bucket_count + rhs.bucket_count,
        }
    }
}

impl AddAssign for StoredCount {
    fn add_assign(&mut self, rhs: StoredCount) {
        *self = *self + rhs;
    }
}

/// A bucket's tracked count together with whether it can be trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketCount {
    pub entries: u64,
    pub bytes: u64,
    pub accurate: bool,
}

impl BucketCount {
    /// Whether a query needing an exact answer must rescan the bucket first.
    pub fn needs_recount(&self) -> bool {
        !self.accurate && self.entries < MIN_INACCURATE_COUNT
    }

    pub fn as_stored(&self) -> StoredCount {
        StoredCount {
            entry_count: self.entries,
            retained_bytes: self.bytes,
            bucket_count: 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recount_threshold_is_strictly_below() {
        let small = BucketCount {
            entries: MIN_INACCURATE_COUNT - 1,
            bytes: 0,
            accurate: false,
        };
        let at = BucketCount {
            entries: MIN_INACCURATE_COUNT,
            ..small
        };
        let trusted = BucketCount {
            accurate: true,
            ..small
        };
        assert!(small.needs_recount());
        assert!(!at.needs_recount());
        assert!(!trusted.needs_recount());
    }

    #[test]
    fn counts_add_up() {
        let mut total = StoredCount::ZERO;
        total += StoredCount::entries(2, 40);
        total += StoredCount {
            entry_count: 1,
            retained_bytes: 10,
            bucket_count: 1,
        };
        assert_eq!(total.entry_count, 3);
        assert_eq!(total.retained_bytes, 50);
        assert_eq!(total.bucket_count, 1);
    }
}
