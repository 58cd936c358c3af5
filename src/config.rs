//! Store-level configuration.
//!
//! All configuration types are plain structs with `Default` and serde
//! support; durations are written as milliseconds.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::bucket::BucketConfig;
use crate::core::{Error, Result};
use crate::store::RetentionConfig;

const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub bucket: BucketConfig,
    pub retention: RetentionConfig,
    /// How often background cleanup runs once started.
    #[serde(with = "duration_ms")]
    pub cleanup_interval: Duration,
    /// Shift applied to the local clock to derive store time.
    pub clock_offset_ms: i64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            bucket: BucketConfig::default(),
            retention: RetentionConfig::default(),
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
            clock_offset_ms: 0,
        }
    }
}

impl StoreConfig {
    pub fn validate(&self) -> Result<()> {
        self.bucket.validate()?;
        self.retention.validate()?;
        if self.cleanup_interval.is_zero() {
            return Err(Error::invalid("cleanup interval must be non-zero"));
        }
        Ok(())
    }
}

/// Serializes a `Duration` as whole milliseconds.
pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
