use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::duration_ms;
use crate::core::{Error, Result, SequenceId};

/// Default guaranteed retention: none, readers alone hold entries back.
const DEFAULT_GUARANTEED_RETENTION: Duration = Duration::ZERO;
/// Default max lifetime: 14 days
const DEFAULT_MAX_LIFETIME: Duration = Duration::from_secs(14 * 24 * 60 * 60);

/// Configuration for entry retention and cleanup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    /// Entries younger than this are kept even after every reader has
    /// committed past them.
    #[serde(with = "duration_ms")]
    pub guaranteed_retention: Duration,
    /// Entries older than this are deleted even if a reader has not
    /// committed past them.
    #[serde(with = "duration_ms")]
    pub max_lifetime: Duration,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            guaranteed_retention: DEFAULT_GUARANTEED_RETENTION,
            max_lifetime: DEFAULT_MAX_LIFETIME,
        }
    }
}

impl RetentionConfig {
    pub fn new(guaranteed_retention: Duration, max_lifetime: Duration) -> Result<Self> {
        let config = Self {
            guaranteed_retention,
            max_lifetime,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_lifetime < self.guaranteed_retention {
            return Err(Error::invalid(
                "max_lifetime must not be shorter than guaranteed_retention",
            ));
        }
        Ok(())
    }
}

/// Highest id cleanup may delete at store time `now_ms` (inclusive).
///
/// Entries past `max_lifetime` always go. Otherwise an entry goes once it
/// is older than `guaranteed_retention` and every reader has committed it.
pub fn clean_level<I>(now_ms: u64, reader_levels: I, config: &RetentionConfig) -> SequenceId
where
    I: IntoIterator<Item = SequenceId>,
{
    let lifetime_level = SequenceId::at_time(now_ms.saturating_sub(millis(config.max_lifetime)));
    let retention_level =
        SequenceId::at_time(now_ms.saturating_sub(millis(config.guaranteed_retention)));
    let committed = reader_levels
        .into_iter()
        .min()
        .map_or(retention_level, |level| level.min(retention_level));
    lifetime_level.max(committed)
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Outcome of one cleanup pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// Level entries were deleted up to, after capping at last available.
    pub clean_level: Option<SequenceId>,
    pub last_available: Option<SequenceId>,
    pub entries_deleted: u64,
    pub buckets_closed: usize,
    pub stores_closed: usize,
    pub buckets_recounted: usize,
    pub metadata_synced: usize,
}
