use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::SequenceId;

/// Resumable checkpoint of a cursor.
///
/// `ordinal` counts entries the cursor has consumed from the bucket since it
/// entered it; `last_id` is the id of the last entry returned, if any. Two
/// positions compare only when they were produced by the same manager
/// generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub generation: u64,
    pub bucket_id: SequenceId,
    pub ordinal: u64,
    pub last_id: Option<SequenceId>,
}

impl Position {
    /// Position before any entry of the given manager generation.
    pub fn start(generation: u64) -> Self {
        Self {
            generation,
            bucket_id: SequenceId::MINIMUM,
            ordinal: 0,
            last_id: None,
        }
    }

    /// Exclusive lower bound of entries still ahead of this position.
    pub fn resume_after(&self) -> SequenceId {
        self.last_id.unwrap_or(self.bucket_id.before())
    }
}

impl PartialOrd for Position {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        if self.generation != other.generation {
            return None;
        }
        Some(
            self.resume_after()
                .cmp(&other.resume_after())
                .then(self.bucket_id.cmp(&other.bucket_id))
                .then(self.ordinal.cmp(&other.ordinal)),
        )
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "g{}/{}#{}", self.generation, self.bucket_id, self.ordinal)?;
        if let Some(last) = self.last_id {
            write!(f, "@{last}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positions_order_within_a_generation() {
        let start = Position::start(1);
        let later = Position {
            generation: 1,
            bucket_id: SequenceId::at_time(3_000),
            ordinal: 2,
            last_id: Some(SequenceId::new(3_102, 0)),
        };
        assert!(start < later);
        assert_eq!(start.resume_after(), SequenceId::MINIMUM);
        assert_eq!(later.resume_after(), SequenceId::new(3_102, 0));
    }

    #[test]
    fn positions_from_other_generations_do_not_compare() {
        let a = Position::start(1);
        let b = Position::start(2);
        assert_eq!(a.partial_cmp(&b), None);
        assert!(!(a < b) && !(a > b));
    }
}
