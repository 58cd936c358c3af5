//! Sequence identifiers and their generator.
//!
//! A [`SequenceId`] is both the queue position of an entry and the cursor token
//! used to resume iteration. Ids order by time, then by a disambiguating
//! counter, then by a bound flag that lets callers build exclusive range
//! limits (`before` / `after` an id) without minting a real entry id.
//!
//! The on-disk key form is 13 big-endian bytes (`time | counter | bound`), so
//! byte-wise comparison of keys agrees with `Ord`.

use std::cmp::Ordering as CmpOrdering;
use std::fmt;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::core::{Error, Result};

/// Length of the encoded ordering key.
pub const KEY_LEN: usize = 13;
/// Length of an encoded id that carries an in-bucket position.
pub const KEY_WITH_POSITION_LEN: usize = KEY_LEN + 8;

/// Largest time (ms) the generator hands out ids for.
pub const MAX_GENERATED_TIME: u64 = u64::MAX - 1;
/// Counters stop below this so `upper_bound_at` stays above every real id.
const MAX_COUNTER: u32 = u32::MAX;

/// Where a synthetic id sits relative to the real id with the same
/// time and counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdBound {
    Before = 0,
    Exact = 1,
    After = 2,
}

impl IdBound {
    fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            0 => Ok(IdBound::Before),
            1 => Ok(IdBound::Exact),
            2 => Ok(IdBound::After),
            _ => Err(Error::Corrupt("invalid sequence id bound")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SequenceId {
    time: u64,
    counter: u32,
    bound: IdBound,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    position: Option<u64>,
}

impl SequenceId {
    /// Precedes every id, real or synthetic.
    pub const MINIMUM: SequenceId = SequenceId {
        time: 0,
        counter: 0,
        bound: IdBound::Before,
        position: None,
    };

    /// Follows every id, real or synthetic.
    pub const MAXIMUM: SequenceId = SequenceId {
        time: u64::MAX,
        counter: u32::MAX,
        bound: IdBound::After,
        position: None,
    };

    /// A real entry id.
    pub const fn new(time: u64, counter: u32) -> Self {
        Self {
            time,
            counter,
            bound: IdBound::Exact,
            position: None,
        }
    }

    /// Lower bound that precedes every id with time `time_ms` or later.
    pub const fn at_time(time_ms: u64) -> Self {
        Self {
            time: time_ms,
            counter: 0,
            bound: IdBound::Before,
            position: None,
        }
    }

    /// Upper bound that follows every id with time `time_ms` or earlier.
    pub const fn upper_bound_at(time_ms: u64) -> Self {
        Self {
            time: time_ms,
            counter: u32::MAX,
            bound: IdBound::After,
            position: None,
        }
    }

    /// Synthetic id sorting immediately after `self` and before any later real id.
    pub fn after(self) -> Self {
        Self {
            bound: IdBound::After,
            position: None,
            ..self
        }
    }

    /// Synthetic id sorting immediately before `self`.
    pub fn before(self) -> Self {
        Self {
            bound: IdBound::Before,
            position: None,
            ..self
        }
    }

    pub fn with_position(self, position: u64) -> Self {
        Self {
            position: Some(position),
            ..self
        }
    }

    pub fn without_position(self) -> Self {
        Self {
            position: None,
            ..self
        }
    }

    pub fn time(&self) -> u64 {
        self.time
    }

    pub fn counter(&self) -> u32 {
        self.counter
    }

    pub fn bound(&self) -> IdBound {
        self.bound
    }

    /// In-bucket position, when the id was read back from a bucket store.
    pub fn position(&self) -> Option<u64> {
        self.position
    }

    /// True for ids naming a real entry rather than a range bound.
    pub fn is_exact(&self) -> bool {
        self.bound == IdBound::Exact
    }

    /// Encodes the ordering key.
    pub fn to_key(&self) -> [u8; KEY_LEN] {
        let mut key = [0u8; KEY_LEN];
        key[0..8].copy_from_slice(&self.time.to_be_bytes());
        key[8..12].copy_from_slice(&self.counter.to_be_bytes());
        key[12] = self.bound as u8;
        key
    }

    /// Appends the key, followed by the position when present.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.to_key());
        if let Some(position) = self.position {
            buf.extend_from_slice(&position.to_be_bytes());
        }
    }

    /// Decodes a key produced by [`SequenceId::to_key`] or
    /// [`SequenceId::encode_into`].
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != KEY_LEN && bytes.len() != KEY_WITH_POSITION_LEN {
            return Err(Error::Corrupt("sequence id length"));
        }
        let time = u64::from_be_bytes(slice_array(&bytes[0..8])?);
        let counter = u32::from_be_bytes(slice_array(&bytes[8..12])?);
        let bound = IdBound::from_byte(bytes[12])?;
        let position = if bytes.len() == KEY_WITH_POSITION_LEN {
            Some(u64::from_be_bytes(slice_array(&bytes[KEY_LEN..])?))
        } else {
            None
        };
        Ok(Self {
            time,
            counter,
            bound,
            position,
        })
    }
}

fn slice_array<const N: usize>(bytes: &[u8]) -> Result<[u8; N]> {
    bytes
        .try_into()
        .map_err(|_| Error::Corrupt("sequence id length"))
}

impl PartialEq for SequenceId {
    fn eq(&self, other: &Self) -> bool {
        self.time == other.time && self.counter == other.counter && self.bound == other.bound
    }
}

impl Eq for SequenceId {}

impl Hash for SequenceId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.time.hash(state);
        self.counter.hash(state);
        self.bound.hash(state);
    }
}

impl PartialOrd for SequenceId {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for SequenceId {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.time
            .cmp(&other.time)
            .then(self.counter.cmp(&other.counter))
            .then(self.bound.cmp(&other.bound))
    }
}

impl fmt::Display for SequenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.time, self.counter)?;
        match self.bound {
            IdBound::Before => write!(f, "-"),
            IdBound::Exact => Ok(()),
            IdBound::After => write!(f, "+"),
        }
    }
}

/// Hands out [`SequenceId`]s with one counter per millisecond.
///
/// An id for `t` only has to beat ids already handed out for `t` or earlier,
/// so a request for a far future time never pushes up ids for the present.
/// Counters for times before the floor set by
/// [`SequenceIdGenerator::forget_before`] are dropped; requests for those
/// times are raised to the floor.
#[derive(Debug, Default)]
pub struct SequenceIdGenerator {
    watermarks: Mutex<Watermarks>,
}

#[derive(Debug, Default)]
struct Watermarks {
    floor: u64,
    next_counter: BTreeMap<u64, u32>,
}

impl SequenceIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns an id for `time_ms` greater than every id generated so far
    /// for the same or an earlier time. Counter exhaustion carries into the
    /// next millisecond.
    pub fn generate(&self, time_ms: u64) -> SequenceId {
        let mut marks = self.watermarks.lock();
        let mut time = time_ms.clamp(marks.floor, MAX_GENERATED_TIME);
        loop {
            let next = marks.next_counter.entry(time).or_insert(0);
            if *next < MAX_COUNTER {
                let counter = *next;
                *next += 1;
                return SequenceId::new(time, counter);
            }
            time += 1;
        }
    }

    /// Ensures every future id for `id`'s time or later is greater than `id`.
    pub fn advance_past(&self, id: SequenceId) {
        let mut marks = self.watermarks.lock();
        if id.time() < marks.floor || id.time() > MAX_GENERATED_TIME {
            return;
        }
        let counter = id.counter().saturating_add(1).min(MAX_COUNTER);
        let next = marks.next_counter.entry(id.time()).or_insert(0);
        *next = (*next).max(counter);
    }

    /// Drops the counters of times before `time_ms`. Later requests for
    /// those times get ids at `time_ms`.
    pub fn forget_before(&self, time_ms: u64) {
        let mut marks = self.watermarks.lock();
        if time_ms <= marks.floor {
            return;
        }
        marks.floor = time_ms.min(MAX_GENERATED_TIME);
        let floor = marks.floor;
        marks.next_counter = marks.next_counter.split_off(&floor);
    }

    /// Number of milliseconds with a live counter.
    pub fn tracked_times(&self) -> usize {
        self.watermarks.lock().next_counter.len()
    }
}
