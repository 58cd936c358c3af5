//! Visibility of enqueued entries.
//!
//! An entry becomes visible once store time has passed its id's millisecond
//! and every enqueue that obtained a smaller id has finished. The tracker
//! hands out ids, remembers which are still in flight, and walks a cursor
//! forward to the newest entry that satisfies both.

use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::bucket::{BucketManager, Cursor, Position};
use crate::core::{Result, SequenceId, SequenceIdGenerator, StoreClock};

struct Visible {
    cursor: Cursor,
    last_available: Option<SequenceId>,
}

pub struct LastAvailableTracker {
    manager: Arc<BucketManager>,
    clock: Arc<StoreClock>,
    ids: SequenceIdGenerator,
    in_flight: Mutex<BTreeSet<SequenceId>>,
    visible: Mutex<Visible>,
}

impl LastAvailableTracker {
    /// Tracker over `manager`'s stored entries. Ids for times that already
    /// hold entries continue after the highest stored counter.
    pub fn new(manager: Arc<BucketManager>, clock: Arc<StoreClock>) -> Result<Self> {
        let ids = SequenceIdGenerator::new();
        let now = clock.now();
        ids.forget_before(now);
        let mut stored = Cursor::new(Arc::clone(&manager));
        stored.advance_to(SequenceId::at_time(now))?;
        while let Some(entry) = stored.next()? {
            ids.advance_past(entry.id);
        }
        drop(stored);
        let cursor = Cursor::new(Arc::clone(&manager));
        Ok(Self {
            manager,
            clock,
            ids,
            in_flight: Mutex::new(BTreeSet::new()),
            visible: Mutex::new(Visible {
                cursor,
                last_available: None,
            }),
        })
    }

    /// Reserves the id of an entry that becomes visible at `available_at_ms`.
    ///
    /// Times already behind store time are moved up to it, so an id never
    /// lands below a level readers may have been shown. The id stays in
    /// flight until [`LastAvailableTracker::enqueue_finished`].
    pub fn request_ack_id(&self, available_at_ms: u64) -> SequenceId {
        let mut in_flight = self.in_flight.lock();
        let now = self.clock.now();
        self.ids.forget_before(now);
        let id = self.ids.generate(available_at_ms.max(now));
        in_flight.insert(id);
        id
    }

    /// Marks the enqueue of `id` complete, whether it was stored or not.
    pub fn enqueue_finished(&self, id: SequenceId) {
        self.in_flight.lock().remove(&id.without_position());
    }

    /// Number of enqueues between `request_ack_id` and `enqueue_finished`.
    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().len()
    }

    /// Lowest id that may still be inserted: the oldest in-flight id, or the
    /// current store time when nothing is in flight.
    pub fn min_enqueue_level(&self) -> SequenceId {
        let in_flight = self.in_flight.lock();
        let now = SequenceId::at_time(self.clock.now());
        in_flight.first().map_or(now, |first| first.before().min(now))
    }

    /// Moves the last available id forward as far as stored entries allow.
    ///
    /// Everything below the minimum enqueue level is final, so it doubles as
    /// the visibility limit. The current millisecond is excluded since ids
    /// for it can still be handed out.
    pub fn update_available(&self) -> Result<Option<SequenceId>> {
        let limit = self.min_enqueue_level();
        let mut visible = self.visible.lock();
        if let Some(passed) = visible.cursor.advance_to(limit)? {
            visible.last_available = Some(passed);
        }
        Ok(visible.last_available)
    }

    /// Newest visible id as of the last [`LastAvailableTracker::update_available`].
    pub fn last_available(&self) -> Option<SequenceId> {
        self.visible.lock().last_available
    }

    /// Position just after the last available entry.
    pub fn position(&self) -> Position {
        self.visible.lock().cursor.position()
    }

    /// Store time at which the first stored entry after `after` (or after the
    /// last available entry, whichever is later) becomes visible. `None` when
    /// no such entry is stored.
    pub fn time_of_next_message(&self, after: Option<&Position>) -> Result<Option<u64>> {
        let tracked = self.position();
        let from = match after {
            Some(position) if *position > tracked => *position,
            _ => tracked,
        };
        let mut cursor = Cursor::at(Arc::clone(&self.manager), Some(&from))?;
        Ok(cursor
            .peek_up_to(SequenceId::MAXIMUM)?
            .map(|entry| entry.id.time()))
    }
}

impl std::fmt::Debug for LastAvailableTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LastAvailableTracker")
            .field("store_id", &self.manager.store_id())
            .field("last_available", &self.last_available())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}
