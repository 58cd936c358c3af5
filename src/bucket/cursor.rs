//! Traversal across buckets.
//!
//! A [`BucketIterator`] walks one bucket through a leased store handle, fetching
//! in small batches. A [`Cursor`] chains iterators bucket by bucket. Buckets
//! are looked up by id on every hop, so a cursor is unaffected by buckets
//! behind it being deleted, and it discovers buckets created after it reached
//! the end.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::bucket::{Bucket, BucketManager, Position, StoreLease};
use crate::core::{Error, Result, SequenceId};
use crate::persistence::StoredEntry;

const SCAN_BATCH: usize = 64;

pub struct BucketIterator {
    lease: StoreLease,
    /// Exclusive lower bound of the next store fetch.
    fetched_up_to: SequenceId,
    /// Highest id returned or skipped.
    consumed_up_to: SequenceId,
    ordinal: u64,
    buffer: VecDeque<StoredEntry>,
}

impl BucketIterator {
    pub(crate) fn new(lease: StoreLease, after: SequenceId, ordinal: u64) -> Self {
        Self {
            lease,
            fetched_up_to: after,
            consumed_up_to: after,
            ordinal,
            buffer: VecDeque::new(),
        }
    }

    pub fn bucket_id(&self) -> SequenceId {
        self.lease.bucket().bucket_id()
    }

    pub fn bucket(&self) -> &Arc<Bucket> {
        self.lease.bucket()
    }

    /// Entries returned or skipped in this bucket so far.
    pub fn ordinal(&self) -> u64 {
        self.ordinal
    }

    fn fill(&mut self) -> Result<()> {
        if !self.buffer.is_empty() {
            return Ok(());
        }
        let batch = self.lease.scan_after(self.fetched_up_to, SCAN_BATCH)?;
        if let Some(last) = batch.last() {
            self.fetched_up_to = last.id;
        }
        self.buffer.extend(batch);
        Ok(())
    }

    pub fn peek(&mut self) -> Result<Option<&StoredEntry>> {
        self.fill()?;
        Ok(self.buffer.front())
    }

    /// Next entry of this bucket; its id carries the in-bucket position.
    pub fn next_entry(&mut self) -> Result<Option<StoredEntry>> {
        self.fill()?;
        let Some(mut entry) = self.buffer.pop_front() else {
            return Ok(None);
        };
        self.consumed_up_to = entry.id;
        entry.id = entry.id.with_position(self.ordinal);
        self.ordinal += 1;
        Ok(Some(entry))
    }

    /// Drops prefetched entries past `limit`; they are fetched again later.
    ///
    /// Ids above a reader's limit may still be inserted out of order, so a
    /// prefetch beyond it cannot be trusted once the limit moves.
    pub fn discard_after(&mut self, limit: SequenceId) {
        let buffered = self.buffer.len();
        while self.buffer.back().is_some_and(|entry| entry.id > limit) {
            self.buffer.pop_back();
        }
        if self.buffer.len() != buffered {
            self.fetched_up_to = self
                .buffer
                .back()
                .map_or(self.consumed_up_to, |entry| entry.id);
        }
    }

    /// Skips every entry `<= target` and returns the last one skipped.
    pub fn advance_to(&mut self, target: SequenceId) -> Result<Option<SequenceId>> {
        let mut passed = None;
        while self.buffer.front().is_some_and(|entry| entry.id <= target) {
            if let Some(entry) = self.buffer.pop_front() {
                passed = Some(entry.id);
                self.consumed_up_to = entry.id;
                self.ordinal += 1;
            }
        }
        if !self.buffer.is_empty() || target <= self.fetched_up_to {
            return Ok(passed);
        }
        if let Some(floor) = self.lease.floor(target)? {
            if floor > self.fetched_up_to {
                let skipped = self.lease.count_between(self.fetched_up_to, floor)?;
                self.ordinal += skipped.entry_count;
                passed = Some(floor);
            }
        }
        self.fetched_up_to = target;
        self.consumed_up_to = target;
        Ok(passed)
    }
}

/// Resumable traversal over every bucket of a manager.
pub struct Cursor {
    manager: Arc<BucketManager>,
    current: Option<BucketIterator>,
    position: Position,
}

impl Cursor {
    /// Cursor before the first entry.
    pub fn new(manager: Arc<BucketManager>) -> Self {
        let position = Position::start(manager.generation());
        Self {
            manager,
            current: None,
            position,
        }
    }

    /// Cursor resuming after `position`, or at the start when `None`.
    ///
    /// # Errors
    ///
    /// - `Error::InvalidArgument`: the position came from another manager generation.
    pub fn at(manager: Arc<BucketManager>, position: Option<&Position>) -> Result<Self> {
        let Some(position) = position else {
            return Ok(Self::new(manager));
        };
        if position.generation != manager.generation() {
            return Err(Error::invalid(format!(
                "position {position} belongs to another generation than {}",
                manager.generation()
            )));
        }
        Ok(Self {
            manager,
            current: None,
            position: *position,
        })
    }

    pub fn position(&self) -> Position {
        self.position
    }

    pub fn last_returned(&self) -> Option<SequenceId> {
        self.position.last_id
    }

    pub fn next(&mut self) -> Result<Option<StoredEntry>> {
        self.fetch(SequenceId::MAXIMUM, true)
    }

    /// Next entry with id `<= limit`. Entries past `limit` stay unconsumed.
    pub fn next_up_to(&mut self, limit: SequenceId) -> Result<Option<StoredEntry>> {
        self.fetch(limit, true)
    }

    pub fn peek_up_to(&mut self, limit: SequenceId) -> Result<Option<StoredEntry>> {
        self.fetch(limit, false)
    }

    /// Positions the cursor so the next entry returned is the first one
    /// strictly greater than `target`. Returns the last entry skipped.
    pub fn advance_to(&mut self, target: SequenceId) -> Result<Option<SequenceId>> {
        let mut passed = None;
        loop {
            if !self.ensure_iterator()? {
                break;
            }
            let Some(iter) = self.current.as_mut() else {
                break;
            };
            if let Some(id) = iter.advance_to(target)? {
                passed = Some(id);
            }
            if iter.peek()?.is_some() {
                iter.discard_after(target);
                break;
            }
            match self.manager.next_bucket_iterator(Some(&*iter))? {
                Some(next) if next.bucket_id() <= target => self.enter(next),
                _ => break,
            }
        }
        if let Some(id) = passed {
            self.position.last_id = Some(id.without_position());
            if let Some(iter) = &self.current {
                self.position.ordinal = iter.ordinal();
            }
        }
        Ok(passed)
    }

    fn fetch(&mut self, limit: SequenceId, consume: bool) -> Result<Option<StoredEntry>> {
        loop {
            if !self.ensure_iterator()? {
                return Ok(None);
            }
            let Some(iter) = self.current.as_mut() else {
                return Ok(None);
            };
            let ordinal = iter.ordinal();
            match iter.peek()? {
                Some(entry) if entry.id <= limit => {
                    let entry = if consume {
                        let entry = iter.next_entry()?;
                        if let Some(entry) = &entry {
                            self.position.last_id = Some(entry.id.without_position());
                            self.position.ordinal = iter.ordinal();
                        }
                        entry
                    } else {
                        let mut entry = entry.clone();
                        entry.id = entry.id.with_position(ordinal);
                        Some(entry)
                    };
                    iter.discard_after(limit);
                    return Ok(entry);
                }
                Some(_) => {
                    iter.discard_after(limit);
                    return Ok(None);
                }
                // A later bucket is entered only once its start is within the
                // limit; ids at or below the limit are never inserted after it.
                None => match self.manager.next_bucket_iterator(Some(&*iter))? {
                    Some(next) if next.bucket_id() <= limit => self.enter(next),
                    _ => return Ok(None),
                },
            }
        }
    }

    fn enter(&mut self, iter: BucketIterator) {
        self.position.bucket_id = iter.bucket_id();
        self.position.ordinal = iter.ordinal();
        self.current = Some(iter);
    }

    /// Opens the iterator for the current position. False when there is no
    /// bucket to read yet.
    fn ensure_iterator(&mut self) -> Result<bool> {
        if self.current.is_some() {
            return Ok(true);
        }
        let Some(iter) = self.manager.iterator_from(&self.position)? else {
            return Ok(false);
        };
        self.enter(iter);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::bucket::{BucketConfig, BucketTypeParams};
    use crate::core::NoopMetrics;
    use crate::persistence::{MemoryPersistence, PersistenceManager};

    fn manager() -> Arc<BucketManager> {
        let params = BucketTypeParams::new(
            Duration::from_secs(3),
            Duration::from_secs(30),
            Duration::ZERO,
            1 << 20,
        )
        .expect("params");
        Arc::new(
            BucketManager::open(
                "q",
                BucketConfig::uniform(params, u64::MAX).expect("config"),
                Arc::new(MemoryPersistence::new()) as Arc<dyn PersistenceManager>,
                Arc::new(NoopMetrics),
            )
            .expect("open"),
        )
    }

    fn id(time: u64) -> SequenceId {
        SequenceId::new(time, 0)
    }

    fn insert(manager: &BucketManager, times: &[u64]) {
        for &t in times {
            manager.insert(id(t), b"e", id(t)).expect("insert");
        }
    }

    #[test]
    fn positions_outlive_deleted_buckets() {
        let manager = manager();
        insert(&manager, &[100, 200, 3_100, 3_200, 6_100]);
        let mut cursor = Cursor::new(Arc::clone(&manager));
        for expected in [100, 200, 3_100, 3_200] {
            assert_eq!(cursor.next().expect("next").expect("entry").id, id(expected));
        }
        let position = cursor.position();
        assert_eq!(position.bucket_id, SequenceId::at_time(3_000));

        let deleted = manager
            .delete_up_to(id(3_200), Some(id(6_100)), SequenceId::at_time(20_000))
            .expect("delete");
        assert_eq!(deleted, 4);
        assert_eq!(manager.num_buckets(), 1);

        assert_eq!(manager.count_after(Some(&position)).expect("count").entry_count, 1);
        let mut resumed = Cursor::at(Arc::clone(&manager), Some(&position)).expect("cursor");
        assert_eq!(resumed.next().expect("next").expect("entry").id, id(6_100));
        assert!(resumed.next().expect("next").is_none());

        assert_eq!(cursor.next().expect("next").expect("entry").id, id(6_100));
        assert!(cursor.next().expect("next").is_none());
    }

    #[test]
    fn position_inside_trimmed_bucket_still_resumes() {
        let manager = manager();
        insert(&manager, &[100, 200, 300, 3_100]);
        let mut cursor = Cursor::new(Arc::clone(&manager));
        cursor.next().expect("next");
        cursor.next().expect("next");
        let position = cursor.position();

        manager
            .delete_up_to(id(200), Some(id(3_100)), SequenceId::at_time(1_000))
            .expect("delete");
        assert_eq!(manager.count_after(Some(&position)).expect("count").entry_count, 2);
        let mut resumed = Cursor::at(Arc::clone(&manager), Some(&position)).expect("cursor");
        assert_eq!(resumed.next().expect("next").expect("entry").id, id(300));
        assert_eq!(resumed.next().expect("next").expect("entry").id, id(3_100));
    }

    #[test]
    fn entries_past_the_limit_are_fetched_again() {
        let manager = manager();
        insert(&manager, &[100, 300]);
        let mut cursor = Cursor::new(Arc::clone(&manager));
        assert_eq!(cursor.next_up_to(id(200)).expect("next").expect("entry").id, id(100));
        assert!(cursor.next_up_to(id(200)).expect("next").is_none());

        insert(&manager, &[200]);
        let ids: Vec<_> = std::iter::from_fn(|| cursor.next_up_to(id(400)).expect("next"))
            .map(|entry| entry.id)
            .collect();
        assert_eq!(ids, vec![id(200), id(300)]);
    }

    #[test]
    fn later_bucket_is_entered_only_within_the_limit() {
        let manager = manager();
        insert(&manager, &[100, 3_100]);
        let mut cursor = Cursor::new(Arc::clone(&manager));
        let limit = SequenceId::at_time(2_500);
        assert_eq!(cursor.next_up_to(limit).expect("next").expect("entry").id, id(100));
        assert!(cursor.next_up_to(limit).expect("next").is_none());
        assert_eq!(cursor.position().bucket_id, SequenceId::at_time(0));

        insert(&manager, &[2_000]);
        let limit = SequenceId::at_time(4_000);
        assert_eq!(cursor.next_up_to(limit).expect("next").expect("entry").id, id(2_000));
        assert_eq!(cursor.next_up_to(limit).expect("next").expect("entry").id, id(3_100));
    }

    #[test]
    fn peek_does_not_consume() {
        let manager = manager();
        insert(&manager, &[100, 200]);
        let mut cursor = Cursor::new(Arc::clone(&manager));
        let peeked = cursor.peek_up_to(SequenceId::MAXIMUM).expect("peek").expect("entry");
        assert_eq!(peeked.id, id(100));
        assert_eq!(peeked.id.position(), Some(0));
        assert_eq!(cursor.last_returned(), None);
        assert_eq!(cursor.next().expect("next").expect("entry").id, id(100));
        assert_eq!(cursor.last_returned(), Some(id(100)));
    }
}
