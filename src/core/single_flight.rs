//! First-creation-wins initialization keyed by value.
//!
//! Concurrent callers asking for the same key while it is being created park
//! on a condition variable until the creator publishes the value (or fails,
//! in which case one of the waiters retries the creation).

use std::collections::HashMap;
use std::hash::Hash;

use parking_lot::{Condvar, Mutex};

use crate::core::Result;

enum Slot<V> {
    Pending,
    Ready(V),
}

pub struct SingleFlight<K, V> {
    slots: Mutex<HashMap<K, Slot<V>>>,
    settled: Condvar,
}

impl<K, V> Default for SingleFlight<K, V> {
    fn default() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            settled: Condvar::new(),
        }
    }
}

impl<K, V> SingleFlight<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the value for `key`, running `init` only if no other caller
    /// has created it or is creating it.
    pub fn get_or_try_init<F>(&self, key: &K, init: F) -> Result<V>
    where
        F: FnOnce() -> Result<V>,
    {
        let mut slots = self.slots.lock();
        loop {
            match slots.get(key) {
                Some(Slot::Ready(value)) => return Ok(value.clone()),
                Some(Slot::Pending) => self.settled.wait(&mut slots),
                None => break,
            }
        }
        slots.insert(key.clone(), Slot::Pending);
        drop(slots);

        let mut guard = PendingGuard {
            flight: self,
            key,
            armed: true,
        };
        let value = init()?;
        guard.armed = false;

        let mut slots = self.slots.lock();
        slots.insert(key.clone(), Slot::Ready(value.clone()));
        drop(slots);
        self.settled.notify_all();
        Ok(value)
    }

    pub fn get(&self, key: &K) -> Option<V> {
        match self.slots.lock().get(key) {
            Some(Slot::Ready(value)) => Some(value.clone()),
            _ => None,
        }
    }

    /// Removes a published value. Pending creations are left alone.
    pub fn remove(&self, key: &K) -> Option<V> {
        let mut slots = self.slots.lock();
        if matches!(slots.get(key), Some(Slot::Ready(_))) {
            if let Some(Slot::Ready(value)) = slots.remove(key) {
                return Some(value);
            }
        }
        None
    }

    /// Removes and returns every published value.
    pub fn drain(&self) -> Vec<V> {
        let mut slots = self.slots.lock();
        let keys: Vec<K> = slots
            .iter()
            .filter(|(_, slot)| matches!(slot, Slot::Ready(_)))
            .map(|(key, _)| key.clone())
            .collect();
        keys.into_iter()
            .filter_map(|key| match slots.remove(&key) {
                Some(Slot::Ready(value)) => Some(value),
                _ => None,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.slots
            .lock()
            .values()
            .filter(|slot| matches!(slot, Slot::Ready(_)))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Clears a pending slot when creation fails or unwinds.
struct PendingGuard<'a, K: Eq + Hash, V> {
    flight: &'a SingleFlight<K, V>,
    key: &'a K,
    armed: bool,
}

impl<K: Eq + Hash, V> Drop for PendingGuard<'_, K, V> {
    fn drop(&mut self) {
        if self.armed {
            self.flight.slots.lock().remove(self.key);
            self.flight.settled.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Error;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Barrier};
    use std::time::Duration;

    #[test]
    fn concurrent_callers_share_one_creation() {
        let flight: Arc<SingleFlight<String, Arc<usize>>> = Arc::new(SingleFlight::new());
        let created = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let flight = Arc::clone(&flight);
                let created = Arc::clone(&created);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    flight
                        .get_or_try_init(&"orders".to_string(), || {
                            std::thread::sleep(Duration::from_millis(20));
                            Ok(Arc::new(created.fetch_add(1, Ordering::SeqCst)))
                        })
                        .expect("init")
                })
            })
            .collect();

        let values: Vec<_> = handles
            .into_iter()
            .map(|h| h.join().expect("join"))
            .collect();
        assert_eq!(created.load(Ordering::SeqCst), 1);
        assert!(values.iter().all(|v| Arc::ptr_eq(v, &values[0])));
    }

    #[test]
    fn failed_creation_can_be_retried() {
        let flight: SingleFlight<u32, u32> = SingleFlight::new();
        let err = flight
            .get_or_try_init(&1, || Err(Error::invalid("nope")))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        assert!(flight.get(&1).is_none());
        assert_eq!(flight.get_or_try_init(&1, || Ok(9)).expect("retry"), 9);
        assert_eq!(flight.remove(&1), Some(9));
        assert!(flight.is_empty());
    }
}
