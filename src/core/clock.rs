use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// A source of millisecond timestamps for the store.
///
/// Sequence ids, bucket windows and retention are all expressed in
/// milliseconds since the UNIX epoch.
pub trait Clock: Send + Sync + 'static {
    /// Returns the current time in milliseconds since the UNIX epoch.
    fn now_millis(&self) -> u64;
}

/// A clock that uses `std::time::SystemTime`.
///
/// Susceptible to NTP adjustments; [`StoreClock`] hides backward jumps.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or(0)
    }
}

/// A monotonic clock driven by the CPU's Time-Stamp Counter via `quanta`.
///
/// Anchors to `SystemTime` at construction and then advances with TSC ticks,
/// so it never jumps backward.
#[derive(Debug, Clone)]
pub struct QuantaClock {
    clock: quanta::Clock,
    start_wall_ms: u64,
    start_instant: quanta::Instant,
}

impl Default for QuantaClock {
    fn default() -> Self {
        let clock = quanta::Clock::new();
        let start_instant = clock.now();
        Self {
            clock,
            start_wall_ms: SystemClock.now_millis(),
            start_instant,
        }
    }
}

impl QuantaClock {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Clock for QuantaClock {
    fn now_millis(&self) -> u64 {
        let delta = self.clock.now().duration_since(self.start_instant);
        self.start_wall_ms
            .saturating_add(u64::try_from(delta.as_millis()).unwrap_or(u64::MAX))
    }
}

/// A manually driven clock for deterministic tests and simulations.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new(start_ms: u64) -> Self {
        Self {
            now: Arc::new(AtomicU64::new(start_ms)),
        }
    }

    pub fn set(&self, ms: u64) {
        self.now.store(ms, Ordering::Release);
    }

    pub fn advance(&self, ms: u64) {
        self.now.fetch_add(ms, Ordering::AcqRel);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.now.load(Ordering::Acquire)
    }
}

/// Store-local time: a local clock shifted by a per-store offset.
///
/// The derived time is monotonic. Lowering the offset (or a local clock that
/// steps backward) pauses store time until the shifted value catches up with
/// the highest time already handed out.
pub struct StoreClock {
    clock: Arc<dyn Clock>,
    offset_ms: AtomicI64,
    high_water_ms: AtomicU64,
}

impl StoreClock {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_offset(clock, 0)
    }

    pub fn with_offset(clock: Arc<dyn Clock>, offset_ms: i64) -> Self {
        Self {
            clock,
            offset_ms: AtomicI64::new(offset_ms),
            high_water_ms: AtomicU64::new(0),
        }
    }

    /// Current store time in milliseconds.
    pub fn now(&self) -> u64 {
        let local = i64::try_from(self.clock.now_millis()).unwrap_or(i64::MAX);
        let shifted = local.saturating_add(self.offset_ms.load(Ordering::Acquire));
        let shifted = u64::try_from(shifted).unwrap_or(0);
        let previous = self.high_water_ms.fetch_max(shifted, Ordering::AcqRel);
        previous.max(shifted)
    }

    pub fn offset(&self) -> i64 {
        self.offset_ms.load(Ordering::Acquire)
    }

    pub fn set_offset(&self, offset_ms: i64) {
        self.offset_ms.store(offset_ms, Ordering::Release);
    }
}

impl std::fmt::Debug for StoreClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreClock")
            .field("offset_ms", &self.offset())
            .field("high_water_ms", &self.high_water_ms.load(Ordering::Acquire))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_clock_applies_offset() {
        let local = ManualClock::new(10_000);
        let clock = StoreClock::with_offset(Arc::new(local.clone()), 500);
        assert_eq!(clock.now(), 10_500);
        local.advance(100);
        assert_eq!(clock.now(), 10_600);
    }

    #[test]
    fn store_clock_pauses_when_offset_reduced() {
        let local = ManualClock::new(10_000);
        let clock = StoreClock::with_offset(Arc::new(local.clone()), 1_000);
        assert_eq!(clock.now(), 11_000);

        clock.set_offset(0);
        assert_eq!(clock.now(), 11_000);
        local.advance(600);
        assert_eq!(clock.now(), 11_000);
        local.advance(600);
        assert_eq!(clock.now(), 11_200);
    }

    #[test]
    fn store_clock_ignores_local_regression() {
        let local = ManualClock::new(5_000);
        let clock = StoreClock::new(Arc::new(local.clone()));
        assert_eq!(clock.now(), 5_000);
        local.set(4_000);
        assert_eq!(clock.now(), 5_000);
    }

    #[test]
    fn quanta_clock_is_monotonic() {
        let clock = QuantaClock::new();
        let a = clock.now_millis();
        let b = clock.now_millis();
        assert!(b >= a);
        assert!(a > 0);
    }
}
