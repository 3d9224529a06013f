use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Monotonic time source injected into the selector.
///
/// Abstracting the clock keeps idle-connection accounting and rate metrics
/// testable without real sleeps.
pub trait Clock: Send + Sync {
    /// Monotonic nanoseconds since an arbitrary origin.
    fn nanos(&self) -> u64;

    /// Monotonic milliseconds since the same origin.
    fn millis(&self) -> u64 { self.nanos() / 1_000_000 }
}

/// Production clock based on [`Instant`].
pub struct MonotonicClock {
    start: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self { Self { start: Instant::now() } }
}

impl Default for MonotonicClock {
    fn default() -> Self { MonotonicClock::new() }
}

impl Clock for MonotonicClock {
    fn nanos(&self) -> u64 { self.start.elapsed().as_nanos() as u64 }
}

/// Manually-advanced clock for deterministic tests.
pub struct ManualClock(AtomicU64);

impl ManualClock {
    pub fn new(start_nanos: u64) -> Self { Self(AtomicU64::new(start_nanos)) }

    pub fn advance(&self, delta: Duration) {
        self.0.fetch_add(delta.as_nanos() as u64, Ordering::Relaxed);
    }

    pub fn set(&self, nanos: u64) { self.0.store(nanos, Ordering::Relaxed); }
}

impl Clock for ManualClock {
    fn nanos(&self) -> u64 { self.0.load(Ordering::Relaxed) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::new(10);
        assert_eq!(clock.nanos(), 10);
        clock.advance(Duration::from_millis(3));
        assert_eq!(clock.nanos(), 3_000_010);
        assert_eq!(clock.millis(), 3);
        clock.set(42);
        assert_eq!(clock.nanos(), 42);
    }

    #[test]
    fn monotonic_clock_moves_forward() {
        let clock = MonotonicClock::new();
        let first = clock.nanos();
        let second = clock.nanos();
        assert!(second >= first);
    }
}
