//! Time sources for the driver.
//!
//! Two capabilities: wall-clock milliseconds (`EpochClock`) and monotonic
//! nanoseconds (`NanoClock`). Both are thread-safe and non-allocating on the
//! read path. Production uses the system implementations; tests inject a
//! `ManualClock` to make timeout behavior deterministic.

use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Source of wall-clock time in milliseconds since the Unix epoch.
pub trait EpochClock: Send + Sync {
    fn now_ms(&self) -> u64;
}

/// Source of monotonic time in nanoseconds.
///
/// The epoch is arbitrary; only differences are meaningful.
pub trait NanoClock: Send + Sync {
    fn now_ns(&self) -> u64;
}

/// System wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemEpochClock;

impl EpochClock for SystemEpochClock {
    #[inline]
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }
}

/// System monotonic clock.
///
/// Anchored to the first read so the value fits a `u64` for the life of any
/// realistic process.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemNanoClock;

static NANO_ANCHOR: OnceLock<Instant> = OnceLock::new();

impl NanoClock for SystemNanoClock {
    #[inline]
    fn now_ns(&self) -> u64 {
        let anchor = NANO_ANCHOR.get_or_init(Instant::now);
        anchor.elapsed().as_nanos() as u64
    }
}

/// Settable clock for deterministic tests. Implements both capabilities.
#[derive(Debug, Default)]
pub struct ManualClock {
    ms: AtomicU64,
    ns: AtomicU64,
}

impl ManualClock {
    pub fn new(ms: u64, ns: u64) -> Self {
        Self {
            ms: AtomicU64::new(ms),
            ns: AtomicU64::new(ns),
        }
    }

    pub fn set_ms(&self, ms: u64) {
        self.ms.store(ms, Ordering::Release);
    }

    pub fn set_ns(&self, ns: u64) {
        self.ns.store(ns, Ordering::Release);
    }

    pub fn advance_ms(&self, delta: u64) {
        self.ms.fetch_add(delta, Ordering::AcqRel);
    }

    pub fn advance_ns(&self, delta: u64) {
        self.ns.fetch_add(delta, Ordering::AcqRel);
    }
}

impl EpochClock for ManualClock {
    #[inline]
    fn now_ms(&self) -> u64 {
        self.ms.load(Ordering::Acquire)
    }
}

impl NanoClock for ManualClock {
    #[inline]
    fn now_ns(&self) -> u64 {
        self.ns.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_nano_clock_is_monotonic() {
        let clock = SystemNanoClock;
        let a = clock.now_ns();
        let b = clock.now_ns();
        assert!(b >= a);
    }

    #[test]
    fn system_epoch_clock_is_plausible() {
        let clock = SystemEpochClock;
        // After 2020-01-01 and before 2100-01-01.
        let now = clock.now_ms();
        assert!(now > 1_577_836_800_000);
        assert!(now < 4_102_444_800_000);
    }

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::new(1_000, 5_000);
        assert_eq!(clock.now_ms(), 1_000);
        assert_eq!(clock.now_ns(), 5_000);

        clock.advance_ms(250);
        clock.advance_ns(10);
        assert_eq!(clock.now_ms(), 1_250);
        assert_eq!(clock.now_ns(), 5_010);

        clock.set_ms(9);
        assert_eq!(clock.now_ms(), 9);
    }
}
