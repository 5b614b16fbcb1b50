//! Idle strategies: cooperative back-off applied when an agent's duty cycle
//! finds no work.
//!
//! Strategies are a sum of concrete variants rather than a trait object so
//! they stay trivially cloneable into each runner. The controllable variant
//! reads a shared counter slot each cycle, letting an operator retune a
//! running driver through the CnC file.

use std::fmt;
use std::thread;
use std::time::Duration;

use petrel_primitives::counters::CounterHandle;

/// Controllable-strategy counter values.
pub const CONTROL_NOT_CONTROLLED: u64 = 0;
pub const CONTROL_NOOP: u64 = 1;
pub const CONTROL_BUSY_SPIN: u64 = 2;
pub const CONTROL_YIELD: u64 = 3;
pub const CONTROL_PARK: u64 = 4;

const CONTROL_PARK_DURATION: Duration = Duration::from_millis(1);

/// Back-off policy configuration.
#[derive(Clone)]
pub enum IdleStrategy {
    /// Do nothing; burn the core.
    NoOp,
    /// Spin-loop hint; burn the core politely.
    BusySpin,
    /// Yield the thread to the scheduler.
    Yield,
    /// Park for a fixed duration.
    Sleep(Duration),
    /// Spin, then yield, then park with exponential growth up to a cap.
    Backoff {
        max_spins: u64,
        max_yields: u64,
        min_park: Duration,
        max_park: Duration,
    },
    /// Behavior selected at runtime through a shared counter slot.
    Controllable(CounterHandle),
}

impl fmt::Debug for IdleStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoOp => write!(f, "NoOp"),
            Self::BusySpin => write!(f, "BusySpin"),
            Self::Yield => write!(f, "Yield"),
            Self::Sleep(d) => write!(f, "Sleep({d:?})"),
            Self::Backoff {
                max_spins,
                max_yields,
                min_park,
                max_park,
            } => write!(
                f,
                "Backoff(spins={max_spins}, yields={max_yields}, park={min_park:?}..{max_park:?})"
            ),
            Self::Controllable(handle) => write!(f, "Controllable(counter={})", handle.id()),
        }
    }
}

/// Runtime state for applying an [`IdleStrategy`].
pub struct Idler {
    strategy: IdleStrategy,
    spins: u64,
    yields: u64,
    park: Duration,
}

impl Idler {
    pub fn new(strategy: IdleStrategy) -> Self {
        let park = match &strategy {
            IdleStrategy::Backoff { min_park, .. } => *min_park,
            _ => Duration::ZERO,
        };
        Self {
            strategy,
            spins: 0,
            yields: 0,
            park,
        }
    }

    /// Apply the back-off appropriate to a duty cycle that performed
    /// `work_count` units of work.
    pub fn idle(&mut self, work_count: usize) {
        if work_count > 0 {
            self.reset();
            return;
        }

        match &self.strategy {
            IdleStrategy::NoOp => {}
            IdleStrategy::BusySpin => std::hint::spin_loop(),
            IdleStrategy::Yield => thread::yield_now(),
            IdleStrategy::Sleep(duration) => thread::sleep(*duration),
            IdleStrategy::Backoff {
                max_spins,
                max_yields,
                max_park,
                ..
            } => {
                if self.spins < *max_spins {
                    self.spins += 1;
                    std::hint::spin_loop();
                } else if self.yields < *max_yields {
                    self.yields += 1;
                    thread::yield_now();
                } else {
                    thread::sleep(self.park);
                    self.park = (self.park * 2).min(*max_park);
                }
            }
            IdleStrategy::Controllable(handle) => match handle.get() {
                CONTROL_NOOP => {}
                CONTROL_BUSY_SPIN => std::hint::spin_loop(),
                CONTROL_YIELD => thread::yield_now(),
                _ => thread::sleep(CONTROL_PARK_DURATION),
            },
        }
    }

    /// Reset back-off state after productive work.
    pub fn reset(&mut self) {
        self.spins = 0;
        self.yields = 0;
        if let IdleStrategy::Backoff { min_park, .. } = &self.strategy {
            self.park = *min_park;
        }
    }

    #[inline]
    pub fn strategy(&self) -> &IdleStrategy {
        &self.strategy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn backoff_escalates_and_resets() {
        let mut idler = Idler::new(IdleStrategy::Backoff {
            max_spins: 2,
            max_yields: 2,
            min_park: Duration::from_micros(1),
            max_park: Duration::from_micros(8),
        });

        for _ in 0..10 {
            idler.idle(0);
        }
        assert_eq!(idler.park, Duration::from_micros(8), "park capped at max");

        idler.idle(3);
        assert_eq!(idler.spins, 0);
        assert_eq!(idler.park, Duration::from_micros(1), "work resets the ladder");
    }

    #[test]
    fn sleep_actually_parks() {
        let mut idler = Idler::new(IdleStrategy::Sleep(Duration::from_millis(5)));
        let start = Instant::now();
        idler.idle(0);
        assert!(start.elapsed() >= Duration::from_millis(4));
    }

    #[test]
    fn noop_and_spin_do_not_park() {
        for strategy in [IdleStrategy::NoOp, IdleStrategy::BusySpin, IdleStrategy::Yield] {
            let mut idler = Idler::new(strategy);
            let start = Instant::now();
            for _ in 0..100 {
                idler.idle(0);
            }
            assert!(start.elapsed() < Duration::from_millis(100));
        }
    }
}
