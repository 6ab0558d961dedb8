//! Digital line and clock traits used by pulse-timing drivers.
//!
//! Board support crates implement [`TriggerLine`] and [`EchoLine`] for their
//! GPIO pins; the rest of the stack only talks to the traits, so drivers can
//! be exercised against [`crate::sim`] without hardware.

use std::time::{Duration, Instant};

/// A digital output line that emits the trigger pulse.
pub trait TriggerLine: Send {
    /// Drive the line high.
    fn set_high(&mut self);

    /// Drive the line low.
    fn set_low(&mut self);
}

/// A digital input line that carries the echo pulse.
pub trait EchoLine: Send {
    /// Sample the current line level.
    fn is_high(&mut self) -> bool;
}

/// Monotonic time source with a blocking delay.
pub trait Clock: Send {
    /// Time elapsed since an arbitrary, fixed origin.
    fn now(&self) -> Duration;

    /// Block for at least `duration`.
    fn delay(&self, duration: Duration);
}

/// Delays shorter than this are busy-waited instead of handed to the
/// scheduler.
const SPIN_THRESHOLD: Duration = Duration::from_millis(1);

/// [`Clock`] backed by [`std::time::Instant`].
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    fn delay(&self, duration: Duration) {
        if duration < SPIN_THRESHOLD {
            let until = Instant::now() + duration;
            while Instant::now() < until {
                std::hint::spin_loop();
            }
        } else {
            std::thread::sleep(duration);
        }
    }
}
