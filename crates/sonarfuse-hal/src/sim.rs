//! In-process simulation for CI/CD testing without physical hardware.
//!
//! Two levels of simulation are provided:
//!
//! - [`SimTransducer`] plays back programmed echo pulses on a virtual
//!   clock, so [`UltrasonicRanger`][crate::ranging::UltrasonicRanger] runs
//!   its real pulse-timing code path deterministically.
//! - [`ScriptedRanger`] implements [`RangingSensor`] directly from a list of
//!   outcomes, which is what sampling-loop and fusion tests want.
//!
//! # Example
//!
//! ```rust
//! use sonarfuse_hal::ranging::RangingSensor;
//! use sonarfuse_hal::sim::ScriptedRanger;
//! use sonarfuse_types::{EchoPhase, RangingError};
//!
//! let mut ranger = ScriptedRanger::new(
//!     "front",
//!     vec![Ok(100.0), Err(RangingError::Timeout { phase: EchoPhase::Rise })],
//! );
//! assert_eq!(ranger.measure(), Ok(100.0));
//! assert!(ranger.measure().is_err());
//! assert_eq!(ranger.measure(), Ok(100.0)); // scripts repeat
//! ```

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use sonarfuse_types::{EchoPhase, RangingError, SensorKind, clamp_confidence};

use crate::lines::{Clock, EchoLine, TriggerLine};
use crate::ranging::{RangingSensor, speed_of_sound_cm_s};

// ────────────────────────────────────────────────────────────────────────────
// Transducer simulation
// ────────────────────────────────────────────────────────────────────────────

/// Delay between the trigger falling edge and the echo rising edge.
const ECHO_LATENCY: Duration = Duration::from_micros(100);

/// Virtual time consumed by every [`Clock::now`] call (one polling step).
const POLL_TICK: Duration = Duration::from_micros(1);

/// Programmed response to one trigger pulse.
#[derive(Debug, Clone, Copy, PartialEq)]
enum EchoResponse {
    Pulse(Duration),
    Silence,
    StuckHigh,
}

#[derive(Debug, Default)]
struct SimState {
    now: Duration,
    trigger_high: bool,
    /// Start and (optional) end of the current echo pulse.
    echo: Option<(Duration, Option<Duration>)>,
    queue: VecDeque<EchoResponse>,
}

fn lock(state: &Mutex<SimState>) -> MutexGuard<'_, SimState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A simulated trigger/echo transducer sharing one virtual clock.
///
/// Program responses with the `push_*` methods, then hand the lines from
/// [`lines`][Self::lines] to a driver.  When nothing is queued the
/// transducer stays silent.
#[derive(Debug, Clone, Default)]
pub struct SimTransducer {
    state: Arc<Mutex<SimState>>,
}

impl SimTransducer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an echo pulse of exactly `width`.
    pub fn push_echo(&self, width: Duration) {
        lock(&self.state).queue.push_back(EchoResponse::Pulse(width));
    }

    /// Queue the echo an object at `distance_cm` would return at
    /// `temperature_c`.
    pub fn push_distance(&self, distance_cm: f64, temperature_c: f64) {
        let seconds = 2.0 * distance_cm.max(0.0) / speed_of_sound_cm_s(temperature_c);
        self.push_echo(Duration::from_secs_f64(seconds));
    }

    /// Queue a trigger that gets no echo at all.
    pub fn push_silence(&self) {
        lock(&self.state).queue.push_back(EchoResponse::Silence);
    }

    /// Queue an echo that rises and never falls.
    pub fn push_stuck_high(&self) {
        lock(&self.state).queue.push_back(EchoResponse::StuckHigh);
    }

    /// Number of responses still queued.
    pub fn pending(&self) -> usize {
        lock(&self.state).queue.len()
    }

    /// Current virtual time.
    pub fn elapsed(&self) -> Duration {
        lock(&self.state).now
    }

    /// Trigger, echo and clock handles bound to this transducer.
    pub fn lines(&self) -> (SimTrigger, SimEcho, SimClock) {
        (
            SimTrigger {
                state: Arc::clone(&self.state),
            },
            SimEcho {
                state: Arc::clone(&self.state),
            },
            SimClock {
                state: Arc::clone(&self.state),
            },
        )
    }
}

/// Trigger output of a [`SimTransducer`].
#[derive(Debug, Clone)]
pub struct SimTrigger {
    state: Arc<Mutex<SimState>>,
}

impl TriggerLine for SimTrigger {
    fn set_high(&mut self) {
        lock(&self.state).trigger_high = true;
    }

    fn set_low(&mut self) {
        let mut s = lock(&self.state);
        if !s.trigger_high {
            return;
        }
        s.trigger_high = false;
        let start = s.now + ECHO_LATENCY;
        s.echo = match s.queue.pop_front().unwrap_or(EchoResponse::Silence) {
            EchoResponse::Pulse(width) => Some((start, Some(start + width))),
            EchoResponse::StuckHigh => Some((start, None)),
            EchoResponse::Silence => None,
        };
    }
}

/// Echo input of a [`SimTransducer`].
#[derive(Debug, Clone)]
pub struct SimEcho {
    state: Arc<Mutex<SimState>>,
}

impl EchoLine for SimEcho {
    fn is_high(&mut self) -> bool {
        let s = lock(&self.state);
        match s.echo {
            Some((start, Some(end))) => s.now >= start && s.now < end,
            Some((start, None)) => s.now >= start,
            None => false,
        }
    }
}

/// Virtual clock of a [`SimTransducer`].  Every `now()` call advances time by
/// one polling tick; `delay()` advances it by the requested amount.
#[derive(Debug, Clone)]
pub struct SimClock {
    state: Arc<Mutex<SimState>>,
}

impl Clock for SimClock {
    fn now(&self) -> Duration {
        let mut s = lock(&self.state);
        s.now += POLL_TICK;
        s.now
    }

    fn delay(&self, duration: Duration) {
        lock(&self.state).now += duration;
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Scripted ranger
// ────────────────────────────────────────────────────────────────────────────

/// A [`RangingSensor`] that replays a fixed script of outcomes, wrapping
/// around when it reaches the end.  An empty script always times out.
#[derive(Debug, Clone)]
pub struct ScriptedRanger {
    id: String,
    kind: SensorKind,
    confidence: f64,
    script: Vec<Result<f64, RangingError>>,
    cursor: usize,
}

impl ScriptedRanger {
    pub fn new(id: impl Into<String>, script: Vec<Result<f64, RangingError>>) -> Self {
        Self {
            id: id.into(),
            kind: SensorKind::Distance,
            confidence: 1.0,
            script,
            cursor: 0,
        }
    }

    /// A ranger that always reports `distance_cm`.
    pub fn constant(id: impl Into<String>, distance_cm: f64) -> Self {
        Self::new(id, vec![Ok(distance_cm)])
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = clamp_confidence(confidence);
        self
    }

    pub fn with_kind(mut self, kind: SensorKind) -> Self {
        self.kind = kind;
        self
    }

    /// Total number of measurements taken so far.
    pub fn calls(&self) -> usize {
        self.cursor
    }
}

impl RangingSensor for ScriptedRanger {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> SensorKind {
        self.kind
    }

    fn measure(&mut self) -> Result<f64, RangingError> {
        if self.script.is_empty() {
            self.cursor += 1;
            return Err(RangingError::Timeout {
                phase: EchoPhase::Rise,
            });
        }
        let outcome = self.script[self.cursor % self.script.len()].clone();
        self.cursor += 1;
        outcome
    }

    fn confidence(&self) -> f64 {
        self.confidence
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────
