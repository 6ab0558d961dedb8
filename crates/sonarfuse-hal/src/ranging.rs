//! Time-of-flight ranging driver.
//!
//! [`UltrasonicRanger`] fires a trigger pulse, times the echo pulse and
//! converts the round-trip duration into a distance:
//!
//! ```text
//! distance_cm = duration_s · v_cm_per_s / 2
//! v_cm_per_s  = (331.3 + 0.606 · T_celsius) · 100
//! ```
//!
//! A failed measurement is reported as a [`RangingError`] and never retried
//! here; retries are a caller decision.
//!
//! # Example
//!
//! ```rust
//! use sonarfuse_hal::ranging::{RangingConfig, UltrasonicRanger};
//! use sonarfuse_hal::sim::SimTransducer;
//!
//! let sim = SimTransducer::new();
//! sim.push_distance(120.0, 20.0);
//! let (trigger, echo, clock) = sim.lines();
//!
//! let mut ranger = UltrasonicRanger::new(RangingConfig::new("front"), trigger, echo, clock);
//! let distance = ranger.measure().expect("simulated echo");
//! assert!((distance - 120.0).abs() < 0.1);
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};
use sonarfuse_types::{EchoPhase, RangingError, SensorKind, clamp_confidence};
use tracing::{debug, info};

use crate::lines::{Clock, EchoLine, TriggerLine};

/// Width of the trigger pulse.
pub const TRIGGER_PULSE: Duration = Duration::from_micros(10);

/// Low time before the trigger pulse so the transducer sees a clean edge.
pub const TRIGGER_SETTLE: Duration = Duration::from_micros(2);

/// Temperature assumed until [`UltrasonicRanger::set_temperature`] is called.
pub const DEFAULT_TEMPERATURE_C: f64 = 20.0;

/// Speed of sound in air, in cm/s, at `temperature_c`.
pub fn speed_of_sound_cm_s(temperature_c: f64) -> f64 {
    (331.3 + 0.606 * temperature_c) * 100.0
}

// ────────────────────────────────────────────────────────────────────────────
// RangingSensor trait
// ────────────────────────────────────────────────────────────────────────────

/// Anything that can produce one raw range measurement on demand.
///
/// Sampling loops are written against this trait so a physical
/// [`UltrasonicRanger`] and a [`ScriptedRanger`][crate::sim::ScriptedRanger]
/// are interchangeable.
pub trait RangingSensor: Send {
    /// Stable identifier, e.g. `"ultrasonic_front"`.
    fn id(&self) -> &str;

    /// Quantity this sensor measures.
    fn kind(&self) -> SensorKind {
        SensorKind::Distance
    }

    /// Take one measurement.
    ///
    /// # Errors
    ///
    /// Returns a [`RangingError`] when no usable reading was obtained.
    fn measure(&mut self) -> Result<f64, RangingError>;

    /// Confidence attached to readings from this sensor, in `[0, 1]`.
    fn confidence(&self) -> f64 {
        1.0
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Configuration
// ────────────────────────────────────────────────────────────────────────────

/// Static configuration of one ultrasonic ranger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RangingConfig {
    pub sensor_id: String,
    /// Largest distance the sensor is rated for (cm).
    pub max_distance_cm: f64,
    /// Bound on each echo edge wait.
    pub echo_timeout: Duration,
    /// Pause between samples in [`UltrasonicRanger::average`].
    pub average_delay: Duration,
    /// Ambient temperature used for speed-of-sound compensation.
    pub temperature_c: f64,
    /// Additive correction applied after conversion (cm).
    pub offset_cm: f64,
    /// Confidence attached to this sensor's readings.
    pub confidence: f64,
}

impl RangingConfig {
    /// Defaults for an HC-SR04 class sensor: 400 cm range, 40 ms echo
    /// window, 20 °C.
    pub fn new(sensor_id: impl Into<String>) -> Self {
        Self {
            sensor_id: sensor_id.into(),
            max_distance_cm: 400.0,
            echo_timeout: Duration::from_millis(40),
            average_delay: Duration::from_millis(10),
            temperature_c: DEFAULT_TEMPERATURE_C,
            offset_cm: 0.0,
            confidence: 1.0,
        }
    }

    pub fn with_max_distance(mut self, max_distance_cm: f64) -> Self {
        self.max_distance_cm = max_distance_cm;
        self
    }

    pub fn with_echo_timeout(mut self, echo_timeout: Duration) -> Self {
        self.echo_timeout = echo_timeout;
        self
    }

    pub fn with_average_delay(mut self, average_delay: Duration) -> Self {
        self.average_delay = average_delay;
        self
    }

    pub fn with_temperature(mut self, temperature_c: f64) -> Self {
        self.temperature_c = temperature_c;
        self
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = clamp_confidence(confidence);
        self
    }
}

// ────────────────────────────────────────────────────────────────────────────
// UltrasonicRanger
// ────────────────────────────────────────────────────────────────────────────

/// Trigger/echo pulse-timing driver.
pub struct UltrasonicRanger<T, E, C> {
    config: RangingConfig,
    speed_of_sound: f64,
    trigger: T,
    echo: E,
    clock: C,
}

impl<T: TriggerLine, E: EchoLine, C: Clock> UltrasonicRanger<T, E, C> {
    pub fn new(config: RangingConfig, trigger: T, echo: E, clock: C) -> Self {
        let speed_of_sound = speed_of_sound_cm_s(config.temperature_c);
        Self {
            config,
            speed_of_sound,
            trigger,
            echo,
            clock,
        }
    }

    pub fn config(&self) -> &RangingConfig {
        &self.config
    }

    /// Current speed of sound in cm/s.
    pub fn speed_of_sound(&self) -> f64 {
        self.speed_of_sound
    }

    /// Recompute the speed of sound for `temperature_c`.
    pub fn set_temperature(&mut self, temperature_c: f64) {
        self.config.temperature_c = temperature_c;
        self.speed_of_sound = speed_of_sound_cm_s(temperature_c);
        info!(sensor = %self.config.sensor_id, temperature_c, "temperature compensation set");
    }

    /// Convert a round-trip echo width into a one-way distance (cm).
    pub fn distance_for(&self, echo_width: Duration) -> f64 {
        echo_width.as_secs_f64() * self.speed_of_sound / 2.0
    }

    /// Take one measurement.
    ///
    /// # Errors
    ///
    /// - [`RangingError::Timeout`] when either echo edge is missing for
    ///   longer than `echo_timeout`.
    /// - [`RangingError::OutOfRange`] when the distance is negative or
    ///   beyond `max_distance_cm`.
    pub fn measure(&mut self) -> Result<f64, RangingError> {
        self.trigger.set_low();
        self.clock.delay(TRIGGER_SETTLE);
        self.trigger.set_high();
        self.clock.delay(TRIGGER_PULSE);
        self.trigger.set_low();

        let rise_deadline = self.clock.now() + self.config.echo_timeout;
        while !self.echo.is_high() {
            if self.clock.now() > rise_deadline {
                debug!(sensor = %self.config.sensor_id, "echo rise timeout");
                return Err(RangingError::Timeout {
                    phase: EchoPhase::Rise,
                });
            }
        }
        let pulse_start = self.clock.now();

        let fall_deadline = pulse_start + self.config.echo_timeout;
        while self.echo.is_high() {
            if self.clock.now() > fall_deadline {
                debug!(sensor = %self.config.sensor_id, "echo fall timeout");
                return Err(RangingError::Timeout {
                    phase: EchoPhase::Fall,
                });
            }
        }
        let pulse_end = self.clock.now();

        let width = pulse_end.saturating_sub(pulse_start);
        let distance = self.distance_for(width) + self.config.offset_cm;

        if !(0.0..=self.config.max_distance_cm).contains(&distance) {
            debug!(sensor = %self.config.sensor_id, distance, "reading out of range");
            return Err(RangingError::OutOfRange {
                distance_cm: distance,
                max_cm: self.config.max_distance_cm,
            });
        }
        Ok(distance)
    }

    /// Mean of up to `count` sequential measurements, skipping failures.
    ///
    /// # Errors
    ///
    /// Returns [`RangingError::NoValidReading`] if every attempt failed (or
    /// `count` is zero).
    pub fn average(&mut self, count: usize) -> Result<f64, RangingError> {
        let mut sum = 0.0;
        let mut ok = 0usize;
        for i in 0..count {
            if let Ok(d) = self.measure() {
                sum += d;
                ok += 1;
            }
            if i + 1 < count {
                self.clock.delay(self.config.average_delay);
            }
        }
        if ok == 0 {
            return Err(RangingError::NoValidReading { attempts: count });
        }
        Ok(sum / ok as f64)
    }

    /// Single-point offset calibration against a known distance.
    ///
    /// Averages ten measurements and stores `known − measured` as the
    /// additive offset.  Returns the new offset.
    pub fn calibrate_offset(&mut self, known_distance_cm: f64) -> Result<f64, RangingError> {
        let previous = self.config.offset_cm;
        self.config.offset_cm = 0.0;
        match self.average(10) {
            Ok(measured) => {
                self.config.offset_cm = known_distance_cm - measured;
                info!(
                    sensor = %self.config.sensor_id,
                    offset_cm = self.config.offset_cm,
                    "offset calibrated"
                );
                Ok(self.config.offset_cm)
            }
            Err(e) => {
                self.config.offset_cm = previous;
                Err(e)
            }
        }
    }
}

impl<T: TriggerLine, E: EchoLine, C: Clock> RangingSensor for UltrasonicRanger<T, E, C> {
    fn id(&self) -> &str {
        &self.config.sensor_id
    }

    fn measure(&mut self) -> Result<f64, RangingError> {
        UltrasonicRanger::measure(self)
    }

    fn confidence(&self) -> f64 {
        self.config.confidence
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimClock, SimEcho, SimTransducer, SimTrigger};

    fn ranger(sim: &SimTransducer, config: RangingConfig) -> UltrasonicRanger<SimTrigger, SimEcho, SimClock> {
        let (t, e, c) = sim.lines();
        UltrasonicRanger::new(config, t, e, c)
    }

    #[test]
    fn speed_of_sound_follows_temperature() {
        assert!((speed_of_sound_cm_s(0.0) - 33_130.0).abs() < 1e-9);
        assert!((speed_of_sound_cm_s(20.0) - 34_342.0).abs() < 1e-9);
    }

    #[test]
    fn distance_matches_half_round_trip() {
        let sim = SimTransducer::new();
        let width = Duration::from_micros(5_830);
        sim.push_echo(width);
        let mut r = ranger(&sim, RangingConfig::new("front"));

        let expected = width.as_secs_f64() * speed_of_sound_cm_s(20.0) / 2.0;
        let d = r.measure().unwrap();
        assert!((d - expected).abs() < 0.1, "got {d}, expected {expected}");
    }

    #[test]
    fn distances_across_range_are_consistent() {
        let sim = SimTransducer::new();
        let mut r = ranger(&sim, RangingConfig::new("front"));
        for cm in [5.0, 50.0, 150.0, 399.0] {
            sim.push_distance(cm, DEFAULT_TEMPERATURE_C);
            let d = r.measure().unwrap();
            assert!((d - cm).abs() < 0.1, "{cm} → {d}");
        }
    }

    #[test]
    fn temperature_changes_conversion() {
        let sim = SimTransducer::new();
        let mut r = ranger(&sim, RangingConfig::new("front"));
        r.set_temperature(35.0);
        assert!((r.speed_of_sound() - speed_of_sound_cm_s(35.0)).abs() < 1e-9);

        sim.push_distance(100.0, 35.0);
        let d = r.measure().unwrap();
        assert!((d - 100.0).abs() < 0.1);
    }

    #[test]
    fn missing_echo_times_out_on_rise() {
        let sim = SimTransducer::new();
        sim.push_silence();
        let mut r = ranger(&sim, RangingConfig::new("front"));
        assert_eq!(
            r.measure(),
            Err(RangingError::Timeout {
                phase: EchoPhase::Rise
            })
        );
    }

    #[test]
    fn stuck_echo_times_out_on_fall() {
        let sim = SimTransducer::new();
        sim.push_stuck_high();
        let mut r = ranger(&sim, RangingConfig::new("front"));
        assert_eq!(
            r.measure(),
            Err(RangingError::Timeout {
                phase: EchoPhase::Fall
            })
        );
    }

    #[test]
    fn far_echo_is_out_of_range() {
        let sim = SimTransducer::new();
        sim.push_distance(300.0, DEFAULT_TEMPERATURE_C);
        let mut r = ranger(&sim, RangingConfig::new("front").with_max_distance(200.0));
        assert!(matches!(r.measure(), Err(RangingError::OutOfRange { .. })));
    }

    #[test]
    fn average_skips_failures() {
        let sim = SimTransducer::new();
        sim.push_distance(100.0, DEFAULT_TEMPERATURE_C);
        sim.push_silence();
        sim.push_distance(110.0, DEFAULT_TEMPERATURE_C);
        let mut r = ranger(&sim, RangingConfig::new("front"));
        let avg = r.average(3).unwrap();
        assert!((avg - 105.0).abs() < 0.1);
    }

    #[test]
    fn average_fails_when_all_attempts_fail() {
        let sim = SimTransducer::new();
        let mut r = ranger(&sim, RangingConfig::new("front"));
        // Nothing programmed: every attempt is silent.
        assert_eq!(
            r.average(3),
            Err(RangingError::NoValidReading { attempts: 3 })
        );
        assert_eq!(
            r.average(0),
            Err(RangingError::NoValidReading { attempts: 0 })
        );
    }

    #[test]
    fn offset_calibration_shifts_readings() {
        let sim = SimTransducer::new();
        for _ in 0..10 {
            sim.push_distance(98.0, DEFAULT_TEMPERATURE_C);
        }
        let mut r = ranger(&sim, RangingConfig::new("front"));
        let offset = r.calibrate_offset(100.0).unwrap();
        assert!((offset - 2.0).abs() < 0.1);

        sim.push_distance(50.0, DEFAULT_TEMPERATURE_C);
        let d = r.measure().unwrap();
        assert!((d - 52.0).abs() < 0.2);
    }

    #[test]
    fn failed_offset_calibration_keeps_previous_offset() {
        let sim = SimTransducer::new();
        let mut r = ranger(&sim, RangingConfig::new("front"));
        assert!(r.calibrate_offset(100.0).is_err());
        assert_eq!(r.config().offset_cm, 0.0);
    }

    #[test]
    fn ranger_is_a_ranging_sensor() {
        let sim = SimTransducer::new();
        sim.push_distance(42.0, DEFAULT_TEMPERATURE_C);
        let mut boxed: Box<dyn RangingSensor> =
            Box::new(ranger(&sim, RangingConfig::new("left").with_confidence(0.8)));
        assert_eq!(boxed.id(), "left");
        assert_eq!(boxed.kind(), SensorKind::Distance);
        assert!((boxed.confidence() - 0.8).abs() < 1e-12);
        assert!((boxed.measure().unwrap() - 42.0).abs() < 0.1);
    }
}
