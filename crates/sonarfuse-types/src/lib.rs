//! `sonarfuse-types` – shared data model for the ranging and fusion stack.
//!
//! Every record that crosses a crate boundary lives here: raw and calibrated
//! [`SensorReading`]s, calibration records, [`FusedReading`]s, advisory
//! [`AnomalyEvent`]s, the bus envelope [`FusionEvent`], and the error
//! taxonomy ([`RangingError`], [`CalibrationError`]).

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Unit attached to every distance value produced by the stack.
pub const DISTANCE_UNIT: &str = "cm";

/// Unit attached to temperature readings.
pub const TEMPERATURE_UNIT: &str = "celsius";

/// Tag written into [`FusedReading::fusion_method`] by the fusion engine.
pub const FUSION_METHOD_WEIGHTED_KALMAN: &str = "weighted_average_kalman";

/// Clamp a confidence value into `[0, 1]`.  `NaN` maps to `0`.
pub fn clamp_confidence(confidence: f64) -> f64 {
    if confidence.is_nan() {
        0.0
    } else {
        confidence.clamp(0.0, 1.0)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Sensors and readings
// ────────────────────────────────────────────────────────────────────────────

/// Physical quantity a sensor measures.  Sensors of the same kind are fused
/// together into one channel.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum SensorKind {
    #[default]
    Distance,
    Temperature,
}

impl SensorKind {
    /// Name of the fusion channel for this kind (e.g. `"distance"`).
    pub fn channel(&self) -> &'static str {
        match self {
            SensorKind::Distance => "distance",
            SensorKind::Temperature => "temperature",
        }
    }

    /// Unit attached to readings of this kind.
    pub fn unit(&self) -> &'static str {
        match self {
            SensorKind::Distance => DISTANCE_UNIT,
            SensorKind::Temperature => TEMPERATURE_UNIT,
        }
    }
}

impl std::fmt::Display for SensorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.channel())
    }
}

/// A single (possibly calibrated) measurement from one sensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    pub sensor_id: String,
    /// Distance in centimetres (or the sensor's native unit for other kinds).
    pub value: f64,
    pub unit: String,
    pub timestamp: DateTime<Utc>,
    /// Trust in this reading, always within `[0, 1]`.
    pub confidence: f64,
    /// Mounting position of the sensor in the robot frame, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<[f64; 3]>,
}

impl SensorReading {
    /// Build a distance reading stamped with the current time.
    ///
    /// `confidence` is clamped to `[0, 1]`.
    pub fn new(sensor_id: impl Into<String>, value: f64, confidence: f64) -> Self {
        Self {
            sensor_id: sensor_id.into(),
            value,
            unit: DISTANCE_UNIT.to_string(),
            timestamp: Utc::now(),
            confidence: clamp_confidence(confidence),
            position: None,
        }
    }

    /// Attach a mounting position.
    pub fn with_position(mut self, position: [f64; 3]) -> Self {
        self.position = Some(position);
        self
    }

    /// Override the timestamp (replay, tests).
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Override the unit.
    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = unit.into();
        self
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Calibration records
// ────────────────────────────────────────────────────────────────────────────

/// A paired (raw sensor output, independently known true value) observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationPoint {
    pub sensor_id: String,
    pub measured_value: f64,
    pub true_value: f64,
    pub timestamp: DateTime<Utc>,
    /// Free-form environmental metadata, e.g. `"temperature" => 21.5`.
    #[serde(default)]
    pub environmental_conditions: BTreeMap<String, f64>,
}

impl CalibrationPoint {
    pub fn new(
        sensor_id: impl Into<String>,
        measured_value: f64,
        true_value: f64,
        environmental_conditions: BTreeMap<String, f64>,
    ) -> Self {
        Self {
            sensor_id: sensor_id.into(),
            measured_value,
            true_value,
            timestamp: Utc::now(),
            environmental_conditions,
        }
    }
}

/// Family of correction model requested at calibration time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
#[derive(Default)]
pub enum ModelKind {
    #[default]
    Linear,
    Polynomial { degree: usize },
    Exponential,
}

impl std::fmt::Display for ModelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModelKind::Linear => write!(f, "linear"),
            ModelKind::Polynomial { degree } => write!(f, "polynomial:{degree}"),
            ModelKind::Exponential => write!(f, "exponential"),
        }
    }
}

impl std::str::FromStr for ModelKind {
    type Err = String;

    /// Parses `linear`, `exponential`, `polynomial` (degree 2) or
    /// `polynomial:<degree>`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "linear" => Ok(ModelKind::Linear),
            "exponential" => Ok(ModelKind::Exponential),
            "polynomial" => Ok(ModelKind::Polynomial { degree: 2 }),
            other => match other.strip_prefix("polynomial:") {
                Some(d) => d
                    .parse::<usize>()
                    .map(|degree| ModelKind::Polynomial { degree })
                    .map_err(|_| format!("invalid polynomial degree '{d}'")),
                None => Err(format!("unknown calibration model '{s}'")),
            },
        }
    }
}

/// A fitted correction model.  Immutable once produced by a calibration run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum CalibrationModel {
    /// `y = slope·x + intercept`
    Linear { slope: f64, intercept: f64 },
    /// `y = c₀·xᵈ + c₁·xᵈ⁻¹ + … + c_d`, highest power first.
    Polynomial { coefficients: Vec<f64> },
    /// `y = a·e^(b·x) + c`
    Exponential { a: f64, b: f64, c: f64 },
}

impl CalibrationModel {
    /// The [`ModelKind`] this model was fitted as.
    pub fn kind(&self) -> ModelKind {
        match self {
            CalibrationModel::Linear { .. } => ModelKind::Linear,
            CalibrationModel::Polynomial { coefficients } => ModelKind::Polynomial {
                degree: coefficients.len().saturating_sub(1),
            },
            CalibrationModel::Exponential { .. } => ModelKind::Exponential,
        }
    }

    /// Model parameters as a flat numeric vector.
    pub fn parameters(&self) -> Vec<f64> {
        match self {
            CalibrationModel::Linear { slope, intercept } => vec![*slope, *intercept],
            CalibrationModel::Polynomial { coefficients } => coefficients.clone(),
            CalibrationModel::Exponential { a, b, c } => vec![*a, *b, *c],
        }
    }

    /// Evaluate the model at raw reading `x`.
    pub fn evaluate(&self, x: f64) -> f64 {
        match self {
            CalibrationModel::Linear { slope, intercept } => slope * x + intercept,
            // Horner's scheme.
            CalibrationModel::Polynomial { coefficients } => {
                coefficients.iter().fold(0.0, |acc, c| acc * x + c)
            }
            CalibrationModel::Exponential { a, b, c } => a * (b * x).exp() + c,
        }
    }
}

/// Outcome of a successful calibration run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationResult {
    pub sensor_id: String,
    pub model: CalibrationModel,
    /// `max(0, 1 − rmse / mean(true_values))`.
    pub accuracy_score: f64,
    pub rmse: f64,
    pub mae: f64,
    pub r_squared: f64,
    /// Points used for the fit, after outlier removal.
    pub point_count: usize,
    pub timestamp: DateTime<Utc>,
}

/// Error statistics of a calibration against held-out (measured, true) pairs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub sensor_id: String,
    pub point_count: usize,
    pub mean_error: f64,
    pub max_error: f64,
    pub min_error: f64,
    pub std_error: f64,
    /// `true` iff `mean_error` is within the sensor's tolerance.
    pub passed: bool,
}

// ────────────────────────────────────────────────────────────────────────────
// Fusion output
// ────────────────────────────────────────────────────────────────────────────

/// A single trusted estimate derived from several sensors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusedReading {
    pub value: f64,
    pub unit: String,
    pub timestamp: DateTime<Utc>,
    pub confidence: f64,
    /// Never empty; ordered by contribution weight, largest first.
    pub contributing_sensor_ids: Vec<String>,
    pub fusion_method: String,
}

/// Classification of an anomaly event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    /// The recent window mean departed from the preceding window.
    StatisticalShift,
}

/// Advisory drift/anomaly notification for one sensor.  Never auto-corrected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyEvent {
    pub id: Uuid,
    pub sensor_id: String,
    pub kind: AnomalyKind,
    pub z_score: f64,
    pub recent_mean: f64,
    pub historical_mean: f64,
    pub timestamp: DateTime<Utc>,
}

// ────────────────────────────────────────────────────────────────────────────
// Bus envelope
// ────────────────────────────────────────────────────────────────────────────

/// Unified event wrapper for the in-process fusion bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FusionEvent {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// e.g. `"sonarfuse-runtime::fusion_loop"`
    pub source: String,
    pub payload: FusionPayload,
}

impl FusionEvent {
    /// Wrap `payload` with a fresh id and the current time.
    pub fn new(source: impl Into<String>, payload: FusionPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            source: source.into(),
            payload,
        }
    }
}

/// Variants of data routed over the fusion bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum FusionPayload {
    Fused(FusedReading),
    Anomaly(AnomalyEvent),
    SensorFault { sensor_id: String, error: RangingError },
}

// ────────────────────────────────────────────────────────────────────────────
// Errors
// ────────────────────────────────────────────────────────────────────────────

/// Echo transition that failed to arrive inside the wait window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EchoPhase {
    /// Waiting for the echo line to go high.
    Rise,
    /// Waiting for the echo line to go low again.
    Fall,
}

/// Failure of a single ranging operation.  Never fatal to the caller.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RangingError {
    #[error("Echo timeout waiting for {phase:?} edge")]
    Timeout { phase: EchoPhase },

    #[error("Distance {distance_cm:.1} cm outside [0, {max_cm:.1}] cm")]
    OutOfRange { distance_cm: f64, max_cm: f64 },

    #[error("No valid reading in {attempts} attempts")]
    NoValidReading { attempts: usize },
}

/// Failure of a calibration operation, returned to the operator.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CalibrationError {
    #[error("Insufficient calibration points for {sensor_id}: {available} < {required}")]
    InsufficientPoints {
        sensor_id: String,
        available: usize,
        required: usize,
    },

    #[error("Fit for {sensor_id} did not converge after {iterations} iterations")]
    FitDidNotConverge { sensor_id: String, iterations: usize },

    #[error("No calibration available for {0}")]
    NoCalibration(String),

    #[error("Degenerate fit for {sensor_id}: {reason}")]
    DegenerateFit { sensor_id: String, reason: String },

    #[error("No validation points supplied for {0}")]
    NoValidationPoints(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reading_confidence_is_clamped() {
        assert_eq!(SensorReading::new("front", 10.0, 1.7).confidence, 1.0);
        assert_eq!(SensorReading::new("front", 10.0, -0.2).confidence, 0.0);
        assert_eq!(SensorReading::new("front", 10.0, f64::NAN).confidence, 0.0);
        assert_eq!(SensorReading::new("front", 10.0, 0.4).unit, "cm");
    }

    #[test]
    fn linear_model_evaluates() {
        let model = CalibrationModel::Linear {
            slope: 2.0,
            intercept: 3.0,
        };
        assert!((model.evaluate(5.0) - 13.0).abs() < 1e-12);
        assert_eq!(model.kind(), ModelKind::Linear);
        assert_eq!(model.parameters(), vec![2.0, 3.0]);
    }

    #[test]
    fn polynomial_model_uses_highest_power_first() {
        // 0.5x² - x + 4
        let model = CalibrationModel::Polynomial {
            coefficients: vec![0.5, -1.0, 4.0],
        };
        assert!((model.evaluate(2.0) - 4.0).abs() < 1e-12);
        assert_eq!(model.kind(), ModelKind::Polynomial { degree: 2 });
    }

    #[test]
    fn exponential_model_evaluates() {
        let model = CalibrationModel::Exponential {
            a: 2.0,
            b: 0.0,
            c: 1.0,
        };
        assert!((model.evaluate(123.0) - 3.0).abs() < 1e-12);
    }

    #[test]
    fn model_kind_parses() {
        assert_eq!("linear".parse::<ModelKind>(), Ok(ModelKind::Linear));
        assert_eq!(
            "Polynomial:3".parse::<ModelKind>(),
            Ok(ModelKind::Polynomial { degree: 3 })
        );
        assert_eq!(
            "polynomial".parse::<ModelKind>(),
            Ok(ModelKind::Polynomial { degree: 2 })
        );
        assert!("cubic".parse::<ModelKind>().is_err());
        assert!("polynomial:x".parse::<ModelKind>().is_err());
    }

    #[test]
    fn calibration_result_roundtrip() {
        let result = CalibrationResult {
            sensor_id: "front".to_string(),
            model: CalibrationModel::Exponential {
                a: 1.5,
                b: 0.01,
                c: -2.0,
            },
            accuracy_score: 0.97,
            rmse: 0.4,
            mae: 0.3,
            r_squared: 0.99,
            point_count: 9,
            timestamp: Utc::now(),
        };
        let json = serde_json::to_string(&result).unwrap();
        let back: CalibrationResult = serde_json::from_str(&json).unwrap();
        assert_eq!(result, back);
    }

    #[test]
    fn fusion_event_roundtrip() {
        let event = FusionEvent::new(
            "sonarfuse-runtime::sampler",
            FusionPayload::SensorFault {
                sensor_id: "left".to_string(),
                error: RangingError::Timeout {
                    phase: EchoPhase::Rise,
                },
            },
        );
        let json = serde_json::to_string(&event).unwrap();
        let back: FusionEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(event.id, back.id);
        assert!(matches!(
            back.payload,
            FusionPayload::SensorFault {
                error: RangingError::Timeout { phase: EchoPhase::Rise },
                ..
            }
        ));
    }

    #[test]
    fn error_display() {
        let err = CalibrationError::InsufficientPoints {
            sensor_id: "front".to_string(),
            available: 4,
            required: 5,
        };
        assert!(err.to_string().contains("4 < 5"));

        let err2 = RangingError::OutOfRange {
            distance_cm: 512.0,
            max_cm: 400.0,
        };
        assert!(err2.to_string().contains("512.0"));
    }
}
