//! [`CalibrationEngine`] – per-sensor calibration from operator-supplied
//! ground truth.
//!
//! Each sensor moves through *uncalibrated → calibrated → re-calibrated*;
//! every successful [`calibrate`][CalibrationEngine::calibrate] replaces the
//! previous result.  Points and results live in a per-sensor slot guarded by
//! its own `Mutex`, so calibrating one sensor never blocks another.
//!
//! # Example
//!
//! ```rust
//! use std::collections::BTreeMap;
//! use sonarfuse_perception::calibration::{CalibrationEngine, CalibrationSettings};
//! use sonarfuse_types::ModelKind;
//!
//! let engine = CalibrationEngine::new(CalibrationSettings::default());
//! for m in [10.0, 20.0, 30.0, 40.0, 50.0] {
//!     engine.add_point("front", m, 2.0 * m + 3.0, BTreeMap::new());
//! }
//! let result = engine.calibrate("front", Some(ModelKind::Linear)).unwrap();
//! assert!((result.r_squared - 1.0).abs() < 1e-9);
//! assert!((engine.apply("front", 25.0) - 53.0).abs() < 1e-9);
//! ```

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, RwLock};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sonarfuse_types::{
    CalibrationError, CalibrationModel, CalibrationPoint, CalibrationResult, ModelKind,
    ValidationReport,
};
use tracing::{debug, info, warn};

use crate::document::CalibrationDocument;
use crate::fit::{ExpFitFailure, fit_exponential, mean, polyfit, std_dev};
use crate::outlier::{CALIBRATION_OUTLIER_SIGMA, remove_fit_outliers};
use crate::{lock, read, write};

// ────────────────────────────────────────────────────────────────────────────
// Settings
// ────────────────────────────────────────────────────────────────────────────

/// Per-sensor calibration requirements.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorCalibrationConfig {
    /// Minimum number of points before a fit is attempted.
    pub required_points: usize,
    /// Mean absolute error (cm) a validation must stay within.
    pub tolerance_cm: f64,
    /// Model used when `calibrate` is called without one.
    pub default_model: ModelKind,
}

impl Default for SensorCalibrationConfig {
    fn default() -> Self {
        Self {
            required_points: 5,
            tolerance_cm: 2.0,
            default_model: ModelKind::Linear,
        }
    }
}

impl SensorCalibrationConfig {
    pub fn with_required_points(mut self, n: usize) -> Self {
        self.required_points = n;
        self
    }

    pub fn with_tolerance_cm(mut self, tolerance: f64) -> Self {
        self.tolerance_cm = tolerance;
        self
    }

    pub fn with_default_model(mut self, model: ModelKind) -> Self {
        self.default_model = model;
        self
    }
}

/// Outlier rejection applied before fitting one model kind.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutlierPolicy {
    pub enabled: bool,
    pub threshold_sigma: f64,
}

impl Default for OutlierPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold_sigma: CALIBRATION_OUTLIER_SIGMA,
        }
    }
}

impl OutlierPolicy {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }
}

/// Engine-wide calibration settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationSettings {
    /// Requirements for sensors without an explicit entry in `sensors`.
    pub defaults: SensorCalibrationConfig,
    pub sensors: BTreeMap<String, SensorCalibrationConfig>,
    pub linear_outliers: OutlierPolicy,
    pub polynomial_outliers: OutlierPolicy,
    pub exponential_outliers: OutlierPolicy,
    /// Starting `[a, b, c]` for the exponential fit.
    pub exponential_initial_guess: [f64; 3],
    pub exponential_max_iterations: usize,
}

impl Default for CalibrationSettings {
    fn default() -> Self {
        Self {
            defaults: SensorCalibrationConfig::default(),
            sensors: BTreeMap::new(),
            linear_outliers: OutlierPolicy::default(),
            polynomial_outliers: OutlierPolicy::default(),
            exponential_outliers: OutlierPolicy::default(),
            exponential_initial_guess: [1.0, 0.01, 0.0],
            exponential_max_iterations: 200,
        }
    }
}

impl CalibrationSettings {
    pub fn with_defaults(mut self, defaults: SensorCalibrationConfig) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn with_sensor(mut self, sensor_id: impl Into<String>, config: SensorCalibrationConfig) -> Self {
        self.sensors.insert(sensor_id.into(), config);
        self
    }

    pub fn with_outlier_policy(mut self, kind: ModelKind, policy: OutlierPolicy) -> Self {
        match kind {
            ModelKind::Linear => self.linear_outliers = policy,
            ModelKind::Polynomial { .. } => self.polynomial_outliers = policy,
            ModelKind::Exponential => self.exponential_outliers = policy,
        }
        self
    }

    pub fn with_exponential_max_iterations(mut self, iterations: usize) -> Self {
        self.exponential_max_iterations = iterations;
        self
    }

    /// Requirements for `sensor_id`, falling back to the defaults.
    pub fn for_sensor(&self, sensor_id: &str) -> &SensorCalibrationConfig {
        self.sensors.get(sensor_id).unwrap_or(&self.defaults)
    }

    pub fn outlier_policy(&self, kind: ModelKind) -> OutlierPolicy {
        match kind {
            ModelKind::Linear => self.linear_outliers,
            ModelKind::Polynomial { .. } => self.polynomial_outliers,
            ModelKind::Exponential => self.exponential_outliers,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Engine
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct CalibrationSlot {
    points: Vec<CalibrationPoint>,
    result: Option<CalibrationResult>,
}

impl CalibrationSlot {
    fn reset(&mut self) {
        self.points.clear();
        self.result = None;
    }
}

/// Fewest points `kind` can be fitted to.
fn min_fit_points(kind: ModelKind) -> usize {
    match kind {
        ModelKind::Linear => 2,
        ModelKind::Polynomial { degree } => degree + 1,
        ModelKind::Exponential => 3,
    }
}

/// Collects calibration points, fits models and applies them to raw values.
pub struct CalibrationEngine {
    settings: CalibrationSettings,
    slots: RwLock<HashMap<String, Arc<Mutex<CalibrationSlot>>>>,
}

impl Default for CalibrationEngine {
    fn default() -> Self {
        Self::new(CalibrationSettings::default())
    }
}

impl CalibrationEngine {
    pub fn new(settings: CalibrationSettings) -> Self {
        Self {
            settings,
            slots: RwLock::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &CalibrationSettings {
        &self.settings
    }

    fn existing_slot(&self, sensor_id: &str) -> Option<Arc<Mutex<CalibrationSlot>>> {
        read(&self.slots).get(sensor_id).cloned()
    }

    fn slot(&self, sensor_id: &str) -> Arc<Mutex<CalibrationSlot>> {
        if let Some(slot) = self.existing_slot(sensor_id) {
            return slot;
        }
        Arc::clone(write(&self.slots).entry(sensor_id.to_string()).or_default())
    }

    /// Record one operator-supplied point.
    pub fn add_point(
        &self,
        sensor_id: &str,
        measured: f64,
        true_value: f64,
        conditions: BTreeMap<String, f64>,
    ) {
        let point = CalibrationPoint::new(sensor_id, measured, true_value, conditions);
        let slot = self.slot(sensor_id);
        let mut slot = lock(&slot);
        slot.points.push(point);
        debug!(sensor = sensor_id, measured, true_value, points = slot.points.len(), "calibration point added");
    }

    /// Record a batch of `(measured, true)` points sharing the same
    /// conditions.
    pub fn add_points(&self, sensor_id: &str, pairs: &[(f64, f64)], conditions: BTreeMap<String, f64>) {
        let slot = self.slot(sensor_id);
        let mut slot = lock(&slot);
        slot.points.extend(
            pairs
                .iter()
                .map(|&(m, t)| CalibrationPoint::new(sensor_id, m, t, conditions.clone())),
        );
        debug!(sensor = sensor_id, added = pairs.len(), points = slot.points.len(), "calibration points added");
    }

    /// Fit a model to the sensor's points and store the result.
    ///
    /// `kind` defaults to the sensor's configured model.
    pub fn calibrate(
        &self,
        sensor_id: &str,
        kind: Option<ModelKind>,
    ) -> Result<CalibrationResult, CalibrationError> {
        let config = self.settings.for_sensor(sensor_id);
        let kind = kind.unwrap_or(config.default_model);
        let slot = self.slot(sensor_id);
        let mut slot = lock(&slot);

        if slot.points.len() < config.required_points {
            warn!(
                sensor = sensor_id,
                available = slot.points.len(),
                required = config.required_points,
                "not enough calibration points"
            );
            return Err(CalibrationError::InsufficientPoints {
                sensor_id: sensor_id.to_string(),
                available: slot.points.len(),
                required: config.required_points,
            });
        }

        let pairs: Vec<(f64, f64)> = slot
            .points
            .iter()
            .map(|p| (p.measured_value, p.true_value))
            .collect();
        let policy = self.settings.outlier_policy(kind);
        let pairs = if policy.enabled {
            let kept = remove_fit_outliers(&pairs, policy.threshold_sigma);
            if kept.len() < min_fit_points(kind) {
                warn!(
                    sensor = sensor_id,
                    kept = kept.len(),
                    "outlier rejection left too few points, fitting all of them"
                );
                pairs
            } else {
                if kept.len() < pairs.len() {
                    info!(sensor = sensor_id, removed = pairs.len() - kept.len(), "calibration outliers removed");
                }
                kept
            }
        } else {
            pairs
        };
        let (xs, ys): (Vec<f64>, Vec<f64>) = pairs.into_iter().unzip();

        let model = self.fit(sensor_id, kind, &xs, &ys)?;
        let result = score(sensor_id, model, &xs, &ys);
        info!(
            sensor = sensor_id,
            model = %kind,
            rmse = result.rmse,
            r_squared = result.r_squared,
            accuracy = result.accuracy_score,
            points = result.point_count,
            "sensor calibrated"
        );
        slot.result = Some(result.clone());
        Ok(result)
    }

    fn fit(
        &self,
        sensor_id: &str,
        kind: ModelKind,
        xs: &[f64],
        ys: &[f64],
    ) -> Result<CalibrationModel, CalibrationError> {
        let degenerate = |reason: String| CalibrationError::DegenerateFit {
            sensor_id: sensor_id.to_string(),
            reason,
        };
        match kind {
            ModelKind::Linear => polyfit(xs, ys, 1)
                .map(|c| CalibrationModel::Linear {
                    slope: c[0],
                    intercept: c[1],
                })
                .ok_or_else(|| degenerate("measured values have no spread".to_string())),
            ModelKind::Polynomial { degree } => polyfit(xs, ys, degree)
                .map(|coefficients| CalibrationModel::Polynomial { coefficients })
                .ok_or_else(|| {
                    degenerate(format!("cannot fit degree {degree} to {} points", xs.len()))
                }),
            ModelKind::Exponential => fit_exponential(
                xs,
                ys,
                self.settings.exponential_initial_guess,
                self.settings.exponential_max_iterations,
            )
            .map(|[a, b, c]| CalibrationModel::Exponential { a, b, c })
            .map_err(|failure| match failure {
                ExpFitFailure::Underdetermined => {
                    degenerate(format!("exponential fit needs 3 points, got {}", xs.len()))
                }
                ExpFitFailure::NotConverged { iterations }
                | ExpFitFailure::NonFinite { iterations } => {
                    warn!(sensor = sensor_id, iterations, "exponential fit did not converge");
                    CalibrationError::FitDidNotConverge {
                        sensor_id: sensor_id.to_string(),
                        iterations,
                    }
                }
            }),
        }
    }

    /// Calibrated value of a raw measurement.  Identity for uncalibrated
    /// sensors, and for models that evaluate to a non-finite value.
    pub fn apply(&self, sensor_id: &str, measured: f64) -> f64 {
        let Some(slot) = self.existing_slot(sensor_id) else {
            return measured;
        };
        let slot = lock(&slot);
        match &slot.result {
            Some(result) => {
                let value = result.model.evaluate(measured);
                if value.is_finite() {
                    value
                } else {
                    warn!(sensor = sensor_id, measured, "calibration produced non-finite value, using raw");
                    measured
                }
            }
            None => measured,
        }
    }

    /// Check the stored calibration against held-out `(measured, true)` pairs.
    pub fn validate(
        &self,
        sensor_id: &str,
        pairs: &[(f64, f64)],
    ) -> Result<ValidationReport, CalibrationError> {
        if self.result(sensor_id).is_none() {
            return Err(CalibrationError::NoCalibration(sensor_id.to_string()));
        }
        if pairs.is_empty() {
            return Err(CalibrationError::NoValidationPoints(sensor_id.to_string()));
        }

        let errors: Vec<f64> = pairs
            .iter()
            .map(|&(m, t)| (self.apply(sensor_id, m) - t).abs())
            .collect();
        let mean_error = mean(&errors).unwrap_or(0.0);
        let tolerance = self.settings.for_sensor(sensor_id).tolerance_cm;
        let report = ValidationReport {
            sensor_id: sensor_id.to_string(),
            point_count: errors.len(),
            mean_error,
            max_error: errors.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            min_error: errors.iter().copied().fold(f64::INFINITY, f64::min),
            std_error: std_dev(&errors).unwrap_or(0.0),
            passed: mean_error <= tolerance,
        };
        info!(sensor = sensor_id, mean_error, passed = report.passed, "calibration validated");
        Ok(report)
    }

    /// Most recent result for a sensor.
    pub fn result(&self, sensor_id: &str) -> Option<CalibrationResult> {
        let slot = self.existing_slot(sensor_id)?;
        let slot = lock(&slot);
        slot.result.clone()
    }

    /// Points recorded for a sensor, in submission order.
    pub fn points(&self, sensor_id: &str) -> Vec<CalibrationPoint> {
        match self.existing_slot(sensor_id) {
            Some(slot) => lock(&slot).points.clone(),
            None => Vec::new(),
        }
    }

    /// Latest result of every calibrated sensor.
    pub fn summary(&self) -> BTreeMap<String, CalibrationResult> {
        let slots: Vec<(String, Arc<Mutex<CalibrationSlot>>)> = read(&self.slots)
            .iter()
            .map(|(id, slot)| (id.clone(), Arc::clone(slot)))
            .collect();
        slots
            .into_iter()
            .filter_map(|(id, slot)| {
                let result = lock(&slot).result.clone();
                result.map(|r| (id, r))
            })
            .collect()
    }

    /// Forget points and results of one sensor, or of every sensor.
    ///
    /// Slots are emptied in place under their own lock, so a concurrent
    /// `add_point` or `calibrate` on the same sensor lands either wholly
    /// before or wholly after the clear.
    pub fn clear(&self, sensor_id: Option<&str>) {
        match sensor_id {
            Some(id) => {
                if let Some(slot) = self.existing_slot(id) {
                    lock(&slot).reset();
                }
                info!(sensor = id, "calibration cleared");
            }
            None => {
                for slot in read(&self.slots).values() {
                    lock(slot).reset();
                }
                info!("all calibrations cleared");
            }
        }
    }

    /// Snapshot every result and point into a persistable document.
    pub fn export(&self) -> CalibrationDocument {
        let slots: Vec<(String, Arc<Mutex<CalibrationSlot>>)> = read(&self.slots)
            .iter()
            .map(|(id, slot)| (id.clone(), Arc::clone(slot)))
            .collect();
        let mut document = CalibrationDocument::empty();
        for (id, slot) in slots {
            let slot = lock(&slot);
            if let Some(result) = &slot.result {
                document.calibration_results.insert(id.clone(), result.clone());
            }
            if !slot.points.is_empty() {
                document.calibration_points.insert(id, slot.points.clone());
            }
        }
        document.export_timestamp = Utc::now();
        document
    }

    /// Load a document.  Every sensor named in it, in either section, has
    /// its points and result replaced together: a section the sensor is
    /// missing from leaves it with no points or no result.  Other sensors
    /// are untouched.
    pub fn import(&self, document: CalibrationDocument) {
        let CalibrationDocument {
            mut calibration_results,
            mut calibration_points,
            export_timestamp,
        } = document;
        let results = calibration_results.len();
        let ids: BTreeSet<String> = calibration_results
            .keys()
            .chain(calibration_points.keys())
            .cloned()
            .collect();
        for id in &ids {
            let slot = self.slot(id);
            let mut slot = lock(&slot);
            slot.points = calibration_points.remove(id).unwrap_or_default();
            slot.result = calibration_results.remove(id);
        }
        info!(results, sensors = ids.len(), exported_at = %export_timestamp, "calibration document imported");
    }
}

/// Quality metrics of `model` over the fitted points.
fn score(sensor_id: &str, model: CalibrationModel, xs: &[f64], ys: &[f64]) -> CalibrationResult {
    let residuals: Vec<f64> = xs
        .iter()
        .zip(ys)
        .map(|(&x, &y)| y - model.evaluate(x))
        .collect();
    let n = residuals.len().max(1) as f64;
    let ss_res: f64 = residuals.iter().map(|r| r * r).sum();
    let rmse = (ss_res / n).sqrt();
    let mae = residuals.iter().map(|r| r.abs()).sum::<f64>() / n;

    let mean_true = mean(ys).unwrap_or(0.0);
    let ss_tot: f64 = ys.iter().map(|y| (y - mean_true) * (y - mean_true)).sum();
    let r_squared = if ss_tot > 0.0 { 1.0 - ss_res / ss_tot } else { 0.0 };
    let accuracy_score = if mean_true > 0.0 {
        (1.0 - rmse / mean_true).max(0.0)
    } else {
        0.0
    };

    CalibrationResult {
        sensor_id: sensor_id.to_string(),
        model,
        accuracy_score,
        rmse,
        mae,
        r_squared,
        point_count: xs.len(),
        timestamp: Utc::now(),
    }
}
