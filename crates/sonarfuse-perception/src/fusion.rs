//! Sensor Fusion Engine.
//!
//! Combines the latest readings of every sensor of one [`SensorKind`] into a
//! single trusted [`FusedReading`]:
//!
//! 1. collect the newest reading per sensor, skipping low-confidence ones;
//! 2. drop outliers against the candidate mean;
//! 3. weighted average with `weight = static weight × confidence`;
//! 4. smooth through the channel's scalar Kalman estimator.
//!
//! ```text
//! fused = Σ(vᵢ·wᵢ) / Σwᵢ        confidence = min(Σwᵢ, 1)
//! ```
//!
//! The engine also flags statistical shifts in individual sensors and
//! extrapolates short linear trends.  Neither feeds back into `fuse`.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use sonarfuse_perception::fusion::{FusionConfig, FusionEngine};
//! use sonarfuse_perception::registry::{SensorProfile, SensorRegistry};
//! use sonarfuse_types::{SensorKind, SensorReading};
//!
//! let registry = Arc::new(SensorRegistry::default());
//! for (id, v) in [("a", 100.0), ("b", 102.0), ("c", 98.0)] {
//!     registry.register(id, SensorProfile::default());
//!     registry.record(SensorReading::new(id, v, 0.9));
//! }
//!
//! let engine = FusionEngine::new(Arc::clone(&registry), FusionConfig::default());
//! let fused = engine.fuse(SensorKind::Distance).unwrap();
//! assert!(fused.value >= 98.0 && fused.value <= 102.0);
//! assert_eq!(fused.contributing_sensor_ids.len(), 3);
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sonarfuse_types::{
    AnomalyEvent, AnomalyKind, FUSION_METHOD_WEIGHTED_KALMAN, FusedReading, SensorKind,
    clamp_confidence,
};
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::fit::{mean, polyfit, polyval, std_dev};
use crate::kalman::{KalmanConfig, KalmanEstimator, confidence_variance};
use crate::lock;
use crate::outlier::{FUSION_OUTLIER_SIGMA, OutlierScore, remove_outliers};
use crate::registry::SensorRegistry;

// ────────────────────────────────────────────────────────────────────────────
// Configuration
// ────────────────────────────────────────────────────────────────────────────

/// Tuning of a [`FusionEngine`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    /// Readings below this confidence are ignored.
    pub min_confidence: f64,
    /// Fewer qualifying sensors than this yields no fused reading.
    pub min_sensors: usize,
    /// Outlier rejection threshold in units of residual spread.
    pub outlier_threshold: f64,
    /// Channel smoothing parameters.
    pub kalman: KalmanConfig,
    /// Size of each of the two windows compared by anomaly detection.
    pub anomaly_window: usize,
    pub anomaly_z_threshold: f64,
    /// Readings used for trend prediction.
    pub prediction_window: usize,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            min_confidence: 0.5,
            min_sensors: 1,
            outlier_threshold: FUSION_OUTLIER_SIGMA,
            kalman: KalmanConfig::default(),
            anomaly_window: 10,
            anomaly_z_threshold: 2.5,
            prediction_window: 10,
        }
    }
}

impl FusionConfig {
    pub fn with_min_confidence(mut self, min_confidence: f64) -> Self {
        self.min_confidence = min_confidence;
        self
    }

    pub fn with_min_sensors(mut self, min_sensors: usize) -> Self {
        self.min_sensors = min_sensors;
        self
    }

    pub fn with_outlier_threshold(mut self, sigma: f64) -> Self {
        self.outlier_threshold = sigma;
        self
    }

    pub fn with_kalman(mut self, kalman: KalmanConfig) -> Self {
        self.kalman = kalman;
        self
    }

    pub fn with_anomaly_z_threshold(mut self, z: f64) -> Self {
        self.anomaly_z_threshold = z;
        self
    }
}

// ────────────────────────────────────────────────────────────────────────────
// FusionEngine
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
struct Candidate {
    sensor_id: String,
    unit: String,
    confidence: f64,
    weight: f64,
}

/// Fuses per-kind channels over a shared [`SensorRegistry`].
pub struct FusionEngine {
    registry: Arc<SensorRegistry>,
    config: FusionConfig,
    channels: Mutex<HashMap<SensorKind, KalmanEstimator>>,
}

impl FusionEngine {
    pub fn new(registry: Arc<SensorRegistry>, config: FusionConfig) -> Self {
        Self {
            registry,
            config,
            channels: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &FusionConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<SensorRegistry> {
        &self.registry
    }

    /// Fuse the latest readings of every sensor of `kind`.
    ///
    /// `None` means there is no actionable reading: too few qualifying
    /// sensors, everything rejected as an outlier, or zero total weight.
    pub fn fuse(&self, kind: SensorKind) -> Option<FusedReading> {
        let mut samples: Vec<(Candidate, f64)> = Vec::new();
        for (sensor_id, profile) in self.registry.sensors_of(kind) {
            let Some(reading) = self.registry.latest(&sensor_id) else {
                trace!(sensor = %sensor_id, "no reading yet");
                continue;
            };
            if reading.confidence < self.config.min_confidence {
                trace!(sensor = %sensor_id, confidence = reading.confidence, "reading below confidence floor");
                continue;
            }
            samples.push((
                Candidate {
                    sensor_id,
                    unit: reading.unit,
                    confidence: reading.confidence,
                    weight: profile.weight * reading.confidence,
                },
                reading.value,
            ));
        }

        if samples.is_empty() || samples.len() < self.config.min_sensors {
            debug!(channel = %kind, qualifying = samples.len(), "not enough sensors to fuse");
            return None;
        }

        let mut kept = remove_outliers(
            &samples,
            self.config.outlier_threshold,
            OutlierScore::Standard,
        );
        if kept.len() < samples.len() {
            debug!(channel = %kind, rejected = samples.len() - kept.len(), "fusion outliers rejected");
        }
        if kept.is_empty() {
            return None;
        }

        let total_weight: f64 = kept.iter().map(|(c, _)| c.weight).sum();
        if total_weight.is_nan() || total_weight <= 0.0 {
            debug!(channel = %kind, "total fusion weight is zero");
            return None;
        }
        let raw = kept.iter().map(|(c, v)| v * c.weight).sum::<f64>() / total_weight;

        let confidences: Vec<f64> = kept.iter().map(|(c, _)| c.confidence).collect();
        let mean_confidence = mean(&confidences).unwrap_or(0.0);
        let variance = confidence_variance(self.config.kalman.measurement_variance, mean_confidence);
        let value = {
            let mut channels = lock(&self.channels);
            channels
                .entry(kind)
                .or_insert_with(|| KalmanEstimator::new(self.config.kalman))
                .update_with_variance(raw, variance)
        };

        kept.sort_by(|(a, _), (b, _)| {
            b.weight
                .total_cmp(&a.weight)
                .then_with(|| a.sensor_id.cmp(&b.sensor_id))
        });
        let unit = kept[0].0.unit.clone();
        let contributing_sensor_ids: Vec<String> =
            kept.into_iter().map(|(c, _)| c.sensor_id).collect();

        trace!(channel = %kind, raw, value, sensors = contributing_sensor_ids.len(), "channel fused");
        Some(FusedReading {
            value,
            unit,
            timestamp: Utc::now(),
            confidence: clamp_confidence(total_weight.min(1.0)),
            contributing_sensor_ids,
            fusion_method: FUSION_METHOD_WEIGHTED_KALMAN.to_string(),
        })
    }

    /// Fuse every kind that has registered sensors.  Kinds with no actionable
    /// reading are absent from the map.
    pub fn fuse_all(&self) -> BTreeMap<SensorKind, FusedReading> {
        self.registry
            .kinds()
            .into_iter()
            .filter_map(|kind| self.fuse(kind).map(|f| (kind, f)))
            .collect()
    }

    /// Forget the smoothing state of one channel.
    pub fn reset_channel(&self, kind: SensorKind) {
        lock(&self.channels).remove(&kind);
    }

    /// Compare each sensor's newest window against the window before it and
    /// report sensors whose mean shifted by more than the z threshold.
    pub fn detect_anomalies(&self) -> Vec<AnomalyEvent> {
        let window = self.config.anomaly_window.max(1);
        let mut events = Vec::new();

        for sensor_id in self.registry.ids() {
            let values = self.registry.recent_values(&sensor_id, 2 * window);
            if values.len() < 2 * window {
                continue;
            }
            let (older, recent) = values.split_at(window);
            let (Some(historical_mean), Some(older_std), Some(recent_mean)) =
                (mean(older), std_dev(older), mean(recent))
            else {
                continue;
            };
            if older_std <= 0.0 {
                continue;
            }

            let z_score = (recent_mean - historical_mean).abs() / older_std;
            if z_score > self.config.anomaly_z_threshold {
                warn!(
                    sensor = %sensor_id,
                    z_score,
                    recent_mean,
                    historical_mean,
                    "statistical shift detected"
                );
                events.push(AnomalyEvent {
                    id: Uuid::new_v4(),
                    sensor_id,
                    kind: AnomalyKind::StatisticalShift,
                    z_score,
                    recent_mean,
                    historical_mean,
                    timestamp: Utc::now(),
                });
            }
        }
        events
    }

    /// Extrapolate a least-squares line through the sensor's recent values,
    /// `steps_ahead` samples past the newest one.
    pub fn predict_next(&self, sensor_id: &str, steps_ahead: usize) -> Option<f64> {
        let values = self
            .registry
            .recent_values(sensor_id, self.config.prediction_window);
        if values.len() < 2 {
            return None;
        }
        let xs: Vec<f64> = (0..values.len()).map(|i| i as f64).collect();
        let line = polyfit(&xs, &values, 1)?;
        Some(polyval(&line, (values.len() - 1 + steps_ahead) as f64))
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::SensorProfile;
    use proptest::prelude::*;
    use sonarfuse_types::SensorReading;

    fn setup(readings: &[(&str, f64, f64)]) -> (Arc<SensorRegistry>, FusionEngine) {
        let registry = Arc::new(SensorRegistry::default());
        for (id, value, confidence) in readings {
            registry.register(*id, SensorProfile::default());
            registry.record(SensorReading::new(*id, *value, *confidence));
        }
        let engine = FusionEngine::new(Arc::clone(&registry), FusionConfig::default());
        (registry, engine)
    }

    // -----------------------------------------------------------------------
    // fuse
    // -----------------------------------------------------------------------

    #[test]
    fn fuses_three_agreeing_sensors() {
        let (_, engine) = setup(&[("a", 100.0, 0.9), ("b", 102.0, 0.9), ("c", 98.0, 0.9)]);
        let fused = engine.fuse(SensorKind::Distance).unwrap();
        assert!(fused.value >= 98.0 && fused.value <= 102.0);
        assert_eq!(fused.confidence, 1.0);
        assert_eq!(fused.contributing_sensor_ids, vec!["a", "b", "c"]);
        assert_eq!(fused.fusion_method, FUSION_METHOD_WEIGHTED_KALMAN);
        assert_eq!(fused.unit, "cm");
    }

    #[test]
    fn none_when_all_below_confidence_floor() {
        let (_, engine) = setup(&[("a", 100.0, 0.3), ("b", 102.0, 0.4)]);
        assert!(engine.fuse(SensorKind::Distance).is_none());
    }

    #[test]
    fn none_without_sensors_of_kind() {
        let (_, engine) = setup(&[("a", 100.0, 0.9)]);
        assert!(engine.fuse(SensorKind::Temperature).is_none());
    }

    #[test]
    fn min_sensors_is_enforced() {
        let registry = Arc::new(SensorRegistry::default());
        registry.record(SensorReading::new("a", 100.0, 0.9));
        let engine = FusionEngine::new(
            Arc::clone(&registry),
            FusionConfig::default().with_min_sensors(2),
        );
        assert!(engine.fuse(SensorKind::Distance).is_none());
    }

    #[test]
    fn weights_order_contributors() {
        let registry = Arc::new(SensorRegistry::default());
        registry.register("low", SensorProfile::default().with_weight(0.2));
        registry.register("high", SensorProfile::default().with_weight(0.8));
        registry.record(SensorReading::new("low", 110.0, 1.0));
        registry.record(SensorReading::new("high", 100.0, 1.0));
        let engine = FusionEngine::new(Arc::clone(&registry), FusionConfig::default());
        let fused = engine.fuse(SensorKind::Distance).unwrap();
        assert_eq!(fused.contributing_sensor_ids, vec!["high", "low"]);
        // First update passes the weighted mean straight through.
        assert!((fused.value - 102.0).abs() < 1e-9);
        assert!((fused.confidence - 1.0).abs() < 1e-12);
    }

    #[test]
    fn low_total_weight_lowers_confidence() {
        let registry = Arc::new(SensorRegistry::default());
        registry.register("a", SensorProfile::default().with_weight(0.5));
        registry.record(SensorReading::new("a", 100.0, 0.8));
        let engine = FusionEngine::new(Arc::clone(&registry), FusionConfig::default());
        let fused = engine.fuse(SensorKind::Distance).unwrap();
        assert!((fused.confidence - 0.4).abs() < 1e-12);
    }

    #[test]
    fn zero_weight_yields_none() {
        let registry = Arc::new(SensorRegistry::default());
        registry.register("a", SensorProfile::default().with_weight(0.0));
        registry.record(SensorReading::new("a", 100.0, 0.9));
        let engine = FusionEngine::new(Arc::clone(&registry), FusionConfig::default());
        assert!(engine.fuse(SensorKind::Distance).is_none());
    }

    #[test]
    fn mild_disagreement_is_not_an_outlier() {
        let (_, engine) = setup(&[
            ("a", 100.0, 0.9),
            ("b", 100.0, 0.9),
            ("c", 100.0, 0.9),
            ("d", 110.0, 0.9),
        ]);
        let fused = engine.fuse(SensorKind::Distance).unwrap();
        assert_eq!(fused.contributing_sensor_ids, vec!["a", "b", "c", "d"]);
        assert!((fused.value - 102.5).abs() < 1e-9);
    }

    #[test]
    fn outlier_sensor_is_excluded() {
        let mut readings: Vec<(String, f64)> =
            (0..19).map(|i| (format!("s{i}"), 100.0 + (i % 3) as f64)).collect();
        readings.push(("spike".into(), 900.0));
        let registry = Arc::new(SensorRegistry::default());
        for (id, v) in &readings {
            registry.record(SensorReading::new(id.as_str(), *v, 1.0));
        }
        let engine = FusionEngine::new(Arc::clone(&registry), FusionConfig::default());
        let fused = engine.fuse(SensorKind::Distance).unwrap();
        assert!(!fused.contributing_sensor_ids.contains(&"spike".to_string()));
        assert!(fused.value < 103.0);
    }

    #[test]
    fn channel_smoothing_and_reset() {
        let (registry, engine) = setup(&[("a", 100.0, 1.0)]);
        assert_eq!(engine.fuse(SensorKind::Distance).map(|f| f.value), Some(100.0));
        registry.record(SensorReading::new("a", 200.0, 1.0));
        let smoothed = engine.fuse(SensorKind::Distance).unwrap().value;
        assert!(smoothed > 100.0 && smoothed < 200.0);
        engine.reset_channel(SensorKind::Distance);
        assert_eq!(engine.fuse(SensorKind::Distance).map(|f| f.value), Some(200.0));
    }

    #[test]
    fn fuse_all_covers_each_kind() {
        let registry = Arc::new(SensorRegistry::default());
        registry.register("d", SensorProfile::new(SensorKind::Distance));
        registry.register("t", SensorProfile::new(SensorKind::Temperature));
        registry.record(SensorReading::new("d", 50.0, 1.0));
        registry.record(SensorReading::new("t", 21.0, 1.0).with_unit("celsius"));
        let engine = FusionEngine::new(Arc::clone(&registry), FusionConfig::default());
        let all = engine.fuse_all();
        assert_eq!(all.len(), 2);
        assert_eq!(all[&SensorKind::Temperature].unit, "celsius");
    }

    // -----------------------------------------------------------------------
    // anomalies
    // -----------------------------------------------------------------------

    #[test]
    fn step_change_is_flagged() {
        let registry = Arc::new(SensorRegistry::default());
        for i in 0..10 {
            registry.record(SensorReading::new("front", 100.0 + (i % 2) as f64, 1.0));
        }
        for _ in 0..10 {
            registry.record(SensorReading::new("front", 150.0, 1.0));
        }
        let engine = FusionEngine::new(Arc::clone(&registry), FusionConfig::default());
        let events = engine.detect_anomalies();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].sensor_id, "front");
        assert_eq!(events[0].kind, AnomalyKind::StatisticalShift);
        assert!((events[0].recent_mean - 150.0).abs() < 1e-9);
        assert!((events[0].historical_mean - 100.5).abs() < 1e-9);
        assert!(events[0].z_score > 2.5);
    }

    proptest! {
        #[test]
        fn step_after_twenty_stable_readings_is_flagged(
            base in 10.0f64..400.0,
            noise in prop::collection::vec(-1.0f64..1.0, 20),
        ) {
            prop_assume!(std_dev(&noise[10..]).is_some_and(|s| s > 1e-6));
            let stable: Vec<f64> = noise.iter().map(|n| base + n).collect();
            let sigma = std_dev(&stable).unwrap();

            let registry = Arc::new(SensorRegistry::default());
            for v in &stable {
                registry.record(SensorReading::new("front", *v, 1.0));
            }
            for v in &stable[10..] {
                registry.record(SensorReading::new("front", v + 10.0 * sigma, 1.0));
            }
            let engine = FusionEngine::new(Arc::clone(&registry), FusionConfig::default());
            let events = engine.detect_anomalies();
            prop_assert!(events.iter().any(|e| e.sensor_id == "front"));
        }
    }

    #[test]
    fn steady_sensor_is_not_flagged() {
        let registry = Arc::new(SensorRegistry::default());
        for i in 0..30 {
            registry.record(SensorReading::new("front", 100.0 + (i % 3) as f64, 1.0));
        }
        let engine = FusionEngine::new(Arc::clone(&registry), FusionConfig::default());
        assert!(engine.detect_anomalies().is_empty());
    }

    #[test]
    fn short_or_constant_history_is_skipped() {
        let registry = Arc::new(SensorRegistry::default());
        for i in 0..19 {
            registry.record(SensorReading::new("short", 100.0 + (i % 2) as f64 * 50.0, 1.0));
        }
        for i in 0..20 {
            let v = if i < 10 { 100.0 } else { 500.0 };
            registry.record(SensorReading::new("flat", v, 1.0));
        }
        let engine = FusionEngine::new(Arc::clone(&registry), FusionConfig::default());
        assert!(engine.detect_anomalies().is_empty());
    }

    // -----------------------------------------------------------------------
    // prediction
    // -----------------------------------------------------------------------

    #[test]
    fn ramp_is_extrapolated() {
        let registry = Arc::new(SensorRegistry::default());
        for i in 1..=5 {
            registry.record(SensorReading::new("front", 10.0 * i as f64, 1.0));
        }
        let engine = FusionEngine::new(Arc::clone(&registry), FusionConfig::default());
        assert!((engine.predict_next("front", 1).unwrap() - 60.0).abs() < 1e-9);
        assert!((engine.predict_next("front", 3).unwrap() - 80.0).abs() < 1e-9);
    }

    #[test]
    fn prediction_uses_recent_window() {
        let registry = Arc::new(SensorRegistry::default());
        for _ in 0..20 {
            registry.record(SensorReading::new("front", 500.0, 1.0));
        }
        for i in 0..10 {
            registry.record(SensorReading::new("front", i as f64, 1.0));
        }
        let engine = FusionEngine::new(Arc::clone(&registry), FusionConfig::default());
        assert!((engine.predict_next("front", 1).unwrap() - 10.0).abs() < 1e-9);
    }

    #[test]
    fn prediction_needs_two_readings() {
        let (_, engine) = setup(&[("front", 10.0, 1.0)]);
        assert_eq!(engine.predict_next("front", 1), None);
        assert_eq!(engine.predict_next("missing", 1), None);
    }
}
