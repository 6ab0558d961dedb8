//! Scalar Kalman estimator used to smooth fused channels and, optionally,
//! individual sensors.
//!
//! # Example
//!
//! ```rust
//! use sonarfuse_perception::kalman::{KalmanConfig, KalmanEstimator};
//!
//! let mut kf = KalmanEstimator::new(KalmanConfig::default());
//! assert_eq!(kf.update(100.0), 100.0); // first measurement passes through
//! let next = kf.update(110.0);
//! assert!(next > 100.0 && next < 110.0);
//! ```

use serde::{Deserialize, Serialize};

/// Lowest confidence used when converting confidence to variance.
const CONFIDENCE_FLOOR: f64 = 0.01;

/// Noise parameters of a [`KalmanEstimator`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KalmanConfig {
    /// Process noise added to the variance before every update.
    pub process_variance: f64,
    /// Measurement noise used when the caller supplies none.
    pub measurement_variance: f64,
}

impl Default for KalmanConfig {
    fn default() -> Self {
        Self {
            process_variance: 1e-5,
            measurement_variance: 1e-3,
        }
    }
}

impl KalmanConfig {
    pub fn with_process_variance(mut self, q: f64) -> Self {
        self.process_variance = q;
        self
    }

    pub fn with_measurement_variance(mut self, r: f64) -> Self {
        self.measurement_variance = r;
        self
    }

    /// Replace unusable values with the defaults: negative or non-finite
    /// process noise, and non-positive measurement noise.
    fn sanitized(self) -> Self {
        let defaults = Self::default();
        Self {
            process_variance: if self.process_variance.is_finite() && self.process_variance >= 0.0
            {
                self.process_variance
            } else {
                defaults.process_variance
            },
            measurement_variance: if self.measurement_variance.is_finite()
                && self.measurement_variance > 0.0
            {
                self.measurement_variance
            } else {
                defaults.measurement_variance
            },
        }
    }
}

/// Current belief of a [`KalmanEstimator`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct KalmanState {
    pub estimate: f64,
    pub variance: f64,
    pub initialized: bool,
}

/// Map a reading confidence onto a measurement variance: low confidence
/// means high variance.
pub fn confidence_variance(base: f64, confidence: f64) -> f64 {
    let confidence = if confidence.is_nan() { 0.0 } else { confidence };
    base / confidence.max(CONFIDENCE_FLOOR)
}

/// One-dimensional Kalman filter with a constant-value process model.
#[derive(Debug, Clone)]
pub struct KalmanEstimator {
    config: KalmanConfig,
    state: KalmanState,
}

impl KalmanEstimator {
    pub fn new(config: KalmanConfig) -> Self {
        Self {
            config: config.sanitized(),
            state: KalmanState::default(),
        }
    }

    pub fn config(&self) -> KalmanConfig {
        self.config
    }

    /// Fold in a measurement with the configured measurement variance.
    pub fn update(&mut self, measurement: f64) -> f64 {
        self.update_with_variance(measurement, self.config.measurement_variance)
    }

    /// Fold in a measurement with a per-call variance.  Non-positive or
    /// non-finite variances fall back to the configured one.
    pub fn update_with_variance(&mut self, measurement: f64, variance: f64) -> f64 {
        let r = if variance.is_finite() && variance > 0.0 {
            variance
        } else {
            self.config.measurement_variance
        };

        if !self.state.initialized {
            self.state = KalmanState {
                estimate: measurement,
                variance: r,
                initialized: true,
            };
            return measurement;
        }

        let p = self.state.variance + self.config.process_variance;
        let gain = p / (p + r);
        self.state.estimate += gain * (measurement - self.state.estimate);
        // Equal to (1 - gain)·p without the cancellation when r ≪ p.
        self.state.variance = p * r / (p + r);
        self.state.estimate
    }

    /// Forget everything; the next update re-initializes.
    pub fn reset(&mut self) {
        self.state = KalmanState::default();
    }

    pub fn state(&self) -> KalmanState {
        self.state
    }

    /// Current estimate, if any measurement has been folded in.
    pub fn estimate(&self) -> Option<f64> {
        self.state.initialized.then_some(self.state.estimate)
    }
}

impl Default for KalmanEstimator {
    fn default() -> Self {
        Self::new(KalmanConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn first_update_passes_through() {
        let mut kf = KalmanEstimator::default();
        assert_eq!(kf.estimate(), None);
        assert_eq!(kf.update(42.0), 42.0);
        let s = kf.state();
        assert!(s.initialized);
        assert_eq!(s.variance, 1e-3);
    }

    #[test]
    fn second_update_follows_gain_formula() {
        let mut kf = KalmanEstimator::default();
        kf.update(100.0);
        let p = 1e-3 + 1e-5;
        let k = p / (p + 1e-3);
        let expected = 100.0 + k * (110.0 - 100.0);
        assert!((kf.update(110.0) - expected).abs() < 1e-12);
        assert!((kf.state().variance - (1.0 - k) * p).abs() < 1e-15);
        assert!((kf.state().variance - p * 1e-3 / (p + 1e-3)).abs() < 1e-18);
    }

    #[test]
    fn variance_stays_positive_across_extreme_ratios() {
        let mut kf = KalmanEstimator::default();
        kf.update_with_variance(1.0, 1e6);
        kf.update_with_variance(1.0, 1e-12);
        let v = kf.state().variance;
        assert!(v > 0.0);
        assert!((v - 1e-12).abs() < 1e-20);

        let next = kf.update_with_variance(5.0, 1.0);
        assert!(next > 1.0);
        assert!(kf.state().variance > 0.0);
    }

    #[test]
    fn non_positive_variance_uses_default() {
        let mut kf = KalmanEstimator::default();
        kf.update_with_variance(5.0, -1.0);
        assert_eq!(kf.state().variance, 1e-3);
        kf.update_with_variance(6.0, 0.0);
        assert!(kf.state().variance > 0.0);
    }

    #[test]
    fn broken_config_is_sanitized() {
        let kf = KalmanEstimator::new(
            KalmanConfig::default()
                .with_process_variance(f64::NAN)
                .with_measurement_variance(0.0),
        );
        assert_eq!(kf.config(), KalmanConfig::default());
    }

    #[test]
    fn reset_reinitializes() {
        let mut kf = KalmanEstimator::default();
        kf.update(1.0);
        kf.update(2.0);
        kf.reset();
        assert_eq!(kf.update(9.0), 9.0);
    }

    #[test]
    fn confidence_maps_to_variance() {
        assert_eq!(confidence_variance(1e-3, 1.0), 1e-3);
        assert!((confidence_variance(1e-3, 0.5) - 2e-3).abs() < 1e-15);
        assert_eq!(confidence_variance(1e-3, 0.0), 1e-3 / 0.01);
        assert_eq!(confidence_variance(1e-3, f64::NAN), 1e-3 / 0.01);
    }

    proptest! {
        #[test]
        fn variance_stays_positive(
            zs in prop::collection::vec(-500.0f64..500.0, 1..50),
            rs in prop::collection::vec(-1.0f64..1.0, 50),
        ) {
            let mut kf = KalmanEstimator::default();
            for (z, r) in zs.iter().zip(&rs) {
                kf.update_with_variance(*z, *r);
                prop_assert!(kf.state().variance > 0.0);
            }
        }

        #[test]
        fn estimate_within_measurement_range(zs in prop::collection::vec(-500.0f64..500.0, 1..50)) {
            let mut kf = KalmanEstimator::default();
            for z in &zs {
                kf.update(*z);
            }
            let lo = zs.iter().copied().fold(f64::INFINITY, f64::min);
            let hi = zs.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            let e = kf.state().estimate;
            prop_assert!(e >= lo - 1e-9 && e <= hi + 1e-9);
        }
    }
}
