//! `sonarfuse-perception` – turns raw ranging output into trusted readings.
//!
//! # Modules
//!
//! - [`outlier`] – residual z-score outlier rejection shared by
//!   calibration and fusion.
//! - [`fit`] – least squares (Householder QR), polynomial regression and a
//!   Levenberg–Marquardt exponential fit.
//! - [`calibration`] – [`CalibrationEngine`][calibration::CalibrationEngine]:
//!   per-sensor models fitted from operator ground truth.
//! - [`document`] – [`CalibrationDocument`][document::CalibrationDocument] and
//!   [`HistoryDocument`][document::HistoryDocument]:
//!   JSON persistence of calibration state and reading history.
//! - [`kalman`] – [`KalmanEstimator`][kalman::KalmanEstimator]: scalar
//!   smoothing filter.
//! - [`buffer`] – [`HistoryBuffer`][buffer::HistoryBuffer]: bounded reading
//!   history.
//! - [`registry`] – [`SensorRegistry`][registry::SensorRegistry]: per-sensor
//!   profiles and histories.
//! - [`fusion`] – [`FusionEngine`][fusion::FusionEngine]: weighted,
//!   outlier-filtered, Kalman-smoothed fusion plus anomaly detection and
//!   trend prediction.
//! - [`context`] – [`SensorContext`][context::SensorContext]: everything
//!   above wired together.

use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

pub mod buffer;
pub mod calibration;
pub mod context;
pub mod document;
pub mod fit;
pub mod fusion;
pub mod kalman;
pub mod outlier;
pub mod registry;

pub use calibration::{CalibrationEngine, CalibrationSettings, SensorCalibrationConfig};
pub use context::{PerceptionConfig, SensorContext};
pub use document::{CalibrationDocument, DocumentError, HistoryDocument};
pub use fusion::{FusionConfig, FusionEngine};
pub use kalman::{KalmanConfig, KalmanEstimator};
pub use registry::{SensorProfile, SensorRegistry};

// A panicking writer must not take every reader down with it.

pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn read<T>(l: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    l.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write<T>(l: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    l.write().unwrap_or_else(PoisonError::into_inner)
}
