//! [`SensorContext`] – the explicit perception context shared by samplers,
//! the fusion loop and operator commands.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sonarfuse_types::SensorReading;
use tracing::debug;

use crate::buffer::DEFAULT_HISTORY_CAPACITY;
use crate::calibration::{CalibrationEngine, CalibrationSettings};
use crate::fusion::{FusionConfig, FusionEngine};
use crate::registry::{SensorProfile, SensorRegistry};

/// Configuration of a whole [`SensorContext`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PerceptionConfig {
    /// Readings retained per sensor.
    pub history_capacity: usize,
    pub fusion: FusionConfig,
    pub calibration: CalibrationSettings,
}

impl Default for PerceptionConfig {
    fn default() -> Self {
        Self {
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            fusion: FusionConfig::default(),
            calibration: CalibrationSettings::default(),
        }
    }
}

impl PerceptionConfig {
    pub fn with_history_capacity(mut self, capacity: usize) -> Self {
        self.history_capacity = capacity;
        self
    }

    pub fn with_fusion(mut self, fusion: FusionConfig) -> Self {
        self.fusion = fusion;
        self
    }

    pub fn with_calibration(mut self, calibration: CalibrationSettings) -> Self {
        self.calibration = calibration;
        self
    }
}

/// Registry, calibration and fusion engines wired together.
pub struct SensorContext {
    registry: Arc<SensorRegistry>,
    calibration: Arc<CalibrationEngine>,
    fusion: Arc<FusionEngine>,
}

impl SensorContext {
    pub fn new(config: PerceptionConfig) -> Self {
        let registry = Arc::new(
            SensorRegistry::new(config.history_capacity)
                .with_process_variance(config.fusion.kalman.process_variance),
        );
        let calibration = Arc::new(CalibrationEngine::new(config.calibration));
        let fusion = Arc::new(FusionEngine::new(Arc::clone(&registry), config.fusion));
        Self {
            registry,
            calibration,
            fusion,
        }
    }

    pub fn registry(&self) -> &Arc<SensorRegistry> {
        &self.registry
    }

    pub fn calibration(&self) -> &Arc<CalibrationEngine> {
        &self.calibration
    }

    pub fn fusion(&self) -> &Arc<FusionEngine> {
        &self.fusion
    }

    pub fn register_sensor(&self, sensor_id: impl Into<String>, profile: SensorProfile) {
        self.registry.register(sensor_id, profile);
    }

    /// Calibrate a raw value, wrap it in a [`SensorReading`] and record it.
    /// Returns the stored reading.
    pub fn ingest_raw(&self, sensor_id: &str, raw: f64, confidence: f64) -> SensorReading {
        let calibrated = self.calibration.apply(sensor_id, raw);
        let mut reading = SensorReading::new(sensor_id, calibrated, confidence);
        if let Some(profile) = self.registry.profile(sensor_id) {
            reading = reading.with_unit(profile.kind.unit());
            if let Some(position) = profile.position {
                reading = reading.with_position(position);
            }
        }
        debug!(sensor = sensor_id, raw, value = reading.value, "reading ingested");
        self.registry.record(reading)
    }
}

impl Default for SensorContext {
    fn default() -> Self {
        Self::new(PerceptionConfig::default())
    }
}
