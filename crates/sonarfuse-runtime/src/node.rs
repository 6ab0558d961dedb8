//! [`SensorNode`] – one sampling unit per sensor plus a fusion loop, started
//! and stopped together.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use sonarfuse_hal::SensorArray;
use sonarfuse_middleware::EventBus;
use sonarfuse_perception::{SensorContext, SensorProfile};
use tracing::{info, warn};

use crate::fusion_loop::{FusionLoop, FusionLoopConfig};
use crate::sampler::SamplingUnit;

/// Scheduling of a [`SensorNode`].
#[derive(Debug, Clone, PartialEq)]
pub struct NodeConfig {
    pub sample_interval: Duration,
    pub fusion: FusionLoopConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            sample_interval: Duration::from_millis(100),
            fusion: FusionLoopConfig::default(),
        }
    }
}

/// Per-sensor sample counts reported on shutdown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SamplerReport {
    pub sensor_id: String,
    pub samples: u64,
    pub failures: u64,
    pub stopped_cleanly: bool,
}

/// The running acquisition pipeline.
pub struct SensorNode {
    context: Arc<SensorContext>,
    bus: EventBus,
    samplers: Vec<SamplingUnit>,
    fusion: FusionLoop,
}

impl SensorNode {
    /// Take every driver out of `array` and start sampling and fusing.
    ///
    /// Sensors without a registry profile are registered with a default
    /// profile of their reported kind.
    pub fn start(
        array: SensorArray,
        context: Arc<SensorContext>,
        bus: EventBus,
        config: NodeConfig,
    ) -> io::Result<Self> {
        let mut samplers = Vec::with_capacity(array.len());
        for sensor in array.into_sensors() {
            if !context.registry().contains(sensor.id()) {
                context.register_sensor(sensor.id(), SensorProfile::new(sensor.kind()));
            }
            samplers.push(SamplingUnit::spawn(
                sensor,
                Arc::clone(&context),
                Some(bus.clone()),
                config.sample_interval,
            )?);
        }
        let fusion = FusionLoop::spawn(Arc::clone(&context), bus.clone(), config.fusion)?;
        info!(sensors = samplers.len(), "sensor node started");
        Ok(Self {
            context,
            bus,
            samplers,
            fusion,
        })
    }

    pub fn context(&self) -> &Arc<SensorContext> {
        &self.context
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn sensor_ids(&self) -> Vec<&str> {
        self.samplers.iter().map(|s| s.sensor_id()).collect()
    }

    /// Stop the fusion loop first, then every sampler, each with
    /// `join_timeout`.
    pub fn shutdown(self, join_timeout: Duration) -> Vec<SamplerReport> {
        if !self.fusion.stop(join_timeout) {
            warn!("fusion loop detached on shutdown");
        }
        let reports: Vec<SamplerReport> = self
            .samplers
            .into_iter()
            .map(|unit| {
                let sensor_id = unit.sensor_id().to_string();
                let samples = unit.samples();
                let failures = unit.failures();
                let stopped_cleanly = unit.stop(join_timeout);
                SamplerReport {
                    sensor_id,
                    samples,
                    failures,
                    stopped_cleanly,
                }
            })
            .collect();
        info!(sensors = reports.len(), "sensor node stopped");
        reports
    }
}
