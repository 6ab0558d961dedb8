//! [`FusionLoop`] – periodic fusion and anomaly detection.
//!
//! Every tick fuses each sensor kind from the latest stored readings and
//! publishes the results on [`Topic::Fused`]; anomaly events go out on
//! [`Topic::Anomalies`].  The loop never waits for fresh samples.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use sonarfuse_middleware::{EventBus, Topic};
use sonarfuse_perception::SensorContext;
use sonarfuse_types::{AnomalyEvent, FusedReading, FusionEvent, FusionPayload};
use tracing::trace;

use crate::worker::Worker;

const SOURCE: &str = "sonarfuse-runtime::fusion_loop";

/// Scheduling of a [`FusionLoop`].
#[derive(Debug, Clone, PartialEq)]
pub struct FusionLoopConfig {
    pub interval: Duration,
    /// Run anomaly detection every `anomaly_every` ticks; `0` disables it.
    pub anomaly_every: u32,
}

impl Default for FusionLoopConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(200),
            anomaly_every: 5,
        }
    }
}

impl FusionLoopConfig {
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_anomaly_every(mut self, ticks: u32) -> Self {
        self.anomaly_every = ticks;
        self
    }
}

/// What one fusion tick produced.
#[derive(Debug, Clone, Default)]
pub struct TickOutput {
    pub fused: Vec<FusedReading>,
    pub anomalies: Vec<AnomalyEvent>,
}

/// Run one fusion pass and publish its output.
pub fn fusion_tick(context: &SensorContext, bus: &EventBus, detect_anomalies: bool) -> TickOutput {
    let fused: Vec<FusedReading> = context.fusion().fuse_all().into_values().collect();
    for reading in &fused {
        bus.broadcast(
            Topic::Fused,
            FusionEvent::new(SOURCE, FusionPayload::Fused(reading.clone())),
        );
    }

    let anomalies = if detect_anomalies {
        context.fusion().detect_anomalies()
    } else {
        Vec::new()
    };
    for event in &anomalies {
        bus.broadcast(
            Topic::Anomalies,
            FusionEvent::new(SOURCE, FusionPayload::Anomaly(event.clone())),
        );
    }

    trace!(fused = fused.len(), anomalies = anomalies.len(), "fusion tick");
    TickOutput { fused, anomalies }
}

/// A running fusion thread.
pub struct FusionLoop {
    ticks: Arc<AtomicU64>,
    worker: Worker,
}

impl FusionLoop {
    pub fn spawn(
        context: Arc<SensorContext>,
        bus: EventBus,
        config: FusionLoopConfig,
    ) -> io::Result<Self> {
        let ticks = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&ticks);
        let every = u64::from(config.anomaly_every);

        let worker = Worker::spawn("fusion-loop", config.interval, move || {
            let n = counter.fetch_add(1, Ordering::Relaxed) + 1;
            let detect = every > 0 && n % every == 0;
            fusion_tick(&context, &bus, detect);
        })?;

        Ok(Self { ticks, worker })
    }

    /// Ticks started so far.
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_running()
    }

    pub fn stop(self, join_timeout: Duration) -> bool {
        self.worker.stop(join_timeout)
    }
}
