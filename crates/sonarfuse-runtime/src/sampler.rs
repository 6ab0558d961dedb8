//! [`SamplingUnit`] – drives one ranging sensor on its own thread.
//!
//! Each successful measurement goes through
//! [`SensorContext::ingest_raw`] (calibration, then the sensor's history
//! buffer).  Failures are counted, logged and, when a bus is attached,
//! published on [`Topic::Faults`].  A failed sample never stops the unit.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use sonarfuse_hal::RangingSensor;
use sonarfuse_middleware::{EventBus, Topic};
use sonarfuse_perception::SensorContext;
use sonarfuse_types::{FusionEvent, FusionPayload};
use tracing::debug;

use crate::worker::Worker;

const SOURCE: &str = "sonarfuse-runtime::sampler";

/// Counters shared between a unit and its thread.
#[derive(Debug, Default)]
struct Counters {
    samples: AtomicU64,
    failures: AtomicU64,
}

/// A running per-sensor sampling thread.
pub struct SamplingUnit {
    sensor_id: String,
    counters: Arc<Counters>,
    worker: Worker,
}

impl SamplingUnit {
    /// Start sampling `sensor` every `interval`.
    pub fn spawn(
        mut sensor: Box<dyn RangingSensor>,
        context: Arc<SensorContext>,
        bus: Option<EventBus>,
        interval: Duration,
    ) -> io::Result<Self> {
        let sensor_id = sensor.id().to_string();
        let counters = Arc::new(Counters::default());
        let shared = Arc::clone(&counters);
        let id = sensor_id.clone();

        let worker = Worker::spawn(format!("sampler-{sensor_id}"), interval, move || {
            match sensor.measure() {
                Ok(raw) => {
                    context.ingest_raw(&id, raw, sensor.confidence());
                    shared.samples.fetch_add(1, Ordering::Relaxed);
                }
                Err(error) => {
                    shared.failures.fetch_add(1, Ordering::Relaxed);
                    debug!(sensor = %id, %error, "sample failed");
                    if let Some(bus) = &bus {
                        bus.broadcast(
                            Topic::Faults,
                            FusionEvent::new(
                                SOURCE,
                                FusionPayload::SensorFault {
                                    sensor_id: id.clone(),
                                    error,
                                },
                            ),
                        );
                    }
                }
            }
        })?;

        Ok(Self {
            sensor_id,
            counters,
            worker,
        })
    }

    pub fn sensor_id(&self) -> &str {
        &self.sensor_id
    }

    /// Successful samples so far.
    pub fn samples(&self) -> u64 {
        self.counters.samples.load(Ordering::Relaxed)
    }

    /// Failed samples so far.
    pub fn failures(&self) -> u64 {
        self.counters.failures.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_running()
    }

    /// Stop sampling; see [`Worker::stop`].
    pub fn stop(self, join_timeout: Duration) -> bool {
        self.worker.stop(join_timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sonarfuse_hal::ScriptedRanger;
    use sonarfuse_types::{EchoPhase, RangingError};
    use std::time::Instant;

    fn wait_for(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn samples_land_in_registry() {
        let ctx = Arc::new(SensorContext::default());
        let unit = SamplingUnit::spawn(
            Box::new(ScriptedRanger::constant("front", 120.0)),
            Arc::clone(&ctx),
            None,
            Duration::from_millis(1),
        )
        .unwrap();
        wait_for(|| unit.samples() >= 3);
        assert_eq!(unit.sensor_id(), "front");
        assert!(unit.stop(Duration::from_secs(2)));
        assert_eq!(ctx.registry().latest("front").map(|r| r.value), Some(120.0));
    }

    #[test]
    fn failures_are_skipped_and_published() {
        let ctx = Arc::new(SensorContext::default());
        let bus = EventBus::default();
        let mut faults = bus.subscribe_to(Topic::Faults);
        let script = vec![
            Err(RangingError::Timeout {
                phase: EchoPhase::Rise,
            }),
            Ok(80.0),
        ];
        let unit = SamplingUnit::spawn(
            Box::new(ScriptedRanger::new("left", script)),
            Arc::clone(&ctx),
            Some(bus.clone()),
            Duration::from_millis(1),
        )
        .unwrap();
        wait_for(|| unit.failures() >= 2 && unit.samples() >= 2);
        assert!(unit.is_running());
        assert!(unit.stop(Duration::from_secs(2)));

        assert!(ctx.registry().values("left").iter().all(|v| *v == 80.0));
        let event = faults.try_recv().expect("fault published");
        match event.payload {
            FusionPayload::SensorFault { sensor_id, error } => {
                assert_eq!(sensor_id, "left");
                assert_eq!(error, RangingError::Timeout { phase: EchoPhase::Rise });
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn calibration_is_applied_to_samples() {
        let ctx = Arc::new(SensorContext::default());
        let pairs: Vec<(f64, f64)> = (1..=5).map(|i| (i as f64 * 10.0, i as f64 * 10.0 + 5.0)).collect();
        ctx.calibration().add_points("front", &pairs, Default::default());
        ctx.calibration().calibrate("front", None).unwrap();

        let unit = SamplingUnit::spawn(
            Box::new(ScriptedRanger::constant("front", 100.0)),
            Arc::clone(&ctx),
            None,
            Duration::from_millis(1),
        )
        .unwrap();
        wait_for(|| unit.samples() >= 1);
        assert!(unit.stop(Duration::from_secs(2)));
        let latest = ctx.registry().latest("front").unwrap();
        assert!((latest.value - 105.0).abs() < 1e-9);
    }
}
