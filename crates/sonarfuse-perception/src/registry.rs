//! [`SensorRegistry`] – explicit per-sensor state for the perception stack.
//!
//! Each registered sensor owns a [`HistoryBuffer`] behind its own `RwLock`
//! and an optional smoothing [`KalmanEstimator`].  The outer map lock is
//! held only long enough to look up or insert an entry, so a writer on one
//! sensor never blocks readers of another.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sonarfuse_types::{SensorKind, SensorReading};
use tracing::{debug, warn};

use crate::buffer::{DEFAULT_HISTORY_CAPACITY, HistoryBuffer};
use crate::document::HistoryDocument;
use crate::fit::{mean, std_dev};
use crate::kalman::{KalmanConfig, KalmanEstimator};
use crate::{lock, read, write};

/// Static description of a sensor as the fusion stack sees it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorProfile {
    pub kind: SensorKind,
    /// Relative trust used as the static fusion weight.
    pub weight: f64,
    /// Measurement variance for per-sensor smoothing.
    pub variance: f64,
    /// Pass every recorded value through the sensor's own Kalman estimator.
    pub smoothing: bool,
    pub position: Option<[f64; 3]>,
}

impl Default for SensorProfile {
    fn default() -> Self {
        Self {
            kind: SensorKind::Distance,
            weight: 1.0,
            variance: 1.0,
            smoothing: false,
            position: None,
        }
    }
}

impl SensorProfile {
    pub fn new(kind: SensorKind) -> Self {
        Self {
            kind,
            ..Self::default()
        }
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_variance(mut self, variance: f64) -> Self {
        self.variance = variance;
        self
    }

    pub fn with_smoothing(mut self, smoothing: bool) -> Self {
        self.smoothing = smoothing;
        self
    }

    pub fn with_position(mut self, position: [f64; 3]) -> Self {
        self.position = Some(position);
        self
    }
}

/// Point-in-time status of one sensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorStatus {
    pub sensor_id: String,
    pub kind: SensorKind,
    pub last_value: Option<f64>,
    pub last_timestamp: Option<DateTime<Utc>>,
    pub confidence: Option<f64>,
    pub buffered: usize,
    /// Readings per second across the buffered window.
    pub data_rate_hz: f64,
}

/// Direction of the buffered values from oldest to newest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Increasing,
    Decreasing,
    Flat,
}

/// Summary statistics over one sensor's buffered values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorStatistics {
    pub sensor_id: String,
    pub count: usize,
    pub mean: f64,
    pub std_dev: f64,
    pub min: f64,
    pub max: f64,
    pub latest: f64,
    pub trend: Trend,
}

struct SensorEntry {
    profile: SensorProfile,
    history: RwLock<HistoryBuffer>,
    smoother: Mutex<KalmanEstimator>,
}

impl SensorEntry {
    fn new(profile: SensorProfile, capacity: usize, process_variance: f64) -> Self {
        let smoother = KalmanEstimator::new(
            KalmanConfig::default()
                .with_process_variance(process_variance)
                .with_measurement_variance(profile.variance),
        );
        Self {
            profile,
            history: RwLock::new(HistoryBuffer::new(capacity)),
            smoother: Mutex::new(smoother),
        }
    }
}

/// Registry of sensors and their reading histories.
pub struct SensorRegistry {
    capacity: usize,
    process_variance: f64,
    sensors: RwLock<HashMap<String, Arc<SensorEntry>>>,
}

impl Default for SensorRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}

impl SensorRegistry {
    /// Create an empty registry whose buffers hold `capacity` readings.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            process_variance: KalmanConfig::default().process_variance,
            sensors: RwLock::new(HashMap::new()),
        }
    }

    /// Process noise used by per-sensor smoothing.
    pub fn with_process_variance(mut self, q: f64) -> Self {
        self.process_variance = q;
        self
    }

    /// Register a sensor.  Re-registering an id replaces its profile and
    /// discards its history.  Negative or non-finite weights become zero.
    pub fn register(&self, sensor_id: impl Into<String>, mut profile: SensorProfile) {
        let sensor_id = sensor_id.into();
        if !profile.weight.is_finite() || profile.weight < 0.0 {
            warn!(sensor = %sensor_id, weight = profile.weight, "invalid sensor weight, using 0");
            profile.weight = 0.0;
        }
        debug!(sensor = %sensor_id, kind = %profile.kind, "sensor registered");
        let entry = Arc::new(SensorEntry::new(profile, self.capacity, self.process_variance));
        write(&self.sensors).insert(sensor_id, entry);
    }

    fn entry(&self, sensor_id: &str) -> Option<Arc<SensorEntry>> {
        read(&self.sensors).get(sensor_id).cloned()
    }

    fn entry_or_register(&self, sensor_id: &str) -> Arc<SensorEntry> {
        if let Some(entry) = self.entry(sensor_id) {
            return entry;
        }
        let mut map = write(&self.sensors);
        Arc::clone(map.entry(sensor_id.to_string()).or_insert_with(|| {
            warn!(sensor = %sensor_id, "reading from unregistered sensor, registering with default profile");
            Arc::new(SensorEntry::new(
                SensorProfile::default(),
                self.capacity,
                self.process_variance,
            ))
        }))
    }

    pub fn contains(&self, sensor_id: &str) -> bool {
        read(&self.sensors).contains_key(sensor_id)
    }

    pub fn len(&self) -> usize {
        read(&self.sensors).len()
    }

    pub fn is_empty(&self) -> bool {
        read(&self.sensors).is_empty()
    }

    /// Registered ids in sorted order.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = read(&self.sensors).keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn profile(&self, sensor_id: &str) -> Option<SensorProfile> {
        self.entry(sensor_id).map(|e| e.profile.clone())
    }

    /// Store a reading and return the stored copy, which differs from the
    /// input only when the sensor has smoothing enabled.
    pub fn record(&self, mut reading: SensorReading) -> SensorReading {
        let entry = self.entry_or_register(&reading.sensor_id);
        if entry.profile.smoothing {
            reading.value = lock(&entry.smoother).update(reading.value);
        }
        write(&entry.history).push(reading.clone());
        reading
    }

    pub fn latest(&self, sensor_id: &str) -> Option<SensorReading> {
        let entry = self.entry(sensor_id)?;
        let history = read(&entry.history);
        history.latest().cloned()
    }

    /// Every buffered reading of a sensor, oldest first.
    pub fn snapshot(&self, sensor_id: &str) -> Vec<SensorReading> {
        self.entry(sensor_id)
            .map(|e| read(&e.history).iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Buffered values of a sensor, oldest first.
    pub fn values(&self, sensor_id: &str) -> Vec<f64> {
        self.entry(sensor_id)
            .map(|e| read(&e.history).values())
            .unwrap_or_default()
    }

    /// The newest `n` values of a sensor, oldest first.
    pub fn recent_values(&self, sensor_id: &str, n: usize) -> Vec<f64> {
        self.entry(sensor_id)
            .map(|e| read(&e.history).recent(n).iter().map(|r| r.value).collect())
            .unwrap_or_default()
    }

    /// Sensors of `kind`, sorted by id.
    pub fn sensors_of(&self, kind: SensorKind) -> Vec<(String, SensorProfile)> {
        let mut sensors: Vec<(String, SensorProfile)> = read(&self.sensors)
            .iter()
            .filter(|(_, e)| e.profile.kind == kind)
            .map(|(id, e)| (id.clone(), e.profile.clone()))
            .collect();
        sensors.sort_by(|a, b| a.0.cmp(&b.0));
        sensors
    }

    /// Kinds with at least one registered sensor.
    pub fn kinds(&self) -> BTreeSet<SensorKind> {
        read(&self.sensors).values().map(|e| e.profile.kind).collect()
    }

    /// Status of every sensor, sorted by id.
    pub fn status(&self) -> Vec<SensorStatus> {
        self.ids()
            .into_iter()
            .filter_map(|id| {
                let entry = self.entry(&id)?;
                let history = read(&entry.history);
                let latest = history.latest();
                let data_rate_hz = match (history.oldest(), latest) {
                    (Some(first), Some(last)) if history.len() > 1 => {
                        let span = (last.timestamp - first.timestamp).num_microseconds();
                        match span {
                            Some(us) if us > 0 => (history.len() - 1) as f64 / (us as f64 / 1e6),
                            _ => 0.0,
                        }
                    }
                    _ => 0.0,
                };
                Some(SensorStatus {
                    sensor_id: id.clone(),
                    kind: entry.profile.kind,
                    last_value: latest.map(|r| r.value),
                    last_timestamp: latest.map(|r| r.timestamp),
                    confidence: latest.map(|r| r.confidence),
                    buffered: history.len(),
                    data_rate_hz,
                })
            })
            .collect()
    }

    /// Statistics of every sensor with at least one reading, sorted by id.
    pub fn statistics(&self) -> Vec<SensorStatistics> {
        self.ids()
            .into_iter()
            .filter_map(|id| {
                let values = self.values(&id);
                let first = *values.first()?;
                let latest = *values.last()?;
                let trend = if latest > first {
                    Trend::Increasing
                } else if latest < first {
                    Trend::Decreasing
                } else {
                    Trend::Flat
                };
                Some(SensorStatistics {
                    count: values.len(),
                    mean: mean(&values)?,
                    std_dev: std_dev(&values)?,
                    min: values.iter().copied().fold(f64::INFINITY, f64::min),
                    max: values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
                    latest,
                    trend,
                    sensor_id: id,
                })
            })
            .collect()
    }

    /// Every sensor's buffered readings, oldest first.  Registered sensors
    /// without readings appear with an empty list.
    pub fn export_history(&self) -> HistoryDocument {
        let sensors = self
            .ids()
            .into_iter()
            .map(|id| {
                let readings = self.snapshot(&id);
                (id, readings)
            })
            .collect();
        HistoryDocument {
            sensors,
            export_timestamp: Utc::now(),
        }
    }

    /// Append the readings of `document` to the matching buffers, registering
    /// unknown sensors with the default profile.  Stored values are taken as
    /// they are and never re-smoothed.  Returns the number of readings
    /// appended, which can exceed what the bounded buffers retain.
    pub fn import_history(&self, document: HistoryDocument) -> usize {
        let mut imported = 0;
        for (sensor_id, readings) in document.sensors {
            let entry = self.entry_or_register(&sensor_id);
            let mut history = write(&entry.history);
            for mut reading in readings {
                reading.sensor_id.clone_from(&sensor_id);
                history.push(reading);
                imported += 1;
            }
        }
        debug!(readings = imported, "history imported");
        imported
    }

    /// Drop all buffered readings and smoothing state.  Registrations stay.
    pub fn clear(&self) {
        for entry in read(&self.sensors).values() {
            write(&entry.history).clear();
            lock(&entry.smoother).reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn reading(id: &str, v: f64) -> SensorReading {
        SensorReading::new(id, v, 1.0)
    }

    #[test]
    fn unknown_sensor_is_auto_registered() {
        let reg = SensorRegistry::default();
        reg.record(reading("front", 100.0));
        assert!(reg.contains("front"));
        assert_eq!(reg.profile("front"), Some(SensorProfile::default()));
        assert_eq!(reg.latest("front").map(|r| r.value), Some(100.0));
    }

    #[test]
    fn exported_history_restores_into_fresh_registry() {
        let reg = SensorRegistry::default();
        reg.register("idle", SensorProfile::default());
        let t0 = Utc::now();
        for (i, v) in [100.5, 101.0, 99.75].into_iter().enumerate() {
            reg.record(reading("front", v).with_timestamp(t0 + Duration::milliseconds(50 * i as i64)));
        }
        reg.record(reading("left", 42.25).with_position([0.0, 0.1, 0.0]));

        let doc = reg.export_history();
        assert_eq!(doc.sensors.len(), 3);
        assert!(doc.sensors["idle"].is_empty());
        assert_eq!(doc.reading_count(), 4);

        let json = doc.to_json_pretty().unwrap();
        let restored = SensorRegistry::default();
        assert_eq!(restored.import_history(HistoryDocument::from_json(&json).unwrap()), 4);
        assert_eq!(restored.snapshot("front"), reg.snapshot("front"));
        assert_eq!(restored.snapshot("left"), reg.snapshot("left"));
        assert!(restored.contains("idle"));
        assert_eq!(restored.export_history().sensors, doc.sensors);
    }

    #[test]
    fn imported_history_respects_capacity() {
        let mut doc = HistoryDocument::empty();
        doc.sensors.insert(
            "front".into(),
            (0..8).map(|v| reading("front", v as f64)).collect(),
        );
        let reg = SensorRegistry::new(5);
        assert_eq!(reg.import_history(doc), 8);
        assert_eq!(reg.values("front"), vec![3.0, 4.0, 5.0, 6.0, 7.0]);
    }

    #[test]
    fn history_is_bounded() {
        let reg = SensorRegistry::new(5);
        for v in 0..8 {
            reg.record(reading("front", v as f64));
        }
        assert_eq!(reg.values("front"), vec![3.0, 4.0, 5.0, 6.0, 7.0]);
        assert_eq!(reg.recent_values("front", 2), vec![6.0, 7.0]);
        assert_eq!(reg.snapshot("front").len(), 5);
    }

    #[test]
    fn smoothing_filters_recorded_values() {
        let reg = SensorRegistry::default();
        reg.register("front", SensorProfile::default().with_smoothing(true));
        assert_eq!(reg.record(reading("front", 100.0)).value, 100.0);
        let second = reg.record(reading("front", 200.0)).value;
        assert!(second > 100.0 && second < 200.0);
        assert_eq!(reg.latest("front").map(|r| r.value), Some(second));
    }

    #[test]
    fn sensors_of_filters_by_kind() {
        let reg = SensorRegistry::default();
        reg.register("b", SensorProfile::new(SensorKind::Distance));
        reg.register("a", SensorProfile::new(SensorKind::Distance));
        reg.register("t", SensorProfile::new(SensorKind::Temperature));
        let ids: Vec<String> = reg
            .sensors_of(SensorKind::Distance)
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(reg.kinds().len(), 2);
    }

    #[test]
    fn invalid_weight_becomes_zero() {
        let reg = SensorRegistry::default();
        reg.register("a", SensorProfile::default().with_weight(-3.0));
        assert_eq!(reg.profile("a").map(|p| p.weight), Some(0.0));
    }

    #[test]
    fn status_reports_rate() {
        let reg = SensorRegistry::default();
        reg.register("front", SensorProfile::default());
        reg.register("idle", SensorProfile::default());
        let t0 = Utc::now();
        for i in 0..5 {
            reg.record(reading("front", 50.0).with_timestamp(t0 + Duration::milliseconds(100 * i)));
        }
        let status = reg.status();
        assert_eq!(status.len(), 2);
        assert_eq!(status[0].sensor_id, "front");
        assert_eq!(status[0].buffered, 5);
        assert!((status[0].data_rate_hz - 10.0).abs() < 1e-9);
        assert_eq!(status[1].last_value, None);
        assert_eq!(status[1].data_rate_hz, 0.0);
    }

    #[test]
    fn statistics_report_trend() {
        let reg = SensorRegistry::default();
        for v in [10.0, 12.0, 14.0] {
            reg.record(reading("up", v));
        }
        for v in [5.0, 5.0] {
            reg.record(reading("flat", v));
        }
        let stats = reg.statistics();
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[0].sensor_id, "flat");
        assert_eq!(stats[0].trend, Trend::Flat);
        assert_eq!(stats[1].trend, Trend::Increasing);
        assert_eq!(stats[1].mean, 12.0);
        assert_eq!(stats[1].min, 10.0);
        assert_eq!(stats[1].max, 14.0);
    }

    #[test]
    fn clear_keeps_registrations() {
        let reg = SensorRegistry::default();
        reg.record(reading("front", 1.0));
        reg.clear();
        assert!(reg.contains("front"));
        assert!(reg.latest("front").is_none());
    }
}
