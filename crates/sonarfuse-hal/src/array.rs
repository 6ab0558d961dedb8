//! [`SensorArray`] – registry of ranging drivers keyed by sensor id.
//!
//! The array owns every registered [`RangingSensor`] and offers whole-array
//! queries (one measurement per sensor, nearest obstacle).  Continuous
//! sampling takes sensors *out* of the array with [`SensorArray::take`] so
//! each one can be driven by its own execution unit.

use std::collections::{BTreeMap, HashMap};

use sonarfuse_types::RangingError;
use tracing::debug;

use crate::ranging::RangingSensor;

/// Registry of ranging drivers.
///
/// Construct with [`SensorArray::new`], register drivers, then query.
#[derive(Default)]
pub struct SensorArray {
    sensors: HashMap<String, Box<dyn RangingSensor>>,
}

impl SensorArray {
    /// Create an empty array.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a driver.  Any previously registered driver with the same
    /// `id` is replaced.
    pub fn register(&mut self, sensor: Box<dyn RangingSensor>) {
        self.sensors.insert(sensor.id().to_string(), sensor);
    }

    /// Number of registered drivers.
    pub fn len(&self) -> usize {
        self.sensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sensors.is_empty()
    }

    /// Registered ids in sorted order.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sensors.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Take one measurement from the named sensor.  `None` if the id is not
    /// registered.
    pub fn measure(&mut self, id: &str) -> Option<Result<f64, RangingError>> {
        self.sensors.get_mut(id).map(|s| s.measure())
    }

    /// Take one measurement from every sensor.
    pub fn measure_all(&mut self) -> BTreeMap<String, Result<f64, RangingError>> {
        self.sensors
            .iter_mut()
            .map(|(id, sensor)| (id.clone(), sensor.measure()))
            .collect()
    }

    /// Successful readings of one sweep, keyed by sensor id.  Failed sensors
    /// are absent.
    pub fn obstacle_map(&mut self) -> BTreeMap<String, f64> {
        self.measure_all()
            .into_iter()
            .filter_map(|(id, outcome)| match outcome {
                Ok(d) => Some((id, d)),
                Err(e) => {
                    debug!(sensor = %id, error = %e, "sensor skipped in sweep");
                    None
                }
            })
            .collect()
    }

    /// The sensor reporting the nearest obstacle in one sweep.
    pub fn closest_obstacle(&mut self) -> Option<(String, f64)> {
        self.obstacle_map()
            .into_iter()
            .min_by(|a, b| a.1.total_cmp(&b.1))
    }

    /// Remove a driver from the array, handing ownership to the caller.
    pub fn take(&mut self, id: &str) -> Option<Box<dyn RangingSensor>> {
        self.sensors.remove(id)
    }

    /// Consume the array and return all drivers in id order.
    pub fn into_sensors(self) -> Vec<Box<dyn RangingSensor>> {
        let mut sensors: Vec<_> = self.sensors.into_values().collect();
        sensors.sort_by(|a, b| a.id().cmp(b.id()));
        sensors
    }
}
