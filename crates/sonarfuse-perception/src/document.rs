//! Persisted calibration state and reading history.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sonarfuse_types::{CalibrationPoint, CalibrationResult, SensorReading};
use thiserror::Error;

/// Failure to encode or decode a [`CalibrationDocument`] or
/// [`HistoryDocument`].
#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("document is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Every calibration result and point, keyed by sensor id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationDocument {
    #[serde(default)]
    pub calibration_results: BTreeMap<String, CalibrationResult>,
    #[serde(default)]
    pub calibration_points: BTreeMap<String, Vec<CalibrationPoint>>,
    pub export_timestamp: DateTime<Utc>,
}

impl CalibrationDocument {
    /// A document with no sensors, stamped now.
    pub fn empty() -> Self {
        Self {
            calibration_results: BTreeMap::new(),
            calibration_points: BTreeMap::new(),
            export_timestamp: Utc::now(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.calibration_results.is_empty() && self.calibration_points.is_empty()
    }

    pub fn to_json_pretty(&self) -> Result<String, DocumentError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self, DocumentError> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Buffered readings of every sensor, oldest first, keyed by sensor id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryDocument {
    #[serde(default)]
    pub sensors: BTreeMap<String, Vec<SensorReading>>,
    pub export_timestamp: DateTime<Utc>,
}

impl HistoryDocument {
    pub fn empty() -> Self {
        Self {
            sensors: BTreeMap::new(),
            export_timestamp: Utc::now(),
        }
    }

    /// Total number of readings across all sensors.
    pub fn reading_count(&self) -> usize {
        self.sensors.values().map(Vec::len).sum()
    }

    pub fn to_json_pretty(&self) -> Result<String, DocumentError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self, DocumentError> {
        Ok(serde_json::from_str(json)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sonarfuse_types::CalibrationModel;

    #[test]
    fn json_round_trip() {
        let mut doc = CalibrationDocument::empty();
        doc.calibration_points.insert(
            "front".into(),
            vec![CalibrationPoint::new("front", 10.0, 12.0, BTreeMap::new())],
        );
        doc.calibration_results.insert(
            "front".into(),
            CalibrationResult {
                sensor_id: "front".into(),
                model: CalibrationModel::Exponential { a: 2.0, b: 0.02, c: 1.0 },
                accuracy_score: 0.99,
                rmse: 0.1,
                mae: 0.08,
                r_squared: 0.999,
                point_count: 6,
                timestamp: Utc::now(),
            },
        );
        let json = doc.to_json_pretty().unwrap();
        assert!(json.contains("\"export_timestamp\""));
        assert_eq!(CalibrationDocument::from_json(&json).unwrap(), doc);
    }

    #[test]
    fn missing_sections_default_to_empty() {
        let doc =
            CalibrationDocument::from_json(r#"{"export_timestamp":"2024-01-01T00:00:00Z"}"#).unwrap();
        assert!(doc.is_empty());
    }

    #[test]
    fn garbage_is_rejected() {
        let err = CalibrationDocument::from_json("not json").unwrap_err();
        assert!(err.to_string().starts_with("document is not valid JSON"));
        assert!(HistoryDocument::from_json("[1, 2").is_err());
    }

    #[test]
    fn history_document_round_trip() {
        let mut doc = HistoryDocument::empty();
        doc.sensors.insert(
            "front".into(),
            vec![
                SensorReading::new("front", 100.5, 0.9),
                SensorReading::new("front", 101.25, 0.8).with_position([0.1, 0.0, 0.2]),
            ],
        );
        doc.sensors.insert("left".into(), Vec::new());
        assert_eq!(doc.reading_count(), 2);
        let json = doc.to_json_pretty().unwrap();
        assert!(json.contains("\"unit\": \"cm\""));
        assert_eq!(HistoryDocument::from_json(&json).unwrap(), doc);
    }
}
