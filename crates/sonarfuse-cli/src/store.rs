//! Calibration and history documents on disk.
//!
//! The perception crate only encodes and decodes [`CalibrationDocument`]s
//! and [`HistoryDocument`][sonarfuse_perception::HistoryDocument]s; reading
//! and writing the files happens here.

use std::fs;
use std::path::Path;

use sonarfuse_perception::{CalibrationDocument, CalibrationEngine, SensorRegistry};

/// Read the document at `path`.  A missing file is an empty document.
pub fn load_document(path: &Path) -> Result<CalibrationDocument, String> {
    if !path.exists() {
        return Ok(CalibrationDocument::empty());
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read calibration at {}: {}", path.display(), e))?;
    CalibrationDocument::from_json(&raw)
        .map_err(|e| format!("Failed to parse calibration at {}: {}", path.display(), e))
}

fn write_json(path: &Path, what: &str, raw: &str) -> Result<(), String> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create {} directory: {}", what, e))?;
    }
    fs::write(path, raw).map_err(|e| format!("Failed to write {} at {}: {}", what, path.display(), e))
}

/// Write `document` to `path` as pretty-printed JSON, creating parent
/// directories as needed.
pub fn save_document(path: &Path, document: &CalibrationDocument) -> Result<(), String> {
    let raw = document
        .to_json_pretty()
        .map_err(|e| format!("Failed to serialize calibration: {}", e))?;
    write_json(path, "calibration", &raw)
}

/// Import the document at `path` into `engine`.
pub fn load_into(engine: &CalibrationEngine, path: &Path) -> Result<(), String> {
    let document = load_document(path)?;
    if !document.is_empty() {
        engine.import(document);
    }
    Ok(())
}

/// Export `engine` to `path`.
pub fn save_from(engine: &CalibrationEngine, path: &Path) -> Result<(), String> {
    save_document(path, &engine.export())
}

/// Write every buffered reading of `registry` to `path`.  Returns the number
/// of readings written.
pub fn save_history(registry: &SensorRegistry, path: &Path) -> Result<usize, String> {
    let document = registry.export_history();
    let raw = document
        .to_json_pretty()
        .map_err(|e| format!("Failed to serialize history: {}", e))?;
    write_json(path, "history", &raw)?;
    Ok(document.reading_count())
}
