//! Configuration Vault – reads/writes `~/.sonarfuse/config.toml`.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use sonarfuse_perception::{PerceptionConfig, SensorProfile};
use sonarfuse_runtime::{FusionLoopConfig, NodeConfig};
use sonarfuse_types::SensorKind;

/// One sensor of the simulated array started by `sonarfuse run`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorEntry {
    pub id: String,

    #[serde(default)]
    pub kind: SensorKind,

    /// Relative trust in the fusion (`>= 0`).
    #[serde(default = "default_weight")]
    pub weight: f64,

    /// Measurement variance used when smoothing is enabled.
    #[serde(default = "default_variance")]
    pub variance: f64,

    /// Smooth this sensor's readings with its own Kalman filter.
    #[serde(default)]
    pub smoothing: bool,

    /// Confidence attached to every simulated reading.
    #[serde(default = "default_confidence")]
    pub confidence: f64,

    /// Mounting position `[x, y, z]` attached to every reading.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<[f64; 3]>,

    /// Value the simulated driver reports around (cm or °C).
    pub simulated_value: f64,
}

impl SensorEntry {
    pub fn new(id: impl Into<String>, kind: SensorKind, simulated_value: f64) -> Self {
        Self {
            id: id.into(),
            kind,
            weight: default_weight(),
            variance: default_variance(),
            smoothing: false,
            confidence: default_confidence(),
            position: None,
            simulated_value,
        }
    }

    /// Registry profile for this sensor.
    pub fn profile(&self) -> SensorProfile {
        let profile = SensorProfile::new(self.kind)
            .with_weight(self.weight)
            .with_variance(self.variance)
            .with_smoothing(self.smoothing);
        match self.position {
            Some(position) => profile.with_position(position),
            None => profile,
        }
    }
}

/// Persisted user configuration stored in `~/.sonarfuse/config.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Period of each sensor's sampling thread.
    #[serde(default = "default_sample_interval_ms")]
    pub sample_interval_ms: u64,

    /// Period of the fusion loop.
    #[serde(default = "default_fusion_interval_ms")]
    pub fusion_interval_ms: u64,

    /// Run anomaly detection every N fusion ticks (`0` disables it).
    #[serde(default = "default_anomaly_every")]
    pub anomaly_every: u32,

    /// Calibration document.  Relative paths resolve against the config
    /// directory.
    #[serde(default = "default_calibration_file")]
    pub calibration_file: PathBuf,

    /// History, fusion thresholds and calibration defaults.
    #[serde(default)]
    pub perception: PerceptionConfig,

    #[serde(default = "default_sensors")]
    pub sensors: Vec<SensorEntry>,
}

fn default_weight() -> f64 {
    1.0
}
fn default_variance() -> f64 {
    1.0
}
fn default_confidence() -> f64 {
    0.9
}
fn default_sample_interval_ms() -> u64 {
    100
}
fn default_fusion_interval_ms() -> u64 {
    200
}
fn default_anomaly_every() -> u32 {
    5
}
fn default_calibration_file() -> PathBuf {
    PathBuf::from("calibration.json")
}
fn default_sensors() -> Vec<SensorEntry> {
    vec![
        SensorEntry::new("ultrasonic_front", SensorKind::Distance, 120.0),
        SensorEntry {
            weight: 0.8,
            ..SensorEntry::new("ultrasonic_left", SensorKind::Distance, 123.0)
        },
        SensorEntry {
            smoothing: true,
            variance: 0.5,
            ..SensorEntry::new("board_temperature", SensorKind::Temperature, 21.5)
        },
    ]
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sample_interval_ms: default_sample_interval_ms(),
            fusion_interval_ms: default_fusion_interval_ms(),
            anomaly_every: default_anomaly_every(),
            calibration_file: default_calibration_file(),
            perception: PerceptionConfig::default(),
            sensors: default_sensors(),
        }
    }
}

impl Config {
    /// Scheduling for the sensor node, with intervals of at least 1 ms.
    pub fn node_config(&self) -> NodeConfig {
        NodeConfig {
            sample_interval: Duration::from_millis(self.sample_interval_ms.max(1)),
            fusion: FusionLoopConfig::default()
                .with_interval(Duration::from_millis(self.fusion_interval_ms.max(1)))
                .with_anomaly_every(self.anomaly_every),
        }
    }

    /// The calibration document path, resolved against `config_dir` when
    /// relative.
    pub fn calibration_path_in(&self, config_dir: &Path) -> PathBuf {
        if self.calibration_file.is_absolute() {
            self.calibration_file.clone()
        } else {
            config_dir.join(&self.calibration_file)
        }
    }

    /// The calibration document path for the default config location.
    pub fn calibration_path(&self) -> PathBuf {
        let path = config_path();
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        self.calibration_path_in(dir)
    }
}

/// Return the path to `~/.sonarfuse/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

/// Build the config path relative to the given home directory.
pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".sonarfuse").join("config.toml")
}

/// Load the config from disk.  Returns `None` if the file does not exist.
pub fn load() -> Result<Option<Config>, String> {
    load_from(&config_path())
}

/// Load the config, falling back to defaults when the file is missing.
/// Environment overrides apply either way.
pub fn load_or_default() -> Result<Config, String> {
    match load()? {
        Some(cfg) => Ok(cfg),
        None => {
            let mut cfg = Config::default();
            apply_env_overrides(&mut cfg);
            Ok(cfg)
        }
    }
}

/// Load the config from a specific path.
pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
    let mut cfg: Config =
        toml::from_str(&raw).map_err(|e| format!("Failed to parse config: {}", e))?;
    apply_env_overrides(&mut cfg);
    Ok(Some(cfg))
}

/// Apply `SONARFUSE_*` environment variable overrides to `cfg`.
///
/// Supported variables:
///
/// | Variable | Config field |
/// |---|---|
/// | `SONARFUSE_SAMPLE_INTERVAL_MS` | `sample_interval_ms` |
/// | `SONARFUSE_FUSION_INTERVAL_MS` | `fusion_interval_ms` |
/// | `SONARFUSE_CALIBRATION_FILE` | `calibration_file` |
/// | `SONARFUSE_MIN_CONFIDENCE` | `perception.fusion.min_confidence` |
///
/// Values that fail to parse are ignored.
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("SONARFUSE_SAMPLE_INTERVAL_MS")
        && let Ok(ms) = v.trim().parse::<u64>()
    {
        cfg.sample_interval_ms = ms;
    }
    if let Ok(v) = std::env::var("SONARFUSE_FUSION_INTERVAL_MS")
        && let Ok(ms) = v.trim().parse::<u64>()
    {
        cfg.fusion_interval_ms = ms;
    }
    if let Ok(v) = std::env::var("SONARFUSE_CALIBRATION_FILE")
        && !v.trim().is_empty()
    {
        cfg.calibration_file = PathBuf::from(v.trim());
    }
    if let Ok(v) = std::env::var("SONARFUSE_MIN_CONFIDENCE")
        && let Ok(c) = v.trim().parse::<f64>()
        && (0.0..=1.0).contains(&c)
    {
        cfg.perception.fusion.min_confidence = c;
    }
}

/// Save the config to disk, creating `~/.sonarfuse/` if necessary.
pub fn save(cfg: &Config) -> Result<(), String> {
    save_to(cfg, &config_path())
}

/// Save the config to a specific path.
pub(crate) fn save_to(cfg: &Config, path: &Path) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory: {}", e))?;
    }
    let raw =
        toml::to_string_pretty(cfg).map_err(|e| format!("Failed to serialize config: {}", e))?;
    fs::write(path, raw)
        .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    Ok(())
}
