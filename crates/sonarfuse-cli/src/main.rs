//! `sonarfuse-cli` – SonarFuse Command Line Interface
//!
//! This binary drives the SonarFuse stack from a terminal:
//!
//! 1. `run` starts one sampling thread per configured (simulated) sensor
//!    plus the fusion loop, and prints fused readings, anomalies and sensor
//!    faults until the time limit or **Ctrl-C**.  With `--history FILE` the
//!    buffered readings of every sensor are written to `FILE` on exit.
//! 2. `calibrate`, `validate`, `show` and `clear` operate on the calibration
//!    document next to `~/.sonarfuse/config.toml`.
//! 3. `init` writes the default configuration.

mod commands;
mod config;
mod store;

use colored::Colorize;
use std::collections::BTreeMap;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::warn;

use commands::{Command, USAGE};
use config::{Config, SensorEntry};
use sonarfuse_hal::{ScriptedRanger, SensorArray};
use sonarfuse_middleware::{EventBus, Topic};
use sonarfuse_perception::{CalibrationEngine, SensorContext};
use sonarfuse_runtime::SensorNode;
use sonarfuse_types::{
    CalibrationError, EchoPhase, FusionEvent, FusionPayload, ModelKind, RangingError, SensorKind,
};

/// Bounded wait for each worker thread when `run` stops.
const JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// How often `run` drains the bus.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

fn main() -> ExitCode {
    sonarfuse_runtime::init_tracing();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = match commands::parse_args(&args) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("{}: {}", "Error".red().bold(), e);
            eprintln!();
            eprintln!("{}", USAGE);
            return ExitCode::from(2);
        }
    };

    let cfg = match config::load_or_default() {
        Ok(c) => c,
        Err(e) => {
            println!("{}: {}", "Config error".red(), e);
            println!("  Using default configuration.");
            let mut cfg = Config::default();
            config::apply_env_overrides(&mut cfg);
            cfg
        }
    };

    let outcome = match command {
        Command::Run { seconds, history } => {
            cmd_run(&cfg, seconds.map(Duration::from_secs), history.as_deref())
        }
        Command::Calibrate {
            sensor_id,
            model,
            pairs,
        } => cmd_calibrate(&cfg, &sensor_id, model, &pairs),
        Command::Validate { sensor_id, pairs } => cmd_validate(&cfg, &sensor_id, &pairs),
        Command::Show => cmd_show(&cfg),
        Command::Clear { sensor_id } => cmd_clear(&cfg, sensor_id.as_deref()),
        Command::Init => cmd_init(),
        Command::Help => {
            println!("{}", USAGE);
            Ok(())
        }
    };

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}: {}", "Error".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// run
// ─────────────────────────────────────────────────────────────────────────────

fn cmd_run(cfg: &Config, limit: Option<Duration>, history: Option<&Path>) -> Result<(), String> {
    print_banner();
    if cfg.sensors.is_empty() {
        return Err("no sensors configured".to_string());
    }

    let context = Arc::new(SensorContext::new(cfg.perception.clone()));
    let calibration_path = cfg.calibration_path();
    store::load_into(context.calibration(), &calibration_path)?;
    let calibrated = context.calibration().summary().len();

    let mut array = SensorArray::new();
    for entry in &cfg.sensors {
        context.register_sensor(entry.id.clone(), entry.profile());
        array.register(Box::new(simulated_ranger(entry)));
    }

    // ── Shared shutdown flag ──────────────────────────────────────────────
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Ctrl-C received – stopping sensors …".yellow().bold());
        shutdown_clone.store(true, Ordering::SeqCst);
    }) {
        warn!(error = %e, "Failed to install Ctrl-C handler; run will only stop at its time limit");
    }

    let bus = EventBus::default();
    let mut fused = bus.subscribe_to(Topic::Fused);
    let mut anomalies = bus.subscribe_to(Topic::Anomalies);
    let mut faults = bus.subscribe_to(Topic::Faults);

    let node = SensorNode::start(array, Arc::clone(&context), bus, cfg.node_config())
        .map_err(|e| format!("Failed to start sensor threads: {}", e))?;

    println!(
        "  {} sensor(s) online, {} calibrated ({})",
        node.sensor_ids().len().to_string().bold(),
        calibrated,
        calibration_path.display().to_string().dimmed()
    );
    match limit {
        Some(d) => println!("  Running for {}s. Press Ctrl-C to stop early.\n", d.as_secs()),
        None => println!("  Press Ctrl-C to stop.\n"),
    }

    let started = Instant::now();
    while !shutdown.load(Ordering::SeqCst) {
        if limit.is_some_and(|d| started.elapsed() >= d) {
            break;
        }
        for event in faults.drain() {
            print_event(&event);
        }
        for event in anomalies.drain() {
            print_event(&event);
        }
        for event in fused.drain() {
            print_event(&event);
        }
        std::thread::sleep(POLL_INTERVAL);
    }

    println!();
    let reports = node.shutdown(JOIN_TIMEOUT);
    for r in &reports {
        let status = if r.stopped_cleanly {
            "stopped".green()
        } else {
            "detached".yellow()
        };
        println!(
            "  {:<20} {:>6} samples  {:>4} failures  {}",
            r.sensor_id.bold(),
            r.samples,
            r.failures,
            status
        );
    }
    if let Some(path) = history {
        let written = store::save_history(context.registry(), path)?;
        println!(
            "\n  {} readings written to {}",
            written,
            path.display().to_string().dimmed()
        );
    }
    println!("\n  {}", "✓ Exiting SonarFuse.".green());
    Ok(())
}

/// A scripted driver wobbling around the entry's simulated value.  Distance
/// sensors drop one echo per script cycle.
fn simulated_ranger(entry: &SensorEntry) -> ScriptedRanger {
    ScriptedRanger::new(entry.id.clone(), simulated_script(entry))
        .with_kind(entry.kind)
        .with_confidence(entry.confidence)
}

fn simulated_script(entry: &SensorEntry) -> Vec<Result<f64, RangingError>> {
    const JITTER: [f64; 10] = [0.0, 0.3, -0.2, 0.5, -0.4, 0.1, -0.1, 0.4, -0.3, 0.2];
    let scale = match entry.kind {
        SensorKind::Distance => 1.0,
        SensorKind::Temperature => 0.1,
    };
    let mut script: Vec<Result<f64, RangingError>> = JITTER
        .iter()
        .chain(JITTER.iter().rev())
        .map(|j| Ok(entry.simulated_value + j * scale))
        .collect();
    if entry.kind == SensorKind::Distance {
        script.push(Err(RangingError::Timeout {
            phase: EchoPhase::Rise,
        }));
    }
    script
}

fn print_event(event: &FusionEvent) {
    let time = event.timestamp.format("%H:%M:%S%.3f").to_string().dimmed();
    match &event.payload {
        FusionPayload::Fused(f) => println!(
            "  {} {} {:>9.2} {:<7} conf {:.2}  [{}]",
            time,
            "fused  ".cyan(),
            f.value,
            f.unit,
            f.confidence,
            f.contributing_sensor_ids.join(", ")
        ),
        FusionPayload::Anomaly(a) => println!(
            "  {} {} {} z={:.2} mean {:.2} → {:.2}",
            time,
            "anomaly".yellow().bold(),
            a.sensor_id.bold(),
            a.z_score,
            a.historical_mean,
            a.recent_mean
        ),
        FusionPayload::SensorFault { sensor_id, error } => println!(
            "  {} {} {} {}",
            time,
            "fault  ".red(),
            sensor_id.bold(),
            error.to_string().dimmed()
        ),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Calibration commands
// ─────────────────────────────────────────────────────────────────────────────

/// Engine with the stored document loaded.
fn open_engine(cfg: &Config) -> Result<CalibrationEngine, String> {
    let engine = CalibrationEngine::new(cfg.perception.calibration.clone());
    store::load_into(&engine, &cfg.calibration_path())?;
    Ok(engine)
}

fn cmd_calibrate(
    cfg: &Config,
    sensor_id: &str,
    model: ModelKind,
    pairs: &[(f64, f64)],
) -> Result<(), String> {
    let engine = open_engine(cfg)?;
    engine.add_points(sensor_id, pairs, BTreeMap::new());
    let outcome = engine.calibrate(sensor_id, Some(model));

    // Points are kept even when the fit fails so they can be topped up later.
    let path = cfg.calibration_path();
    store::save_from(&engine, &path)?;

    match outcome {
        Ok(result) => {
            println!(
                "  {} {} calibrated with {} model ({} points)",
                "✓".green().bold(),
                sensor_id.bold(),
                result.model.kind(),
                result.point_count
            );
            println!(
                "    parameters {:?}\n    rmse {:.4}  mae {:.4}  r² {:.4}  accuracy {:.3}",
                result.model.parameters(),
                result.rmse,
                result.mae,
                result.r_squared,
                result.accuracy_score
            );
            println!("    saved to {}", path.display().to_string().dimmed());
            Ok(())
        }
        Err(e @ CalibrationError::FitDidNotConverge { .. }) => Err(format!(
            "{}; try `{}` instead",
            e,
            format!("sonarfuse calibrate {sensor_id} polynomial:2").bold()
        )),
        Err(e) => Err(format!(
            "{} ({} point(s) stored)",
            e,
            engine.points(sensor_id).len()
        )),
    }
}

fn cmd_validate(cfg: &Config, sensor_id: &str, pairs: &[(f64, f64)]) -> Result<(), String> {
    let engine = open_engine(cfg)?;
    let report = engine
        .validate(sensor_id, pairs)
        .map_err(|e| e.to_string())?;
    let verdict = if report.passed {
        "PASS".green().bold()
    } else {
        "FAIL".red().bold()
    };
    println!(
        "  {} {} over {} point(s)",
        verdict,
        sensor_id.bold(),
        report.point_count
    );
    println!(
        "    mean error {:.4}  max {:.4}  min {:.4}  std {:.4}  (tolerance {:.2})",
        report.mean_error,
        report.max_error,
        report.min_error,
        report.std_error,
        engine.settings().for_sensor(sensor_id).tolerance_cm
    );
    Ok(())
}

fn cmd_show(cfg: &Config) -> Result<(), String> {
    let engine = open_engine(cfg)?;
    let summary = engine.summary();
    if summary.is_empty() {
        println!("  No calibrations stored in {}", cfg.calibration_path().display());
        return Ok(());
    }
    for (id, result) in summary {
        println!(
            "  {:<20} {:<13} r² {:.4}  rmse {:.4}  accuracy {:.3}  {} pts  {}",
            id.bold(),
            result.model.kind().to_string(),
            result.r_squared,
            result.rmse,
            result.accuracy_score,
            result.point_count,
            result.timestamp.format("%Y-%m-%d %H:%M").to_string().dimmed()
        );
    }
    Ok(())
}

fn cmd_clear(cfg: &Config, sensor_id: Option<&str>) -> Result<(), String> {
    let engine = open_engine(cfg)?;
    engine.clear(sensor_id);
    store::save_from(&engine, &cfg.calibration_path())?;
    match sensor_id {
        Some(id) => println!("  {} Cleared calibration for {}", "✓".green().bold(), id.bold()),
        None => println!("  {} Cleared all calibrations", "✓".green().bold()),
    }
    Ok(())
}

fn cmd_init() -> Result<(), String> {
    let path = config::config_path();
    if config::load()?.is_some() {
        println!("  Config already exists at {}", path.display().to_string().bold());
        return Ok(());
    }
    config::save(&Config::default())?;
    println!(
        "  {} Config saved to {}",
        "✓".green().bold(),
        path.display().to_string().bold()
    );
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Banner
// ─────────────────────────────────────────────────────────────────────────────

fn print_banner() {
    println!();
    println!(
        "  {} {}",
        "SonarFuse".bold().cyan(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!("  Ultrasonic sensor fusion");
    println!();
}
