//! Command-line parsing for the `sonarfuse` binary.

use std::path::PathBuf;

use sonarfuse_types::ModelKind;

pub const USAGE: &str = "\
Usage: sonarfuse <command> [args]

Commands:
  run [--seconds N] [--history FILE]         Sample the configured array and print fused readings;
                                             --history writes every buffered reading to FILE on exit
  calibrate <sensor> <model> <m:t>...        Add (measured:true) points, fit a model and save it
  validate <sensor> <m:t>...                 Check a stored calibration against held-out points
  show                                       Print every stored calibration
  clear [sensor]                             Drop calibration data for one or all sensors
  init                                       Write the default config if none exists
  help                                       Show this message

Models: linear | polynomial[:degree] | exponential";

/// A parsed invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Run {
        seconds: Option<u64>,
        history: Option<PathBuf>,
    },
    Calibrate {
        sensor_id: String,
        model: ModelKind,
        pairs: Vec<(f64, f64)>,
    },
    Validate {
        sensor_id: String,
        pairs: Vec<(f64, f64)>,
    },
    Show,
    Clear {
        sensor_id: Option<String>,
    },
    Init,
    Help,
}

/// Parse the arguments that follow the program name.
pub fn parse_args<S: AsRef<str>>(args: &[S]) -> Result<Command, String> {
    let args: Vec<&str> = args.iter().map(AsRef::as_ref).collect();
    let Some((&cmd, rest)) = args.split_first() else {
        return Ok(Command::Help);
    };

    match cmd {
        "run" => parse_run(rest),
        "calibrate" => {
            let [sensor_id, model, points @ ..] = rest else {
                return Err("calibrate needs <sensor> <model> <m:t>...".to_string());
            };
            Ok(Command::Calibrate {
                sensor_id: sensor_id.to_string(),
                model: model.parse()?,
                pairs: parse_pairs(points)?,
            })
        }
        "validate" => {
            let [sensor_id, points @ ..] = rest else {
                return Err("validate needs <sensor> <m:t>...".to_string());
            };
            Ok(Command::Validate {
                sensor_id: sensor_id.to_string(),
                pairs: parse_pairs(points)?,
            })
        }
        "show" => no_args("show", rest).map(|_| Command::Show),
        "clear" => match rest {
            [] => Ok(Command::Clear { sensor_id: None }),
            [sensor_id] => Ok(Command::Clear {
                sensor_id: Some(sensor_id.to_string()),
            }),
            _ => Err("clear takes at most one sensor id".to_string()),
        },
        "init" => no_args("init", rest).map(|_| Command::Init),
        "help" | "--help" | "-h" => Ok(Command::Help),
        other => Err(format!("unknown command '{other}'")),
    }
}

fn parse_run(rest: &[&str]) -> Result<Command, String> {
    let mut seconds = None;
    let mut history = None;
    let mut rest = rest;
    while let [flag, tail @ ..] = rest {
        let [value, tail @ ..] = tail else {
            return Err(format!("{flag} needs a value"));
        };
        match *flag {
            "--seconds" if seconds.is_none() => {
                seconds = Some(
                    value
                        .parse::<u64>()
                        .map_err(|_| format!("invalid --seconds value '{value}'"))?,
                );
            }
            "--history" if history.is_none() => history = Some(PathBuf::from(value)),
            _ => return Err("run takes only [--seconds N] [--history FILE]".to_string()),
        }
        rest = tail;
    }
    Ok(Command::Run { seconds, history })
}

fn no_args(cmd: &str, rest: &[&str]) -> Result<(), String> {
    if rest.is_empty() {
        Ok(())
    } else {
        Err(format!("{cmd} takes no arguments"))
    }
}

/// Parse one `measured:true` pair.
pub fn parse_pair(s: &str) -> Result<(f64, f64), String> {
    let (m, t) = s
        .split_once(':')
        .ok_or_else(|| format!("expected measured:true, got '{s}'"))?;
    let parse = |v: &str| {
        v.trim()
            .parse::<f64>()
            .ok()
            .filter(|x| x.is_finite())
            .ok_or_else(|| format!("invalid number '{v}' in '{s}'"))
    };
    Ok((parse(m)?, parse(t)?))
}

fn parse_pairs(points: &[&str]) -> Result<Vec<(f64, f64)>, String> {
    points.iter().map(|p| parse_pair(p)).collect()
}
