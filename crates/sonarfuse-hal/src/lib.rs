//! `sonarfuse-hal` – ranging hardware abstraction.
//!
//! # Modules
//!
//! - [`lines`] – [`TriggerLine`][lines::TriggerLine],
//!   [`EchoLine`][lines::EchoLine] and [`Clock`][lines::Clock]: the seams a
//!   board support crate implements.
//! - [`ranging`] – [`UltrasonicRanger`][ranging::UltrasonicRanger]: trigger /
//!   echo pulse timing with temperature-compensated distance conversion, and
//!   the [`RangingSensor`][ranging::RangingSensor] trait every driver
//!   implements.
//! - [`array`] – [`SensorArray`][array::SensorArray]: registry of drivers
//!   keyed by sensor id.
//! - [`sim`] – simulated transducers and scripted rangers for headless tests.

pub mod array;
pub mod lines;
pub mod ranging;
pub mod sim;

pub use array::SensorArray;
pub use lines::{Clock, EchoLine, MonotonicClock, TriggerLine};
pub use ranging::{RangingConfig, RangingSensor, UltrasonicRanger, speed_of_sound_cm_s};
pub use sim::{ScriptedRanger, SimTransducer};
