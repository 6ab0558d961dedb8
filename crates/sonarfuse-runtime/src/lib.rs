//! `sonarfuse-runtime` – execution units for the acquisition pipeline.
//!
//! Sampling and fusion run on separate OS threads and share nothing but the
//! per-sensor buffers inside [`SensorContext`][sonarfuse_perception::SensorContext].
//!
//! # Modules
//!
//! - [`worker`] – [`Worker`][worker::Worker]: named fixed-interval thread
//!   with cooperative stop and a bounded join.
//! - [`sampler`] – [`SamplingUnit`][sampler::SamplingUnit]: one thread per
//!   ranging sensor, feeding calibrated readings into the registry.
//! - [`fusion_loop`] – [`FusionLoop`][fusion_loop::FusionLoop]: periodic
//!   fusion and anomaly detection, published on the event bus.
//! - [`node`] – [`SensorNode`][node::SensorNode]: a sensor array's samplers
//!   and the fusion loop, started and stopped as one.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]: initialises
//!   the global `tracing` subscriber.

pub mod fusion_loop;
pub mod node;
pub mod sampler;
pub mod telemetry;
pub mod worker;

pub use fusion_loop::{FusionLoop, FusionLoopConfig, TickOutput, fusion_tick};
pub use node::{NodeConfig, SamplerReport, SensorNode};
pub use sampler::SamplingUnit;
pub use telemetry::{LogFormat, init_tracing};
pub use worker::Worker;
