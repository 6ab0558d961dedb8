//! `sonarfuse-middleware` – routes fusion output to whoever is listening.
//!
//! # Modules
//!
//! - [`bus`] – Headless, typed, topic-based publish/subscribe event bus built
//!   on Tokio broadcast channels.

pub mod bus;

pub use bus::{BusError, EventBus, Topic, TopicReceiver};
