//! Headless, typed, topic-based publish/subscribe event bus.
//!
//! Uses [`tokio::sync::broadcast`] channels under the hood so that every
//! subscriber receives every message without any single subscriber blocking
//! the others.
//!
//! # Topics
//!
//! | Topic | Typical traffic |
//! |---|---|
//! | [`Topic::Fused`] | One [`FusedReading`][sonarfuse_types::FusedReading] per channel per fusion tick |
//! | [`Topic::Anomalies`] | Advisory statistical-shift events |
//! | [`Topic::Faults`] | Per-sample ranging failures |

use sonarfuse_types::FusionEvent;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{trace, warn};

/// Default channel capacity (number of buffered events before old ones are
/// dropped for slow subscribers).
const DEFAULT_CAPACITY: usize = 256;

/// Routing lanes of the [`EventBus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Fused channel readings.
    Fused,
    /// Anomaly notifications.
    Anomalies,
    /// Sensor faults reported by sampling units.
    Faults,
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Topic::Fused => "fused",
            Topic::Anomalies => "anomalies",
            Topic::Faults => "faults",
        })
    }
}

/// Errors raised by the bus.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BusError {
    /// Nobody is listening on the topic.  Usually harmless.
    #[error("no subscribers for topic {0}")]
    NoSubscribers(Topic),
}

/// Shared event bus. Clone it cheaply – all clones share the same underlying
/// broadcast channels.
#[derive(Clone, Debug)]
pub struct EventBus {
    fused: broadcast::Sender<FusionEvent>,
    anomalies: broadcast::Sender<FusionEvent>,
    faults: broadcast::Sender<FusionEvent>,
}

impl EventBus {
    /// Create a new bus.  `capacity` applies to every topic independently
    /// and is raised to 1 if zero.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (fused, _) = broadcast::channel(capacity);
        let (anomalies, _) = broadcast::channel(capacity);
        let (faults, _) = broadcast::channel(capacity);
        Self {
            fused,
            anomalies,
            faults,
        }
    }

    /// Publish `event` to `topic`.
    ///
    /// Returns the number of receivers handed the event, or
    /// [`BusError::NoSubscribers`] when nobody is listening.
    pub fn publish_to(&self, topic: Topic, event: FusionEvent) -> Result<usize, BusError> {
        self.topic_sender(topic)
            .send(event)
            .map_err(|_| BusError::NoSubscribers(topic))
    }

    /// Publish and treat a missing audience as a normal condition.
    /// Returns the number of receivers handed the event.
    pub fn broadcast(&self, topic: Topic, event: FusionEvent) -> usize {
        match self.publish_to(topic, event) {
            Ok(n) => n,
            Err(e) => {
                trace!(%topic, error = %e, "event dropped");
                0
            }
        }
    }

    /// Subscribe to one topic.
    pub fn subscribe_to(&self, topic: Topic) -> TopicReceiver {
        TopicReceiver {
            topic,
            receiver: self.topic_sender(topic).subscribe(),
        }
    }

    /// Number of live subscribers on `topic`.
    pub fn subscriber_count(&self, topic: Topic) -> usize {
        self.topic_sender(topic).receiver_count()
    }

    fn topic_sender(&self, topic: Topic) -> &broadcast::Sender<FusionEvent> {
        match topic {
            Topic::Fused => &self.fused,
            Topic::Anomalies => &self.anomalies,
            Topic::Faults => &self.faults,
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

// ---------------------------------------------------------------------------
// Topic-based receiver
// ---------------------------------------------------------------------------

/// A receiver bound to a single [`Topic`] channel.
///
/// Obtained via [`EventBus::subscribe_to`].
pub struct TopicReceiver {
    topic: Topic,
    receiver: broadcast::Receiver<FusionEvent>,
}

impl TopicReceiver {
    /// Wait for the next event on this topic.
    ///
    /// Returns:
    /// * `Ok(event)` – a successfully received event.
    /// * `Err(broadcast::error::RecvError::Lagged(n))` – the subscriber fell
    ///   behind and `n` messages were dropped.
    /// * `Err(broadcast::error::RecvError::Closed)` – the bus has shut down.
    pub async fn recv(&mut self) -> Result<FusionEvent, broadcast::error::RecvError> {
        self.receiver.recv().await
    }

    /// Take the next buffered event without waiting.  Lag is logged and
    /// skipped; `None` means nothing is pending or the bus is gone.
    pub fn try_recv(&mut self) -> Option<FusionEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    warn!(topic = %self.topic, lagged_by = n, "TopicReceiver lagged");
                    continue;
                }
                Err(broadcast::error::TryRecvError::Empty)
                | Err(broadcast::error::TryRecvError::Closed) => return None,
            }
        }
    }

    /// Drain everything currently buffered.
    pub fn drain(&mut self) -> Vec<FusionEvent> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }

    /// The [`Topic`] this receiver is bound to.
    pub fn topic(&self) -> Topic {
        self.topic
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use sonarfuse_types::{EchoPhase, FusedReading, FusionPayload, RangingError};

    fn fused_event(value: f64) -> FusionEvent {
        FusionEvent::new(
            "sonarfuse-middleware::test",
            FusionPayload::Fused(FusedReading {
                value,
                unit: "cm".into(),
                timestamp: Utc::now(),
                confidence: 1.0,
                contributing_sensor_ids: vec!["front".into()],
                fusion_method: "weighted_average_kalman".into(),
            }),
        )
    }

    fn fault_event() -> FusionEvent {
        FusionEvent::new(
            "sonarfuse-middleware::test",
            FusionPayload::SensorFault {
                sensor_id: "front".into(),
                error: RangingError::Timeout {
                    phase: EchoPhase::Fall,
                },
            },
        )
    }

    #[test]
    fn publish_without_subscribers_is_reported() {
        let bus = EventBus::default();
        assert_eq!(
            bus.publish_to(Topic::Fused, fused_event(1.0)),
            Err(BusError::NoSubscribers(Topic::Fused))
        );
        assert_eq!(bus.broadcast(Topic::Fused, fused_event(1.0)), 0);
    }

    #[tokio::test]
    async fn topic_multiple_subscribers_receive_same_event() -> Result<(), Box<dyn std::error::Error>> {
        let bus = EventBus::default();
        let mut subscriber1 = bus.subscribe_to(Topic::Fused);
        let mut subscriber2 = bus.subscribe_to(Topic::Fused);
        assert_eq!(bus.subscriber_count(Topic::Fused), 2);

        let event = fused_event(120.0);
        assert_eq!(bus.publish_to(Topic::Fused, event.clone())?, 2);

        assert_eq!(subscriber1.recv().await?.id, event.id);
        assert_eq!(subscriber2.recv().await?.id, event.id);
        Ok(())
    }

    #[tokio::test]
    async fn topics_are_isolated() -> Result<(), Box<dyn std::error::Error>> {
        let bus = EventBus::default();
        let mut anomalies = bus.subscribe_to(Topic::Anomalies);
        let _faults = bus.subscribe_to(Topic::Faults);

        bus.publish_to(Topic::Faults, fault_event())?;

        let result =
            tokio::time::timeout(std::time::Duration::from_millis(50), anomalies.recv()).await;
        assert!(result.is_err(), "Anomalies subscriber must not see a fault");
        Ok(())
    }

    #[test]
    fn try_recv_drains_in_order() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe_to(Topic::Fused);
        assert!(rx.try_recv().is_none());
        for v in [1.0, 2.0, 3.0] {
            bus.broadcast(Topic::Fused, fused_event(v));
        }
        let values: Vec<f64> = rx
            .drain()
            .into_iter()
            .filter_map(|e| match e.payload {
                FusionPayload::Fused(f) => Some(f.value),
                _ => None,
            })
            .collect();
        assert_eq!(values, vec![1.0, 2.0, 3.0]);
        assert_eq!(rx.topic(), Topic::Fused);
    }

    #[test]
    fn try_recv_skips_lag() {
        let bus = EventBus::new(4);
        let mut rx = bus.subscribe_to(Topic::Faults);
        for _ in 0..20 {
            bus.broadcast(Topic::Faults, fault_event());
        }
        assert_eq!(rx.drain().len(), 4);
    }

    /// Flooding a low-capacity channel while a subscriber sleeps must produce
    /// a `Lagged` error rather than panicking or blocking.
    #[tokio::test]
    async fn topic_channel_lag_on_slow_subscriber() {
        let bus = EventBus::new(8);
        let mut slow_sub = bus.subscribe_to(Topic::Fused);
        for i in 0..100 {
            bus.broadcast(Topic::Fused, fused_event(i as f64));
        }
        let result = slow_sub.recv().await;
        assert!(
            matches!(result, Err(broadcast::error::RecvError::Lagged(_))),
            "expected Lagged error, got: {result:?}"
        );
    }
}
