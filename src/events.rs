//! Keyed event fan-out for SSE subscribers.
//!
//! One broadcast channel per optimization id, held in a cache with idle
//! expiry so abandoned ids cannot accumulate. A terminal event starts a
//! short grace timer before the channel is dropped, which ends every
//! subscriber stream for that id.

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::debug;

const EVENT_BUFFER: usize = 256;

/// Events published over an optimization's lifetime. `Complete` and `Error`
/// are terminal.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum OptimizationEvent {
    #[serde(rename_all = "camelCase")]
    Progress {
        optimization_id: String,
        percent: u8,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        file_index: Option<usize>,
        #[serde(skip_serializing_if = "Option::is_none")]
        file_name: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Complete {
        optimization_id: String,
        payload: serde_json::Value,
    },
    #[serde(rename_all = "camelCase")]
    Error {
        optimization_id: String,
        message: String,
    },
}

impl OptimizationEvent {
    pub fn progress(id: impl Into<String>, percent: u8, message: impl Into<String>) -> Self {
        Self::Progress {
            optimization_id: id.into(),
            percent: percent.min(100),
            message: message.into(),
            file_index: None,
            file_name: None,
        }
    }

    pub fn file_progress(
        id: impl Into<String>,
        percent: u8,
        message: impl Into<String>,
        file_index: usize,
        file_name: impl Into<String>,
    ) -> Self {
        Self::Progress {
            optimization_id: id.into(),
            percent: percent.min(100),
            message: message.into(),
            file_index: Some(file_index),
            file_name: Some(file_name.into()),
        }
    }

    pub fn complete(id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self::Complete {
            optimization_id: id.into(),
            payload,
        }
    }

    pub fn error(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Error {
            optimization_id: id.into(),
            message: message.into(),
        }
    }

    pub fn optimization_id(&self) -> &str {
        match self {
            Self::Progress {
                optimization_id, ..
            }
            | Self::Complete {
                optimization_id, ..
            }
            | Self::Error {
                optimization_id, ..
            } => optimization_id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete { .. } | Self::Error { .. })
    }

    /// SSE event name.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Progress { .. } => "progress",
            Self::Complete { .. } => "complete",
            Self::Error { .. } => "error",
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SubscribeError {
    #[error("subscription id must not be empty")]
    EmptyId,
}

pub struct EventBroker {
    channels: moka::future::Cache<String, broadcast::Sender<OptimizationEvent>>,
    grace: Duration,
}

impl EventBroker {
    pub fn new(idle_ttl: Duration, grace: Duration) -> Self {
        Self {
            channels: moka::future::Cache::builder()
                .time_to_idle(idle_ttl)
                .build(),
            grace,
        }
    }

    /// Subscribe to every event published for `id` after this call. Multiple
    /// subscribers per id are fine; each gets its own receiver.
    pub async fn subscribe(
        &self,
        id: &str,
    ) -> Result<broadcast::Receiver<OptimizationEvent>, SubscribeError> {
        if id.trim().is_empty() {
            return Err(SubscribeError::EmptyId);
        }
        let tx = self
            .channels
            .get_with(id.to_string(), async { broadcast::channel(EVENT_BUFFER).0 })
            .await;
        Ok(tx.subscribe())
    }

    /// Deliver to current subscribers of the event's id. A terminal event
    /// schedules the channel teardown after the grace window.
    pub async fn publish(&self, event: OptimizationEvent) {
        let id = event.optimization_id().to_string();
        let terminal = event.is_terminal();

        if let Some(tx) = self.channels.get(&id).await {
            // Send only fails when nobody is listening, which is fine.
            let delivered = tx.send(event).unwrap_or(0);
            debug!(id = %id, delivered, "event published");
        }

        if terminal {
            let channels = self.channels.clone();
            let grace = self.grace;
            tokio::spawn(async move {
                tokio::time::sleep(grace).await;
                channels.invalidate(&id).await;
            });
        }
    }

    /// Number of ids with a live channel.
    pub fn channel_count(&self) -> u64 {
        self.channels.entry_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::sync::broadcast::error::RecvError;
    use tokio::time::{sleep, timeout};

    fn broker() -> EventBroker {
        EventBroker::new(Duration::from_secs(60), Duration::from_millis(50))
    }

    #[tokio::test]
    async fn subscribers_receive_events_published_after_subscription() {
        let broker = broker();
        let mut rx = broker.subscribe("opt-1").await.unwrap();
        broker
            .publish(OptimizationEvent::progress("opt-1", 50, "halfway"))
            .await;
        let event = timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.kind(), "progress");
        assert_eq!(event.optimization_id(), "opt-1");
    }

    #[tokio::test]
    async fn every_subscriber_sees_every_event() {
        let broker = broker();
        let mut a = broker.subscribe("opt-1").await.unwrap();
        let mut b = broker.subscribe("opt-1").await.unwrap();
        broker
            .publish(OptimizationEvent::complete("opt-1", json!({"ok": true})))
            .await;
        assert!(a.recv().await.unwrap().is_terminal());
        assert!(b.recv().await.unwrap().is_terminal());
    }

    #[tokio::test]
    async fn terminal_event_closes_channel_after_grace() {
        let broker = broker();
        let mut rx = broker.subscribe("opt-1").await.unwrap();
        broker
            .publish(OptimizationEvent::error("opt-1", "boom"))
            .await;
        assert!(rx.recv().await.unwrap().is_terminal());
        sleep(Duration::from_millis(150)).await;
        // Channel dropped: the pending receiver observes closure.
        assert!(matches!(rx.recv().await, Err(RecvError::Closed)));
        broker.channels.run_pending_tasks().await;
        assert_eq!(broker.channel_count(), 0);
    }

    #[tokio::test]
    async fn empty_id_is_rejected() {
        let broker = broker();
        assert_eq!(
            broker.subscribe("  ").await.unwrap_err(),
            SubscribeError::EmptyId
        );
    }

    #[test]
    fn events_serialize_with_a_type_tag() {
        let event = OptimizationEvent::progress("opt-1", 10, "queued");
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "progress");
        assert_eq!(value["optimizationId"], "opt-1");
        assert_eq!(value["percent"], 10);
    }
}
