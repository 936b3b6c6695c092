//! Run lifecycle events fanned out to SSE subscribers.
//!
//! Every event is published to a single `tokio::sync::broadcast` channel;
//! each SSE connection subscribes and filters by run id. Lagging receivers
//! drop events; the status poll endpoint remains the source of truth.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::models::RunStatus;

/// Capacity of the broadcast channel backing run-event fanout.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum RunEvent {
    RunStarted {
        run_id: String,
    },
    StatusChanged {
        run_id: String,
        status: RunStatus,
    },
    PhaseStarted {
        run_id: String,
        phase: String,
    },
    PhaseCompleted {
        run_id: String,
        phase: String,
        progress: u8,
        context_truncated: bool,
    },
    ClarificationRequested {
        run_id: String,
        question: String,
    },
    RunCompleted {
        run_id: String,
        /// Whether the final report reached chat history durably.
        saved: bool,
    },
    RunFailed {
        run_id: String,
        error: String,
    },
}

impl RunEvent {
    pub fn run_id(&self) -> &str {
        match self {
            Self::RunStarted { run_id }
            | Self::StatusChanged { run_id, .. }
            | Self::PhaseStarted { run_id, .. }
            | Self::PhaseCompleted { run_id, .. }
            | Self::ClarificationRequested { run_id, .. }
            | Self::RunCompleted { run_id, .. }
            | Self::RunFailed { run_id, .. } => run_id,
        }
    }
}

/// Cloneable handle publishing run events to all SSE subscribers.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<RunEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Publish an event. Send errors just mean nobody is listening.
    pub fn publish(&self, event: RunEvent) {
        debug!(run_id = event.run_id(), event = ?event, "Publishing run event");
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_subscriber() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(RunEvent::PhaseStarted {
            run_id: "r1".to_string(),
            phase: "framing".to_string(),
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.run_id(), "r1");
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_fine() {
        let bus = EventBus::new();
        bus.publish(RunEvent::RunStarted {
            run_id: "r1".to_string(),
        });
    }

    #[test]
    fn test_events_serialize_tagged() {
        let event = RunEvent::RunCompleted {
            run_id: "r1".to_string(),
            saved: true,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "RunCompleted");
        assert_eq!(json["data"]["saved"], true);
    }
}
