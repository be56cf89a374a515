//! Event fan-out to the presentation layer.
//!
//! Every state change the coordinator makes is published here as a
//! [`FanoutEvent`]. The bus is built on `tokio::sync::broadcast`: publishing
//! never blocks and never fails the source, and a subscriber that falls
//! behind the channel capacity loses the oldest events (`RecvError::Lagged`)
//! rather than exerting backpressure — drop-if-slow by construction.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::types::{ChatEntry, NodeEvent, ReceivedTask, StoredTask};

/// Default buffer depth per subscriber.
const DEFAULT_CAPACITY: usize = 256;

/// A state change pushed to the presentation layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum FanoutEvent {
    /// A sent-task record changed.
    #[serde(rename = "task.update")]
    TaskUpdate {
        /// Snapshot after the change.
        task: StoredTask,
    },

    /// A received-task record changed (this node is the executor).
    #[serde(rename = "task.received")]
    ReceivedTaskUpdate {
        /// Snapshot after the change.
        task: ReceivedTask,
    },

    /// A chat message was appended to a peer log.
    #[serde(rename = "chat.message", rename_all = "camelCase")]
    ChatMessage {
        /// Peer the conversation is with.
        node_id: String,
        /// The appended message.
        message: ChatEntry,
    },

    /// A cluster lifecycle event was observed.
    #[serde(rename = "node.event")]
    NodeLifecycle {
        /// The observed event.
        #[serde(flatten)]
        event: NodeEvent,
    },
}

/// Broadcast bus carrying [`FanoutEvent`]s to any number of subscribers.
///
/// Cheap to clone; all clones publish into the same channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<FanoutEvent>,
}

impl EventBus {
    /// Create a bus with the given per-subscriber capacity.
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Subscribe to events published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<FanoutEvent> {
        self.tx.subscribe()
    }

    /// Publish an event to all current subscribers.
    ///
    /// A bus with no subscribers silently drops the event; the source never
    /// observes a failure.
    pub fn publish(&self, event: FanoutEvent) {
        match self.tx.send(event) {
            Ok(count) => debug!(subscribers = count, "fan-out event published"),
            Err(_) => debug!("fan-out event dropped (no subscribers)"),
        }
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChatRole, NodeEventKind, StoredTask, TaskSource};

    #[tokio::test]
    async fn publish_without_subscribers_does_not_fail() {
        let bus = EventBus::default();
        bus.publish(FanoutEvent::TaskUpdate {
            task: StoredTask::new("t1", "n1", None, "ls", TaskSource::Remote),
        });
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn subscribers_receive_events_in_order() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        bus.publish(FanoutEvent::ChatMessage {
            node_id: "peer".to_string(),
            message: ChatEntry::new("peer", ChatRole::User, "hi"),
        });
        bus.publish(FanoutEvent::NodeLifecycle {
            event: NodeEvent::new("peer", None, NodeEventKind::Online),
        });

        assert!(matches!(rx.recv().await.unwrap(), FanoutEvent::ChatMessage { .. }));
        assert!(matches!(rx.recv().await.unwrap(), FanoutEvent::NodeLifecycle { .. }));
    }

    #[tokio::test]
    async fn slow_subscriber_lags_instead_of_blocking() {
        let bus = EventBus::new(2);
        let mut rx = bus.subscribe();

        for i in 0..5 {
            bus.publish(FanoutEvent::NodeLifecycle {
                event: NodeEvent::new(format!("n{i}"), None, NodeEventKind::Online),
            });
        }

        // The first recv reports the overflow, then the retained tail arrives.
        match rx.recv().await {
            Err(broadcast::error::RecvError::Lagged(missed)) => assert!(missed >= 1),
            other => panic!("expected lag, got {other:?}"),
        }
        assert!(rx.recv().await.is_ok());
    }

    #[test]
    fn fanout_event_wire_names() {
        let event = FanoutEvent::NodeLifecycle {
            event: NodeEvent::new("n1", Some("worker".to_string()), NodeEventKind::Offline),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "node.event");
        assert_eq!(json["nodeId"], "n1");
        assert_eq!(json["nodeName"], "worker");
        assert_eq!(json["event"], "offline");

        let update = FanoutEvent::TaskUpdate {
            task: StoredTask::new("t1", "n1", None, "ls", TaskSource::Remote),
        };
        let json = serde_json::to_value(&update).unwrap();
        assert_eq!(json["type"], "task.update");
        assert_eq!(json["task"]["taskId"], "t1");
    }
}
