//! In-process pub/sub for node and job updates (spec §4.7). Delivery is
//! at-most-once and best-effort: a publish with no subscribers is simply
//! dropped, and a lagging subscriber misses intermediate updates rather than
//! blocking the publisher. Shape grounded on `tokio::sync::broadcast` usage
//! in `event_bus.rs` from the broader example pack.

use tokio::sync::broadcast;

use crate::domain::{JobUpdateEvent, NodeUpdateEvent};

const CHANNEL_CAPACITY: usize = 1024;

/// Broadcasts [`NodeUpdateEvent`]s to every live subscriber (e.g. an SSE
/// stream handler). Cheap to clone; all clones share the same channel.
#[derive(Debug, Clone)]
pub struct NodeEventBus {
    sender: broadcast::Sender<NodeUpdateEvent>,
}

impl NodeEventBus {
    pub fn new() -> Self {
        let (sender, _receiver) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NodeUpdateEvent> {
        self.sender.subscribe()
    }

    /// Publishes an event. Returns the number of subscribers it reached;
    /// zero subscribers and a torn-down channel are both non-fatal.
    pub fn publish(&self, event: NodeUpdateEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }
}

impl Default for NodeEventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Broadcasts [`JobUpdateEvent`]s; same delivery semantics as [`NodeEventBus`].
#[derive(Debug, Clone)]
pub struct JobEventBus {
    sender: broadcast::Sender<JobUpdateEvent>,
}

impl JobEventBus {
    pub fn new() -> Self {
        let (sender, _receiver) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobUpdateEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: JobUpdateEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }
}

impl Default for JobEventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enums::{JobStatus, NodeStatus};
    use chrono::Utc;

    #[tokio::test]
    async fn publish_with_no_subscribers_does_not_panic() {
        let bus = NodeEventBus::new();
        let delivered = bus.publish(NodeUpdateEvent {
            node_id: "node-1".into(),
            status: NodeStatus::Online,
            metrics: Default::default(),
            updated_at: Utc::now(),
        });
        assert_eq!(delivered, 0);
    }

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let bus = JobEventBus::new();
        let mut receiver = bus.subscribe();
        let event = JobUpdateEvent {
            job_id: "job-1".into(),
            status: JobStatus::Running,
            total_tasks: 4,
            completed_tasks: 1,
            failed_tasks: 0,
            updated_at: Utc::now(),
        };
        bus.publish(event.clone());
        let received = receiver.recv().await.unwrap();
        assert_eq!(received.job_id, event.job_id);
    }

    #[tokio::test]
    async fn lagging_subscriber_does_not_block_publisher() {
        let bus = NodeEventBus::new();
        let _receiver = bus.subscribe();
        for _ in 0..(CHANNEL_CAPACITY * 2) {
            bus.publish(NodeUpdateEvent {
                node_id: "node-1".into(),
                status: NodeStatus::Online,
                metrics: Default::default(),
                updated_at: Utc::now(),
            });
        }
    }
}
