//! In-process pub/sub for change notifications.
//!
//! Two topics, each a bounded broadcast channel: `node_update` and
//! `job_update`. Events carry only the ID of the changed row; subscribers
//! re-read authoritative state from the coordinator. Publishing never
//! blocks: when a subscriber's queue overflows, the oldest pending events
//! are dropped and the receiver observes the lag count, which the stream
//! endpoints surface as a `drop_count` annotation.

use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Default per-subscriber queue capacity.
pub const DEFAULT_CAPACITY: usize = 64;

/// A node row changed (registration, heartbeat, policy, staleness).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeUpdate {
    pub node_id: String,
}

/// A job's tasks or derived status changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct JobUpdate {
    pub job_id: Uuid,
}

/// Bounded two-topic event bus. Cloneable; all clones share the channels.
#[derive(Clone)]
pub struct EventBus {
    nodes_tx: broadcast::Sender<NodeUpdate>,
    jobs_tx: broadcast::Sender<JobUpdate>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (nodes_tx, _) = broadcast::channel(capacity);
        let (jobs_tx, _) = broadcast::channel(capacity);
        Self { nodes_tx, jobs_tx }
    }

    /// Publish a node change. No-op when nobody is subscribed.
    pub fn publish_node_update(&self, node_id: &str) {
        let _ = self.nodes_tx.send(NodeUpdate {
            node_id: node_id.to_owned(),
        });
    }

    /// Publish a job change. No-op when nobody is subscribed.
    pub fn publish_job_update(&self, job_id: Uuid) {
        let _ = self.jobs_tx.send(JobUpdate { job_id });
    }

    pub fn subscribe_nodes(&self) -> broadcast::Receiver<NodeUpdate> {
        self.nodes_tx.subscribe()
    }

    pub fn subscribe_jobs(&self) -> broadcast::Receiver<JobUpdate> {
        self.jobs_tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
