//! Orchestration events broadcast to observers (the server's SSE stream).

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast;

use crate::core::types::{CheckpointStatus, DecisionAction, InstanceStatus};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrchestratorEvent {
    InstanceRegistered {
        instance_id: String,
    },
    InstanceStatusChanged {
        instance_id: String,
        status: InstanceStatus,
    },
    InstanceSwept {
        instance_id: String,
        reason: String,
    },
    DecisionRecorded {
        instance_id: String,
        action: DecisionAction,
        forced: bool,
    },
    CheckpointFinished {
        checkpoint_id: String,
        status: CheckpointStatus,
        retry_count: u32,
    },
    Escalated {
        subject_id: String,
        ticket_id: String,
    },
}

/// Cheap-to-clone broadcast handle. Sending with no subscribers is a no-op.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: Arc<broadcast::Sender<OrchestratorEvent>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx: Arc::new(tx) }
    }

    pub fn emit(&self, event: OrchestratorEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.tx.subscribe()
    }
}
