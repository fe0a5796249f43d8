use serde::{Deserialize, Serialize};
use uuid::Uuid;

use saleflow_core::{RunId, WorkflowId};

/// A committed history event as seen by bus subscribers.
///
/// `sequence_number` is the position inside the run's stream; it restarts
/// at 1 on every continue-as-new.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEnvelope<E> {
    event_id: Uuid,
    workflow_id: WorkflowId,
    run_id: RunId,
    sequence_number: u64,
    event_type: String,
    payload: E,
}

impl<E> EventEnvelope<E> {
    pub fn new(
        event_id: Uuid,
        workflow_id: WorkflowId,
        run_id: RunId,
        sequence_number: u64,
        event_type: impl Into<String>,
        payload: E,
    ) -> Self {
        Self {
            event_id,
            workflow_id,
            run_id,
            sequence_number,
            event_type: event_type.into(),
            payload,
        }
    }

    pub fn event_id(&self) -> Uuid {
        self.event_id
    }

    pub fn workflow_id(&self) -> &WorkflowId {
        &self.workflow_id
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn sequence_number(&self) -> u64 {
        self.sequence_number
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn payload(&self) -> &E {
        &self.payload
    }

    pub fn into_payload(self) -> E {
        self.payload
    }
}
