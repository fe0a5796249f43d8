use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

use saleflow_core::{ExpectedVersion, RunId, WorkflowId};

/// A history event ready to be appended (no sequence number yet).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UncommittedEvent {
    pub event_id: Uuid,
    pub workflow_id: WorkflowId,
    pub run_id: RunId,

    pub event_type: String,
    pub event_version: u32,
    pub occurred_at: DateTime<Utc>,

    pub payload: JsonValue,
}

/// A history event persisted in a run's stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredEvent {
    pub event_id: Uuid,
    pub workflow_id: WorkflowId,
    pub run_id: RunId,

    /// Position in the run's stream, starting at 1.
    pub sequence_number: u64,

    pub event_type: String,
    pub event_version: u32,
    pub occurred_at: DateTime<Utc>,

    pub payload: JsonValue,
}

impl StoredEvent {
    pub fn stream_version(&self) -> u64 {
        self.sequence_number
    }

    /// Convert into an envelope for publication on the bus.
    pub fn to_envelope(&self) -> saleflow_events::EventEnvelope<JsonValue> {
        saleflow_events::EventEnvelope::new(
            self.event_id,
            self.workflow_id.clone(),
            self.run_id,
            self.sequence_number,
            self.event_type.clone(),
            self.payload.clone(),
        )
    }
}

#[derive(Debug, Error)]
pub enum EventStoreError {
    #[error("optimistic concurrency check failed: {0}")]
    Concurrency(String),

    #[error("stream mismatch: {0}")]
    StreamMismatch(String),

    #[error("invalid append: {0}")]
    InvalidAppend(String),

    #[error("event publication failed: {0}")]
    Publish(String),
}

/// Append-only store of orchestration history.
///
/// Implementations must:
/// - reject batches that mix streams
/// - enforce optimistic concurrency against the current stream version
/// - assign `sequence_number`s starting at `current_version + 1`, without gaps
/// - remember which run of a workflow was opened most recently
pub trait EventStore: Send + Sync {
    fn append(
        &self,
        events: Vec<UncommittedEvent>,
        expected_version: ExpectedVersion,
    ) -> Result<Vec<StoredEvent>, EventStoreError>;

    /// Load a run's full stream (empty if it does not exist).
    fn load_stream(
        &self,
        workflow_id: &WorkflowId,
        run_id: RunId,
    ) -> Result<Vec<StoredEvent>, EventStoreError>;

    /// Run whose stream was created last for this workflow, if any.
    fn latest_run(&self, workflow_id: &WorkflowId) -> Result<Option<RunId>, EventStoreError>;

    /// Drop a run's stream after it has been compacted away.
    fn delete_stream(&self, workflow_id: &WorkflowId, run_id: RunId) -> Result<(), EventStoreError>;
}

impl<S> EventStore for Arc<S>
where
    S: EventStore + ?Sized,
{
    fn append(
        &self,
        events: Vec<UncommittedEvent>,
        expected_version: ExpectedVersion,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        (**self).append(events, expected_version)
    }

    fn load_stream(
        &self,
        workflow_id: &WorkflowId,
        run_id: RunId,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        (**self).load_stream(workflow_id, run_id)
    }

    fn latest_run(&self, workflow_id: &WorkflowId) -> Result<Option<RunId>, EventStoreError> {
        (**self).latest_run(workflow_id)
    }

    fn delete_stream(&self, workflow_id: &WorkflowId, run_id: RunId) -> Result<(), EventStoreError> {
        (**self).delete_stream(workflow_id, run_id)
    }
}

impl UncommittedEvent {
    /// Build from a typed event, capturing the metadata needed to decode it later.
    pub fn from_typed<E>(
        workflow_id: WorkflowId,
        run_id: RunId,
        event_id: Uuid,
        event: &E,
    ) -> Result<Self, EventStoreError>
    where
        E: saleflow_events::Event + Serialize,
    {
        let payload = serde_json::to_value(event).map_err(|e| {
            EventStoreError::InvalidAppend(format!("payload serialization failed: {e}"))
        })?;

        Ok(Self {
            event_id,
            workflow_id,
            run_id,
            event_type: event.event_type().to_string(),
            event_version: event.version(),
            occurred_at: event.occurred_at(),
            payload,
        })
    }
}
