//! Append-only history store boundary.
//!
//! Every orchestration run writes its decisions to one stream keyed by
//! `(workflow_id, run_id)`. Continue-as-new opens a new stream and deletes
//! the previous one, which keeps the stored history bounded by one run.

pub mod in_memory;
pub mod r#trait;

pub use in_memory::InMemoryEventStore;
pub use r#trait::{EventStore, EventStoreError, StoredEvent, UncommittedEvent};

use saleflow_core::{ExpectedVersion, RunId, WorkflowId};
use saleflow_events::{EventBus, EventEnvelope};
use serde_json::Value as JsonValue;

/// Adapter that publishes committed events to an `EventBus` after a successful append.
///
/// Ordering invariant: publish happens only after append succeeds.
pub struct PublishingEventStore<S, B> {
    store: S,
    bus: B,
}

impl<S, B> PublishingEventStore<S, B> {
    pub fn new(store: S, bus: B) -> Self {
        Self { store, bus }
    }

    pub fn into_parts(self) -> (S, B) {
        (self.store, self.bus)
    }
}

impl<S, B> EventStore for PublishingEventStore<S, B>
where
    S: EventStore,
    B: EventBus<EventEnvelope<JsonValue>>,
{
    fn append(
        &self,
        events: Vec<UncommittedEvent>,
        expected_version: ExpectedVersion,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        let committed = self.store.append(events, expected_version)?;

        for e in &committed {
            self.bus
                .publish(e.to_envelope())
                .map_err(|err| EventStoreError::Publish(format!("{err:?}")))?;
        }

        Ok(committed)
    }

    fn load_stream(
        &self,
        workflow_id: &WorkflowId,
        run_id: RunId,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        self.store.load_stream(workflow_id, run_id)
    }

    fn latest_run(&self, workflow_id: &WorkflowId) -> Result<Option<RunId>, EventStoreError> {
        self.store.latest_run(workflow_id)
    }

    fn delete_stream(&self, workflow_id: &WorkflowId, run_id: RunId) -> Result<(), EventStoreError> {
        self.store.delete_stream(workflow_id, run_id)
    }
}
