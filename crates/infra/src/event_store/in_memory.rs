use std::collections::HashMap;
use std::sync::RwLock;

use saleflow_core::{ExpectedVersion, RunId, WorkflowId};

use super::r#trait::{EventStore, EventStoreError, StoredEvent, UncommittedEvent};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct StreamKey {
    workflow_id: WorkflowId,
    run_id: RunId,
}

#[derive(Debug, Default)]
struct Streams {
    streams: HashMap<StreamKey, Vec<StoredEvent>>,
    latest_run: HashMap<WorkflowId, RunId>,
}

/// In-memory append-only history store.
///
/// Intended for tests/dev; history is lost with the process.
#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    inner: RwLock<Streams>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn current_version(stream: &[StoredEvent]) -> u64 {
        stream.last().map(|e| e.sequence_number).unwrap_or(0)
    }

    /// Number of streams currently held (all workflows, all runs).
    pub fn stream_count(&self) -> usize {
        self.inner.read().map(|s| s.streams.len()).unwrap_or(0)
    }
}

fn poisoned() -> EventStoreError {
    EventStoreError::InvalidAppend("lock poisoned".to_string())
}

impl EventStore for InMemoryEventStore {
    fn append(
        &self,
        events: Vec<UncommittedEvent>,
        expected_version: ExpectedVersion,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        let Some(first) = events.first() else {
            return Ok(vec![]);
        };

        let key = StreamKey {
            workflow_id: first.workflow_id.clone(),
            run_id: first.run_id,
        };

        for (idx, e) in events.iter().enumerate() {
            if e.workflow_id != key.workflow_id || e.run_id != key.run_id {
                return Err(EventStoreError::StreamMismatch(format!(
                    "batch targets more than one stream (index {idx})"
                )));
            }
        }

        let mut inner = self.inner.write().map_err(|_| poisoned())?;
        let Streams {
            streams,
            latest_run,
        } = &mut *inner;

        let is_new = !streams.contains_key(&key);
        let stream = streams.entry(key.clone()).or_default();
        let current = Self::current_version(stream);

        if !expected_version.matches(current) {
            return Err(EventStoreError::Concurrency(format!(
                "expected {expected_version:?}, found {current}"
            )));
        }

        let mut next = current + 1;
        let mut committed = Vec::with_capacity(events.len());
        for e in events {
            let stored = StoredEvent {
                event_id: e.event_id,
                workflow_id: e.workflow_id,
                run_id: e.run_id,
                sequence_number: next,
                event_type: e.event_type,
                event_version: e.event_version,
                occurred_at: e.occurred_at,
                payload: e.payload,
            };
            next += 1;
            stream.push(stored.clone());
            committed.push(stored);
        }

        if is_new {
            latest_run.insert(key.workflow_id, key.run_id);
        }

        Ok(committed)
    }

    fn load_stream(
        &self,
        workflow_id: &WorkflowId,
        run_id: RunId,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        let key = StreamKey {
            workflow_id: workflow_id.clone(),
            run_id,
        };

        let inner = self.inner.read().map_err(|_| poisoned())?;
        Ok(inner.streams.get(&key).cloned().unwrap_or_default())
    }

    fn latest_run(&self, workflow_id: &WorkflowId) -> Result<Option<RunId>, EventStoreError> {
        let inner = self.inner.read().map_err(|_| poisoned())?;
        Ok(inner.latest_run.get(workflow_id).copied())
    }

    fn delete_stream(&self, workflow_id: &WorkflowId, run_id: RunId) -> Result<(), EventStoreError> {
        let key = StreamKey {
            workflow_id: workflow_id.clone(),
            run_id,
        };

        let mut inner = self.inner.write().map_err(|_| poisoned())?;
        inner.streams.remove(&key);
        Ok(())
    }
}
