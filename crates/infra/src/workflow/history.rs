//! Replay log of an orchestration run.
//!
//! Live handlers and replay share one fold ([`WorkflowState::apply`]) so a
//! resumed run reaches the exact state the crashed one had committed.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use saleflow_core::{Aggregate, ExpectedVersion, RunId, SaleItemId, WorkflowId};
use saleflow_events::Event;
use saleflow_sales::{SaleItemAggregate, SaleItemEvent, SaleItemStatus, SaleItemWorkflowInput};

use super::{WorkflowError, WorkflowOutcome};
use crate::event_store::{EventStore, EventStoreError, StoredEvent, UncommittedEvent};

/// Decision recorded in a run's history stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum WorkflowEvent {
    Started {
        input: SaleItemWorkflowInput,
        task_queue: String,
        occurred_at: DateTime<Utc>,
    },
    SaleItem(SaleItemEvent),
    FulfillmentMarked {
        approver_name: String,
        occurred_at: DateTime<Utc>,
    },
    RestartRequested {
        occurred_at: DateTime<Utc>,
    },
    /// Recorded with the split that reserved the child.
    ChildStarted {
        child_workflow_id: WorkflowId,
        child_sale_item_id: SaleItemId,
        /// Split sequence the child id was derived from.
        sequence: u32,
        quantity: u64,
        occurred_at: DateTime<Utc>,
    },
    ContinuedAsNew {
        next_run_id: RunId,
        input: SaleItemWorkflowInput,
        occurred_at: DateTime<Utc>,
    },
    Completed {
        outcome: WorkflowOutcome,
        occurred_at: DateTime<Utc>,
    },
}

impl Event for WorkflowEvent {
    fn event_type(&self) -> &'static str {
        match self {
            WorkflowEvent::Started { .. } => "workflow.started",
            WorkflowEvent::SaleItem(e) => e.event_type(),
            WorkflowEvent::FulfillmentMarked { .. } => "workflow.fulfillment_marked",
            WorkflowEvent::RestartRequested { .. } => "workflow.restart_requested",
            WorkflowEvent::ChildStarted { .. } => "workflow.child_started",
            WorkflowEvent::ContinuedAsNew { .. } => "workflow.continued_as_new",
            WorkflowEvent::Completed { .. } => "workflow.completed",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            WorkflowEvent::SaleItem(e) => e.occurred_at(),
            WorkflowEvent::Started { occurred_at, .. }
            | WorkflowEvent::FulfillmentMarked { occurred_at, .. }
            | WorkflowEvent::RestartRequested { occurred_at }
            | WorkflowEvent::ChildStarted { occurred_at, .. }
            | WorkflowEvent::ContinuedAsNew { occurred_at, .. }
            | WorkflowEvent::Completed { occurred_at, .. } => *occurred_at,
        }
    }
}

/// In-memory state of one run, rebuilt from its history.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkflowState {
    sale_item: SaleItemAggregate,
    fulfilled: bool,
    approver_name: Option<String>,
    restart_requested: bool,
    split_sequence: u32,
}

impl WorkflowState {
    pub fn sale_item(&self) -> &SaleItemAggregate {
        &self.sale_item
    }

    pub fn fulfilled(&self) -> bool {
        self.fulfilled
    }

    pub fn approver_name(&self) -> Option<&str> {
        self.approver_name.as_deref()
    }

    pub fn restart_requested(&self) -> bool {
        self.restart_requested
    }

    pub fn split_sequence(&self) -> u32 {
        self.split_sequence
    }

    pub fn apply(&mut self, event: &WorkflowEvent) {
        match event {
            WorkflowEvent::Started { input, .. } => {
                self.split_sequence = input.split_sequence;
            }
            WorkflowEvent::SaleItem(e) => {
                match e {
                    SaleItemEvent::StatusChanged(changed)
                        if changed.to == SaleItemStatus::BilledApproved =>
                    {
                        self.fulfilled = true;
                    }
                    _ => {}
                }
                self.sale_item.apply(e);
            }
            WorkflowEvent::FulfillmentMarked { approver_name, .. } => {
                self.fulfilled = true;
                self.approver_name = Some(approver_name.clone());
            }
            WorkflowEvent::RestartRequested { .. } => {
                self.restart_requested = true;
            }
            WorkflowEvent::ChildStarted { sequence, .. } => {
                self.split_sequence = self.split_sequence.max(*sequence);
            }
            WorkflowEvent::ContinuedAsNew { .. }
            | WorkflowEvent::Completed { .. } => {}
        }
    }
}

/// How a replayed run ended, if it did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunClosure {
    ContinuedAsNew {
        next_run_id: RunId,
        input: SaleItemWorkflowInput,
    },
    Completed(WorkflowOutcome),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayedRun {
    pub state: WorkflowState,
    /// Stream version after the last replayed event.
    pub version: u64,
    pub closure: Option<RunClosure>,
}

/// Rebuild a run's state from its stored stream.
pub fn replay(
    workflow_id: &WorkflowId,
    run_id: RunId,
    stream: &[StoredEvent],
) -> Result<ReplayedRun, WorkflowError> {
    validate_loaded_stream(workflow_id, run_id, stream)?;

    let mut state = WorkflowState::default();
    let mut closure = None;

    for (idx, stored) in stream.iter().enumerate() {
        let event: WorkflowEvent = serde_json::from_value(stored.payload.clone()).map_err(|e| {
            WorkflowError::History(format!(
                "failed to decode {} at sequence {}: {e}",
                stored.event_type, stored.sequence_number
            ))
        })?;

        if idx == 0 && !matches!(event, WorkflowEvent::Started { .. }) {
            return Err(WorkflowError::History(format!(
                "run {run_id} does not begin with a start event"
            )));
        }
        if closure.is_some() {
            return Err(WorkflowError::History(format!(
                "run {run_id} has events after it closed (sequence {})",
                stored.sequence_number
            )));
        }

        match &event {
            WorkflowEvent::ContinuedAsNew {
                next_run_id, input, ..
            } => {
                closure = Some(RunClosure::ContinuedAsNew {
                    next_run_id: *next_run_id,
                    input: input.clone(),
                });
            }
            WorkflowEvent::Completed { outcome, .. } => {
                closure = Some(RunClosure::Completed(outcome.clone()));
            }
            _ => {}
        }

        state.apply(&event);
    }

    Ok(ReplayedRun {
        state,
        version: stream.last().map(|e| e.sequence_number).unwrap_or(0),
        closure,
    })
}

fn validate_loaded_stream(
    workflow_id: &WorkflowId,
    run_id: RunId,
    stream: &[StoredEvent],
) -> Result<(), WorkflowError> {
    // A buggy backend must not leak another run's decisions into this one.
    let mut last = 0u64;
    for (idx, e) in stream.iter().enumerate() {
        if &e.workflow_id != workflow_id || e.run_id != run_id {
            return Err(WorkflowError::History(format!(
                "loaded stream contains a foreign event at index {idx}"
            )));
        }
        if e.sequence_number <= last {
            return Err(WorkflowError::History(format!(
                "non-monotonic sequence_number in loaded stream (last={last}, found={})",
                e.sequence_number
            )));
        }
        last = e.sequence_number;
    }
    Ok(())
}

/// Appends a run's decisions to its stream with optimistic concurrency.
pub struct HistoryRecorder {
    store: Arc<dyn EventStore>,
    workflow_id: WorkflowId,
    run_id: RunId,
    version: Mutex<u64>,
}

impl HistoryRecorder {
    pub fn new(store: Arc<dyn EventStore>, workflow_id: WorkflowId, run_id: RunId) -> Self {
        Self::resume(store, workflow_id, run_id, 0)
    }

    /// Continue appending to a stream that already holds `version` events.
    pub fn resume(
        store: Arc<dyn EventStore>,
        workflow_id: WorkflowId,
        run_id: RunId,
        version: u64,
    ) -> Self {
        Self {
            store,
            workflow_id,
            run_id,
            version: Mutex::new(version),
        }
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn version(&self) -> Result<u64, EventStoreError> {
        Ok(*self.lock_version()?)
    }

    pub fn record(&self, events: &[WorkflowEvent]) -> Result<Vec<StoredEvent>, EventStoreError> {
        if events.is_empty() {
            return Ok(vec![]);
        }

        let mut version = self.lock_version()?;

        let expected = if *version == 0 {
            ExpectedVersion::NoStream
        } else {
            ExpectedVersion::Exact(*version)
        };

        let uncommitted = events
            .iter()
            .map(|e| {
                UncommittedEvent::from_typed(
                    self.workflow_id.clone(),
                    self.run_id,
                    Uuid::now_v7(),
                    e,
                )
            })
            .collect::<Result<Vec<_>, _>>()?;

        let committed = self.store.append(uncommitted, expected)?;
        if let Some(last) = committed.last() {
            *version = last.sequence_number;
        }

        Ok(committed)
    }

    fn lock_version(&self) -> Result<std::sync::MutexGuard<'_, u64>, EventStoreError> {
        self.version
            .lock()
            .map_err(|_| EventStoreError::InvalidAppend("lock poisoned".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_store::InMemoryEventStore;
    use saleflow_sales::{QuantitySplit, SaleItemInitialized, StatusChanged};

    fn ids() -> (WorkflowId, SaleItemId, RunId) {
        (
            WorkflowId::new("sale-item-poc-workflow-1234567").unwrap(),
            SaleItemId::new("1234567").unwrap(),
            RunId::new(),
        )
    }

    fn started(sale_item_id: &SaleItemId) -> Vec<WorkflowEvent> {
        let now = Utc::now();
        vec![
            WorkflowEvent::Started {
                input: SaleItemWorkflowInput::new(sale_item_id.clone(), 10),
                task_queue: "q".to_string(),
                occurred_at: now,
            },
            WorkflowEvent::SaleItem(SaleItemEvent::Initialized(SaleItemInitialized {
                sale_item_id: sale_item_id.clone(),
                quantity: 10,
                status: SaleItemStatus::Open,
                occurred_at: now,
            })),
        ]
    }

    #[test]
    fn replay_rebuilds_entity_and_flags() {
        let (workflow_id, sale_item_id, run_id) = ids();
        let store: Arc<dyn EventStore> = Arc::new(InMemoryEventStore::new());
        let recorder = HistoryRecorder::new(store.clone(), workflow_id.clone(), run_id);
        let now = Utc::now();

        recorder.record(&started(&sale_item_id)).unwrap();
        recorder
            .record(&[
                WorkflowEvent::SaleItem(SaleItemEvent::StatusChanged(StatusChanged {
                    sale_item_id: sale_item_id.clone(),
                    from: SaleItemStatus::Open,
                    to: SaleItemStatus::Ready,
                    occurred_at: now,
                })),
                WorkflowEvent::SaleItem(SaleItemEvent::QuantitySplit(QuantitySplit {
                    sale_item_id: sale_item_id.clone(),
                    child_id: sale_item_id.child(1),
                    quantity: 4,
                    remaining: 6,
                    occurred_at: now,
                })),
                WorkflowEvent::ChildStarted {
                    child_workflow_id: WorkflowId::new("sale-item-poc-workflow-1234567-3").unwrap(),
                    child_sale_item_id: sale_item_id.child(3),
                    sequence: 3,
                    quantity: 4,
                    occurred_at: now,
                },
                WorkflowEvent::RestartRequested { occurred_at: now },
            ])
            .unwrap();

        let stream = store.load_stream(&workflow_id, run_id).unwrap();
        let replayed = replay(&workflow_id, run_id, &stream).unwrap();

        let item = replayed.state.sale_item().snapshot().unwrap();
        assert_eq!(item.current_status, SaleItemStatus::Ready);
        assert_eq!(item.quantity, 6);
        assert_eq!(replayed.state.split_sequence(), 3);
        assert!(replayed.state.restart_requested());
        assert!(!replayed.state.fulfilled());
        assert_eq!(replayed.version, 6);
        assert_eq!(replayed.closure, None);
        assert_eq!(recorder.version().unwrap(), 6);
    }

    #[test]
    fn replay_reports_closure() {
        let (workflow_id, sale_item_id, run_id) = ids();
        let store: Arc<dyn EventStore> = Arc::new(InMemoryEventStore::new());
        let recorder = HistoryRecorder::new(store.clone(), workflow_id.clone(), run_id);
        let outcome = WorkflowOutcome {
            workflow_id: workflow_id.clone(),
            sale_item_id: sale_item_id.clone(),
            approver_name: Some("Tom Smith".to_string()),
        };

        recorder.record(&started(&sale_item_id)).unwrap();
        recorder
            .record(&[
                WorkflowEvent::FulfillmentMarked {
                    approver_name: "Tom Smith".to_string(),
                    occurred_at: Utc::now(),
                },
                WorkflowEvent::Completed {
                    outcome: outcome.clone(),
                    occurred_at: Utc::now(),
                },
            ])
            .unwrap();

        let stream = store.load_stream(&workflow_id, run_id).unwrap();
        let replayed = replay(&workflow_id, run_id, &stream).unwrap();
        assert_eq!(replayed.closure, Some(RunClosure::Completed(outcome)));
        assert_eq!(replayed.state.approver_name(), Some("Tom Smith"));
    }

    #[test]
    fn replay_rejects_foreign_events() {
        let (workflow_id, sale_item_id, run_id) = ids();
        let store: Arc<dyn EventStore> = Arc::new(InMemoryEventStore::new());
        HistoryRecorder::new(store.clone(), workflow_id.clone(), run_id)
            .record(&started(&sale_item_id))
            .unwrap();

        let stream = store.load_stream(&workflow_id, run_id).unwrap();
        let err = replay(&workflow_id, RunId::new(), &stream).unwrap_err();
        assert!(matches!(err, WorkflowError::History(_)));
    }

    #[test]
    fn concurrent_recorders_on_one_stream_conflict() {
        let (workflow_id, sale_item_id, run_id) = ids();
        let store: Arc<dyn EventStore> = Arc::new(InMemoryEventStore::new());
        let first = HistoryRecorder::new(store.clone(), workflow_id.clone(), run_id);
        let second = HistoryRecorder::new(store.clone(), workflow_id.clone(), run_id);

        first.record(&started(&sale_item_id)).unwrap();
        let err = second.record(&started(&sale_item_id)).unwrap_err();
        assert!(matches!(err, EventStoreError::Concurrency(_)));
    }

    #[test]
    fn poisoned_version_lock_is_reported() {
        let (workflow_id, _, run_id) = ids();
        let recorder = Arc::new(HistoryRecorder::new(
            Arc::new(InMemoryEventStore::new()),
            workflow_id,
            run_id,
        ));

        let poisoner = Arc::clone(&recorder);
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.version.lock().unwrap();
            panic!("poison the version lock");
        })
        .join();

        assert!(matches!(recorder.version(), Err(EventStoreError::InvalidAppend(_))));
        assert!(matches!(
            recorder.record(&started(&SaleItemId::new("1234567").unwrap())),
            Err(EventStoreError::InvalidAppend(_))
        ));
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        #[derive(Debug, Clone)]
        enum Step {
            Status(usize),
            Split(u64),
            Child(u32),
            Fulfill,
            Restart,
        }

        fn step() -> impl Strategy<Value = Step> {
            prop_oneof![
                (0usize..4).prop_map(Step::Status),
                (0u64..5).prop_map(Step::Split),
                (1u32..20).prop_map(Step::Child),
                Just(Step::Fulfill),
                Just(Step::Restart),
            ]
        }

        fn to_events(sale_item_id: &SaleItemId, steps: &[Step]) -> Vec<WorkflowEvent> {
            let now = Utc::now();
            let mut events = started(sale_item_id);
            let mut status = SaleItemStatus::Open;
            let mut quantity = 10u64;

            for step in steps {
                let event = match *step {
                    Step::Status(idx) => {
                        let to = SaleItemStatus::ALL[idx];
                        let from = std::mem::replace(&mut status, to);
                        WorkflowEvent::SaleItem(SaleItemEvent::StatusChanged(StatusChanged {
                            sale_item_id: sale_item_id.clone(),
                            from,
                            to,
                            occurred_at: now,
                        }))
                    }
                    Step::Split(requested) => {
                        let requested = requested.min(quantity);
                        quantity -= requested;
                        WorkflowEvent::SaleItem(SaleItemEvent::QuantitySplit(QuantitySplit {
                            sale_item_id: sale_item_id.clone(),
                            child_id: sale_item_id.child(1),
                            quantity: requested,
                            remaining: quantity,
                            occurred_at: now,
                        }))
                    }
                    Step::Child(sequence) => WorkflowEvent::ChildStarted {
                        child_workflow_id: WorkflowId::new(format!("wf-{sequence}")).unwrap(),
                        child_sale_item_id: sale_item_id.child(sequence),
                        sequence,
                        quantity: 1,
                        occurred_at: now,
                    },
                    Step::Fulfill => WorkflowEvent::FulfillmentMarked {
                        approver_name: "Tom Smith".to_string(),
                        occurred_at: now,
                    },
                    Step::Restart => WorkflowEvent::RestartRequested { occurred_at: now },
                };
                events.push(event);
            }
            events
        }

        proptest! {
            /// Property: replaying a stored run reaches the state the live fold reached.
            #[test]
            fn replay_matches_live_fold(
                steps in prop::collection::vec(step(), 0..24),
                batch in 1usize..5,
            ) {
                let (workflow_id, sale_item_id, run_id) = ids();
                let store: Arc<dyn EventStore> = Arc::new(InMemoryEventStore::new());
                let recorder = HistoryRecorder::new(store.clone(), workflow_id.clone(), run_id);

                let events = to_events(&sale_item_id, &steps);
                let mut live = WorkflowState::default();
                for chunk in events.chunks(batch) {
                    recorder.record(chunk).unwrap();
                    for event in chunk {
                        live.apply(event);
                    }
                }

                let stream = store.load_stream(&workflow_id, run_id).unwrap();
                let replayed = replay(&workflow_id, run_id, &stream).unwrap();

                prop_assert_eq!(&replayed.state, &live);
                prop_assert_eq!(replayed.version, events.len() as u64);
                prop_assert_eq!(recorder.version().unwrap(), events.len() as u64);
                prop_assert_eq!(replayed.closure, None);
            }
        }
    }
}
