//! Hosts orchestrations: one task per workflow id, chained across runs.
//!
//! The runtime owns the mailbox of every workflow it started or resumed.
//! A driver task opens a run, serves it until it exits and then either
//! completes the workflow or opens the successor run, deleting the
//! predecessor's history once the successor has started.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde_json::Value as JsonValue;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{error, info, warn};

use saleflow_core::{RunId, SaleItemId, WorkflowId};
use saleflow_events::{EventEnvelope, InMemoryEventBus};
use saleflow_sales::{
    MarkFulfilledRequest, SaleItem, SaleItemWorkflowInput, SplitRequest, StatusUpdateRequest,
    TransitionTable,
};

use crate::activities::{ActivityDispatcher, ActivityExecutor};
use crate::config::WorkflowConfig;
use crate::event_store::{EventStore, InMemoryEventStore, PublishingEventStore};
use crate::workflow::history::{self, HistoryRecorder, RunClosure, WorkflowState};
use crate::workflow::messages::{Query, Reply, Signal, Update, WorkflowMessage};
use crate::workflow::{
    RunExit, SaleItemWorkflow, WorkflowDescription, WorkflowError, WorkflowOutcome,
};

/// History bus type used by [`WorkflowRuntime::in_memory`].
pub type HistoryBus = InMemoryEventBus<EventEnvelope<JsonValue>>;

type WorkflowResult = Option<Result<WorkflowOutcome, WorkflowError>>;

#[derive(Clone)]
pub struct WorkflowRuntime {
    inner: Arc<RuntimeInner>,
}

struct RuntimeInner {
    config: WorkflowConfig,
    store: Arc<dyn EventStore>,
    activities: ActivityExecutor,
    registry: RwLock<HashMap<WorkflowId, WorkflowHandle>>,
}

enum RunStart {
    Fresh {
        input: SaleItemWorkflowInput,
        run_id: RunId,
        previous: Option<RunId>,
    },
    Restored {
        run_id: RunId,
        state: WorkflowState,
        version: u64,
    },
}

impl WorkflowRuntime {
    pub fn new(
        config: WorkflowConfig,
        store: Arc<dyn EventStore>,
        dispatcher: Arc<dyn ActivityDispatcher>,
    ) -> Self {
        let activities = ActivityExecutor::new(
            dispatcher,
            config.activity_timeout,
            config.activity_retry.clone(),
        );

        Self {
            inner: Arc::new(RuntimeInner {
                config,
                store,
                activities,
                registry: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Runtime over an in-memory history store whose commits are published on the returned bus.
    pub fn in_memory(
        config: WorkflowConfig,
        dispatcher: Arc<dyn ActivityDispatcher>,
    ) -> (Self, Arc<HistoryBus>) {
        let bus = Arc::new(HistoryBus::new());
        let store = PublishingEventStore::new(InMemoryEventStore::new(), Arc::clone(&bus));
        (Self::new(config, Arc::new(store), dispatcher), bus)
    }

    pub fn config(&self) -> &WorkflowConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &Arc<dyn EventStore> {
        &self.inner.store
    }

    pub(crate) fn activities(&self) -> &ActivityExecutor {
        &self.inner.activities
    }

    pub fn workflow_id_for(&self, sale_item_id: &SaleItemId) -> WorkflowId {
        WorkflowId::for_sale_item(&self.inner.config.workflow_id_prefix, sale_item_id)
    }

    /// Start a new orchestration for `input.sale_item_id`.
    pub fn start(&self, input: SaleItemWorkflowInput) -> Result<WorkflowHandle, WorkflowError> {
        Ok(self.reserve(input)?.launch())
    }

    /// Claim the workflow id for `input.sale_item_id` without starting its driver.
    ///
    /// Fails with [`WorkflowError::WorkflowAlreadyStarted`] if a workflow with
    /// that id is running. Dropping the reservation unlaunched frees the id.
    pub(crate) fn reserve(&self, input: SaleItemWorkflowInput) -> Result<ReservedStart, WorkflowError> {
        input.initial_status()?;

        let workflow_id = self.workflow_id_for(&input.sale_item_id);
        let (handle, mailbox, result) = self.register(&workflow_id)?;

        Ok(ReservedStart {
            runtime: self.clone(),
            handle,
            pending: Some((input, mailbox, result)),
        })
    }

    /// Re-host a workflow from its stored history.
    pub fn resume(&self, workflow_id: &WorkflowId) -> Result<WorkflowHandle, WorkflowError> {
        let not_found = || WorkflowError::WorkflowNotFound(workflow_id.clone());

        let run_id = self.inner.store.latest_run(workflow_id)?.ok_or_else(not_found)?;
        let stream = self.inner.store.load_stream(workflow_id, run_id)?;
        if stream.is_empty() {
            return Err(not_found());
        }
        let replayed = history::replay(workflow_id, run_id, &stream)?;

        let (handle, mailbox, result) = self.register(workflow_id)?;

        let start = match replayed.closure {
            Some(RunClosure::Completed(outcome)) => {
                info!(workflow_id = %workflow_id, run_id = %run_id, "workflow already completed");
                result.send_replace(Some(Ok(outcome)));
                self.release(&handle);
                return Ok(handle);
            }
            Some(RunClosure::ContinuedAsNew { next_run_id, input }) => RunStart::Fresh {
                input,
                run_id: next_run_id,
                previous: Some(run_id),
            },
            None => RunStart::Restored {
                run_id,
                state: replayed.state,
                version: replayed.version,
            },
        };

        info!(
            workflow_id = %workflow_id,
            run_id = %run_id,
            events = stream.len(),
            "resuming workflow from history"
        );
        tokio::spawn(drive(self.clone(), handle.clone(), start, mailbox, result));

        Ok(handle)
    }

    pub fn handle(&self, workflow_id: &WorkflowId) -> Result<WorkflowHandle, WorkflowError> {
        self.read_registry()?
            .get(workflow_id)
            .cloned()
            .ok_or_else(|| WorkflowError::WorkflowNotFound(workflow_id.clone()))
    }

    pub fn handle_for_sale_item(&self, sale_item_id: &SaleItemId) -> Result<WorkflowHandle, WorkflowError> {
        self.handle(&self.workflow_id_for(sale_item_id))
    }

    fn register(
        &self,
        workflow_id: &WorkflowId,
    ) -> Result<(WorkflowHandle, mpsc::Receiver<WorkflowMessage>, watch::Sender<WorkflowResult>), WorkflowError> {
        let mut registry = self
            .inner
            .registry
            .write()
            .map_err(|_| WorkflowError::Internal("workflow registry lock poisoned".to_string()))?;

        if let Some(existing) = registry.get(workflow_id) {
            if !existing.is_closed() {
                return Err(WorkflowError::WorkflowAlreadyStarted(workflow_id.clone()));
            }
        }

        let (mailbox_tx, mailbox_rx) = mpsc::channel(self.inner.config.mailbox_capacity.max(1));
        let (result_tx, result_rx) = watch::channel(None);
        let handle = WorkflowHandle {
            workflow_id: workflow_id.clone(),
            mailbox: mailbox_tx,
            result: result_rx,
        };
        registry.insert(workflow_id.clone(), handle.clone());

        Ok((handle, mailbox_rx, result_tx))
    }

    /// Drop `handle` from the registry unless its id has since been re-registered.
    fn release(&self, handle: &WorkflowHandle) {
        match self.inner.registry.write() {
            Ok(mut registry) => {
                let current = registry
                    .get(&handle.workflow_id)
                    .is_some_and(|registered| registered.mailbox.same_channel(&handle.mailbox));
                if current {
                    registry.remove(&handle.workflow_id);
                }
            }
            Err(_) => warn!(
                workflow_id = %handle.workflow_id,
                "workflow registry lock poisoned; closed handle kept"
            ),
        }
    }

    fn read_registry(
        &self,
    ) -> Result<std::sync::RwLockReadGuard<'_, HashMap<WorkflowId, WorkflowHandle>>, WorkflowError> {
        self.inner
            .registry
            .read()
            .map_err(|_| WorkflowError::Internal("workflow registry lock poisoned".to_string()))
    }

    fn open_run(&self, workflow_id: &WorkflowId, start: RunStart) -> Result<SaleItemWorkflow, WorkflowError> {
        let store = Arc::clone(&self.inner.store);

        match start {
            RunStart::Fresh {
                input,
                run_id,
                previous,
            } => {
                let history = HistoryRecorder::new(store, workflow_id.clone(), run_id);
                let workflow =
                    SaleItemWorkflow::new(self.clone(), workflow_id.clone(), history, WorkflowState::default());
                workflow.initialize(&input)?;

                if let Some(previous) = previous {
                    match self.inner.store.delete_stream(workflow_id, previous) {
                        Ok(()) => info!(
                            workflow_id = %workflow_id,
                            run_id = %previous,
                            "compacted history of previous run"
                        ),
                        Err(e) => warn!(
                            workflow_id = %workflow_id,
                            run_id = %previous,
                            error = %e,
                            "failed to delete history of previous run"
                        ),
                    }
                }

                Ok(workflow)
            }
            RunStart::Restored {
                run_id,
                state,
                version,
            } => {
                let history = HistoryRecorder::resume(store, workflow_id.clone(), run_id, version);
                Ok(SaleItemWorkflow::new(self.clone(), workflow_id.clone(), history, state))
            }
        }
    }
}

/// A registered workflow id whose driver has not been spawned yet.
pub(crate) struct ReservedStart {
    runtime: WorkflowRuntime,
    handle: WorkflowHandle,
    pending: Option<(
        SaleItemWorkflowInput,
        mpsc::Receiver<WorkflowMessage>,
        watch::Sender<WorkflowResult>,
    )>,
}

impl ReservedStart {
    pub(crate) fn handle(&self) -> &WorkflowHandle {
        &self.handle
    }

    /// Spawn the driver for the reserved workflow.
    pub(crate) fn launch(mut self) -> WorkflowHandle {
        if let Some((input, mailbox, result)) = self.pending.take() {
            let start = RunStart::Fresh {
                input,
                run_id: RunId::new(),
                previous: None,
            };
            tokio::spawn(drive(self.runtime.clone(), self.handle.clone(), start, mailbox, result));
        }
        self.handle.clone()
    }
}

impl Drop for ReservedStart {
    fn drop(&mut self) {
        if self.pending.is_some() {
            self.runtime.release(&self.handle);
        }
    }
}

async fn drive(
    runtime: WorkflowRuntime,
    handle: WorkflowHandle,
    mut start: RunStart,
    mut mailbox: mpsc::Receiver<WorkflowMessage>,
    result: watch::Sender<WorkflowResult>,
) {
    let workflow_id = handle.workflow_id().clone();
    let outcome = loop {
        let workflow = match runtime.open_run(&workflow_id, start) {
            Ok(workflow) => Arc::new(workflow),
            Err(e) => break Err(e),
        };

        match workflow.run(&mut mailbox).await {
            RunExit::Complete => break workflow.complete(),
            RunExit::ContinueAsNew => {
                let next_run_id = RunId::new();
                match workflow.continue_as_new(next_run_id) {
                    Ok(input) => {
                        start = RunStart::Fresh {
                            input,
                            run_id: next_run_id,
                            previous: Some(workflow.run_id()),
                        };
                    }
                    Err(e) => break Err(e),
                }
            }
        }
    };

    if let Err(e) = &outcome {
        error!(workflow_id = %workflow_id, error = %e, "workflow failed");
    }

    // Refuse new messages and drop queued ones before publishing the result.
    mailbox.close();
    drop(mailbox);
    result.send_replace(Some(outcome));
    runtime.release(&handle);
}

/// Client side of one orchestration.
#[derive(Debug, Clone)]
pub struct WorkflowHandle {
    workflow_id: WorkflowId,
    mailbox: mpsc::Sender<WorkflowMessage>,
    result: watch::Receiver<WorkflowResult>,
}

impl WorkflowHandle {
    pub fn workflow_id(&self) -> &WorkflowId {
        &self.workflow_id
    }

    pub fn is_closed(&self) -> bool {
        self.result.borrow().is_some() || self.mailbox.is_closed()
    }

    /// Wait for the orchestration's terminal value.
    pub async fn result(&self) -> Result<WorkflowOutcome, WorkflowError> {
        let current = self.result.borrow().clone();
        if let Some(outcome) = current {
            return outcome;
        }

        let mut result = self.result.clone();
        let done = result
            .wait_for(Option::is_some)
            .await
            .map_err(|_| self.closed())?;
        match done.as_ref() {
            Some(outcome) => outcome.clone(),
            None => Err(self.closed()),
        }
    }

    pub async fn update_status(&self, status: impl Into<String>) -> Result<SaleItem, WorkflowError> {
        let request = StatusUpdateRequest::new(status);
        self.request(|reply| WorkflowMessage::Update(Update::UpdateStatus { request, reply }))
            .await
    }

    /// Split `quantity` units off; resolves when the child orchestration completes.
    pub async fn split(&self, quantity: u64) -> Result<WorkflowOutcome, WorkflowError> {
        let request = SplitRequest { quantity };
        self.request(|reply| WorkflowMessage::Update(Update::Split { request, reply }))
            .await
    }

    pub async fn request_restart(&self) -> Result<(), WorkflowError> {
        self.request(|reply| WorkflowMessage::Update(Update::RequestRestart { reply }))
            .await
    }

    /// Deliver the fulfillment signal. Success means delivery, not processing.
    pub async fn mark_fulfilled(&self, approver_name: impl Into<String>) -> Result<(), WorkflowError> {
        let request = MarkFulfilledRequest::new(approver_name);
        self.send(WorkflowMessage::Signal(Signal::MarkFulfilled(request)))
            .await
    }

    pub async fn get_sale_item(&self) -> Result<SaleItem, WorkflowError> {
        self.request(|reply| WorkflowMessage::Query(Query::GetSaleItem { reply }))
            .await
    }

    pub async fn get_transitions(&self) -> Result<TransitionTable, WorkflowError> {
        self.request(|reply| WorkflowMessage::Query(Query::GetTransitions { reply }))
            .await
    }

    pub async fn describe(&self) -> Result<WorkflowDescription, WorkflowError> {
        self.request(|reply| WorkflowMessage::Query(Query::Describe { reply }))
            .await
    }

    async fn send(&self, message: WorkflowMessage) -> Result<(), WorkflowError> {
        self.mailbox.send(message).await.map_err(|_| self.closed())
    }

    async fn request<T>(
        &self,
        message: impl FnOnce(Reply<T>) -> WorkflowMessage,
    ) -> Result<T, WorkflowError> {
        let (reply, response) = oneshot::channel();
        self.send(message(reply)).await?;
        response.await.map_err(|_| self.closed())?
    }

    fn closed(&self) -> WorkflowError {
        WorkflowError::WorkflowClosed(self.workflow_id.clone())
    }
}
