//! Sale item orchestrator: one run of the long-lived state machine.
//!
//! Handlers decide against the current [`WorkflowState`], record the
//! resulting [`WorkflowEvent`]s and only then fold them into memory. Updates
//! run on their own tasks so the mailbox keeps draining while an activity or
//! child orchestration is awaited; the run ends once no handler is in flight
//! and either a restart was requested or the item is fulfilled.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use tokio::sync::{Notify, mpsc};
use tracing::{error, info, warn};

use saleflow_core::{Aggregate, RunId, SaleItemId, WorkflowId};
use saleflow_sales::{
    ChangeStatus, InitializeSaleItem, MarkFulfilledRequest, SaleItem, SaleItemCommand,
    SaleItemStatus, SaleItemWorkflowInput, SplitQuantity, SplitRequest, StatusUpdateRequest,
    TransitionTable,
};

use super::history::{HistoryRecorder, WorkflowEvent, WorkflowState};
use super::messages::{Query, Signal, Update, WorkflowMessage};
use super::{WorkflowDescription, WorkflowError, WorkflowOutcome};
use crate::activities::ActivityKind;
use crate::runtime::{ReservedStart, WorkflowRuntime};

/// Why a run stopped accepting work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunExit {
    /// Restart requested: carry the entity into a fresh run.
    ContinueAsNew,
    /// Fulfilled: close the orchestration.
    Complete,
}

pub struct SaleItemWorkflow {
    workflow_id: WorkflowId,
    runtime: WorkflowRuntime,
    history: HistoryRecorder,
    state: Mutex<WorkflowState>,
    /// Serializes splits across their child await.
    split_lock: tokio::sync::Mutex<()>,
    in_flight: AtomicUsize,
    changed: Notify,
}

impl SaleItemWorkflow {
    pub(crate) fn new(
        runtime: WorkflowRuntime,
        workflow_id: WorkflowId,
        history: HistoryRecorder,
        state: WorkflowState,
    ) -> Self {
        Self {
            workflow_id,
            runtime,
            history,
            state: Mutex::new(state),
            split_lock: tokio::sync::Mutex::new(()),
            in_flight: AtomicUsize::new(0),
            changed: Notify::new(),
        }
    }

    pub fn workflow_id(&self) -> &WorkflowId {
        &self.workflow_id
    }

    pub fn run_id(&self) -> RunId {
        self.history.run_id()
    }

    /// Record the run's start and create the entity from `input`.
    pub fn initialize(&self, input: &SaleItemWorkflowInput) -> Result<(), WorkflowError> {
        let status = input.initial_status()?;
        let now = Utc::now();

        self.commit(|state| {
            let mut events = vec![WorkflowEvent::Started {
                input: input.clone(),
                task_queue: self.runtime.config().task_queue.clone(),
                occurred_at: now,
            }];
            let created = state
                .sale_item()
                .handle(&SaleItemCommand::Initialize(InitializeSaleItem {
                    sale_item_id: input.sale_item_id.clone(),
                    quantity: input.quantity,
                    status,
                    occurred_at: now,
                }))?;
            events.extend(created.into_iter().map(WorkflowEvent::SaleItem));
            Ok((events, ()))
        })?;

        info!(
            workflow_id = %self.workflow_id,
            run_id = %self.run_id(),
            sale_item_id = %input.sale_item_id,
            quantity = input.quantity,
            status = %status,
            split_sequence = input.split_sequence,
            task_queue = %self.runtime.config().task_queue,
            "workflow started"
        );
        Ok(())
    }

    /// Move the entity to `request.status`, running the transition activity first.
    ///
    /// The guard is evaluated before the activity and again at commit; the
    /// status only changes once every activity has succeeded.
    pub async fn update_status(&self, request: StatusUpdateRequest) -> Result<SaleItem, WorkflowError> {
        let (snapshot, target) = {
            let state = self.lock_state()?;
            let snapshot = state.sale_item().snapshot()?;
            let target: SaleItemStatus = request.status.parse()?;
            state
                .sale_item()
                .transitions()
                .check(snapshot.current_status, target)?;
            (snapshot, target)
        };

        info!(
            workflow_id = %self.workflow_id,
            sale_item_id = %snapshot.sale_item_id,
            from = %snapshot.current_status,
            to = %target,
            "status update accepted"
        );

        let activities = self.runtime.activities();
        activities
            .run(ActivityKind::for_target(target), &snapshot)
            .await?;
        if self.runtime.config().post_update.is_enabled() {
            activities.run(ActivityKind::PostUpdate, &snapshot).await?;
        }

        let updated = self.commit(|state| {
            let changed = state
                .sale_item()
                .handle(&SaleItemCommand::ChangeStatus(ChangeStatus {
                    to: target,
                    occurred_at: Utc::now(),
                }))?;
            let mut item = state.sale_item().snapshot()?;
            item.current_status = target;
            Ok((changed.into_iter().map(WorkflowEvent::SaleItem).collect(), item))
        })?;

        info!(
            workflow_id = %self.workflow_id,
            sale_item_id = %updated.sale_item_id,
            from = %snapshot.current_status,
            to = %target,
            "status updated"
        );
        if target == SaleItemStatus::BilledApproved {
            info!(workflow_id = %self.workflow_id, "sale item fulfilled by billing approval");
        }

        Ok(updated)
    }

    /// Move `request.quantity` units into a child orchestration and wait for it to finish.
    pub async fn split_sale_item(&self, request: SplitRequest) -> Result<WorkflowOutcome, WorkflowError> {
        self.lock_state()?.sale_item().snapshot()?;

        let _split = self.split_lock.lock().await;

        // A recorded split always has a claimed child id.
        let (child, remaining) = self.commit(|state| {
            let item = state.sale_item().snapshot()?;
            let (sequence, child) =
                self.reserve_child(&item.sale_item_id, state.split_sequence(), request.quantity)?;
            let child_sale_item_id = item.sale_item_id.child(sequence);
            let now = Utc::now();

            let mut events: Vec<WorkflowEvent> = state
                .sale_item()
                .handle(&SaleItemCommand::Split(SplitQuantity {
                    quantity: request.quantity,
                    child_id: child_sale_item_id.clone(),
                    occurred_at: now,
                }))?
                .into_iter()
                .map(WorkflowEvent::SaleItem)
                .collect();
            events.push(WorkflowEvent::ChildStarted {
                child_workflow_id: child.handle().workflow_id().clone(),
                child_sale_item_id,
                sequence,
                quantity: request.quantity,
                occurred_at: now,
            });

            Ok((events, (child, item.quantity - request.quantity)))
        })?;

        let child = child.launch();
        info!(
            workflow_id = %self.workflow_id,
            child_workflow_id = %child.workflow_id(),
            quantity = request.quantity,
            remaining,
            "quantity split; waiting for child workflow"
        );
        child.result().await
    }

    /// Claim the first free child id after `after`.
    fn reserve_child(
        &self,
        parent: &SaleItemId,
        after: u32,
        quantity: u64,
    ) -> Result<(u32, ReservedStart), WorkflowError> {
        let mut sequence = after;
        loop {
            sequence = sequence
                .checked_add(1)
                .ok_or_else(|| WorkflowError::Internal("split sequence exhausted".to_string()))?;
            let input = SaleItemWorkflowInput::new(parent.child(sequence), quantity);

            match self.runtime.reserve(input) {
                Ok(child) => return Ok((sequence, child)),
                Err(WorkflowError::WorkflowAlreadyStarted(taken)) => {
                    warn!(
                        workflow_id = %self.workflow_id,
                        child_workflow_id = %taken,
                        "child workflow id in use; trying the next sequence"
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub fn mark_fulfilled(&self, request: MarkFulfilledRequest) -> Result<(), WorkflowError> {
        self.commit(|_| {
            Ok((
                vec![WorkflowEvent::FulfillmentMarked {
                    approver_name: request.approver_name.clone(),
                    occurred_at: Utc::now(),
                }],
                (),
            ))
        })?;

        info!(
            workflow_id = %self.workflow_id,
            approver_name = %request.approver_name,
            "fulfillment marked"
        );
        Ok(())
    }

    pub fn request_restart(&self) -> Result<(), WorkflowError> {
        self.commit(|_| {
            Ok((
                vec![WorkflowEvent::RestartRequested {
                    occurred_at: Utc::now(),
                }],
                (),
            ))
        })?;

        info!(workflow_id = %self.workflow_id, run_id = %self.run_id(), "restart requested");
        Ok(())
    }

    pub fn get_sale_item(&self) -> Result<SaleItem, WorkflowError> {
        Ok(self.lock_state()?.sale_item().snapshot()?)
    }

    pub fn get_transitions(&self) -> Result<TransitionTable, WorkflowError> {
        Ok(self.lock_state()?.sale_item().transitions().clone())
    }

    pub fn describe(&self) -> Result<WorkflowDescription, WorkflowError> {
        let state = self.lock_state()?;
        Ok(WorkflowDescription {
            workflow_id: self.workflow_id.clone(),
            run_id: self.run_id(),
            in_flight: self.in_flight.load(Ordering::SeqCst),
            fulfilled: state.fulfilled(),
            restart_requested: state.restart_requested(),
            split_sequence: state.split_sequence(),
        })
    }

    /// Close this run and return the input its successor starts from.
    pub fn continue_as_new(&self, next_run_id: RunId) -> Result<SaleItemWorkflowInput, WorkflowError> {
        let input = self.commit(|state| {
            let item = state.sale_item().snapshot()?;
            let input = SaleItemWorkflowInput::carry_forward(&item, state.split_sequence());
            Ok((
                vec![WorkflowEvent::ContinuedAsNew {
                    next_run_id,
                    input: input.clone(),
                    occurred_at: Utc::now(),
                }],
                input,
            ))
        })?;

        info!(
            workflow_id = %self.workflow_id,
            run_id = %self.run_id(),
            next_run_id = %next_run_id,
            "continued as new"
        );
        Ok(input)
    }

    pub fn complete(&self) -> Result<WorkflowOutcome, WorkflowError> {
        let outcome = self.commit(|state| {
            let item = state.sale_item().snapshot()?;
            let outcome = WorkflowOutcome {
                workflow_id: self.workflow_id.clone(),
                sale_item_id: item.sale_item_id,
                approver_name: state.approver_name().map(str::to_owned),
            };
            Ok((
                vec![WorkflowEvent::Completed {
                    outcome: outcome.clone(),
                    occurred_at: Utc::now(),
                }],
                outcome,
            ))
        })?;

        info!(workflow_id = %self.workflow_id, run_id = %self.run_id(), "workflow completed");
        Ok(outcome)
    }

    /// Resolves once no handler is in flight and the run should end.
    ///
    /// A pending restart wins over fulfillment.
    pub async fn wait_for_exit(&self) -> RunExit {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            // Register before checking so a change between the check and the await is not lost.
            notified.as_mut().enable();

            if let Some(exit) = self.exit_condition() {
                return exit;
            }
            notified.await;
        }
    }

    fn exit_condition(&self) -> Option<RunExit> {
        if self.in_flight.load(Ordering::SeqCst) > 0 {
            return None;
        }

        let state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if state.restart_requested() {
            Some(RunExit::ContinueAsNew)
        } else if state.fulfilled() {
            Some(RunExit::Complete)
        } else {
            None
        }
    }

    /// Serve the mailbox until the run exits.
    ///
    /// Queued messages are handled before the exit predicate is acted on.
    pub(crate) async fn run(self: &Arc<Self>, mailbox: &mut mpsc::Receiver<WorkflowMessage>) -> RunExit {
        loop {
            tokio::select! {
                biased;

                message = mailbox.recv() => match message {
                    Some(message) => self.dispatch(message),
                    None => return self.wait_for_exit().await,
                },
                exit = self.wait_for_exit() => return exit,
            }
        }
    }

    fn dispatch(self: &Arc<Self>, message: WorkflowMessage) {
        match message {
            WorkflowMessage::Signal(Signal::MarkFulfilled(request)) => {
                if let Err(e) = self.mark_fulfilled(request) {
                    error!(workflow_id = %self.workflow_id, error = %e, "failed to record fulfillment");
                }
            }
            WorkflowMessage::Update(Update::UpdateStatus { request, reply }) => {
                let guard = self.begin_handler();
                let workflow = Arc::clone(self);
                tokio::spawn(async move {
                    let result = workflow.update_status(request).await;
                    if let Err(e) = &result {
                        warn!(workflow_id = %workflow.workflow_id, error = %e, "status update failed");
                    }
                    let _ = reply.send(result);
                    drop(guard);
                });
            }
            WorkflowMessage::Update(Update::Split { request, reply }) => {
                let guard = self.begin_handler();
                let workflow = Arc::clone(self);
                tokio::spawn(async move {
                    let result = workflow.split_sale_item(request).await;
                    if let Err(e) = &result {
                        warn!(workflow_id = %workflow.workflow_id, error = %e, "split failed");
                    }
                    let _ = reply.send(result);
                    drop(guard);
                });
            }
            WorkflowMessage::Update(Update::RequestRestart { reply }) => {
                let _ = reply.send(self.request_restart());
            }
            WorkflowMessage::Query(Query::GetSaleItem { reply }) => {
                let _ = reply.send(self.get_sale_item());
            }
            WorkflowMessage::Query(Query::GetTransitions { reply }) => {
                let _ = reply.send(self.get_transitions());
            }
            WorkflowMessage::Query(Query::Describe { reply }) => {
                let _ = reply.send(self.describe());
            }
        }
    }

    fn begin_handler(self: &Arc<Self>) -> InFlightGuard {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        InFlightGuard {
            workflow: Arc::clone(self),
        }
    }

    /// Decide, record, then apply, all under the state lock.
    fn commit<T>(
        &self,
        decide: impl FnOnce(&WorkflowState) -> Result<(Vec<WorkflowEvent>, T), WorkflowError>,
    ) -> Result<T, WorkflowError> {
        let mut state = self.lock_state()?;
        let (events, value) = decide(&*state)?;

        self.history.record(&events)?;
        for event in &events {
            state.apply(event);
        }
        drop(state);

        self.changed.notify_waiters();
        Ok(value)
    }

    fn lock_state(&self) -> Result<MutexGuard<'_, WorkflowState>, WorkflowError> {
        self.state
            .lock()
            .map_err(|_| WorkflowError::Internal("workflow state lock poisoned".to_string()))
    }
}

/// Counts one running update handler; the run cannot exit while any are alive.
struct InFlightGuard {
    workflow: Arc<SaleItemWorkflow>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.workflow.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.workflow.changed.notify_waiters();
    }
}
