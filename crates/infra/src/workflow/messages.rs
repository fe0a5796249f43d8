//! Mailbox protocol between handles and a running orchestration.

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use saleflow_core::{RunId, SaleItemId, WorkflowId};
use saleflow_sales::{
    MarkFulfilledRequest, SaleItem, SplitRequest, StatusUpdateRequest, TransitionTable,
};

use super::WorkflowError;

pub type Reply<T> = oneshot::Sender<Result<T, WorkflowError>>;

/// One inbound message. Signals are fire-and-forget; updates and queries carry a reply slot.
#[derive(Debug)]
pub enum WorkflowMessage {
    Signal(Signal),
    Update(Update),
    Query(Query),
}

#[derive(Debug)]
pub enum Signal {
    MarkFulfilled(MarkFulfilledRequest),
}

#[derive(Debug)]
pub enum Update {
    UpdateStatus {
        request: StatusUpdateRequest,
        reply: Reply<SaleItem>,
    },
    Split {
        request: SplitRequest,
        reply: Reply<WorkflowOutcome>,
    },
    RequestRestart {
        reply: Reply<()>,
    },
}

#[derive(Debug)]
pub enum Query {
    GetSaleItem { reply: Reply<SaleItem> },
    GetTransitions { reply: Reply<TransitionTable> },
    Describe { reply: Reply<WorkflowDescription> },
}

/// Terminal value of a completed orchestration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowOutcome {
    pub workflow_id: WorkflowId,
    pub sale_item_id: SaleItemId,
    pub approver_name: Option<String>,
}

/// Point-in-time view of a run's orchestration flags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowDescription {
    pub workflow_id: WorkflowId,
    pub run_id: RunId,
    pub in_flight: usize,
    pub fulfilled: bool,
    pub restart_requested: bool,
    pub split_sequence: u32,
}
