//! Side-effecting actions performed around status transitions.
//!
//! The orchestrator never talks to remote systems directly; it hands the
//! current snapshot to an [`ActivityDispatcher`] through an
//! [`ActivityExecutor`], which bounds every call with a timeout and applies
//! the configured retry policy.

mod executor;
mod retry;

pub use executor::ActivityExecutor;
pub use retry::RetryPolicy;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use saleflow_sales::{SaleItem, SaleItemStatus};

/// Every action the dispatcher knows how to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    MoveFromOpenToReady,
    MoveFromReadyToOpen,
    MoveFromReadyToBilledPending,
    MoveFromBilledPendingToBilledApproved,
    PostUpdate,
}

impl ActivityKind {
    pub const ALL: [ActivityKind; 5] = [
        ActivityKind::MoveFromOpenToReady,
        ActivityKind::MoveFromReadyToOpen,
        ActivityKind::MoveFromReadyToBilledPending,
        ActivityKind::MoveFromBilledPendingToBilledApproved,
        ActivityKind::PostUpdate,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::MoveFromOpenToReady => "move_from_open_to_ready",
            Self::MoveFromReadyToOpen => "move_from_ready_to_open",
            Self::MoveFromReadyToBilledPending => "move_from_ready_to_billed_pending",
            Self::MoveFromBilledPendingToBilledApproved => {
                "move_from_billed_pending_to_billed_approved"
            }
            Self::PostUpdate => "post_update",
        }
    }

    /// Action that performs the work of entering `target`.
    ///
    /// Selected by target alone; the guard has already vetted the source.
    pub fn for_target(target: SaleItemStatus) -> ActivityKind {
        match target {
            SaleItemStatus::Open => Self::MoveFromReadyToOpen,
            SaleItemStatus::Ready => Self::MoveFromOpenToReady,
            SaleItemStatus::BilledPending => Self::MoveFromReadyToBilledPending,
            SaleItemStatus::BilledApproved => Self::MoveFromBilledPendingToBilledApproved,
        }
    }
}

impl std::fmt::Display for ActivityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ActivityError {
    /// Transient failure; eligible for another attempt.
    #[error("retryable activity failure: {0}")]
    Retryable(String),

    #[error("fatal activity failure: {0}")]
    Fatal(String),
}

impl ActivityError {
    pub fn retryable(msg: impl Into<String>) -> Self {
        Self::Retryable(msg.into())
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal(msg.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }
}

/// Remote side of a transition.
///
/// Receives the entity snapshot taken before the status changes.
#[async_trait]
pub trait ActivityDispatcher: Send + Sync {
    async fn execute(&self, kind: ActivityKind, sale_item: &SaleItem) -> Result<(), ActivityError>;
}

/// Dispatcher that stands in for real integrations by sleeping.
#[derive(Debug, Clone)]
pub struct SimulatedActivities {
    delay: Duration,
}

impl SimulatedActivities {
    pub const DEFAULT_DELAY: Duration = Duration::from_secs(2);

    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl Default for SimulatedActivities {
    fn default() -> Self {
        Self::new(Self::DEFAULT_DELAY)
    }
}

#[async_trait]
impl ActivityDispatcher for SimulatedActivities {
    async fn execute(&self, kind: ActivityKind, sale_item: &SaleItem) -> Result<(), ActivityError> {
        tracing::info!(
            activity = kind.name(),
            sale_item_id = %sale_item.sale_item_id,
            status = %sale_item.current_status,
            "running activity"
        );
        tokio::time::sleep(self.delay).await;
        Ok(())
    }
}
