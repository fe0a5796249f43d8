use std::time::Duration;

use thiserror::Error;

use saleflow_core::{DomainError, WorkflowId};

use crate::event_store::EventStoreError;

/// Caller-visible failure of a start, update, query or result wait.
///
/// A handler failure never takes the orchestration down; only the one call fails.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WorkflowError {
    #[error("sale item not initialized")]
    NotInitialized,

    #[error("invalid status transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("invalid status: {0}")]
    InvalidStatus(String),

    #[error("insufficient quantity: requested {requested}, available {available}")]
    InsufficientQuantity { requested: u64, available: u64 },

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("activity {activity} timed out after {timeout:?}")]
    ActionTimeout { activity: String, timeout: Duration },

    #[error("activity {activity} failed: {reason}")]
    ActionFailed { activity: String, reason: String },

    #[error("workflow not found: {0}")]
    WorkflowNotFound(WorkflowId),

    #[error("workflow already started: {0}")]
    WorkflowAlreadyStarted(WorkflowId),

    #[error("workflow closed: {0}")]
    WorkflowClosed(WorkflowId),

    #[error("history error: {0}")]
    History(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<DomainError> for WorkflowError {
    fn from(value: DomainError) -> Self {
        match value {
            DomainError::NotInitialized => Self::NotInitialized,
            DomainError::InvalidTransition { from, to } => Self::InvalidTransition { from, to },
            DomainError::InvalidStatus(s) => Self::InvalidStatus(s),
            DomainError::InsufficientQuantity {
                requested,
                available,
            } => Self::InsufficientQuantity {
                requested,
                available,
            },
            DomainError::Validation(msg) => Self::Validation(msg),
            DomainError::Conflict(msg) => Self::Conflict(msg),
        }
    }
}

impl From<EventStoreError> for WorkflowError {
    fn from(value: EventStoreError) -> Self {
        Self::History(value.to_string())
    }
}
