//! Infrastructure layer: orchestration runtime, history store, activities and config.

pub mod activities;
pub mod config;
pub mod event_store;
pub mod runtime;
pub mod workflow;

pub use activities::{
    ActivityDispatcher, ActivityError, ActivityExecutor, ActivityKind, RetryPolicy,
    SimulatedActivities,
};
pub use config::{PostUpdateHook, WorkflowConfig};
pub use runtime::{HistoryBus, WorkflowHandle, WorkflowRuntime};
pub use workflow::{WorkflowDescription, WorkflowError, WorkflowEvent, WorkflowOutcome};
