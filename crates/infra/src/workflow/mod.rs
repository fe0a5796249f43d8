//! Entity orchestrator for sale items.

mod error;
pub mod history;
pub mod messages;
mod sale_item;

pub use error::WorkflowError;
pub use history::{HistoryRecorder, ReplayedRun, RunClosure, WorkflowEvent, WorkflowState, replay};
pub use messages::{WorkflowDescription, WorkflowMessage, WorkflowOutcome};
pub use sale_item::{RunExit, SaleItemWorkflow};
