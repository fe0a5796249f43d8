//! `saleflow-core` — domain foundation building blocks.
//!
//! Pure domain primitives shared by the sale item lifecycle and the
//! orchestration layer (no IO, no async).

pub mod aggregate;
pub mod error;
pub mod id;

pub use aggregate::{Aggregate, AggregateRoot, ExpectedVersion};
pub use error::{DomainError, DomainResult};
pub use id::{RunId, SaleItemId, WorkflowId};
