//! Sale item domain module (event-sourced).
//!
//! Business rules for a sellable inventory unit: its lifecycle states, the
//! legal transitions between them, quantity splitting, and the request
//! shapes accepted by its orchestrator. Pure deterministic logic only.

pub mod item;
pub mod requests;
pub mod transition;

pub use item::{
    ChangeStatus, InitializeSaleItem, QuantitySplit, SaleItem, SaleItemAggregate,
    SaleItemCommand, SaleItemEvent, SaleItemInitialized, SplitQuantity, StatusChanged,
};
pub use requests::{MarkFulfilledRequest, SaleItemWorkflowInput, SplitRequest, StatusUpdateRequest};
pub use transition::{SaleItemStatus, TransitionTable};
