//! Request shapes accepted by a sale item orchestrator.
//!
//! Each is transient: it lives for the handling of one call and is never
//! persisted on its own.

use serde::{Deserialize, Serialize};

use saleflow_core::{DomainResult, SaleItemId};

use crate::item::SaleItem;
use crate::transition::SaleItemStatus;

/// Update: move the sale item to `status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusUpdateRequest {
    pub status: String,
}

impl StatusUpdateRequest {
    pub fn new(status: impl Into<String>) -> Self {
        Self {
            status: status.into(),
        }
    }
}

/// Update: split `quantity` units off into a new sale item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitRequest {
    pub quantity: u64,
}

/// Signal: the sale item has been fulfilled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkFulfilledRequest {
    #[serde(alias = "name")]
    pub approver_name: String,
}

impl MarkFulfilledRequest {
    pub fn new(approver_name: impl Into<String>) -> Self {
        Self {
            approver_name: approver_name.into(),
        }
    }
}

/// Start input for one orchestration run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaleItemWorkflowInput {
    pub sale_item_id: SaleItemId,
    pub quantity: u64,
    /// Initial status name; `open` when absent.
    #[serde(default)]
    pub status: Option<String>,
    /// Number of splits already performed by earlier runs.
    #[serde(default)]
    pub split_sequence: u32,
}

impl SaleItemWorkflowInput {
    pub fn new(sale_item_id: SaleItemId, quantity: u64) -> Self {
        Self {
            sale_item_id,
            quantity,
            status: None,
            split_sequence: 0,
        }
    }

    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    /// Input for the next run, seeded from the current snapshot.
    pub fn carry_forward(snapshot: &SaleItem, split_sequence: u32) -> Self {
        Self {
            sale_item_id: snapshot.sale_item_id.clone(),
            quantity: snapshot.quantity,
            status: Some(snapshot.current_status.as_str().to_string()),
            split_sequence,
        }
    }

    /// Parsed initial status (defaults to `open`).
    pub fn initial_status(&self) -> DomainResult<SaleItemStatus> {
        match self.status.as_deref() {
            None => Ok(SaleItemStatus::default()),
            Some(status) => status.parse(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use saleflow_core::DomainError;

    #[test]
    fn initial_status_defaults_to_open() {
        let input = SaleItemWorkflowInput::new(SaleItemId::new("1").unwrap(), 10);
        assert_eq!(input.initial_status().unwrap(), SaleItemStatus::Open);
    }

    #[test]
    fn unknown_initial_status_is_rejected() {
        let input =
            SaleItemWorkflowInput::new(SaleItemId::new("1").unwrap(), 10).with_status("archived");
        assert_eq!(
            input.initial_status().unwrap_err(),
            DomainError::InvalidStatus("archived".to_string())
        );
    }

    #[test]
    fn carry_forward_preserves_snapshot() {
        let snapshot = SaleItem {
            sale_item_id: SaleItemId::new("1").unwrap(),
            current_status: SaleItemStatus::BilledPending,
            quantity: 7,
        };
        let input = SaleItemWorkflowInput::carry_forward(&snapshot, 3);
        assert_eq!(input.quantity, 7);
        assert_eq!(input.initial_status().unwrap(), SaleItemStatus::BilledPending);
        assert_eq!(input.split_sequence, 3);
    }

    #[test]
    fn mark_fulfilled_accepts_legacy_field_name() {
        let req: MarkFulfilledRequest = serde_json::from_str(r#"{"name":"ana"}"#).unwrap();
        assert_eq!(req.approver_name, "ana");
    }
}
