//! Strongly-typed identifiers used across the domain.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DomainError;

/// Opaque, caller-assigned identifier of a sale item.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SaleItemId(String);

/// Identifier of one orchestration (stable across continue-as-new).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkflowId(String);

/// Identifier of a single run of an orchestration.
///
/// Every continue-as-new starts a new run with a fresh history stream.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(Uuid);

macro_rules! impl_string_newtype {
    ($t:ty, $name:literal) => {
        impl $t {
            /// Build an identifier, rejecting blank values.
            pub fn new(value: impl Into<String>) -> Result<Self, DomainError> {
                let value = value.into();
                if value.trim().is_empty() {
                    return Err(DomainError::validation(concat!($name, " cannot be empty")));
                }
                Ok(Self(value))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $t {
            type Err = DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::new(s)
            }
        }

        impl AsRef<str> for $t {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

impl_string_newtype!(SaleItemId, "SaleItemId");
impl_string_newtype!(WorkflowId, "WorkflowId");

impl SaleItemId {
    /// Identifier of the `sequence`-th unit split off this one.
    pub fn child(&self, sequence: u32) -> SaleItemId {
        SaleItemId(format!("{}-{}", self.0, sequence))
    }
}

impl WorkflowId {
    /// Workflow id of the orchestration that owns `sale_item_id`.
    pub fn for_sale_item(prefix: &str, sale_item_id: &SaleItemId) -> WorkflowId {
        WorkflowId(format!("{prefix}{sale_item_id}"))
    }
}

impl RunId {
    /// Create a new run identifier (UUIDv7, time-ordered).
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Display for RunId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_ids_are_rejected() {
        assert!(SaleItemId::new("  ").is_err());
        assert!(WorkflowId::new("").is_err());
    }

    #[test]
    fn child_ids_are_derived_from_parent() {
        let parent = SaleItemId::new("1234567").unwrap();
        assert_eq!(parent.child(1).as_str(), "1234567-1");
        assert_eq!(parent.child(1).child(2).as_str(), "1234567-1-2");
    }

    #[test]
    fn workflow_id_uses_prefix() {
        let item = SaleItemId::new("1234567").unwrap();
        let id = WorkflowId::for_sale_item("sale-item-poc-workflow-", &item);
        assert_eq!(id.as_str(), "sale-item-poc-workflow-1234567");
    }
}
