//! Lifecycle states and the transition table that guards them.

use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use saleflow_core::{DomainError, DomainResult};

/// Sale item lifecycle status.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum SaleItemStatus {
    #[default]
    Open,
    Ready,
    BilledPending,
    BilledApproved,
}

impl SaleItemStatus {
    pub const ALL: [SaleItemStatus; 4] = [
        SaleItemStatus::Open,
        SaleItemStatus::Ready,
        SaleItemStatus::BilledPending,
        SaleItemStatus::BilledApproved,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SaleItemStatus::Open => "open",
            SaleItemStatus::Ready => "ready",
            SaleItemStatus::BilledPending => "billed_pending",
            SaleItemStatus::BilledApproved => "billed_approved",
        }
    }
}

impl core::fmt::Display for SaleItemStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SaleItemStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SaleItemStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| DomainError::invalid_status(s))
    }
}

/// Static mapping from a status to the statuses reachable in one step.
///
/// ```text
/// open            -> ready
/// ready           -> open, billed_pending
/// billed_pending  -> billed_approved
/// billed_approved -> billed_pending
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransitionTable(BTreeMap<SaleItemStatus, BTreeSet<SaleItemStatus>>);

impl TransitionTable {
    /// The sale item lifecycle table.
    pub fn standard() -> Self {
        use SaleItemStatus::*;

        let edges = [
            (Open, vec![Ready]),
            (Ready, vec![Open, BilledPending]),
            (BilledPending, vec![BilledApproved]),
            (BilledApproved, vec![BilledPending]),
        ];

        Self(
            edges
                .into_iter()
                .map(|(from, to)| (from, to.into_iter().collect()))
                .collect(),
        )
    }

    /// Statuses reachable from `from` in one step.
    pub fn targets(&self, from: SaleItemStatus) -> impl Iterator<Item = SaleItemStatus> + '_ {
        self.0.get(&from).into_iter().flatten().copied()
    }

    pub fn allows(&self, from: SaleItemStatus, to: SaleItemStatus) -> bool {
        self.0.get(&from).is_some_and(|targets| targets.contains(&to))
    }

    /// State machine guard: succeeds iff `to` is reachable from `from`.
    pub fn check(&self, from: SaleItemStatus, to: SaleItemStatus) -> DomainResult<()> {
        if self.allows(from, to) {
            Ok(())
        } else {
            Err(DomainError::invalid_transition(from.as_str(), to.as_str()))
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (SaleItemStatus, &BTreeSet<SaleItemStatus>)> {
        self.0.iter().map(|(from, to)| (*from, to))
    }
}

impl Default for TransitionTable {
    fn default() -> Self {
        Self::standard()
    }
}
