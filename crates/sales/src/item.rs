use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use saleflow_core::{Aggregate, AggregateRoot, DomainError, SaleItemId};
use saleflow_events::Event;

use crate::transition::{SaleItemStatus, TransitionTable};

/// Point-in-time snapshot of a sale item.
///
/// This is what queries return and what continue-as-new carries forward.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaleItem {
    pub sale_item_id: SaleItemId,
    pub current_status: SaleItemStatus,
    pub quantity: u64,
}

/// Aggregate root: a sale item inside one orchestration run.
///
/// Starts empty (not initialized) and is brought to life by exactly one
/// `SaleItemInitialized` event.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SaleItemAggregate {
    item: Option<SaleItem>,
    transitions: TransitionTable,
    version: u64,
}

impl SaleItemAggregate {
    /// Create an empty, not-yet-initialized instance for rehydration.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_initialized(&self) -> bool {
        self.item.is_some()
    }

    /// Immutable copy of the current state.
    pub fn snapshot(&self) -> Result<SaleItem, DomainError> {
        self.item.clone().ok_or(DomainError::NotInitialized)
    }

    pub fn status(&self) -> Option<SaleItemStatus> {
        self.item.as_ref().map(|item| item.current_status)
    }

    pub fn quantity(&self) -> Option<u64> {
        self.item.as_ref().map(|item| item.quantity)
    }

    pub fn transitions(&self) -> &TransitionTable {
        &self.transitions
    }

    fn require_item(&self) -> Result<&SaleItem, DomainError> {
        self.item.as_ref().ok_or(DomainError::NotInitialized)
    }
}

impl AggregateRoot for SaleItemAggregate {
    type Id = SaleItemId;

    fn id(&self) -> Option<&Self::Id> {
        self.item.as_ref().map(|item| &item.sale_item_id)
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: InitializeSaleItem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitializeSaleItem {
    pub sale_item_id: SaleItemId,
    pub quantity: u64,
    pub status: SaleItemStatus,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ChangeStatus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeStatus {
    pub to: SaleItemStatus,
    pub occurred_at: DateTime<Utc>,
}

/// Command: SplitQuantity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitQuantity {
    pub quantity: u64,
    pub child_id: SaleItemId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SaleItemCommand {
    Initialize(InitializeSaleItem),
    ChangeStatus(ChangeStatus),
    Split(SplitQuantity),
}

/// Event: SaleItemInitialized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaleItemInitialized {
    pub sale_item_id: SaleItemId,
    pub quantity: u64,
    pub status: SaleItemStatus,
    pub occurred_at: DateTime<Utc>,
}

/// Event: StatusChanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChanged {
    pub sale_item_id: SaleItemId,
    pub from: SaleItemStatus,
    pub to: SaleItemStatus,
    pub occurred_at: DateTime<Utc>,
}

/// Event: QuantitySplit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuantitySplit {
    pub sale_item_id: SaleItemId,
    pub child_id: SaleItemId,
    pub quantity: u64,
    pub remaining: u64,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SaleItemEvent {
    Initialized(SaleItemInitialized),
    StatusChanged(StatusChanged),
    QuantitySplit(QuantitySplit),
}

impl Event for SaleItemEvent {
    fn event_type(&self) -> &'static str {
        match self {
            SaleItemEvent::Initialized(_) => "sale_item.initialized",
            SaleItemEvent::StatusChanged(_) => "sale_item.status_changed",
            SaleItemEvent::QuantitySplit(_) => "sale_item.quantity_split",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            SaleItemEvent::Initialized(e) => e.occurred_at,
            SaleItemEvent::StatusChanged(e) => e.occurred_at,
            SaleItemEvent::QuantitySplit(e) => e.occurred_at,
        }
    }
}

impl Aggregate for SaleItemAggregate {
    type Command = SaleItemCommand;
    type Event = SaleItemEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            SaleItemEvent::Initialized(e) => {
                self.item = Some(SaleItem {
                    sale_item_id: e.sale_item_id.clone(),
                    current_status: e.status,
                    quantity: e.quantity,
                });
            }
            SaleItemEvent::StatusChanged(e) => {
                if let Some(item) = self.item.as_mut() {
                    item.current_status = e.to;
                }
            }
            SaleItemEvent::QuantitySplit(e) => {
                if let Some(item) = self.item.as_mut() {
                    item.quantity = e.remaining;
                }
            }
        }

        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            SaleItemCommand::Initialize(cmd) => self.handle_initialize(cmd),
            SaleItemCommand::ChangeStatus(cmd) => self.handle_change_status(cmd),
            SaleItemCommand::Split(cmd) => self.handle_split(cmd),
        }
    }
}

impl SaleItemAggregate {
    fn handle_initialize(
        &self,
        cmd: &InitializeSaleItem,
    ) -> Result<Vec<SaleItemEvent>, DomainError> {
        if self.is_initialized() {
            return Err(DomainError::conflict("sale item already initialized"));
        }

        Ok(vec![SaleItemEvent::Initialized(SaleItemInitialized {
            sale_item_id: cmd.sale_item_id.clone(),
            quantity: cmd.quantity,
            status: cmd.status,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_change_status(&self, cmd: &ChangeStatus) -> Result<Vec<SaleItemEvent>, DomainError> {
        let item = self.require_item()?;
        self.transitions.check(item.current_status, cmd.to)?;

        Ok(vec![SaleItemEvent::StatusChanged(StatusChanged {
            sale_item_id: item.sale_item_id.clone(),
            from: item.current_status,
            to: cmd.to,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_split(&self, cmd: &SplitQuantity) -> Result<Vec<SaleItemEvent>, DomainError> {
        let item = self.require_item()?;

        // Checked before decrementing so quantity can never go negative.
        if cmd.quantity > item.quantity {
            return Err(DomainError::InsufficientQuantity {
                requested: cmd.quantity,
                available: item.quantity,
            });
        }

        Ok(vec![SaleItemEvent::QuantitySplit(QuantitySplit {
            sale_item_id: item.sale_item_id.clone(),
            child_id: cmd.child_id.clone(),
            quantity: cmd.quantity,
            remaining: item.quantity - cmd.quantity,
            occurred_at: cmd.occurred_at,
        })])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use saleflow_events::execute;

    fn test_id() -> SaleItemId {
        SaleItemId::new("1234567").unwrap()
    }

    fn test_time() -> DateTime<Utc> {
        Utc::now()
    }

    fn initialized(quantity: u64, status: SaleItemStatus) -> SaleItemAggregate {
        let mut aggregate = SaleItemAggregate::empty();
        let cmd = SaleItemCommand::Initialize(InitializeSaleItem {
            sale_item_id: test_id(),
            quantity,
            status,
            occurred_at: test_time(),
        });
        execute(&mut aggregate, &cmd).unwrap();
        aggregate
    }

    fn change(aggregate: &mut SaleItemAggregate, to: SaleItemStatus) -> Result<(), DomainError> {
        let cmd = SaleItemCommand::ChangeStatus(ChangeStatus {
            to,
            occurred_at: test_time(),
        });
        execute(aggregate, &cmd).map(|_| ())
    }

    #[test]
    fn empty_aggregate_is_not_initialized() {
        let aggregate = SaleItemAggregate::empty();
        assert_eq!(aggregate.snapshot().unwrap_err(), DomainError::NotInitialized);

        let err = aggregate
            .handle(&SaleItemCommand::ChangeStatus(ChangeStatus {
                to: SaleItemStatus::Ready,
                occurred_at: test_time(),
            }))
            .unwrap_err();
        assert_eq!(err, DomainError::NotInitialized);
    }

    #[test]
    fn initialize_sets_snapshot() {
        let aggregate = initialized(10, SaleItemStatus::Open);
        let snapshot = aggregate.snapshot().unwrap();
        assert_eq!(snapshot.sale_item_id, test_id());
        assert_eq!(snapshot.quantity, 10);
        assert_eq!(snapshot.current_status, SaleItemStatus::Open);
        assert_eq!(aggregate.version(), 1);
    }

    #[test]
    fn cannot_initialize_twice() {
        let aggregate = initialized(10, SaleItemStatus::Open);
        let err = aggregate
            .handle(&SaleItemCommand::Initialize(InitializeSaleItem {
                sale_item_id: test_id(),
                quantity: 1,
                status: SaleItemStatus::Open,
                occurred_at: test_time(),
            }))
            .unwrap_err();
        assert!(matches!(err, DomainError::Conflict(_)));
    }

    #[test]
    fn full_lifecycle_open_to_billed_approved() {
        let mut aggregate = initialized(10, SaleItemStatus::Open);

        change(&mut aggregate, SaleItemStatus::Ready).unwrap();
        change(&mut aggregate, SaleItemStatus::BilledPending).unwrap();
        change(&mut aggregate, SaleItemStatus::BilledApproved).unwrap();
        assert_eq!(aggregate.status(), Some(SaleItemStatus::BilledApproved));

        let err = change(&mut aggregate, SaleItemStatus::Open).unwrap_err();
        assert_eq!(err, DomainError::invalid_transition("billed_approved", "open"));
        assert_eq!(aggregate.status(), Some(SaleItemStatus::BilledApproved));
    }

    #[test]
    fn split_decrements_quantity() {
        let mut aggregate = initialized(10, SaleItemStatus::Open);
        let events = execute(
            &mut aggregate,
            &SaleItemCommand::Split(SplitQuantity {
                quantity: 6,
                child_id: test_id().child(1),
                occurred_at: test_time(),
            }),
        )
        .unwrap();

        match &events[0] {
            SaleItemEvent::QuantitySplit(e) => {
                assert_eq!(e.quantity, 6);
                assert_eq!(e.remaining, 4);
                assert_eq!(e.child_id.as_str(), "1234567-1");
            }
            _ => panic!("Expected QuantitySplit event"),
        }
        assert_eq!(aggregate.quantity(), Some(4));
    }

    #[test]
    fn split_more_than_available_is_rejected() {
        let mut aggregate = initialized(4, SaleItemStatus::Open);
        let err = execute(
            &mut aggregate,
            &SaleItemCommand::Split(SplitQuantity {
                quantity: 6,
                child_id: test_id().child(1),
                occurred_at: test_time(),
            }),
        )
        .unwrap_err();

        assert_eq!(
            err,
            DomainError::InsufficientQuantity {
                requested: 6,
                available: 4
            }
        );
        assert_eq!(aggregate.quantity(), Some(4));
    }

    #[test]
    fn apply_is_deterministic() {
        let initialized_event = SaleItemEvent::Initialized(SaleItemInitialized {
            sale_item_id: test_id(),
            quantity: 10,
            status: SaleItemStatus::Open,
            occurred_at: test_time(),
        });
        let changed = SaleItemEvent::StatusChanged(StatusChanged {
            sale_item_id: test_id(),
            from: SaleItemStatus::Open,
            to: SaleItemStatus::Ready,
            occurred_at: test_time(),
        });

        let mut a = SaleItemAggregate::empty();
        let mut b = SaleItemAggregate::empty();
        for ev in [&initialized_event, &changed] {
            a.apply(ev);
            b.apply(ev);
        }

        assert_eq!(a, b);
        assert_eq!(a.version(), 2);
        assert_eq!(a.status(), Some(SaleItemStatus::Ready));
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// Property: quantity never goes negative and is conserved across a split.
            #[test]
            fn split_conserves_quantity(total in 0u64..10_000, requested in 0u64..10_000) {
                let mut aggregate = initialized(total, SaleItemStatus::Open);
                let result = execute(
                    &mut aggregate,
                    &SaleItemCommand::Split(SplitQuantity {
                        quantity: requested,
                        child_id: test_id().child(1),
                        occurred_at: test_time(),
                    }),
                );

                if requested <= total {
                    prop_assert!(result.is_ok());
                    prop_assert_eq!(aggregate.quantity(), Some(total - requested));
                } else {
                    prop_assert!(result.is_err());
                    prop_assert_eq!(aggregate.quantity(), Some(total));
                }
            }

            /// Property: handle never mutates state.
            #[test]
            fn handle_does_not_mutate(idx in 0usize..4) {
                let aggregate = initialized(3, SaleItemStatus::Ready);
                let before = aggregate.clone();
                let _ = aggregate.handle(&SaleItemCommand::ChangeStatus(ChangeStatus {
                    to: SaleItemStatus::ALL[idx],
                    occurred_at: test_time(),
                }));
                prop_assert_eq!(aggregate, before);
            }
        }
    }
}
