use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use fulfillment_core::{
    Aggregate, AggregateRoot, DomainError, InventoryUnitId, OrderId, ReturnAuthorizationId,
    ShipmentId, VariantId,
};
use fulfillment_events::Event;

use crate::transitions::{self, InventoryUnitState, SideEffect, TransitionContext, UnitEvent};

/// Aggregate type tag used on published envelopes.
pub const AGGREGATE_TYPE: &str = "inventory.unit";

/// Aggregate root: InventoryUnit, one physical unit of a variant on an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryUnit {
    id: InventoryUnitId,
    variant_id: VariantId,
    order_id: OrderId,
    shipment_id: Option<ShipmentId>,
    return_authorization_id: Option<ReturnAuthorizationId>,
    pending: bool,
    state: InventoryUnitState,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    version: u64,
    created: bool,
}

/// Persisted form of an [`InventoryUnit`], used by stores to rebuild one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryUnitSnapshot {
    pub id: InventoryUnitId,
    pub variant_id: VariantId,
    pub order_id: OrderId,
    pub shipment_id: Option<ShipmentId>,
    pub return_authorization_id: Option<ReturnAuthorizationId>,
    pub pending: bool,
    pub state: InventoryUnitState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: u64,
}

impl InventoryUnit {
    /// Create an empty, not-yet-created aggregate instance.
    pub fn empty(id: InventoryUnitId) -> Self {
        Self {
            id,
            variant_id: VariantId::from_uuid(uuid::Uuid::nil()),
            order_id: OrderId::from_uuid(uuid::Uuid::nil()),
            shipment_id: None,
            return_authorization_id: None,
            pending: true,
            state: InventoryUnitState::OnHand,
            created_at: DateTime::<Utc>::UNIX_EPOCH,
            updated_at: DateTime::<Utc>::UNIX_EPOCH,
            version: 0,
            created: false,
        }
    }

    /// Rebuild a unit from its persisted form.
    pub fn restore(snapshot: InventoryUnitSnapshot) -> Self {
        Self {
            id: snapshot.id,
            variant_id: snapshot.variant_id,
            order_id: snapshot.order_id,
            shipment_id: snapshot.shipment_id,
            return_authorization_id: snapshot.return_authorization_id,
            pending: snapshot.pending,
            state: snapshot.state,
            created_at: snapshot.created_at,
            updated_at: snapshot.updated_at,
            version: snapshot.version,
            created: true,
        }
    }

    pub fn snapshot(&self) -> InventoryUnitSnapshot {
        InventoryUnitSnapshot {
            id: self.id,
            variant_id: self.variant_id,
            order_id: self.order_id,
            shipment_id: self.shipment_id,
            return_authorization_id: self.return_authorization_id,
            pending: self.pending,
            state: self.state,
            created_at: self.created_at,
            updated_at: self.updated_at,
            version: self.version,
        }
    }

    pub fn id_typed(&self) -> InventoryUnitId {
        self.id
    }

    pub fn variant_id(&self) -> VariantId {
        self.variant_id
    }

    pub fn order_id(&self) -> OrderId {
        self.order_id
    }

    pub fn shipment_id(&self) -> Option<ShipmentId> {
        self.shipment_id
    }

    pub fn return_authorization_id(&self) -> Option<ReturnAuthorizationId> {
        self.return_authorization_id
    }

    pub fn is_pending(&self) -> bool {
        self.pending
    }

    pub fn state(&self) -> InventoryUnitState {
        self.state
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn is_created(&self) -> bool {
        self.created
    }

    pub fn is_backordered(&self) -> bool {
        self.state == InventoryUnitState::Backordered
    }

    /// Clear the `pending` flag and stamp `updated_at`.
    ///
    /// A direct field write used by the batch finalize path; it does not go
    /// through the transition table and leaves `state` alone. The version still
    /// moves so a concurrent transition working from an older read cannot
    /// overwrite it.
    pub fn finalize(&mut self, at: DateTime<Utc>) {
        self.pending = false;
        self.updated_at = at;
        self.version += 1;
    }
}

impl AggregateRoot for InventoryUnit {
    type Id = InventoryUnitId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: CreateUnit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateUnit {
    pub unit_id: InventoryUnitId,
    pub variant_id: VariantId,
    pub order_id: OrderId,
    pub shipment_id: Option<ShipmentId>,
    /// `on_hand` or `backordered`, decided by stock allocation.
    pub initial_state: InventoryUnitState,
    pub occurred_at: DateTime<Utc>,
}

/// Command: FillBackorder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FillBackorder {
    pub unit_id: InventoryUnitId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ShipUnit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShipUnit {
    pub unit_id: InventoryUnitId,
    pub context: TransitionContext,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ReturnUnit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReturnUnit {
    pub unit_id: InventoryUnitId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InventoryUnitCommand {
    CreateUnit(CreateUnit),
    FillBackorder(FillBackorder),
    Ship(ShipUnit),
    Return(ReturnUnit),
}

impl InventoryUnitCommand {
    pub fn unit_id(&self) -> InventoryUnitId {
        match self {
            InventoryUnitCommand::CreateUnit(c) => c.unit_id,
            InventoryUnitCommand::FillBackorder(c) => c.unit_id,
            InventoryUnitCommand::Ship(c) => c.unit_id,
            InventoryUnitCommand::Return(c) => c.unit_id,
        }
    }
}

/// Event: UnitCreated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitCreated {
    pub unit_id: InventoryUnitId,
    pub variant_id: VariantId,
    pub order_id: OrderId,
    pub shipment_id: Option<ShipmentId>,
    pub state: InventoryUnitState,
    pub occurred_at: DateTime<Utc>,
}

/// Payload shared by every lifecycle transition event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitTransitioned {
    pub unit_id: InventoryUnitId,
    pub order_id: OrderId,
    pub event: UnitEvent,
    pub from: InventoryUnitState,
    pub to: InventoryUnitState,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InventoryUnitEvent {
    UnitCreated(UnitCreated),
    BackorderFilled(UnitTransitioned),
    UnitShipped(UnitTransitioned),
    UnitReturned(UnitTransitioned),
}

impl InventoryUnitEvent {
    /// Side effect the transition table attaches to this event, if any.
    pub fn side_effect(&self) -> Option<SideEffect> {
        match self {
            InventoryUnitEvent::UnitCreated(_) => None,
            InventoryUnitEvent::BackorderFilled(t)
            | InventoryUnitEvent::UnitShipped(t)
            | InventoryUnitEvent::UnitReturned(t) => {
                transitions::lookup(t.from, t.event).and_then(|row| row.side_effect)
            }
        }
    }
}

impl Event for InventoryUnitEvent {
    fn event_type(&self) -> &'static str {
        match self {
            InventoryUnitEvent::UnitCreated(_) => "inventory.unit.created",
            InventoryUnitEvent::BackorderFilled(_) => "inventory.unit.backorder_filled",
            InventoryUnitEvent::UnitShipped(_) => "inventory.unit.shipped",
            InventoryUnitEvent::UnitReturned(_) => "inventory.unit.returned",
        }
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            InventoryUnitEvent::UnitCreated(e) => e.occurred_at,
            InventoryUnitEvent::BackorderFilled(e)
            | InventoryUnitEvent::UnitShipped(e)
            | InventoryUnitEvent::UnitReturned(e) => e.occurred_at,
        }
    }
}

impl Aggregate for InventoryUnit {
    type Command = InventoryUnitCommand;
    type Event = InventoryUnitEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            InventoryUnitEvent::UnitCreated(e) => {
                self.id = e.unit_id;
                self.variant_id = e.variant_id;
                self.order_id = e.order_id;
                self.shipment_id = e.shipment_id;
                self.return_authorization_id = None;
                self.pending = true;
                self.state = e.state;
                self.created_at = e.occurred_at;
                self.updated_at = e.occurred_at;
                self.created = true;
            }
            InventoryUnitEvent::BackorderFilled(e)
            | InventoryUnitEvent::UnitShipped(e)
            | InventoryUnitEvent::UnitReturned(e) => {
                self.state = e.to;
                self.updated_at = e.occurred_at;
            }
        }

        // Deterministic version tracking: +1 per applied event.
        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            InventoryUnitCommand::CreateUnit(cmd) => self.handle_create(cmd),
            InventoryUnitCommand::FillBackorder(cmd) => self.handle_transition(
                cmd.unit_id,
                UnitEvent::FillBackorder,
                &TransitionContext::default(),
                cmd.occurred_at,
            ),
            InventoryUnitCommand::Ship(cmd) => {
                self.handle_transition(cmd.unit_id, UnitEvent::Ship, &cmd.context, cmd.occurred_at)
            }
            InventoryUnitCommand::Return(cmd) => self.handle_transition(
                cmd.unit_id,
                UnitEvent::Return,
                &TransitionContext::default(),
                cmd.occurred_at,
            ),
        }
    }
}

impl InventoryUnit {
    fn ensure_unit_id(&self, unit_id: InventoryUnitId) -> Result<(), DomainError> {
        if self.id != unit_id {
            return Err(DomainError::invariant("unit_id mismatch"));
        }
        Ok(())
    }

    fn handle_create(&self, cmd: &CreateUnit) -> Result<Vec<InventoryUnitEvent>, DomainError> {
        if self.created {
            return Err(DomainError::conflict("inventory unit already exists"));
        }
        self.ensure_unit_id(cmd.unit_id)?;

        if !matches!(
            cmd.initial_state,
            InventoryUnitState::OnHand | InventoryUnitState::Backordered
        ) {
            return Err(DomainError::validation(format!(
                "inventory units start on_hand or backordered, not {}",
                cmd.initial_state
            )));
        }

        Ok(vec![InventoryUnitEvent::UnitCreated(UnitCreated {
            unit_id: cmd.unit_id,
            variant_id: cmd.variant_id,
            order_id: cmd.order_id,
            shipment_id: cmd.shipment_id,
            state: cmd.initial_state,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_transition(
        &self,
        unit_id: InventoryUnitId,
        event: UnitEvent,
        ctx: &TransitionContext,
        occurred_at: DateTime<Utc>,
    ) -> Result<Vec<InventoryUnitEvent>, DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        self.ensure_unit_id(unit_id)?;

        let row = transitions::fire(self.state, event, ctx)?;
        let payload = UnitTransitioned {
            unit_id,
            order_id: self.order_id,
            event,
            from: row.from,
            to: row.to,
            occurred_at,
        };

        let ev = match event {
            UnitEvent::FillBackorder => InventoryUnitEvent::BackorderFilled(payload),
            UnitEvent::Ship => InventoryUnitEvent::UnitShipped(payload),
            UnitEvent::Return => InventoryUnitEvent::UnitReturned(payload),
        };
        Ok(vec![ev])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_time() -> DateTime<Utc> {
        Utc::now()
    }

    fn unit_in(state: InventoryUnitState) -> InventoryUnit {
        let unit_id = InventoryUnitId::new();
        let mut unit = InventoryUnit::empty(unit_id);
        let cmd = CreateUnit {
            unit_id,
            variant_id: VariantId::new(),
            order_id: OrderId::new(),
            shipment_id: Some(ShipmentId::new()),
            initial_state: InventoryUnitState::OnHand,
            occurred_at: test_time(),
        };
        fulfillment_events::execute(&mut unit, &InventoryUnitCommand::CreateUnit(cmd)).unwrap();

        let mut snapshot = unit.snapshot();
        snapshot.state = state;
        InventoryUnit::restore(snapshot)
    }

    fn ship(unit: &InventoryUnit, allow_backorder_shipping: bool) -> InventoryUnitCommand {
        InventoryUnitCommand::Ship(ShipUnit {
            unit_id: unit.id_typed(),
            context: TransitionContext {
                allow_backorder_shipping,
            },
            occurred_at: test_time(),
        })
    }

    #[test]
    fn create_unit_starts_pending_in_requested_state() {
        let unit_id = InventoryUnitId::new();
        let mut unit = InventoryUnit::empty(unit_id);
        let cmd = CreateUnit {
            unit_id,
            variant_id: VariantId::new(),
            order_id: OrderId::new(),
            shipment_id: None,
            initial_state: InventoryUnitState::Backordered,
            occurred_at: test_time(),
        };

        let events =
            fulfillment_events::execute(&mut unit, &InventoryUnitCommand::CreateUnit(cmd)).unwrap();

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type(), "inventory.unit.created");
        assert!(unit.is_created());
        assert!(unit.is_pending());
        assert!(unit.is_backordered());
        assert_eq!(unit.version(), 1);
    }

    #[test]
    fn create_unit_rejects_shipped_initial_state() {
        let unit_id = InventoryUnitId::new();
        let unit = InventoryUnit::empty(unit_id);
        let cmd = CreateUnit {
            unit_id,
            variant_id: VariantId::new(),
            order_id: OrderId::new(),
            shipment_id: None,
            initial_state: InventoryUnitState::Shipped,
            occurred_at: test_time(),
        };

        let err = unit.handle(&InventoryUnitCommand::CreateUnit(cmd)).unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn fill_backorder_emits_event_with_update_order_side_effect() {
        let mut unit = unit_in(InventoryUnitState::Backordered);
        let cmd = InventoryUnitCommand::FillBackorder(FillBackorder {
            unit_id: unit.id_typed(),
            occurred_at: test_time(),
        });

        let events = fulfillment_events::execute(&mut unit, &cmd).unwrap();

        assert_eq!(unit.state(), InventoryUnitState::OnHand);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].side_effect(), Some(SideEffect::UpdateOrder));
        match &events[0] {
            InventoryUnitEvent::BackorderFilled(e) => {
                assert_eq!(e.order_id, unit.order_id());
                assert_eq!(e.from, InventoryUnitState::Backordered);
            }
            other => panic!("Expected BackorderFilled event, got {other:?}"),
        }
    }

    #[test]
    fn ship_respects_backorder_shipping_flag() {
        let on_hand = unit_in(InventoryUnitState::OnHand);
        assert!(on_hand.handle(&ship(&on_hand, false)).is_ok());

        let backordered = unit_in(InventoryUnitState::Backordered);
        let err = backordered.handle(&ship(&backordered, false)).unwrap_err();
        assert!(err.is_rejection());
        assert!(backordered.handle(&ship(&backordered, true)).is_ok());

        for state in [InventoryUnitState::Shipped, InventoryUnitState::Returned] {
            let unit = unit_in(state);
            assert!(unit.handle(&ship(&unit, true)).unwrap_err().is_rejection());
        }
    }

    #[test]
    fn rejected_transition_leaves_unit_untouched() {
        let mut unit = unit_in(InventoryUnitState::OnHand);
        let before = unit.clone();
        let cmd = InventoryUnitCommand::Return(ReturnUnit {
            unit_id: unit.id_typed(),
            occurred_at: test_time(),
        });

        let err = fulfillment_events::execute(&mut unit, &cmd).unwrap_err();

        assert!(err.is_rejection());
        assert_eq!(unit, before);
    }

    #[test]
    fn ship_then_return_walks_the_happy_path() {
        let mut unit = unit_in(InventoryUnitState::OnHand);
        let start = unit.version();

        let cmd = ship(&unit, false);
        fulfillment_events::execute(&mut unit, &cmd).unwrap();
        assert_eq!(unit.state(), InventoryUnitState::Shipped);

        let ret = InventoryUnitCommand::Return(ReturnUnit {
            unit_id: unit.id_typed(),
            occurred_at: test_time(),
        });
        let events = fulfillment_events::execute(&mut unit, &ret).unwrap();
        assert_eq!(unit.state(), InventoryUnitState::Returned);
        assert_eq!(events[0].side_effect(), None);
        assert_eq!(unit.version(), start + 2);
    }

    #[test]
    fn commands_against_missing_unit_are_not_found() {
        let unit = InventoryUnit::empty(InventoryUnitId::new());
        let err = unit.handle(&ship(&unit, true)).unwrap_err();
        assert_eq!(err, DomainError::NotFound);
    }

    #[test]
    fn command_for_another_unit_is_an_invariant_violation() {
        let unit = unit_in(InventoryUnitState::OnHand);
        let cmd = InventoryUnitCommand::Return(ReturnUnit {
            unit_id: InventoryUnitId::new(),
            occurred_at: test_time(),
        });
        assert!(matches!(
            unit.handle(&cmd).unwrap_err(),
            DomainError::InvariantViolation(_)
        ));
    }

    #[test]
    fn finalize_clears_pending_without_touching_state() {
        let mut unit = unit_in(InventoryUnitState::Backordered);
        let version = unit.version();
        let at = test_time();

        unit.finalize(at);

        assert!(!unit.is_pending());
        assert_eq!(unit.state(), InventoryUnitState::Backordered);
        assert_eq!(unit.updated_at(), at);
        assert_eq!(unit.version(), version + 1);
    }

    #[test]
    fn handle_does_not_mutate_state() {
        let unit = unit_in(InventoryUnitState::OnHand);
        let before = unit.clone();

        let first = unit.handle(&ship(&unit, false)).unwrap();
        let second = unit.handle(&ship(&unit, false)).unwrap();

        assert_eq!(unit, before);
        assert_eq!(first.len(), second.len());
    }

    #[test]
    fn snapshot_restore_preserves_everything() {
        let unit = unit_in(InventoryUnitState::Shipped);
        assert_eq!(InventoryUnit::restore(unit.snapshot()), unit);
    }
}
