//! Inventory unit lifecycle as an explicit transition table.
//!
//! Each row maps `(from state, event)` to a target state, an optional guard and
//! an optional side effect. Anything not listed is rejected. The table is the
//! single source of truth: the aggregate consults it to decide, and the
//! service consults it to find out which side effects a committed event needs.

use serde::{Deserialize, Serialize};

use fulfillment_core::{DomainError, DomainResult};

/// Lifecycle state of an inventory unit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InventoryUnitState {
    #[default]
    OnHand,
    Backordered,
    Shipped,
    Returned,
}

impl InventoryUnitState {
    pub const ALL: [InventoryUnitState; 4] = [
        InventoryUnitState::OnHand,
        InventoryUnitState::Backordered,
        InventoryUnitState::Shipped,
        InventoryUnitState::Returned,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            InventoryUnitState::OnHand => "on_hand",
            InventoryUnitState::Backordered => "backordered",
            InventoryUnitState::Shipped => "shipped",
            InventoryUnitState::Returned => "returned",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "on_hand" => Some(InventoryUnitState::OnHand),
            "backordered" => Some(InventoryUnitState::Backordered),
            "shipped" => Some(InventoryUnitState::Shipped),
            "returned" => Some(InventoryUnitState::Returned),
            _ => None,
        }
    }
}

impl core::fmt::Display for InventoryUnitState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle events that can be fired at a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitEvent {
    FillBackorder,
    Ship,
    Return,
}

impl UnitEvent {
    pub const ALL: [UnitEvent; 3] = [UnitEvent::FillBackorder, UnitEvent::Ship, UnitEvent::Return];

    pub fn as_str(self) -> &'static str {
        match self {
            UnitEvent::FillBackorder => "fill_backorder",
            UnitEvent::Ship => "ship",
            UnitEvent::Return => "return",
        }
    }
}

impl core::fmt::Display for UnitEvent {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decision-time inputs for guards.
///
/// Store-wide settings are passed in here explicitly instead of being read from
/// ambient global state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionContext {
    /// Units may ship while still backordered.
    pub allow_backorder_shipping: bool,
}

/// Predicate that must hold for a transition to fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Guard {
    /// `allow_backorder_shipping || state == on_hand`
    AllowShip,
}

impl Guard {
    pub fn permits(self, state: InventoryUnitState, ctx: &TransitionContext) -> bool {
        match self {
            Guard::AllowShip => ctx.allow_backorder_shipping || state == InventoryUnitState::OnHand,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Guard::AllowShip => "allow_ship",
        }
    }
}

/// Work that must complete in the same unit of work as the state write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SideEffect {
    /// Ask the owning order to recalculate its totals and states.
    UpdateOrder,
}

/// One row of the transition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub event: UnitEvent,
    pub from: InventoryUnitState,
    pub to: InventoryUnitState,
    pub guard: Option<Guard>,
    pub side_effect: Option<SideEffect>,
}

pub const TRANSITIONS: &[Transition] = &[
    Transition {
        event: UnitEvent::FillBackorder,
        from: InventoryUnitState::Backordered,
        to: InventoryUnitState::OnHand,
        guard: None,
        side_effect: Some(SideEffect::UpdateOrder),
    },
    Transition {
        event: UnitEvent::Ship,
        from: InventoryUnitState::OnHand,
        to: InventoryUnitState::Shipped,
        guard: Some(Guard::AllowShip),
        side_effect: None,
    },
    Transition {
        event: UnitEvent::Ship,
        from: InventoryUnitState::Backordered,
        to: InventoryUnitState::Shipped,
        guard: Some(Guard::AllowShip),
        side_effect: None,
    },
    Transition {
        event: UnitEvent::Return,
        from: InventoryUnitState::Shipped,
        to: InventoryUnitState::Returned,
        guard: None,
        side_effect: None,
    },
];

/// Find the table row for `event` fired from `from`, ignoring guards.
pub fn lookup(from: InventoryUnitState, event: UnitEvent) -> Option<&'static Transition> {
    TRANSITIONS.iter().find(|t| t.from == from && t.event == event)
}

/// Resolve `event` fired from `from`, evaluating the row's guard.
///
/// Returns [`DomainError::TransitionRejected`] when there is no row or the
/// guard does not pass.
pub fn fire(
    from: InventoryUnitState,
    event: UnitEvent,
    ctx: &TransitionContext,
) -> DomainResult<&'static Transition> {
    let transition = lookup(from, event).ok_or_else(|| {
        DomainError::rejected(format!("cannot {event} an inventory unit that is {from}"))
    })?;

    if let Some(guard) = transition.guard {
        if !guard.permits(from, ctx) {
            return Err(DomainError::rejected(format!(
                "cannot {event} an inventory unit that is {from}: guard {} failed",
                guard.name()
            )));
        }
    }

    Ok(transition)
}
