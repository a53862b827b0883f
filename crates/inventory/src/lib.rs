//! Inventory unit lifecycle.
//!
//! This crate contains the business rules for inventory units, implemented
//! purely as deterministic domain logic (no IO, no storage). The lifecycle is a
//! data-driven transition table (see [`transitions`]); the [`InventoryUnit`]
//! aggregate consults it to accept or reject lifecycle events.

pub mod transitions;
pub mod unit;

pub use transitions::{
    Guard, InventoryUnitState, SideEffect, TRANSITIONS, Transition, TransitionContext, UnitEvent,
};
pub use unit::{
    AGGREGATE_TYPE, CreateUnit, FillBackorder, InventoryUnit, InventoryUnitCommand,
    InventoryUnitEvent, InventoryUnitSnapshot, ReturnUnit, ShipUnit, UnitCreated,
    UnitTransitioned,
};
