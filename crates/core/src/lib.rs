//! `fulfillment-core`: domain foundation building blocks.
//!
//! This crate contains **pure domain** primitives shared by the inventory and
//! shipping modules (no infrastructure concerns).

pub mod aggregate;
pub mod entity;
pub mod error;
pub mod id;
pub mod money;
pub mod shipment;
pub mod stock;
pub mod value_object;

pub use aggregate::{Aggregate, AggregateRoot, ExpectedVersion};
pub use entity::Entity;
pub use error::{DomainError, DomainResult};
pub use id::{
    InventoryUnitId, OrderId, ReturnAuthorizationId, ShipmentId, ShippingMethodId,
    ShippingRateId, StockItemId, StockLocationId, VariantId,
};
pub use money::{Currency, Money};
pub use shipment::{Shipment, ShipmentState};
pub use stock::StockItem;
pub use value_object::ValueObject;
