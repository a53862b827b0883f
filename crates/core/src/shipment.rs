//! Shipment snapshot.
//!
//! Shipments are owned by the order workflow; this crate only needs the fields
//! the inventory and shipping modules read (owning order, stock location,
//! lifecycle state, order currency).

use serde::{Deserialize, Serialize};

use crate::entity::Entity;
use crate::id::{OrderId, ShipmentId, StockLocationId};
use crate::money::Currency;

/// Shipment lifecycle state as reported by the order workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShipmentState {
    Pending,
    Ready,
    Shipped,
    Canceled,
}

impl ShipmentState {
    pub fn as_str(self) -> &'static str {
        match self {
            ShipmentState::Pending => "pending",
            ShipmentState::Ready => "ready",
            ShipmentState::Shipped => "shipped",
            ShipmentState::Canceled => "canceled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ShipmentState::Pending),
            "ready" => Some(ShipmentState::Ready),
            "shipped" => Some(ShipmentState::Shipped),
            "canceled" => Some(ShipmentState::Canceled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shipment {
    pub id: ShipmentId,
    pub order_id: OrderId,
    pub stock_location_id: StockLocationId,
    pub state: ShipmentState,
    /// Currency of the owning order.
    pub currency: Currency,
}

impl Shipment {
    pub fn is_canceled(&self) -> bool {
        self.state == ShipmentState::Canceled
    }
}

impl Entity for Shipment {
    type Id = ShipmentId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}
