use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use fulfillment_core::{
    ExpectedVersion, InventoryUnitId, Shipment, ShipmentId, ShippingRateId, StockItem,
    StockItemId,
};
use fulfillment_inventory::{InventoryUnit, SideEffect};
use fulfillment_shipping::{Audience, RateOption, ShippingMethod, ShippingRate};

use crate::order::OrderUpdateError;

/// Fulfillment store operation error.
///
/// These are **infrastructure errors** (storage, concurrency, failed side
/// effects) as opposed to domain errors (validation, rejected transitions).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("optimistic concurrency check failed: {0}")]
    Concurrency(String),

    #[error("duplicate record: {0}")]
    Duplicate(String),

    #[error("missing record: {0}")]
    Missing(String),

    #[error("side effect failed: {0}")]
    SideEffect(#[from] OrderUpdateError),

    #[error("stored data is corrupt: {0}")]
    Corrupt(String),

    #[error("database error: {0}")]
    Database(String),
}

/// Persistence boundary for inventory units and the records they are queried
/// against (shipments, stock items, shipping methods and rates).
///
/// ## Write semantics
///
/// - `insert_unit` fails with `Duplicate` if the id exists.
/// - `commit_transition` checks `expected` against the stored version, writes
///   the unit and carries out its side effects as one unit of work (commit lock
///   or database transaction). Any failure leaves the stored unit unchanged.
/// - `finalize_units` is one batched write; ids that do not exist are skipped.
///
/// ## Query semantics
///
/// - Backorder queries only return units in `backordered` state whose shipment
///   exists and is not canceled, oldest `created_at` first (ties by unit id).
/// - Empty results are normal.
#[async_trait]
pub trait FulfillmentStore: Send + Sync {
    async fn upsert_shipment(&self, shipment: Shipment) -> Result<(), StoreError>;

    async fn get_shipment(&self, id: ShipmentId) -> Result<Option<Shipment>, StoreError>;

    async fn upsert_stock_item(&self, item: StockItem) -> Result<(), StoreError>;

    async fn get_stock_item(&self, id: StockItemId) -> Result<Option<StockItem>, StoreError>;

    async fn upsert_shipping_method(&self, method: ShippingMethod) -> Result<(), StoreError>;

    async fn insert_shipping_rate(&self, rate: ShippingRate) -> Result<(), StoreError>;

    async fn get_shipping_rate(
        &self,
        id: ShippingRateId,
    ) -> Result<Option<ShippingRate>, StoreError>;

    /// Rates of a shipment visible to `audience`, cheapest first.
    async fn shipping_rates(
        &self,
        shipment_id: ShipmentId,
        audience: Audience,
    ) -> Result<Vec<RateOption>, StoreError>;

    async fn insert_unit(&self, unit: &InventoryUnit) -> Result<(), StoreError>;

    async fn get_unit(&self, id: InventoryUnitId) -> Result<Option<InventoryUnit>, StoreError>;

    /// Atomically persist a transitioned unit together with its side effects.
    async fn commit_transition(
        &self,
        unit: &InventoryUnit,
        expected: ExpectedVersion,
        effects: &[SideEffect],
    ) -> Result<(), StoreError>;

    /// Clear `pending` and stamp `updated_at` on every listed unit in one write.
    ///
    /// Returns how many units were updated.
    async fn finalize_units(
        &self,
        ids: &[InventoryUnitId],
        at: DateTime<Utc>,
    ) -> Result<usize, StoreError>;

    /// Ids of the still-pending units of a shipment.
    async fn pending_unit_ids(
        &self,
        shipment_id: ShipmentId,
    ) -> Result<Vec<InventoryUnitId>, StoreError>;

    /// Backordered units of the stock item's variant on non-canceled shipments.
    async fn backordered_per_variant(
        &self,
        stock_item: &StockItem,
    ) -> Result<Vec<InventoryUnit>, StoreError>;

    /// [`FulfillmentStore::backordered_per_variant`] restricted to shipments
    /// leaving from the stock item's location.
    async fn backordered_for_stock_item(
        &self,
        stock_item: &StockItem,
    ) -> Result<Vec<InventoryUnit>, StoreError>;

    /// Stock item for the unit's variant at its shipment's stock location.
    async fn find_stock_item(&self, unit: &InventoryUnit) -> Result<Option<StockItem>, StoreError>;
}

#[async_trait]
impl<S> FulfillmentStore for Arc<S>
where
    S: FulfillmentStore + ?Sized,
{
    async fn upsert_shipment(&self, shipment: Shipment) -> Result<(), StoreError> {
        (**self).upsert_shipment(shipment).await
    }

    async fn get_shipment(&self, id: ShipmentId) -> Result<Option<Shipment>, StoreError> {
        (**self).get_shipment(id).await
    }

    async fn upsert_stock_item(&self, item: StockItem) -> Result<(), StoreError> {
        (**self).upsert_stock_item(item).await
    }

    async fn get_stock_item(&self, id: StockItemId) -> Result<Option<StockItem>, StoreError> {
        (**self).get_stock_item(id).await
    }

    async fn upsert_shipping_method(&self, method: ShippingMethod) -> Result<(), StoreError> {
        (**self).upsert_shipping_method(method).await
    }

    async fn insert_shipping_rate(&self, rate: ShippingRate) -> Result<(), StoreError> {
        (**self).insert_shipping_rate(rate).await
    }

    async fn get_shipping_rate(
        &self,
        id: ShippingRateId,
    ) -> Result<Option<ShippingRate>, StoreError> {
        (**self).get_shipping_rate(id).await
    }

    async fn shipping_rates(
        &self,
        shipment_id: ShipmentId,
        audience: Audience,
    ) -> Result<Vec<RateOption>, StoreError> {
        (**self).shipping_rates(shipment_id, audience).await
    }

    async fn insert_unit(&self, unit: &InventoryUnit) -> Result<(), StoreError> {
        (**self).insert_unit(unit).await
    }

    async fn get_unit(&self, id: InventoryUnitId) -> Result<Option<InventoryUnit>, StoreError> {
        (**self).get_unit(id).await
    }

    async fn commit_transition(
        &self,
        unit: &InventoryUnit,
        expected: ExpectedVersion,
        effects: &[SideEffect],
    ) -> Result<(), StoreError> {
        (**self).commit_transition(unit, expected, effects).await
    }

    async fn finalize_units(
        &self,
        ids: &[InventoryUnitId],
        at: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        (**self).finalize_units(ids, at).await
    }

    async fn pending_unit_ids(
        &self,
        shipment_id: ShipmentId,
    ) -> Result<Vec<InventoryUnitId>, StoreError> {
        (**self).pending_unit_ids(shipment_id).await
    }

    async fn backordered_per_variant(
        &self,
        stock_item: &StockItem,
    ) -> Result<Vec<InventoryUnit>, StoreError> {
        (**self).backordered_per_variant(stock_item).await
    }

    async fn backordered_for_stock_item(
        &self,
        stock_item: &StockItem,
    ) -> Result<Vec<InventoryUnit>, StoreError> {
        (**self).backordered_for_stock_item(stock_item).await
    }

    async fn find_stock_item(&self, unit: &InventoryUnit) -> Result<Option<StockItem>, StoreError> {
        (**self).find_stock_item(unit).await
    }
}
