use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};

use fulfillment_core::{
    AggregateRoot, ExpectedVersion, InventoryUnitId, Shipment, ShipmentId, ShippingMethodId,
    ShippingRateId, StockItem, StockItemId,
};
use fulfillment_inventory::{InventoryUnit, SideEffect};
use fulfillment_shipping::{Audience, RateOption, ShippingMethod, ShippingRate, scoped};

use super::r#trait::{FulfillmentStore, StoreError};
use crate::order::OrderRecalculator;

#[derive(Debug, Default)]
struct Tables {
    units: HashMap<InventoryUnitId, InventoryUnit>,
    shipments: HashMap<ShipmentId, Shipment>,
    stock_items: HashMap<StockItemId, StockItem>,
    shipping_methods: HashMap<ShippingMethodId, ShippingMethod>,
    shipping_rates: HashMap<ShippingRateId, ShippingRate>,
}

impl Tables {
    fn backordered_where(
        &self,
        stock_item: &StockItem,
        keep: impl Fn(&Shipment) -> bool,
    ) -> Vec<InventoryUnit> {
        let mut units: Vec<InventoryUnit> = self
            .units
            .values()
            .filter(|u| u.is_backordered() && u.variant_id() == stock_item.variant_id)
            .filter(|u| {
                u.shipment_id()
                    .and_then(|id| self.shipments.get(&id))
                    .is_some_and(|s| !s.is_canceled() && keep(s))
            })
            .cloned()
            .collect();
        units.sort_by_key(|u| (u.created_at(), u.id_typed()));
        units
    }
}

/// In-memory fulfillment store.
///
/// Intended for tests/dev. One lock guards the tables and is only held for the
/// duration of a read or write, never across an await on the order
/// recalculator. Unit writes (transitions and finalize) are serialized by a
/// separate commit lock, so no other unit write lands between a transition's
/// version check and its last side effect.
///
/// Readers can observe a transitioned unit while its order is being
/// recalculated; if recalculation fails the previous unit is put back.
pub struct InMemoryFulfillmentStore {
    tables: RwLock<Tables>,
    commits: Mutex<()>,
    orders: Arc<dyn OrderRecalculator>,
}

impl InMemoryFulfillmentStore {
    pub fn new(orders: Arc<dyn OrderRecalculator>) -> Self {
        Self {
            tables: RwLock::default(),
            commits: Mutex::new(()),
            orders,
        }
    }

    async fn run_side_effects(
        &self,
        unit: &InventoryUnit,
        effects: &[SideEffect],
    ) -> Result<(), StoreError> {
        for effect in effects {
            match effect {
                SideEffect::UpdateOrder => self.orders.recalculate(unit.order_id()).await?,
            }
        }
        Ok(())
    }
}

impl fmt::Debug for InMemoryFulfillmentStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryFulfillmentStore").finish_non_exhaustive()
    }
}

#[async_trait]
impl FulfillmentStore for InMemoryFulfillmentStore {
    async fn upsert_shipment(&self, shipment: Shipment) -> Result<(), StoreError> {
        self.tables.write().await.shipments.insert(shipment.id, shipment);
        Ok(())
    }

    async fn get_shipment(&self, id: ShipmentId) -> Result<Option<Shipment>, StoreError> {
        Ok(self.tables.read().await.shipments.get(&id).cloned())
    }

    async fn upsert_stock_item(&self, item: StockItem) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        let clash = tables.stock_items.values().any(|existing| {
            existing.id != item.id && existing.holds(item.variant_id, item.stock_location_id)
        });
        if clash {
            return Err(StoreError::Duplicate(format!(
                "stock item for variant {} at location {} already exists",
                item.variant_id, item.stock_location_id
            )));
        }
        tables.stock_items.insert(item.id, item);
        Ok(())
    }

    async fn get_stock_item(&self, id: StockItemId) -> Result<Option<StockItem>, StoreError> {
        Ok(self.tables.read().await.stock_items.get(&id).cloned())
    }

    async fn upsert_shipping_method(&self, method: ShippingMethod) -> Result<(), StoreError> {
        self.tables.write().await.shipping_methods.insert(method.id, method);
        Ok(())
    }

    async fn insert_shipping_rate(&self, rate: ShippingRate) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        if !tables.shipments.contains_key(&rate.shipment_id()) {
            return Err(StoreError::Missing(format!("shipment {}", rate.shipment_id())));
        }
        if !tables.shipping_methods.contains_key(&rate.shipping_method_id()) {
            return Err(StoreError::Missing(format!(
                "shipping method {}",
                rate.shipping_method_id()
            )));
        }
        if tables.shipping_rates.contains_key(&rate.id_typed()) {
            return Err(StoreError::Duplicate(format!("shipping rate {}", rate.id_typed())));
        }
        tables.shipping_rates.insert(rate.id_typed(), rate);
        Ok(())
    }

    async fn get_shipping_rate(
        &self,
        id: ShippingRateId,
    ) -> Result<Option<ShippingRate>, StoreError> {
        Ok(self.tables.read().await.shipping_rates.get(&id).cloned())
    }

    async fn shipping_rates(
        &self,
        shipment_id: ShipmentId,
        audience: Audience,
    ) -> Result<Vec<RateOption>, StoreError> {
        let tables = self.tables.read().await;
        let options = tables
            .shipping_rates
            .values()
            .filter(|r| r.shipment_id() == shipment_id)
            .filter_map(|r| {
                tables
                    .shipping_methods
                    .get(&r.shipping_method_id())
                    .map(|m| RateOption {
                        rate: r.clone(),
                        method: m.clone(),
                    })
            })
            .collect::<Vec<_>>();
        Ok(scoped(options, audience))
    }

    async fn insert_unit(&self, unit: &InventoryUnit) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        if tables.units.contains_key(&unit.id_typed()) {
            return Err(StoreError::Duplicate(format!("inventory unit {}", unit.id_typed())));
        }
        tables.units.insert(unit.id_typed(), unit.clone());
        Ok(())
    }

    async fn get_unit(&self, id: InventoryUnitId) -> Result<Option<InventoryUnit>, StoreError> {
        Ok(self.tables.read().await.units.get(&id).cloned())
    }

    async fn commit_transition(
        &self,
        unit: &InventoryUnit,
        expected: ExpectedVersion,
        effects: &[SideEffect],
    ) -> Result<(), StoreError> {
        let _commit = self.commits.lock().await;

        let previous = {
            let mut tables = self.tables.write().await;
            let current = tables.units.get(&unit.id_typed()).ok_or_else(|| {
                StoreError::Missing(format!("inventory unit {}", unit.id_typed()))
            })?;
            if !expected.matches(current.version()) {
                return Err(StoreError::Concurrency(format!(
                    "inventory unit {}: expected {expected:?}, found {}",
                    unit.id_typed(),
                    current.version()
                )));
            }
            tables.units.insert(unit.id_typed(), unit.clone())
        };

        if let Err(err) = self.run_side_effects(unit, effects).await {
            let mut tables = self.tables.write().await;
            match previous {
                Some(previous) => tables.units.insert(unit.id_typed(), previous),
                None => tables.units.remove(&unit.id_typed()),
            };
            return Err(err);
        }
        Ok(())
    }

    async fn finalize_units(
        &self,
        ids: &[InventoryUnitId],
        at: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }

        let _commit = self.commits.lock().await;
        let mut tables = self.tables.write().await;
        let mut updated = 0;
        for id in ids {
            if let Some(unit) = tables.units.get_mut(id) {
                unit.finalize(at);
                updated += 1;
            }
        }
        Ok(updated)
    }

    async fn pending_unit_ids(
        &self,
        shipment_id: ShipmentId,
    ) -> Result<Vec<InventoryUnitId>, StoreError> {
        let tables = self.tables.read().await;
        let mut ids: Vec<InventoryUnitId> = tables
            .units
            .values()
            .filter(|u| u.is_pending() && u.shipment_id() == Some(shipment_id))
            .map(|u| u.id_typed())
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn backordered_per_variant(
        &self,
        stock_item: &StockItem,
    ) -> Result<Vec<InventoryUnit>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables.backordered_where(stock_item, |_| true))
    }

    async fn backordered_for_stock_item(
        &self,
        stock_item: &StockItem,
    ) -> Result<Vec<InventoryUnit>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables.backordered_where(stock_item, |s| {
            s.stock_location_id == stock_item.stock_location_id
        }))
    }

    async fn find_stock_item(&self, unit: &InventoryUnit) -> Result<Option<StockItem>, StoreError> {
        let tables = self.tables.read().await;
        let Some(shipment) = unit.shipment_id().and_then(|id| tables.shipments.get(&id)) else {
            return Ok(None);
        };
        Ok(tables
            .stock_items
            .values()
            .find(|item| item.holds(unit.variant_id(), shipment.stock_location_id))
            .cloned())
    }
}
