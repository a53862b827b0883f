//! Fulfillment orchestration (application-level).
//!
//! ```text
//! Request
//!   ↓
//! 1. Load the unit and remember its version
//!   ↓
//! 2. Decide + apply on a working copy (pure, transition table)
//!   ↓
//! 3. Commit the state write with its side effects (one unit of work)
//!   ↓
//! 4. Publish the committed events on the bus
//! ```
//!
//! A rejected transition is an ordinary answer ([`TransitionOutcome::Rejected`]),
//! not an error: nothing is written and nothing is published.
//!
//! Once step 3 succeeds the call succeeds. A failed publish is logged and the
//! committed outcome is still returned; delivery is at-least-once and consumers
//! dedupe on `(aggregate_id, sequence_number)`.

use std::sync::RwLock;

use chrono::Utc;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info, warn};

use fulfillment_core::{
    AggregateRoot, DomainError, ExpectedVersion, InventoryUnitId, Money, ShipmentId,
    ShippingRateId, StockItem, StockItemId,
};
use fulfillment_events::{EventBus, EventEnvelope, execute};
use fulfillment_inventory::{
    AGGREGATE_TYPE, CreateUnit, FillBackorder, InventoryUnit, InventoryUnitCommand,
    InventoryUnitEvent, ReturnUnit, ShipUnit, SideEffect,
};
use fulfillment_shipping::{Audience, RateOption};

use crate::config::FulfillmentConfig;
use crate::order::OrderUpdateError;
use crate::store::{FulfillmentStore, StoreError};

#[derive(Debug, Error)]
pub enum FulfillmentError {
    /// Deterministic domain failure (validation, invariant).
    #[error(transparent)]
    Domain(DomainError),

    #[error("not found: {0}")]
    NotFound(String),

    /// Stale version or duplicate record; reload and retry.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The order could not be recalculated; the transition was not committed.
    #[error(transparent)]
    OrderUpdate(OrderUpdateError),

    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for FulfillmentError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::Concurrency(msg) | StoreError::Duplicate(msg) => Self::Conflict(msg),
            StoreError::Missing(msg) => Self::NotFound(msg),
            StoreError::SideEffect(err) => Self::OrderUpdate(err),
            other => Self::Store(other),
        }
    }
}

impl From<DomainError> for FulfillmentError {
    fn from(value: DomainError) -> Self {
        match value {
            DomainError::Conflict(msg) => Self::Conflict(msg),
            DomainError::NotFound => Self::NotFound("domain object".to_string()),
            other => Self::Domain(other),
        }
    }
}

/// Result of firing a lifecycle event at a unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionOutcome {
    /// Committed; `events` were published.
    Applied {
        unit: InventoryUnit,
        events: Vec<InventoryUnitEvent>,
    },
    /// Not allowed from the unit's current state; the unit is unchanged.
    Rejected { unit: InventoryUnit, reason: String },
}

impl TransitionOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, TransitionOutcome::Applied { .. })
    }

    pub fn unit(&self) -> &InventoryUnit {
        match self {
            TransitionOutcome::Applied { unit, .. } | TransitionOutcome::Rejected { unit, .. } => {
                unit
            }
        }
    }
}

/// A rate with the price the configured audience should see.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PricedRate {
    pub option: RateOption,
    pub display_price: Money,
}

/// Inventory unit lifecycle and shipping rate queries over a store and a bus.
///
/// Settings are read once per call and passed down explicitly, so
/// [`FulfillmentService::reconfigure`] takes effect for the next request.
pub struct FulfillmentService<S, B> {
    store: S,
    bus: B,
    config: RwLock<FulfillmentConfig>,
}

impl<S, B> FulfillmentService<S, B> {
    pub fn new(store: S, bus: B, config: FulfillmentConfig) -> Self {
        Self {
            store,
            bus,
            config: RwLock::new(config),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    /// Current settings.
    pub fn config(&self) -> FulfillmentConfig {
        match self.config.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn reconfigure(&self, config: FulfillmentConfig) {
        match self.config.write() {
            Ok(mut guard) => *guard = config,
            Err(poisoned) => *poisoned.into_inner() = config,
        }
    }
}

impl<S, B> FulfillmentService<S, B>
where
    S: FulfillmentStore,
    B: EventBus<EventEnvelope<JsonValue>>,
{
    /// Record a new unit in its initial state (`on_hand` or `backordered`).
    pub async fn create_unit(
        &self,
        command: CreateUnit,
    ) -> Result<InventoryUnit, FulfillmentError> {
        let mut unit = InventoryUnit::empty(command.unit_id);
        let events = execute(&mut unit, &InventoryUnitCommand::CreateUnit(command))?;

        self.store.insert_unit(&unit).await?;
        info!(
            unit_id = %unit.id_typed(),
            order_id = %unit.order_id(),
            state = %unit.state(),
            "inventory unit created"
        );

        self.publish(&unit, 0, &events);
        Ok(unit)
    }

    pub async fn fill_backorder(
        &self,
        unit_id: InventoryUnitId,
    ) -> Result<TransitionOutcome, FulfillmentError> {
        let command = InventoryUnitCommand::FillBackorder(FillBackorder {
            unit_id,
            occurred_at: Utc::now(),
        });
        self.transition(unit_id, command).await
    }

    /// Ship a unit. Backordered units ship only when backorder shipping is enabled.
    pub async fn ship(
        &self,
        unit_id: InventoryUnitId,
    ) -> Result<TransitionOutcome, FulfillmentError> {
        let command = InventoryUnitCommand::Ship(ShipUnit {
            unit_id,
            context: self.config().transition_context(),
            occurred_at: Utc::now(),
        });
        self.transition(unit_id, command).await
    }

    pub async fn return_unit(
        &self,
        unit_id: InventoryUnitId,
    ) -> Result<TransitionOutcome, FulfillmentError> {
        let command = InventoryUnitCommand::Return(ReturnUnit {
            unit_id,
            occurred_at: Utc::now(),
        });
        self.transition(unit_id, command).await
    }

    pub async fn get_unit(
        &self,
        unit_id: InventoryUnitId,
    ) -> Result<InventoryUnit, FulfillmentError> {
        self.store
            .get_unit(unit_id)
            .await?
            .ok_or_else(|| FulfillmentError::NotFound(format!("inventory unit {unit_id}")))
    }

    /// Clear `pending` on every listed unit in one write. Empty input is a no-op.
    pub async fn finalize_units(
        &self,
        ids: &[InventoryUnitId],
    ) -> Result<usize, FulfillmentError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let updated = self.store.finalize_units(ids, Utc::now()).await?;
        if updated != ids.len() {
            warn!(requested = ids.len(), updated, "some inventory units were not finalized");
        }
        debug!(updated, "inventory units finalized");
        Ok(updated)
    }

    /// Finalize every still-pending unit of a shipment.
    pub async fn finalize_shipment(
        &self,
        shipment_id: ShipmentId,
    ) -> Result<usize, FulfillmentError> {
        if self.store.get_shipment(shipment_id).await?.is_none() {
            return Err(FulfillmentError::NotFound(format!("shipment {shipment_id}")));
        }
        let ids = self.store.pending_unit_ids(shipment_id).await?;
        let updated = self.finalize_units(&ids).await?;
        info!(shipment_id = %shipment_id, updated, "shipment finalized");
        Ok(updated)
    }

    pub async fn backordered_per_variant(
        &self,
        stock_item: &StockItem,
    ) -> Result<Vec<InventoryUnit>, FulfillmentError> {
        Ok(self.store.backordered_per_variant(stock_item).await?)
    }

    pub async fn backordered_for_stock_item(
        &self,
        stock_item: &StockItem,
    ) -> Result<Vec<InventoryUnit>, FulfillmentError> {
        Ok(self.store.backordered_for_stock_item(stock_item).await?)
    }

    /// Stock item the unit would draw from, if its shipment's location stocks
    /// the variant.
    pub async fn find_stock_item(
        &self,
        unit_id: InventoryUnitId,
    ) -> Result<Option<StockItem>, FulfillmentError> {
        let unit = self.get_unit(unit_id).await?;
        Ok(self.store.find_stock_item(&unit).await?)
    }

    /// Fill up to `quantity` backorders of a stock item, oldest first.
    ///
    /// Each fill is its own `fill_backorder` transition and recalculates its
    /// order. A unit that changed since it was listed (rejected, or a stale
    /// version) is skipped and does not count toward `quantity`. The first
    /// other error stops processing; units filled before it stay filled.
    pub async fn process_backorders(
        &self,
        stock_item_id: StockItemId,
        quantity: usize,
    ) -> Result<Vec<InventoryUnit>, FulfillmentError> {
        let stock_item = self
            .store
            .get_stock_item(stock_item_id)
            .await?
            .ok_or_else(|| FulfillmentError::NotFound(format!("stock item {stock_item_id}")))?;

        let mut filled = Vec::new();
        if quantity == 0 {
            return Ok(filled);
        }

        let waiting = self.store.backordered_for_stock_item(&stock_item).await?;
        for unit in waiting {
            if filled.len() == quantity {
                break;
            }
            match self.fill_backorder(unit.id_typed()).await {
                Ok(TransitionOutcome::Applied { unit, .. }) => filled.push(unit),
                Ok(TransitionOutcome::Rejected { unit, reason }) => {
                    debug!(unit_id = %unit.id_typed(), %reason, "backorder no longer waiting");
                }
                Err(FulfillmentError::Conflict(reason)) => {
                    debug!(unit_id = %unit.id_typed(), %reason, "backorder changed while filling");
                }
                Err(err) => return Err(err),
            }
        }

        info!(
            stock_item_id = %stock_item_id,
            quantity,
            filled = filled.len(),
            "backorders processed"
        );
        Ok(filled)
    }

    /// Rates of a shipment visible to `audience`, cheapest first.
    pub async fn shipping_rates(
        &self,
        shipment_id: ShipmentId,
        audience: Audience,
    ) -> Result<Vec<RateOption>, FulfillmentError> {
        Ok(self.store.shipping_rates(shipment_id, audience).await?)
    }

    /// [`FulfillmentService::shipping_rates`] with each rate's display price.
    pub async fn priced_shipping_rates(
        &self,
        shipment_id: ShipmentId,
        audience: Audience,
    ) -> Result<Vec<PricedRate>, FulfillmentError> {
        let shipment = self
            .store
            .get_shipment(shipment_id)
            .await?
            .ok_or_else(|| FulfillmentError::NotFound(format!("shipment {shipment_id}")))?;
        let policy = self.config().vat_policy();

        let options = self.store.shipping_rates(shipment_id, audience).await?;
        let mut priced = Vec::with_capacity(options.len());
        for option in options {
            let display_price = option.rate.display_price(&policy, &shipment.currency)?;
            priced.push(PricedRate {
                option,
                display_price,
            });
        }
        Ok(priced)
    }

    /// Display price of a stored rate, in its shipment's currency.
    pub async fn display_price(&self, rate_id: ShippingRateId) -> Result<Money, FulfillmentError> {
        let rate = self
            .store
            .get_shipping_rate(rate_id)
            .await?
            .ok_or_else(|| FulfillmentError::NotFound(format!("shipping rate {rate_id}")))?;
        let shipment = self
            .store
            .get_shipment(rate.shipment_id())
            .await?
            .ok_or_else(|| {
                FulfillmentError::NotFound(format!("shipment {}", rate.shipment_id()))
            })?;

        Ok(rate.display_price(&self.config().vat_policy(), &shipment.currency)?)
    }

    async fn transition(
        &self,
        unit_id: InventoryUnitId,
        command: InventoryUnitCommand,
    ) -> Result<TransitionOutcome, FulfillmentError> {
        let current = self.get_unit(unit_id).await?;
        let expected = ExpectedVersion(current.version());

        let mut working = current.clone();
        let events = match execute(&mut working, &command) {
            Ok(events) => events,
            Err(err) if err.is_rejection() => {
                info!(
                    unit_id = %unit_id,
                    state = %current.state(),
                    reason = %err,
                    "transition rejected"
                );
                return Ok(TransitionOutcome::Rejected {
                    unit: current,
                    reason: err.to_string(),
                });
            }
            Err(err) => return Err(err.into()),
        };

        let effects: Vec<SideEffect> = events.iter().filter_map(|e| e.side_effect()).collect();
        self.store
            .commit_transition(&working, expected, &effects)
            .await
            .inspect_err(|err| {
                warn!(unit_id = %unit_id, error = %err, "transition not committed")
            })?;

        info!(
            unit_id = %unit_id,
            from = %current.state(),
            to = %working.state(),
            "inventory unit transitioned"
        );

        self.publish(&working, current.version(), &events);
        Ok(TransitionOutcome::Applied {
            unit: working,
            events,
        })
    }

    /// Publish committed events; `prior_version` is the unit version before them.
    ///
    /// The events are already committed, so a failure is logged rather than
    /// returned. The remaining events of the batch are skipped to keep each
    /// stream in order.
    fn publish(&self, unit: &InventoryUnit, prior_version: u64, events: &[InventoryUnitEvent]) {
        for (idx, event) in events.iter().enumerate() {
            let sequence_number = prior_version + idx as u64 + 1;
            let published = EventEnvelope::from_typed(
                *unit.id_typed().as_uuid(),
                AGGREGATE_TYPE,
                sequence_number,
                event,
            )
            .map_err(|e| e.to_string())
            .and_then(|envelope| self.bus.publish(envelope).map_err(|e| format!("{e:?}")));

            if let Err(error) = published {
                warn!(
                    unit_id = %unit.id_typed(),
                    sequence_number,
                    %error,
                    "committed event not published"
                );
                return;
            }
        }
    }
}
