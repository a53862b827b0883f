//! Integration tests for the fulfillment pipeline.
//!
//! Tests: Service → FulfillmentStore (+ OrderRecalculator) → EventBus
//!
//! Verifies:
//! - Lifecycle transitions follow the table, with guards and side effects
//! - Side-effect failures leave nothing committed or published
//! - Order recalculation can read the store it is called from
//! - Concurrent transitions on one unit are serialized
//! - A failed publish does not undo a committed transition
//! - Backorder queries, finalize batches and rate pricing over stored data

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex, OnceLock, Weak, mpsc};
    use std::time::Duration as StdDuration;

    use async_trait::async_trait;
    use chrono::{DateTime, Duration, Utc};
    use rust_decimal_macros::dec;
    use serde_json::Value as JsonValue;

    use fulfillment_core::{
        AggregateRoot, Currency, ExpectedVersion, InventoryUnitId, OrderId, Shipment, ShipmentId, ShipmentState,
        ShippingMethodId, ShippingRateId, StockItem, StockItemId, StockLocationId, VariantId,
    };
    use fulfillment_events::{EventBus, EventEnvelope, InMemoryEventBus, Subscription};
    use fulfillment_inventory::{CreateUnit, InventoryUnit, InventoryUnitState, SideEffect};
    use fulfillment_shipping::{Audience, DisplayOn, RateOption, ShippingMethod, ShippingRate};

    use crate::config::FulfillmentConfig;
    use crate::order::{OrderRecalculator, OrderUpdateError};
    use crate::service::{FulfillmentError, FulfillmentService, TransitionOutcome};
    use crate::store::{FulfillmentStore, InMemoryFulfillmentStore, StoreError};

    type Bus = Arc<InMemoryEventBus<EventEnvelope<JsonValue>>>;
    type Service = FulfillmentService<Arc<InMemoryFulfillmentStore>, Bus>;

    #[derive(Default)]
    struct RecordingOrders {
        calls: Mutex<Vec<OrderId>>,
        fail: bool,
    }

    impl RecordingOrders {
        fn failing() -> Self {
            Self {
                fail: true,
                ..Self::default()
            }
        }

        fn calls(&self) -> Vec<OrderId> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl OrderRecalculator for RecordingOrders {
        async fn recalculate(&self, order_id: OrderId) -> Result<(), OrderUpdateError> {
            if self.fail {
                return Err(OrderUpdateError::new(order_id, "order is locked"));
            }
            self.calls.lock().unwrap().push(order_id);
            Ok(())
        }
    }

    struct Fixture {
        service: Arc<Service>,
        orders: Arc<RecordingOrders>,
        events: Subscription<EventEnvelope<JsonValue>>,
    }

    fn setup_with(orders: RecordingOrders, config: FulfillmentConfig) -> Fixture {
        let orders = Arc::new(orders);
        let recalculator: Arc<dyn OrderRecalculator> = orders.clone();
        let store = Arc::new(InMemoryFulfillmentStore::new(recalculator));
        let bus: Bus = Arc::new(InMemoryEventBus::new());
        // Subscribe before anything is published.
        let events = bus.subscribe();

        Fixture {
            service: Arc::new(FulfillmentService::new(store, bus, config)),
            orders,
            events,
        }
    }

    fn setup() -> Fixture {
        setup_with(RecordingOrders::default(), FulfillmentConfig::default())
    }

    fn usd() -> Currency {
        Currency::new("USD").unwrap()
    }

    async fn shipment(f: &Fixture, location: StockLocationId, state: ShipmentState) -> Shipment {
        let shipment = Shipment {
            id: ShipmentId::new(),
            order_id: OrderId::new(),
            stock_location_id: location,
            state,
            currency: usd(),
        };
        f.service.store().upsert_shipment(shipment.clone()).await.unwrap();
        shipment
    }

    async fn unit_at(
        f: &Fixture,
        shipment: &Shipment,
        variant_id: VariantId,
        state: InventoryUnitState,
        created_at: DateTime<Utc>,
    ) -> InventoryUnit {
        f.service
            .create_unit(CreateUnit {
                unit_id: InventoryUnitId::new(),
                variant_id,
                order_id: shipment.order_id,
                shipment_id: Some(shipment.id),
                initial_state: state,
                occurred_at: created_at,
            })
            .await
            .unwrap()
    }

    async fn unit(f: &Fixture, state: InventoryUnitState) -> InventoryUnit {
        let shipment = shipment(f, StockLocationId::new(), ShipmentState::Pending).await;
        unit_at(f, &shipment, VariantId::new(), state, Utc::now()).await
    }

    async fn stock_item(
        f: &Fixture,
        variant_id: VariantId,
        location: StockLocationId,
    ) -> StockItem {
        let item = StockItem {
            id: StockItemId::new(),
            variant_id,
            stock_location_id: location,
            count_on_hand: 0,
            backorderable: true,
        };
        f.service.store().upsert_stock_item(item.clone()).await.unwrap();
        item
    }

    fn ids(units: &[InventoryUnit]) -> Vec<InventoryUnitId> {
        units.iter().map(|u| u.id_typed()).collect()
    }

    #[tokio::test]
    async fn fill_backorder_moves_unit_on_hand_and_recalculates_order_once() {
        let f = setup();
        let unit = unit(&f, InventoryUnitState::Backordered).await;

        let outcome = f.service.fill_backorder(unit.id_typed()).await.unwrap();

        assert!(outcome.is_applied());
        assert_eq!(outcome.unit().state(), InventoryUnitState::OnHand);
        assert_eq!(f.orders.calls(), vec![unit.order_id()]);

        let stored = f.service.get_unit(unit.id_typed()).await.unwrap();
        assert_eq!(stored.state(), InventoryUnitState::OnHand);
    }

    #[tokio::test]
    async fn fill_backorder_from_on_hand_is_rejected_without_side_effect() {
        let f = setup();
        let unit = unit(&f, InventoryUnitState::OnHand).await;

        let outcome = f.service.fill_backorder(unit.id_typed()).await.unwrap();

        assert!(matches!(outcome, TransitionOutcome::Rejected { .. }));
        assert!(f.orders.calls().is_empty());
        assert_eq!(f.service.get_unit(unit.id_typed()).await.unwrap(), unit);
    }

    #[tokio::test]
    async fn ship_from_on_hand_is_always_allowed() {
        let f = setup();
        let unit = unit(&f, InventoryUnitState::OnHand).await;

        let outcome = f.service.ship(unit.id_typed()).await.unwrap();

        assert!(outcome.is_applied());
        assert_eq!(outcome.unit().state(), InventoryUnitState::Shipped);
        assert!(f.orders.calls().is_empty());
    }

    #[tokio::test]
    async fn ship_from_backordered_follows_the_backorder_shipping_flag() {
        let f = setup();
        let unit = unit(&f, InventoryUnitState::Backordered).await;

        let outcome = f.service.ship(unit.id_typed()).await.unwrap();
        assert!(!outcome.is_applied());
        assert_eq!(
            f.service.get_unit(unit.id_typed()).await.unwrap().state(),
            InventoryUnitState::Backordered
        );

        f.service.reconfigure(FulfillmentConfig {
            allow_backorder_shipping: true,
            ..FulfillmentConfig::default()
        });

        let outcome = f.service.ship(unit.id_typed()).await.unwrap();
        assert!(outcome.is_applied());
        assert_eq!(outcome.unit().state(), InventoryUnitState::Shipped);
    }

    #[tokio::test]
    async fn shipped_and_returned_units_never_ship_even_with_the_flag() {
        let f = setup_with(
            RecordingOrders::default(),
            FulfillmentConfig {
                allow_backorder_shipping: true,
                ..FulfillmentConfig::default()
            },
        );
        let shipped = unit(&f, InventoryUnitState::OnHand).await;
        f.service.ship(shipped.id_typed()).await.unwrap();

        let returned = unit(&f, InventoryUnitState::OnHand).await;
        f.service.ship(returned.id_typed()).await.unwrap();
        f.service.return_unit(returned.id_typed()).await.unwrap();

        for id in [shipped.id_typed(), returned.id_typed()] {
            let before = f.service.get_unit(id).await.unwrap();
            let outcome = f.service.ship(id).await.unwrap();
            assert!(!outcome.is_applied());
            assert_eq!(f.service.get_unit(id).await.unwrap(), before);
        }
    }

    #[tokio::test]
    async fn return_is_only_allowed_from_shipped() {
        let f = setup();
        let on_hand = unit(&f, InventoryUnitState::OnHand).await;
        let backordered = unit(&f, InventoryUnitState::Backordered).await;

        for id in [on_hand.id_typed(), backordered.id_typed()] {
            let outcome = f.service.return_unit(id).await.unwrap();
            assert!(matches!(outcome, TransitionOutcome::Rejected { .. }));
        }

        f.service.ship(on_hand.id_typed()).await.unwrap();
        let outcome = f.service.return_unit(on_hand.id_typed()).await.unwrap();
        assert_eq!(outcome.unit().state(), InventoryUnitState::Returned);

        // Nothing leaves returned.
        let again = f.service.return_unit(on_hand.id_typed()).await.unwrap();
        assert!(!again.is_applied());
    }

    #[tokio::test]
    async fn failed_order_recalculation_commits_and_publishes_nothing() {
        let f = setup_with(RecordingOrders::failing(), FulfillmentConfig::default());
        let unit = unit(&f, InventoryUnitState::Backordered).await;
        f.events.drain();

        let err = f.service.fill_backorder(unit.id_typed()).await.unwrap_err();

        assert!(matches!(err, FulfillmentError::OrderUpdate(_)));
        assert_eq!(f.service.get_unit(unit.id_typed()).await.unwrap(), unit);
        assert!(f.events.drain().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_ships_of_one_unit_commit_exactly_once() {
        let f = setup();
        let unit = unit(&f, InventoryUnitState::OnHand).await;
        f.events.drain();

        let tasks: Vec<_> = (0..2)
            .map(|_| {
                let service = f.service.clone();
                let id = unit.id_typed();
                tokio::spawn(async move { service.ship(id).await })
            })
            .collect();

        let mut applied = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(outcome) if outcome.is_applied() => applied += 1,
                Ok(_) | Err(FulfillmentError::Conflict(_)) => {}
                Err(other) => panic!("unexpected error: {other:?}"),
            }
        }

        assert_eq!(applied, 1);
        assert_eq!(
            f.service.get_unit(unit.id_typed()).await.unwrap().state(),
            InventoryUnitState::Shipped
        );
        assert_eq!(f.events.drain().len(), 1);
    }

    #[tokio::test]
    async fn committed_transitions_are_published_in_stream_order() {
        let f = setup();
        let unit = unit(&f, InventoryUnitState::Backordered).await;
        f.service.fill_backorder(unit.id_typed()).await.unwrap();
        f.service.ship(unit.id_typed()).await.unwrap();

        let published = f.events.drain();
        let summary: Vec<(&str, u64)> = published
            .iter()
            .map(|e| (e.event_type(), e.sequence_number()))
            .collect();

        assert_eq!(
            summary,
            vec![
                ("inventory.unit.created", 1),
                ("inventory.unit.backorder_filled", 2),
                ("inventory.unit.shipped", 3),
            ]
        );
        assert!(published.iter().all(|e| e.aggregate_id() == *unit.id_typed().as_uuid()));
        assert!(published.iter().all(|e| e.aggregate_type() == "inventory.unit"));
    }

    #[tokio::test]
    async fn create_unit_rejects_lifecycle_end_states_and_duplicates() {
        let f = setup();
        let shipment = shipment(&f, StockLocationId::new(), ShipmentState::Pending).await;
        let command = CreateUnit {
            unit_id: InventoryUnitId::new(),
            variant_id: VariantId::new(),
            order_id: shipment.order_id,
            shipment_id: Some(shipment.id),
            initial_state: InventoryUnitState::Shipped,
            occurred_at: Utc::now(),
        };

        let err = f.service.create_unit(command.clone()).await.unwrap_err();
        assert!(matches!(err, FulfillmentError::Domain(_)));

        let command = CreateUnit {
            initial_state: InventoryUnitState::OnHand,
            ..command
        };
        f.service.create_unit(command.clone()).await.unwrap();
        let err = f.service.create_unit(command).await.unwrap_err();
        assert!(matches!(err, FulfillmentError::Conflict(_)));
    }

    #[tokio::test]
    async fn unknown_unit_is_not_found() {
        let f = setup();
        let err = f.service.ship(InventoryUnitId::new()).await.unwrap_err();
        assert!(matches!(err, FulfillmentError::NotFound(_)));
    }

    #[tokio::test]
    async fn backordered_per_variant_is_fifo_and_skips_canceled_shipments() {
        let f = setup();
        let variant = VariantId::new();
        let location = StockLocationId::new();
        let item = stock_item(&f, variant, location).await;
        let t0 = Utc::now();

        let open = shipment(&f, location, ShipmentState::Pending).await;
        let elsewhere = shipment(&f, StockLocationId::new(), ShipmentState::Ready).await;
        let canceled = shipment(&f, location, ShipmentState::Canceled).await;

        let backordered = InventoryUnitState::Backordered;
        let minutes = Duration::minutes;
        let newest = unit_at(&f, &open, variant, backordered, t0 + minutes(2)).await;
        let oldest = unit_at(&f, &elsewhere, variant, backordered, t0).await;
        let middle = unit_at(&f, &open, variant, backordered, t0 + minutes(1)).await;
        unit_at(&f, &canceled, variant, backordered, t0 - minutes(5)).await;
        unit_at(&f, &open, variant, InventoryUnitState::OnHand, t0 - minutes(5)).await;
        unit_at(&f, &open, VariantId::new(), backordered, t0).await;

        let waiting = f.service.backordered_per_variant(&item).await.unwrap();
        assert_eq!(ids(&waiting), ids(&[oldest, middle.clone(), newest.clone()]));

        let here = f.service.backordered_for_stock_item(&item).await.unwrap();
        assert_eq!(ids(&here), ids(&[middle, newest]));
    }

    #[tokio::test]
    async fn backorder_queries_on_an_unused_variant_are_empty() {
        let f = setup();
        let item = stock_item(&f, VariantId::new(), StockLocationId::new()).await;

        assert!(f.service.backordered_per_variant(&item).await.unwrap().is_empty());
        assert!(f.service.backordered_for_stock_item(&item).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn find_stock_item_matches_shipment_location_and_variant() {
        let f = setup();
        let variant = VariantId::new();
        let location = StockLocationId::new();
        let item = stock_item(&f, variant, location).await;
        stock_item(&f, variant, StockLocationId::new()).await;

        let here = shipment(&f, location, ShipmentState::Pending).await;
        let unit = unit_at(&f, &here, variant, InventoryUnitState::OnHand, Utc::now()).await;
        assert_eq!(f.service.find_stock_item(unit.id_typed()).await.unwrap(), Some(item));

        let unstocked = shipment(&f, StockLocationId::new(), ShipmentState::Pending).await;
        let orphan = unit_at(&f, &unstocked, variant, InventoryUnitState::OnHand, Utc::now()).await;
        assert_eq!(f.service.find_stock_item(orphan.id_typed()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn finalize_shipment_clears_pending_and_keeps_states() {
        let f = setup();
        let variant = VariantId::new();
        let target = shipment(&f, StockLocationId::new(), ShipmentState::Ready).await;
        let other = shipment(&f, StockLocationId::new(), ShipmentState::Ready).await;

        let mut units = Vec::new();
        for state in [
            InventoryUnitState::OnHand,
            InventoryUnitState::Backordered,
            InventoryUnitState::OnHand,
        ] {
            units.push(unit_at(&f, &target, variant, state, Utc::now()).await);
        }
        let untouched = unit_at(&f, &other, variant, InventoryUnitState::OnHand, Utc::now()).await;

        let updated = f.service.finalize_shipment(target.id).await.unwrap();
        assert_eq!(updated, 3);

        for before in &units {
            let after = f.service.get_unit(before.id_typed()).await.unwrap();
            assert!(!after.is_pending());
            assert_eq!(after.state(), before.state());
        }
        assert!(f.service.get_unit(untouched.id_typed()).await.unwrap().is_pending());

        // Already finalized: nothing left to do.
        assert_eq!(f.service.finalize_shipment(target.id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn finalize_units_with_no_ids_is_a_no_op() {
        let f = setup();
        assert_eq!(f.service.finalize_units(&[]).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn transition_after_finalize_works_from_the_new_version() {
        let f = setup();
        let unit = unit(&f, InventoryUnitState::OnHand).await;
        f.service.finalize_units(&[unit.id_typed()]).await.unwrap();

        let outcome = f.service.ship(unit.id_typed()).await.unwrap();
        assert!(outcome.is_applied());
        assert!(!outcome.unit().is_pending());
    }

    #[tokio::test]
    async fn process_backorders_fills_oldest_first_up_to_quantity() {
        let f = setup();
        let variant = VariantId::new();
        let location = StockLocationId::new();
        let item = stock_item(&f, variant, location).await;
        let open = shipment(&f, location, ShipmentState::Pending).await;
        let t0 = Utc::now();

        let backordered = InventoryUnitState::Backordered;
        let third = unit_at(&f, &open, variant, backordered, t0 + Duration::seconds(2)).await;
        let first = unit_at(&f, &open, variant, backordered, t0).await;
        let second = unit_at(&f, &open, variant, backordered, t0 + Duration::seconds(1)).await;

        let filled = f.service.process_backorders(item.id, 2).await.unwrap();

        assert_eq!(ids(&filled), ids(&[first, second]));
        assert!(filled.iter().all(|u| u.state() == InventoryUnitState::OnHand));
        assert_eq!(f.orders.calls().len(), 2);
        assert_eq!(
            f.service.get_unit(third.id_typed()).await.unwrap().state(),
            InventoryUnitState::Backordered
        );

        assert!(f.service.process_backorders(item.id, 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn process_backorders_stops_at_the_first_hard_error() {
        let f = setup_with(RecordingOrders::failing(), FulfillmentConfig::default());
        let variant = VariantId::new();
        let location = StockLocationId::new();
        let item = stock_item(&f, variant, location).await;
        let open = shipment(&f, location, ShipmentState::Pending).await;
        let waiting =
            unit_at(&f, &open, variant, InventoryUnitState::Backordered, Utc::now()).await;

        let err = f.service.process_backorders(item.id, 5).await.unwrap_err();

        assert!(matches!(err, FulfillmentError::OrderUpdate(_)));
        assert!(f.service.get_unit(waiting.id_typed()).await.unwrap().is_backordered());
    }

    #[tokio::test]
    async fn process_backorders_for_unknown_stock_item_is_not_found() {
        let f = setup();
        let err = f.service.process_backorders(StockItemId::new(), 1).await.unwrap_err();
        assert!(matches!(err, FulfillmentError::NotFound(_)));
    }

    async fn method(f: &Fixture, name: &str, display_on: DisplayOn) -> ShippingMethod {
        let method = ShippingMethod {
            id: ShippingMethodId::new(),
            name: name.to_string(),
            display_on,
        };
        f.service.store().upsert_shipping_method(method.clone()).await.unwrap();
        method
    }

    async fn rate(
        f: &Fixture,
        shipment: &Shipment,
        method: &ShippingMethod,
        cost: rust_decimal::Decimal,
    ) -> ShippingRate {
        let rate =
            ShippingRate::new(ShippingRateId::new(), shipment.id, method.id, cost, false).unwrap();
        f.service.store().insert_shipping_rate(rate.clone()).await.unwrap();
        rate
    }

    #[tokio::test]
    async fn shipping_rates_are_scoped_by_audience_and_sorted_by_cost() {
        let f = setup();
        let s = shipment(&f, StockLocationId::new(), ShipmentState::Pending).await;
        let ground = method(&f, "Ground", DisplayOn::Both).await;
        let express = method(&f, "Express", DisplayOn::FrontEnd).await;
        let freight = method(&f, "Freight", DisplayOn::BackEnd).await;

        let express_rate = rate(&f, &s, &express, dec!(25.00)).await;
        let ground_rate = rate(&f, &s, &ground, dec!(5.00)).await;
        let freight_rate = rate(&f, &s, &freight, dec!(1.00)).await;

        let front = f.service.shipping_rates(s.id, Audience::Frontend).await.unwrap();
        let front: Vec<_> = front.iter().map(|o| o.rate.id_typed()).collect();
        assert_eq!(front, vec![ground_rate.id_typed(), express_rate.id_typed()]);

        let back = f.service.shipping_rates(s.id, Audience::Backend).await.unwrap();
        let names: Vec<_> = back.iter().filter_map(|o| o.rate.name(&o.method)).collect();
        assert_eq!(names, vec!["Freight", "Ground"]);
        assert_eq!(back[0].rate.id_typed(), freight_rate.id_typed());
    }

    #[tokio::test]
    async fn display_price_adds_vat_only_when_prices_include_it() {
        let f = setup();
        let s = shipment(&f, StockLocationId::new(), ShipmentState::Pending).await;
        let ground = method(&f, "Ground", DisplayOn::Both).await;
        let stored = rate(&f, &s, &ground, dec!(10.00)).await;

        f.service.reconfigure(FulfillmentConfig {
            default_tax_rate: dec!(0.20),
            ..FulfillmentConfig::default()
        });
        let price = f.service.display_price(stored.id_typed()).await.unwrap();
        assert_eq!(price.amount(), dec!(10.00));
        assert_eq!(price.currency(), &usd());

        f.service.reconfigure(FulfillmentConfig {
            shipment_inc_vat: true,
            default_tax_rate: dec!(0.20),
            ..FulfillmentConfig::default()
        });
        let price = f.service.display_price(stored.id_typed()).await.unwrap();
        assert_eq!(price.to_string(), "12.00 USD");

        let priced = f
            .service
            .priced_shipping_rates(s.id, Audience::Frontend)
            .await
            .unwrap();
        assert_eq!(priced.len(), 1);
        assert_eq!(priced[0].display_price, price);
    }

    #[tokio::test]
    async fn display_price_overflow_is_a_domain_error() {
        let f = setup_with(
            RecordingOrders::default(),
            FulfillmentConfig {
                shipment_inc_vat: true,
                default_tax_rate: dec!(0.20),
                ..FulfillmentConfig::default()
            },
        );
        let s = shipment(&f, StockLocationId::new(), ShipmentState::Pending).await;
        let ground = method(&f, "Ground", DisplayOn::Both).await;
        let stored = rate(&f, &s, &ground, rust_decimal::Decimal::MAX).await;

        let err = f.service.display_price(stored.id_typed()).await.unwrap_err();
        assert!(matches!(err, FulfillmentError::Domain(_)));

        let err = f
            .service
            .priced_shipping_rates(s.id, Audience::Frontend)
            .await
            .unwrap_err();
        assert!(matches!(err, FulfillmentError::Domain(_)));
    }

    #[tokio::test]
    async fn rates_require_their_shipment_and_method() {
        let f = setup();
        let orphan = ShippingRate::new(
            ShippingRateId::new(),
            ShipmentId::new(),
            ShippingMethodId::new(),
            dec!(3.00),
            false,
        )
        .unwrap();

        assert!(f.service.store().insert_shipping_rate(orphan).await.is_err());
        let err = f.service.display_price(ShippingRateId::new()).await.unwrap_err();
        assert!(matches!(err, FulfillmentError::NotFound(_)));
    }

    /// Recalculator that reads the filled unit back through the store calling it.
    #[derive(Default)]
    struct ReadingOrders {
        store: OnceLock<Weak<InMemoryFulfillmentStore>>,
        unit: OnceLock<InventoryUnitId>,
        seen: Mutex<Vec<InventoryUnitState>>,
    }

    #[async_trait]
    impl OrderRecalculator for ReadingOrders {
        async fn recalculate(&self, order_id: OrderId) -> Result<(), OrderUpdateError> {
            let store = self
                .store
                .get()
                .and_then(Weak::upgrade)
                .ok_or_else(|| OrderUpdateError::new(order_id, "store is gone"))?;
            let unit_id = *self
                .unit
                .get()
                .ok_or_else(|| OrderUpdateError::new(order_id, "no unit to read"))?;
            let unit = store
                .get_unit(unit_id)
                .await
                .map_err(|e| OrderUpdateError::new(order_id, e.to_string()))?
                .ok_or_else(|| OrderUpdateError::new(order_id, "unit missing"))?;
            self.seen.lock().unwrap().push(unit.state());
            Ok(())
        }
    }

    #[tokio::test]
    async fn order_recalculation_can_read_the_store_during_a_fill() {
        let orders = Arc::new(ReadingOrders::default());
        let store = Arc::new(InMemoryFulfillmentStore::new(orders.clone()));
        orders.store.set(Arc::downgrade(&store)).unwrap();
        let bus: Bus = Arc::new(InMemoryEventBus::new());
        let service = FulfillmentService::new(store.clone(), bus, FulfillmentConfig::default());

        let shipment = Shipment {
            id: ShipmentId::new(),
            order_id: OrderId::new(),
            stock_location_id: StockLocationId::new(),
            state: ShipmentState::Pending,
            currency: usd(),
        };
        store.upsert_shipment(shipment.clone()).await.unwrap();
        let unit = service
            .create_unit(CreateUnit {
                unit_id: InventoryUnitId::new(),
                variant_id: VariantId::new(),
                order_id: shipment.order_id,
                shipment_id: Some(shipment.id),
                initial_state: InventoryUnitState::Backordered,
                occurred_at: Utc::now(),
            })
            .await
            .unwrap();
        orders.unit.set(unit.id_typed()).unwrap();

        let outcome = tokio::time::timeout(
            StdDuration::from_secs(5),
            service.fill_backorder(unit.id_typed()),
        )
        .await
        .expect("fill_backorder did not finish")
        .unwrap();

        assert!(outcome.is_applied());
        assert_eq!(*orders.seen.lock().unwrap(), vec![InventoryUnitState::OnHand]);
    }

    #[tokio::test]
    async fn failed_side_effect_restores_the_previous_unit() {
        let f = setup_with(RecordingOrders::failing(), FulfillmentConfig::default());
        let before = unit(&f, InventoryUnitState::Backordered).await;

        let mut after = before.clone();
        fulfillment_events::execute(
            &mut after,
            &fulfillment_inventory::InventoryUnitCommand::FillBackorder(
                fulfillment_inventory::FillBackorder {
                    unit_id: before.id_typed(),
                    occurred_at: Utc::now(),
                },
            ),
        )
        .unwrap();

        let err = f
            .service
            .store()
            .commit_transition(
                &after,
                ExpectedVersion(before.version()),
                &[SideEffect::UpdateOrder],
            )
            .await
            .unwrap_err();

        assert!(matches!(err, StoreError::SideEffect(_)));
        assert_eq!(f.service.get_unit(before.id_typed()).await.unwrap(), before);

        // The restored unit still accepts a commit at its original version.
        f.service
            .store()
            .commit_transition(&after, ExpectedVersion(before.version()), &[])
            .await
            .unwrap();
        assert!(!f.service.get_unit(before.id_typed()).await.unwrap().is_backordered());
    }

    /// Store that finalizes one unit right after handing out a read of it, so the
    /// caller's commit races a concurrent write.
    struct RacingStore {
        inner: Arc<InMemoryFulfillmentStore>,
        target: InventoryUnitId,
        raced: AtomicBool,
    }

    #[async_trait]
    impl FulfillmentStore for RacingStore {
        async fn upsert_shipment(&self, shipment: Shipment) -> Result<(), StoreError> {
            self.inner.upsert_shipment(shipment).await
        }

        async fn get_shipment(&self, id: ShipmentId) -> Result<Option<Shipment>, StoreError> {
            self.inner.get_shipment(id).await
        }

        async fn upsert_stock_item(&self, item: StockItem) -> Result<(), StoreError> {
            self.inner.upsert_stock_item(item).await
        }

        async fn get_stock_item(&self, id: StockItemId) -> Result<Option<StockItem>, StoreError> {
            self.inner.get_stock_item(id).await
        }

        async fn upsert_shipping_method(&self, method: ShippingMethod) -> Result<(), StoreError> {
            self.inner.upsert_shipping_method(method).await
        }

        async fn insert_shipping_rate(&self, rate: ShippingRate) -> Result<(), StoreError> {
            self.inner.insert_shipping_rate(rate).await
        }

        async fn get_shipping_rate(
            &self,
            id: ShippingRateId,
        ) -> Result<Option<ShippingRate>, StoreError> {
            self.inner.get_shipping_rate(id).await
        }

        async fn shipping_rates(
            &self,
            shipment_id: ShipmentId,
            audience: Audience,
        ) -> Result<Vec<RateOption>, StoreError> {
            self.inner.shipping_rates(shipment_id, audience).await
        }

        async fn insert_unit(&self, unit: &InventoryUnit) -> Result<(), StoreError> {
            self.inner.insert_unit(unit).await
        }

        async fn get_unit(&self, id: InventoryUnitId) -> Result<Option<InventoryUnit>, StoreError> {
            let unit = self.inner.get_unit(id).await?;
            if id == self.target && !self.raced.swap(true, Ordering::SeqCst) {
                self.inner.finalize_units(&[id], Utc::now()).await?;
            }
            Ok(unit)
        }

        async fn commit_transition(
            &self,
            unit: &InventoryUnit,
            expected: ExpectedVersion,
            effects: &[SideEffect],
        ) -> Result<(), StoreError> {
            self.inner.commit_transition(unit, expected, effects).await
        }

        async fn finalize_units(
            &self,
            ids: &[InventoryUnitId],
            at: DateTime<Utc>,
        ) -> Result<usize, StoreError> {
            self.inner.finalize_units(ids, at).await
        }

        async fn pending_unit_ids(
            &self,
            shipment_id: ShipmentId,
        ) -> Result<Vec<InventoryUnitId>, StoreError> {
            self.inner.pending_unit_ids(shipment_id).await
        }

        async fn backordered_per_variant(
            &self,
            stock_item: &StockItem,
        ) -> Result<Vec<InventoryUnit>, StoreError> {
            self.inner.backordered_per_variant(stock_item).await
        }

        async fn backordered_for_stock_item(
            &self,
            stock_item: &StockItem,
        ) -> Result<Vec<InventoryUnit>, StoreError> {
            self.inner.backordered_for_stock_item(stock_item).await
        }

        async fn find_stock_item(
            &self,
            unit: &InventoryUnit,
        ) -> Result<Option<StockItem>, StoreError> {
            self.inner.find_stock_item(unit).await
        }
    }

    #[tokio::test]
    async fn process_backorders_skips_a_unit_written_while_it_was_being_filled() {
        let f = setup();
        let variant = VariantId::new();
        let location = StockLocationId::new();
        let item = stock_item(&f, variant, location).await;
        let open = shipment(&f, location, ShipmentState::Pending).await;
        let t0 = Utc::now();

        let backordered = InventoryUnitState::Backordered;
        let raced = unit_at(&f, &open, variant, backordered, t0).await;
        let second = unit_at(&f, &open, variant, backordered, t0 + Duration::seconds(1)).await;
        let third = unit_at(&f, &open, variant, backordered, t0 + Duration::seconds(2)).await;

        let racing = RacingStore {
            inner: f.service.store().clone(),
            target: raced.id_typed(),
            raced: AtomicBool::new(false),
        };
        let bus: Bus = Arc::new(InMemoryEventBus::new());
        let service = FulfillmentService::new(racing, bus, FulfillmentConfig::default());

        let filled = service.process_backorders(item.id, 2).await.unwrap();

        assert_eq!(ids(&filled), ids(&[second, third]));
        let raced = f.service.get_unit(raced.id_typed()).await.unwrap();
        assert!(raced.is_backordered());
        assert!(!raced.is_pending());
    }

    /// Bus whose every publish fails.
    struct FailingBus;

    impl EventBus<EventEnvelope<JsonValue>> for FailingBus {
        type Error = &'static str;

        fn publish(&self, _message: EventEnvelope<JsonValue>) -> Result<(), Self::Error> {
            Err("broker unavailable")
        }

        fn subscribe(&self) -> Subscription<EventEnvelope<JsonValue>> {
            Subscription::new(mpsc::channel().1)
        }
    }

    #[tokio::test]
    async fn failed_publish_still_reports_the_committed_transition() {
        let orders: Arc<dyn OrderRecalculator> = Arc::new(RecordingOrders::default());
        let store = Arc::new(InMemoryFulfillmentStore::new(orders));
        let service = FulfillmentService::new(store, FailingBus, FulfillmentConfig::default());

        let shipment = Shipment {
            id: ShipmentId::new(),
            order_id: OrderId::new(),
            stock_location_id: StockLocationId::new(),
            state: ShipmentState::Pending,
            currency: usd(),
        };
        service.store().upsert_shipment(shipment.clone()).await.unwrap();
        let unit = service
            .create_unit(CreateUnit {
                unit_id: InventoryUnitId::new(),
                variant_id: VariantId::new(),
                order_id: shipment.order_id,
                shipment_id: Some(shipment.id),
                initial_state: InventoryUnitState::OnHand,
                occurred_at: Utc::now(),
            })
            .await
            .unwrap();

        let outcome = service.ship(unit.id_typed()).await.unwrap();

        assert!(outcome.is_applied());
        assert_eq!(
            service.get_unit(unit.id_typed()).await.unwrap().state(),
            InventoryUnitState::Shipped
        );
    }

    #[tokio::test]
    async fn sequence_numbers_skip_versions_taken_by_finalize() {
        let f = setup();
        let unit = unit(&f, InventoryUnitState::OnHand).await;
        f.service.finalize_units(&[unit.id_typed()]).await.unwrap();
        f.service.ship(unit.id_typed()).await.unwrap();

        let summary: Vec<(String, u64)> = f
            .events
            .drain()
            .iter()
            .map(|e| (e.event_type().to_string(), e.sequence_number()))
            .collect();

        assert_eq!(
            summary,
            vec![
                ("inventory.unit.created".to_string(), 1),
                ("inventory.unit.shipped".to_string(), 3),
            ]
        );
    }
}
