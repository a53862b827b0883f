//! Postgres-backed fulfillment store.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError |
//! |------------|----------------------|------------|
//! | Database (unique violation) | `23505` | `Duplicate` |
//! | Database (serialization failure) | `40001` | `Concurrency` |
//! | Database (foreign key violation) | `23503` | `Missing` |
//! | Database (other) / pool / IO | any | `Database` |
//!
//! ## Concurrency
//!
//! `commit_transition` locks the unit row (`SELECT ... FOR UPDATE`), checks
//! `lock_version` against the expected version, writes the unit and records its
//! side effects on the same transaction before committing. Any failure rolls
//! the whole transaction back.
//!
//! ## Side effects
//!
//! `UpdateOrder` inserts a row into `order_recalculation_requests`, an outbox
//! the order service drains. The row commits if and only if the unit write
//! commits, and a transition holds a single pooled connection throughout.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{PgConnection, Row};
use tracing::{Span, instrument};
use uuid::Uuid;

use fulfillment_core::{
    Currency, ExpectedVersion, InventoryUnitId, OrderId, Shipment, ShipmentId, ShipmentState,
    ShippingMethodId, ShippingRateId, StockItem, StockItemId,
};
use fulfillment_inventory::{
    InventoryUnit, InventoryUnitSnapshot, InventoryUnitState, SideEffect,
};
use fulfillment_shipping::{Audience, DisplayOn, RateOption, ShippingMethod, ShippingRate};

use super::r#trait::{FulfillmentStore, StoreError};
use crate::order::OrderUpdateError;

const SCHEMA: &str = include_str!("../../migrations/0001_fulfillment.sql");

const UNIT_COLUMNS: &str = "u.id, u.variant_id, u.order_id, u.shipment_id, \
     u.return_authorization_id, u.pending, u.state, u.created_at, u.updated_at, u.lock_version";

/// Postgres-backed fulfillment store.
///
/// Cloning is cheap; clones share the connection pool.
#[derive(Debug, Clone)]
pub struct PostgresFulfillmentStore {
    pool: PgPool,
}

impl PostgresFulfillmentStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect a small pool to `database_url`.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the fulfillment tables if they do not exist yet.
    #[instrument(skip(self), err)]
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }

    async fn backordered(
        &self,
        stock_item: &StockItem,
        same_location: bool,
    ) -> Result<Vec<InventoryUnit>, StoreError> {
        let sql = format!(
            r#"
            SELECT {UNIT_COLUMNS}
            FROM inventory_units u
            JOIN shipments s ON s.id = u.shipment_id
            WHERE u.variant_id = $1
              AND u.state = 'backordered'
              AND s.state <> 'canceled'
              AND ($2 = FALSE OR s.stock_location_id = $3)
            ORDER BY u.created_at ASC, u.id ASC
            "#
        );

        let rows = sqlx::query(&sql)
            .bind(stock_item.variant_id.as_uuid())
            .bind(same_location)
            .bind(stock_item.stock_location_id.as_uuid())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("backordered", e))?;

        let units = rows.iter().map(unit_from_row).collect::<Result<Vec<_>, _>>()?;
        Span::current().record("unit_count", units.len());
        Ok(units)
    }
}

#[async_trait]
impl FulfillmentStore for PostgresFulfillmentStore {
    #[instrument(skip(self, shipment), fields(shipment_id = %shipment.id), err)]
    async fn upsert_shipment(&self, shipment: Shipment) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO shipments (id, order_id, stock_location_id, state, currency)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (id) DO UPDATE SET
                order_id = EXCLUDED.order_id,
                stock_location_id = EXCLUDED.stock_location_id,
                state = EXCLUDED.state,
                currency = EXCLUDED.currency
            "#,
        )
        .bind(shipment.id.as_uuid())
        .bind(shipment.order_id.as_uuid())
        .bind(shipment.stock_location_id.as_uuid())
        .bind(shipment.state.as_str())
        .bind(shipment.currency.code())
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("upsert_shipment", e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(shipment_id = %id), err)]
    async fn get_shipment(&self, id: ShipmentId) -> Result<Option<Shipment>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, order_id, stock_location_id, state, currency
            FROM shipments
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_shipment", e))?;

        row.as_ref().map(shipment_from_row).transpose()
    }

    #[instrument(skip(self, item), fields(stock_item_id = %item.id), err)]
    async fn upsert_stock_item(&self, item: StockItem) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO stock_items (
                id, variant_id, stock_location_id, count_on_hand, backorderable
            )
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (id) DO UPDATE SET
                variant_id = EXCLUDED.variant_id,
                stock_location_id = EXCLUDED.stock_location_id,
                count_on_hand = EXCLUDED.count_on_hand,
                backorderable = EXCLUDED.backorderable
            "#,
        )
        .bind(item.id.as_uuid())
        .bind(item.variant_id.as_uuid())
        .bind(item.stock_location_id.as_uuid())
        .bind(item.count_on_hand)
        .bind(item.backorderable)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("upsert_stock_item", e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(stock_item_id = %id), err)]
    async fn get_stock_item(&self, id: StockItemId) -> Result<Option<StockItem>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, variant_id, stock_location_id, count_on_hand, backorderable
            FROM stock_items
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_stock_item", e))?;

        row.as_ref().map(stock_item_from_row).transpose()
    }

    #[instrument(skip(self, method), fields(shipping_method_id = %method.id), err)]
    async fn upsert_shipping_method(&self, method: ShippingMethod) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO shipping_methods (id, name, display_on)
            VALUES ($1, $2, $3)
            ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                display_on = EXCLUDED.display_on
            "#,
        )
        .bind(method.id.as_uuid())
        .bind(&method.name)
        .bind(method.display_on.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("upsert_shipping_method", e))?;
        Ok(())
    }

    #[instrument(skip(self, rate), fields(shipping_rate_id = %rate.id_typed()), err)]
    async fn insert_shipping_rate(&self, rate: ShippingRate) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO shipping_rates (id, shipment_id, shipping_method_id, cost, selected)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(rate.id_typed().as_uuid())
        .bind(rate.shipment_id().as_uuid())
        .bind(rate.shipping_method_id().as_uuid())
        .bind(rate.cost())
        .bind(rate.is_selected())
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert_shipping_rate", e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(shipping_rate_id = %id), err)]
    async fn get_shipping_rate(
        &self,
        id: ShippingRateId,
    ) -> Result<Option<ShippingRate>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, shipment_id, shipping_method_id, cost, selected
            FROM shipping_rates
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_shipping_rate", e))?;

        row.as_ref().map(rate_from_row).transpose()
    }

    #[instrument(
        skip(self),
        fields(shipment_id = %shipment_id, audience = ?audience, rate_count),
        err
    )]
    async fn shipping_rates(
        &self,
        shipment_id: ShipmentId,
        audience: Audience,
    ) -> Result<Vec<RateOption>, StoreError> {
        let side = match audience {
            Audience::Frontend => DisplayOn::FrontEnd,
            Audience::Backend => DisplayOn::BackEnd,
        };

        let rows = sqlx::query(
            r#"
            SELECT r.id, r.shipment_id, r.shipping_method_id, r.cost, r.selected,
                   m.name, m.display_on
            FROM shipping_rates r
            JOIN shipping_methods m ON m.id = r.shipping_method_id
            WHERE r.shipment_id = $1
              AND m.display_on IN ('both', $2)
            ORDER BY r.cost ASC, r.id ASC
            "#,
        )
        .bind(shipment_id.as_uuid())
        .bind(side.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("shipping_rates", e))?;

        let mut options = Vec::with_capacity(rows.len());
        for row in &rows {
            let rate = rate_from_row(row)?;
            let display_on: String = get(row, "display_on")?;
            let method = ShippingMethod {
                id: rate.shipping_method_id(),
                name: get(row, "name")?,
                display_on: DisplayOn::parse(&display_on)
                    .ok_or_else(|| StoreError::Corrupt(format!("display_on '{display_on}'")))?,
            };
            options.push(RateOption { rate, method });
        }

        Span::current().record("rate_count", options.len());
        Ok(options)
    }

    #[instrument(skip(self, unit), fields(unit_id = %unit.id_typed()), err)]
    async fn insert_unit(&self, unit: &InventoryUnit) -> Result<(), StoreError> {
        let s = unit.snapshot();
        sqlx::query(
            r#"
            INSERT INTO inventory_units (
                id, variant_id, order_id, shipment_id, return_authorization_id,
                pending, state, created_at, updated_at, lock_version
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(s.id.as_uuid())
        .bind(s.variant_id.as_uuid())
        .bind(s.order_id.as_uuid())
        .bind(s.shipment_id.map(Uuid::from))
        .bind(s.return_authorization_id.map(Uuid::from))
        .bind(s.pending)
        .bind(s.state.as_str())
        .bind(s.created_at)
        .bind(s.updated_at)
        .bind(version_to_db(s.version)?)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert_unit", e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(unit_id = %id), err)]
    async fn get_unit(&self, id: InventoryUnitId) -> Result<Option<InventoryUnit>, StoreError> {
        let sql = format!("SELECT {UNIT_COLUMNS} FROM inventory_units u WHERE u.id = $1");
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_unit", e))?;

        row.as_ref().map(unit_from_row).transpose()
    }

    #[instrument(
        skip(self, unit, effects),
        fields(
            unit_id = %unit.id_typed(),
            state = %unit.state(),
            expected_version = ?expected
        ),
        err
    )]
    async fn commit_transition(
        &self,
        unit: &InventoryUnit,
        expected: ExpectedVersion,
        effects: &[SideEffect],
    ) -> Result<(), StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let current: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT lock_version
            FROM inventory_units
            WHERE id = $1
            FOR UPDATE
            "#,
        )
        .bind(unit.id_typed().as_uuid())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("lock_unit", e))?;

        let Some(current) = current else {
            tx.rollback().await.map_err(|e| map_sqlx_error("rollback", e))?;
            return Err(StoreError::Missing(format!("inventory unit {}", unit.id_typed())));
        };

        let current = version_from_db(current)?;
        if !expected.matches(current) {
            tx.rollback().await.map_err(|e| map_sqlx_error("rollback", e))?;
            return Err(StoreError::Concurrency(format!(
                "inventory unit {}: expected {expected:?}, found {current}",
                unit.id_typed()
            )));
        }

        let s = unit.snapshot();
        sqlx::query(
            r#"
            UPDATE inventory_units
            SET state = $2,
                pending = $3,
                shipment_id = $4,
                return_authorization_id = $5,
                updated_at = $6,
                lock_version = $7
            WHERE id = $1
            "#,
        )
        .bind(s.id.as_uuid())
        .bind(s.state.as_str())
        .bind(s.pending)
        .bind(s.shipment_id.map(Uuid::from))
        .bind(s.return_authorization_id.map(Uuid::from))
        .bind(s.updated_at)
        .bind(version_to_db(s.version)?)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("update_unit", e))?;

        for effect in effects {
            match effect {
                SideEffect::UpdateOrder => request_recalculation(&mut *tx, unit.order_id()).await?,
            }
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(())
    }

    #[instrument(skip(self, ids), fields(unit_count = ids.len()), err)]
    async fn finalize_units(
        &self,
        ids: &[InventoryUnitId],
        at: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }

        let ids: Vec<Uuid> = ids.iter().map(|id| *id.as_uuid()).collect();
        let result = sqlx::query(
            r#"
            UPDATE inventory_units
            SET pending = FALSE,
                updated_at = $2,
                lock_version = lock_version + 1
            WHERE id = ANY($1)
            "#,
        )
        .bind(&ids)
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("finalize_units", e))?;

        usize::try_from(result.rows_affected())
            .map_err(|e| StoreError::Database(format!("rows_affected overflow: {e}")))
    }

    #[instrument(skip(self), fields(shipment_id = %shipment_id), err)]
    async fn pending_unit_ids(
        &self,
        shipment_id: ShipmentId,
    ) -> Result<Vec<InventoryUnitId>, StoreError> {
        let ids: Vec<Uuid> = sqlx::query_scalar(
            r#"
            SELECT id
            FROM inventory_units
            WHERE shipment_id = $1 AND pending = TRUE
            ORDER BY id ASC
            "#,
        )
        .bind(shipment_id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("pending_unit_ids", e))?;

        Ok(ids.into_iter().map(InventoryUnitId::from_uuid).collect())
    }

    #[instrument(
        skip(self, stock_item),
        fields(variant_id = %stock_item.variant_id, unit_count),
        err
    )]
    async fn backordered_per_variant(
        &self,
        stock_item: &StockItem,
    ) -> Result<Vec<InventoryUnit>, StoreError> {
        self.backordered(stock_item, false).await
    }

    #[instrument(skip(self, stock_item), fields(stock_item_id = %stock_item.id, unit_count), err)]
    async fn backordered_for_stock_item(
        &self,
        stock_item: &StockItem,
    ) -> Result<Vec<InventoryUnit>, StoreError> {
        self.backordered(stock_item, true).await
    }

    #[instrument(skip(self, unit), fields(unit_id = %unit.id_typed()), err)]
    async fn find_stock_item(&self, unit: &InventoryUnit) -> Result<Option<StockItem>, StoreError> {
        let Some(shipment_id) = unit.shipment_id() else {
            return Ok(None);
        };

        let row = sqlx::query(
            r#"
            SELECT i.id, i.variant_id, i.stock_location_id, i.count_on_hand, i.backorderable
            FROM stock_items i
            JOIN shipments s ON s.stock_location_id = i.stock_location_id
            WHERE s.id = $1 AND i.variant_id = $2
            "#,
        )
        .bind(shipment_id.as_uuid())
        .bind(unit.variant_id().as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_stock_item", e))?;

        row.as_ref().map(stock_item_from_row).transpose()
    }
}

/// Queue an order recalculation on the caller's connection (normally an open
/// transaction).
async fn request_recalculation(
    conn: &mut PgConnection,
    order_id: OrderId,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO order_recalculation_requests (order_id)
        VALUES ($1)
        "#,
    )
    .bind(order_id.as_uuid())
    .execute(conn)
    .await
    .map_err(|e| StoreError::SideEffect(OrderUpdateError::new(order_id, e.to_string())))?;
    Ok(())
}

fn get<'r, T>(row: &'r PgRow, column: &str) -> Result<T, StoreError>
where
    T: sqlx::Decode<'r, sqlx::Postgres> + sqlx::Type<sqlx::Postgres>,
{
    row.try_get(column)
        .map_err(|e| StoreError::Corrupt(format!("column '{column}': {e}")))
}

fn version_to_db(version: u64) -> Result<i64, StoreError> {
    i64::try_from(version)
        .map_err(|_| StoreError::Corrupt(format!("version {version} out of range")))
}

fn version_from_db(version: i64) -> Result<u64, StoreError> {
    u64::try_from(version)
        .map_err(|_| StoreError::Corrupt(format!("negative lock_version {version}")))
}

fn unit_from_row(row: &PgRow) -> Result<InventoryUnit, StoreError> {
    let state: String = get(row, "state")?;
    let shipment_id: Option<Uuid> = get(row, "shipment_id")?;
    let return_authorization_id: Option<Uuid> = get(row, "return_authorization_id")?;

    Ok(InventoryUnit::restore(InventoryUnitSnapshot {
        id: InventoryUnitId::from_uuid(get(row, "id")?),
        variant_id: get::<Uuid>(row, "variant_id")?.into(),
        order_id: get::<Uuid>(row, "order_id")?.into(),
        shipment_id: shipment_id.map(Into::into),
        return_authorization_id: return_authorization_id.map(Into::into),
        pending: get(row, "pending")?,
        state: InventoryUnitState::parse(&state)
            .ok_or_else(|| StoreError::Corrupt(format!("inventory unit state '{state}'")))?,
        created_at: get(row, "created_at")?,
        updated_at: get(row, "updated_at")?,
        version: version_from_db(get(row, "lock_version")?)?,
    }))
}

fn shipment_from_row(row: &PgRow) -> Result<Shipment, StoreError> {
    let state: String = get(row, "state")?;
    let currency: String = get(row, "currency")?;

    Ok(Shipment {
        id: get::<Uuid>(row, "id")?.into(),
        order_id: get::<Uuid>(row, "order_id")?.into(),
        stock_location_id: get::<Uuid>(row, "stock_location_id")?.into(),
        state: ShipmentState::parse(&state)
            .ok_or_else(|| StoreError::Corrupt(format!("shipment state '{state}'")))?,
        currency: Currency::new(&currency)
            .map_err(|e| StoreError::Corrupt(format!("shipment currency: {e}")))?,
    })
}

fn stock_item_from_row(row: &PgRow) -> Result<StockItem, StoreError> {
    Ok(StockItem {
        id: get::<Uuid>(row, "id")?.into(),
        variant_id: get::<Uuid>(row, "variant_id")?.into(),
        stock_location_id: get::<Uuid>(row, "stock_location_id")?.into(),
        count_on_hand: get(row, "count_on_hand")?,
        backorderable: get(row, "backorderable")?,
    })
}

fn rate_from_row(row: &PgRow) -> Result<ShippingRate, StoreError> {
    let cost: Decimal = get(row, "cost")?;
    ShippingRate::new(
        ShippingRateId::from_uuid(get(row, "id")?),
        get::<Uuid>(row, "shipment_id")?.into(),
        ShippingMethodId::from_uuid(get(row, "shipping_method_id")?),
        cost,
        get(row, "selected")?,
    )
    .map_err(|e| StoreError::Corrupt(format!("shipping rate: {e}")))
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => StoreError::Duplicate(msg),
                Some("40001") => StoreError::Concurrency(msg),
                Some("23503") => StoreError::Missing(msg),
                _ => StoreError::Database(msg),
            }
        }
        other => StoreError::Database(format!("{operation}: {other}")),
    }
}
