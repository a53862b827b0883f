//! Order recalculation collaborator.
//!
//! Filling a backorder changes what an order can ship, so the owning order must
//! recalculate its totals and states. Orders live outside this crate. The
//! in-memory store calls an [`OrderRecalculator`] right after writing the unit
//! and restores the previous unit if it fails. The Postgres store records the
//! request in its `order_recalculation_requests` outbox inside the transition's
//! transaction.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use fulfillment_core::OrderId;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("order {order_id} could not be updated: {reason}")]
pub struct OrderUpdateError {
    pub order_id: OrderId,
    pub reason: String,
}

impl OrderUpdateError {
    pub fn new(order_id: OrderId, reason: impl Into<String>) -> Self {
        Self {
            order_id,
            reason: reason.into(),
        }
    }
}

/// Asks an order to recalculate itself.
///
/// Implementations must be idempotent: recalculating an order twice yields the
/// same order as recalculating it once.
///
/// A recalculator may read through the store that calls it (units, shipments,
/// stock items) and sees the transitioned unit in its new state. It must not
/// fire transitions or finalize units: the store holds its commit lock for the
/// duration of the call.
#[async_trait]
pub trait OrderRecalculator: Send + Sync {
    async fn recalculate(&self, order_id: OrderId) -> Result<(), OrderUpdateError>;
}

#[async_trait]
impl<R> OrderRecalculator for Arc<R>
where
    R: OrderRecalculator + ?Sized,
{
    async fn recalculate(&self, order_id: OrderId) -> Result<(), OrderUpdateError> {
        (**self).recalculate(order_id).await
    }
}
