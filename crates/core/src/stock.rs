//! Stock item snapshot: one variant held at one stock location.

use serde::{Deserialize, Serialize};

use crate::entity::Entity;
use crate::id::{StockItemId, StockLocationId, VariantId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockItem {
    pub id: StockItemId,
    pub variant_id: VariantId,
    pub stock_location_id: StockLocationId,
    pub count_on_hand: i64,
    pub backorderable: bool,
}

impl StockItem {
    /// True when this record describes `variant_id` held at `stock_location_id`.
    pub fn holds(&self, variant_id: VariantId, stock_location_id: StockLocationId) -> bool {
        self.variant_id == variant_id && self.stock_location_id == stock_location_id
    }
}

impl Entity for StockItem {
    type Id = StockItemId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}
