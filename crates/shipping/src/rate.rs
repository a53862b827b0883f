use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use fulfillment_core::{
    Currency, DomainError, DomainResult, Entity, Money, ShipmentId, ShippingMethodId,
    ShippingRateId,
};

use crate::method::ShippingMethod;
use crate::pricing::VatPolicy;

/// A priced shipping option attached to a shipment.
///
/// Read-only once calculated, apart from which rate the customer selected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShippingRate {
    id: ShippingRateId,
    shipment_id: ShipmentId,
    shipping_method_id: ShippingMethodId,
    cost: Decimal,
    selected: bool,
}

impl ShippingRate {
    pub fn new(
        id: ShippingRateId,
        shipment_id: ShipmentId,
        shipping_method_id: ShippingMethodId,
        cost: Decimal,
        selected: bool,
    ) -> DomainResult<Self> {
        if cost.is_sign_negative() && !cost.is_zero() {
            return Err(DomainError::validation(format!(
                "shipping rate cost cannot be negative, got {cost}"
            )));
        }
        Ok(Self {
            id,
            shipment_id,
            shipping_method_id,
            cost,
            selected,
        })
    }

    pub fn id_typed(&self) -> ShippingRateId {
        self.id
    }

    pub fn shipment_id(&self) -> ShipmentId {
        self.shipment_id
    }

    pub fn shipping_method_id(&self) -> ShippingMethodId {
        self.shipping_method_id
    }

    pub fn cost(&self) -> Decimal {
        self.cost
    }

    pub fn is_selected(&self) -> bool {
        self.selected
    }

    /// Name of the rate, taken from its shipping method.
    ///
    /// `None` when `method` is not this rate's method.
    pub fn name<'a>(&self, method: &'a ShippingMethod) -> Option<&'a str> {
        (method.id == self.shipping_method_id).then_some(method.name.as_str())
    }

    /// Customer-facing price in the order's currency.
    ///
    /// `cost * (1 + default_tax_rate)` when prices include VAT, `cost` otherwise,
    /// rounded half-to-even to the currency's minor unit.
    ///
    /// Fails only when the VAT-inclusive amount overflows.
    pub fn display_price(&self, policy: &VatPolicy, currency: &Currency) -> DomainResult<Money> {
        Ok(Money::new(policy.gross(self.cost)?, currency.clone()))
    }

    /// Alias of [`ShippingRate::display_price`].
    pub fn display_cost(&self, policy: &VatPolicy, currency: &Currency) -> DomainResult<Money> {
        self.display_price(policy, currency)
    }
}

impl Entity for ShippingRate {
    type Id = ShippingRateId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}
