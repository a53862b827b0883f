//! Audience scopes over shipping rates.

use serde::{Deserialize, Serialize};

use crate::method::ShippingMethod;
use crate::rate::ShippingRate;

/// Who is looking at the rates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Audience {
    /// Customer-facing checkout.
    Frontend,
    /// Admin / back-office.
    Backend,
}

/// A rate together with the shipping method it prices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateOption {
    pub rate: ShippingRate,
    pub method: ShippingMethod,
}

/// Rates whose method is visible to `audience`, cheapest first.
///
/// Equal costs are ordered by rate id so the result does not depend on the
/// input order.
pub fn scoped(
    options: impl IntoIterator<Item = RateOption>,
    audience: Audience,
) -> Vec<RateOption> {
    let mut visible: Vec<RateOption> = options
        .into_iter()
        .filter(|o| o.method.display_on.visible_to(audience))
        .collect();
    visible.sort_by(|a, b| {
        a.rate
            .cost()
            .cmp(&b.rate.cost())
            .then_with(|| a.rate.id_typed().cmp(&b.rate.id_typed()))
    });
    visible
}

pub fn frontend(options: impl IntoIterator<Item = RateOption>) -> Vec<RateOption> {
    scoped(options, Audience::Frontend)
}

pub fn backend(options: impl IntoIterator<Item = RateOption>) -> Vec<RateOption> {
    scoped(options, Audience::Backend)
}
