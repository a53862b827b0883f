//! VAT handling for displayed shipping prices.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use fulfillment_core::{DomainError, DomainResult};

/// Store-wide VAT settings, read at decision time and passed in explicitly.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VatPolicy {
    /// Displayed shipping prices include VAT.
    pub prices_include_vat: bool,
    /// Default tax rate as a fraction (`0.20` for 20%).
    pub default_tax_rate: Decimal,
}

impl VatPolicy {
    pub fn new(prices_include_vat: bool, default_tax_rate: Decimal) -> DomainResult<Self> {
        if default_tax_rate.is_sign_negative() && !default_tax_rate.is_zero() {
            return Err(DomainError::validation(format!(
                "default tax rate cannot be negative, got {default_tax_rate}"
            )));
        }
        Ok(Self {
            prices_include_vat,
            default_tax_rate,
        })
    }

    /// Policy that leaves costs untouched.
    pub fn excluding_vat() -> Self {
        Self::default()
    }

    /// Unrounded displayed amount for a net `cost`.
    ///
    /// Fails when the VAT-inclusive amount does not fit in a `Decimal`.
    pub fn gross(&self, cost: Decimal) -> DomainResult<Decimal> {
        if !self.prices_include_vat {
            return Ok(cost);
        }
        Decimal::ONE
            .checked_add(self.default_tax_rate)
            .and_then(|factor| factor.checked_mul(cost))
            .ok_or_else(|| {
                DomainError::validation(format!(
                    "{cost} with a {} tax rate is out of range",
                    self.default_tax_rate
                ))
            })
    }
}
