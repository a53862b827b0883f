//! Configuration loading and representation.
//!
//! Store-wide settings come from the environment:
//!
//! | variable | type | default |
//! |---|---|---|
//! | `FULFILLMENT_ALLOW_BACKORDER_SHIPPING` | bool | `false` |
//! | `FULFILLMENT_SHIPMENT_INC_VAT` | bool | `false` |
//! | `FULFILLMENT_DEFAULT_TAX_RATE` | decimal fraction, `>= 0` | `0` |
//! | `DATABASE_URL` | Postgres URL | unset |
//!
//! Malformed values are errors rather than silently falling back.

use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use fulfillment_inventory::TransitionContext;
use fulfillment_shipping::VatPolicy;

pub const ENV_ALLOW_BACKORDER_SHIPPING: &str = "FULFILLMENT_ALLOW_BACKORDER_SHIPPING";
pub const ENV_SHIPMENT_INC_VAT: &str = "FULFILLMENT_SHIPMENT_INC_VAT";
pub const ENV_DEFAULT_TAX_RATE: &str = "FULFILLMENT_DEFAULT_TAX_RATE";
pub const ENV_DATABASE_URL: &str = "DATABASE_URL";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var}: expected a boolean, got '{value}'")]
    InvalidBool { var: &'static str, value: String },

    #[error("{var}: expected a non-negative decimal, got '{value}'")]
    InvalidDecimal { var: &'static str, value: String },
}

/// Store-wide fulfillment settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FulfillmentConfig {
    /// Inventory units may ship while backordered.
    pub allow_backorder_shipping: bool,
    /// Displayed shipping prices include VAT.
    pub shipment_inc_vat: bool,
    /// Default tax rate as a fraction (`0.20` for 20%).
    pub default_tax_rate: Decimal,
    pub database_url: Option<String>,
}

impl FulfillmentConfig {
    /// Load from process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load using an arbitrary variable lookup (tests, layered sources).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let allow_backorder_shipping = match lookup(ENV_ALLOW_BACKORDER_SHIPPING) {
            Some(v) => parse_bool(ENV_ALLOW_BACKORDER_SHIPPING, &v)?,
            None => false,
        };

        let shipment_inc_vat = match lookup(ENV_SHIPMENT_INC_VAT) {
            Some(v) => parse_bool(ENV_SHIPMENT_INC_VAT, &v)?,
            None => false,
        };

        let default_tax_rate = match lookup(ENV_DEFAULT_TAX_RATE) {
            Some(v) => parse_rate(ENV_DEFAULT_TAX_RATE, &v)?,
            None => {
                if shipment_inc_vat {
                    tracing::warn!(
                        "{ENV_SHIPMENT_INC_VAT} is set but {ENV_DEFAULT_TAX_RATE} is not; using 0"
                    );
                }
                Decimal::ZERO
            }
        };

        let database_url = lookup(ENV_DATABASE_URL).filter(|v| !v.trim().is_empty());

        Ok(Self {
            allow_backorder_shipping,
            shipment_inc_vat,
            default_tax_rate,
            database_url,
        })
    }

    /// Guard inputs for inventory unit transitions.
    pub fn transition_context(&self) -> TransitionContext {
        TransitionContext {
            allow_backorder_shipping: self.allow_backorder_shipping,
        }
    }

    /// VAT settings for shipping rate display prices.
    pub fn vat_policy(&self) -> VatPolicy {
        VatPolicy {
            prices_include_vat: self.shipment_inc_vat,
            default_tax_rate: self.default_tax_rate,
        }
    }
}

fn parse_bool(var: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidBool {
            var,
            value: value.to_string(),
        }),
    }
}

fn parse_rate(var: &'static str, value: &str) -> Result<Decimal, ConfigError> {
    let invalid = || ConfigError::InvalidDecimal {
        var,
        value: value.to_string(),
    };
    let rate = Decimal::from_str(value.trim()).map_err(|_| invalid())?;
    if rate < Decimal::ZERO {
        return Err(invalid());
    }
    Ok(rate)
}
