//! Shipping rates and their customer-facing prices.
//!
//! A [`ShippingRate`] is one priced option (a [`ShippingMethod`]) computed for a
//! shipment. This crate owns the display-price formula and the audience scopes
//! used by checkout (frontend) and admin (backend) screens. Pure domain logic:
//! store-wide settings arrive as an explicit [`VatPolicy`].

pub mod method;
pub mod pricing;
pub mod rate;
pub mod scope;

pub use method::{DisplayOn, ShippingMethod};
pub use pricing::VatPolicy;
pub use rate::ShippingRate;
pub use scope::{Audience, RateOption, backend, frontend, scoped};
