//! Infrastructure layer: configuration, persistence, order collaborator and
//! the fulfillment service that ties them to the domain crates.

pub mod config;
pub mod order;
pub mod service;
pub mod store;

#[cfg(test)]
mod integration_tests;

pub use config::{ConfigError, FulfillmentConfig};
pub use order::{OrderRecalculator, OrderUpdateError};
pub use service::{FulfillmentError, FulfillmentService, PricedRate, TransitionOutcome};
pub use store::{
    FulfillmentStore, InMemoryFulfillmentStore, PostgresFulfillmentStore, StoreError,
};
