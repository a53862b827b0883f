//! Fulfillment persistence boundary.
//!
//! One trait ([`FulfillmentStore`]) with an in-memory implementation for tests
//! and development and a Postgres implementation for production.

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::InMemoryFulfillmentStore;
pub use postgres::PostgresFulfillmentStore;
pub use r#trait::{FulfillmentStore, StoreError};
