//! Domain events and their distribution.
//!
//! Aggregates describe what happened as typed events; stores wrap committed
//! events in an [`EventEnvelope`] and publish them on an [`EventBus`] for
//! downstream consumers (order workflows, audit trails).

pub mod bus;
pub mod envelope;
pub mod event;
pub mod handler;
pub mod in_memory_bus;

pub use bus::{EventBus, Subscription};
pub use envelope::EventEnvelope;
pub use event::Event;
pub use handler::execute;
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
