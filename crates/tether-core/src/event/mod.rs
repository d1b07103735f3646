//! Event bus for correlation lifecycle events.
//!
//! Provides an `EventBus` that distributes `CorrelationEvent` messages to
//! all subscribers via a `tokio::sync::broadcast` channel.

pub mod bus;

pub use bus::EventBus;
