//! Shared domain types for Tether.
//!
//! This crate contains the types exchanged between the correlation core,
//! its storage adapters and the HTTP ingress: executions and their
//! resolution outcomes, webhook subscriptions and listeners, inbound
//! deliveries, timers, bus events and configuration.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod config;
pub mod delivery;
pub mod error;
pub mod event;
pub mod execution;
pub mod step;
pub mod subscription;
pub mod timer;
