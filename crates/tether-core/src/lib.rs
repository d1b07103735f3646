//! The external-event correlation core for Tether.
//!
//! Lets a workflow step suspend after starting a side effect and resume
//! exactly once, when either a matching inbound delivery arrives or a
//! timer expires first. Also owns the lifecycle of shared remote webhook
//! registrations.
//!
//! This crate defines the "ports" (repository and provider traits) that
//! the infrastructure layer implements. It depends only on `tether-types`
//! -- never on `tether-infra` or any database/IO crate.

pub mod event;
pub mod repository;
pub mod resolution;
pub mod service;
pub mod step;
pub mod webhook;

#[cfg(test)]
pub(crate) mod testing;
