//! HTTP ingress for Tether.
//!
//! Axum server receiving webhook deliveries at `/webhooks/{binding_key}`,
//! envelope response format, and CORS support.

pub mod error;
pub mod handlers;
pub mod response;
pub mod router;
