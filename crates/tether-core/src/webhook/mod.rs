//! Inbound side of the correlation core.
//!
//! - `signature` -- delivery verification and secret generation
//! - `provider` -- the `WebhookProvider` port, its boxed wrapper and registry
//! - `subscription` -- shared remote registrations with reference counting
//! - `expression` -- JEXL evaluation of `when` filter clauses
//! - `filter` -- per-listener delivery filtering
//! - `router` -- delivery -> verified envelope -> routed intents

pub mod expression;
pub mod filter;
pub mod provider;
pub mod router;
pub mod signature;
pub mod subscription;

pub use filter::FilterEngine;
pub use provider::{BoxWebhookProvider, ProviderError, ProviderRegistry, WebhookProvider};
pub use router::{EventRouter, RouteError};
pub use signature::SignatureError;
pub use subscription::{SubscriptionError, SubscriptionHandle, SubscriptionManager};
