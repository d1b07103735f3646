//! Webhook provider adapters.
//!
//! - `http` -- generic REST webhook registry (reqwest)
//! - `static_endpoint` -- fixed endpoint without a remote object
//! - `envelope` -- JSON-pointer envelope extraction shared by both

pub mod envelope;
pub mod http;
pub mod static_endpoint;

pub use http::HttpWebhookProvider;
pub use static_endpoint::StaticEndpointProvider;

use tether_core::webhook::{ProviderError, ProviderRegistry};
use tether_types::config::{ProviderConfig, ProviderKind};

/// Build a registry holding one provider per `[[providers]]` entry.
pub fn build_registry(configs: &[ProviderConfig]) -> Result<ProviderRegistry, ProviderError> {
    let registry = ProviderRegistry::new();
    for config in configs {
        match config.kind {
            ProviderKind::Http => registry.register(HttpWebhookProvider::from_config(config)?),
            ProviderKind::Static => registry.register(StaticEndpointProvider::from_config(config)),
        }
    }
    Ok(registry)
}
