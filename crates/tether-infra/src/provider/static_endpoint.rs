//! Provider for systems that post to a fixed, pre-configured endpoint.
//!
//! There is no remote object to create or delete: registration only mints
//! the local binding and secret, and the operator configures the callback
//! URL on the external side once. Such a target accepts exactly one
//! registration, so incompatible configurations conflict.

use std::collections::HashMap;

use tether_core::webhook::WebhookProvider;
use tether_core::webhook::provider::{ProviderError, RemoteRegistration};
use tether_types::config::{EnvelopeConfig, ProviderConfig};
use tether_types::delivery::EventEnvelope;
use tether_types::subscription::{ExternalTarget, SignatureScheme};

use super::envelope::extract_envelope;

#[derive(Debug, Clone)]
pub struct StaticEndpointProvider {
    name: String,
    signature_header: String,
    envelope: EnvelopeConfig,
}

impl StaticEndpointProvider {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            signature_header: "x-signature".to_string(),
            envelope: EnvelopeConfig::default(),
        }
    }

    pub fn from_config(config: &ProviderConfig) -> Self {
        Self {
            name: config.name.clone(),
            signature_header: config.signature_header.to_ascii_lowercase(),
            envelope: config.envelope.clone(),
        }
    }
}

impl WebhookProvider for StaticEndpointProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn scheme(&self) -> SignatureScheme {
        SignatureScheme::HmacSha256 {
            header: self.signature_header.clone(),
        }
    }

    fn allows_multiple_registrations(&self) -> bool {
        false
    }

    async fn register(
        &self,
        registration: &RemoteRegistration,
    ) -> Result<Option<String>, ProviderError> {
        tracing::info!(
            provider = %self.name,
            external_target = %registration.target,
            callback_url = %registration.callback_url,
            "static endpoint bound; configure the callback on the external side"
        );
        Ok(None)
    }

    async fn update(
        &self,
        _remote_id: Option<&str>,
        _registration: &RemoteRegistration,
    ) -> Result<(), ProviderError> {
        Ok(())
    }

    async fn unregister(
        &self,
        _target: &ExternalTarget,
        _remote_id: Option<&str>,
    ) -> Result<(), ProviderError> {
        Ok(())
    }

    fn parse_envelope(
        &self,
        headers: &HashMap<String, String>,
        body: &[u8],
    ) -> Result<EventEnvelope, ProviderError> {
        extract_envelope(&self.envelope, headers, body)
    }
}
