//! WebhookProvider trait, its object-safe wrapper and the provider registry.
//!
//! A provider is the vendor seam of the correlation core: it knows how to
//! create, update and delete a remote webhook registration, how to decide
//! whether two configurations can share one registration, and how to pull
//! the filter-relevant `EventEnvelope` out of a vendor body. The core never
//! branches on vendor identity.
//!
//! Dynamic dispatch follows the blanket-impl pattern:
//! 1. `WebhookProviderDyn` is object-safe with boxed futures
//! 2. every `T: WebhookProvider` implements it
//! 3. `BoxWebhookProvider` wraps `Box<dyn WebhookProviderDyn>` and delegates

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use tether_types::delivery::EventEnvelope;
use tether_types::subscription::{ExternalTarget, SignatureScheme};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("remote rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("remote registration not found")]
    NotFound,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("malformed delivery body: {0}")]
    Parse(String),
}

/// How an existing registration relates to a newly desired configuration.
#[derive(Debug, Clone, PartialEq)]
pub enum MergeDecision {
    /// The existing registration already satisfies the request.
    Unchanged,
    /// A combined configuration satisfies both; push it remotely.
    Merged(Value),
    /// The two configurations cannot share a registration.
    Conflict,
}

/// Everything a provider needs to create or update a remote registration.
#[derive(Debug, Clone)]
pub struct RemoteRegistration {
    pub target: ExternalTarget,
    pub config: Value,
    /// `{public_base_url}/webhooks/{binding_key}`.
    pub callback_url: String,
    /// Secret the remote must sign or present with each delivery.
    pub secret: Option<String>,
}

// ---------------------------------------------------------------------------
// WebhookProvider
// ---------------------------------------------------------------------------

/// Vendor adapter for remote webhook registrations.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait WebhookProvider: Send + Sync {
    /// Registered provider name, matching `ExternalTarget::provider`.
    fn name(&self) -> &str;

    /// Authentication scheme deliveries from this provider carry.
    fn scheme(&self) -> SignatureScheme;

    /// Whether a registration made with `existing` serves a node asking
    /// for `desired`.
    fn compare_config(&self, existing: &Value, desired: &Value) -> bool {
        existing == desired
    }

    /// Reconcile an existing registration's configuration with a new request.
    fn reconcile(&self, existing: &Value, desired: &Value) -> MergeDecision {
        if self.compare_config(existing, desired) {
            MergeDecision::Unchanged
        } else {
            MergeDecision::Conflict
        }
    }

    /// Whether the external system allows more than one registration per target.
    fn allows_multiple_registrations(&self) -> bool {
        true
    }

    /// Create the remote registration. Returns the remote id, if the
    /// external system assigns one.
    fn register(
        &self,
        registration: &RemoteRegistration,
    ) -> impl Future<Output = Result<Option<String>, ProviderError>> + Send;

    /// Push a changed configuration to an existing registration.
    fn update(
        &self,
        remote_id: Option<&str>,
        registration: &RemoteRegistration,
    ) -> impl Future<Output = Result<(), ProviderError>> + Send;

    /// Delete the remote registration.
    fn unregister(
        &self,
        target: &ExternalTarget,
        remote_id: Option<&str>,
    ) -> impl Future<Output = Result<(), ProviderError>> + Send;

    /// Extract the filter-relevant envelope from a verified delivery.
    fn parse_envelope(
        &self,
        headers: &HashMap<String, String>,
        body: &[u8],
    ) -> Result<EventEnvelope, ProviderError>;

    /// Resolve a resource id to its name for id-based filters.
    fn resolve_resource(
        &self,
        _attribute: &str,
        _id: &str,
    ) -> impl Future<Output = Result<Option<String>, ProviderError>> + Send {
        async { Ok(None) }
    }
}

// ---------------------------------------------------------------------------
// Dynamic dispatch
// ---------------------------------------------------------------------------

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Object-safe version of [`WebhookProvider`].
pub trait WebhookProviderDyn: Send + Sync {
    fn name(&self) -> &str;
    fn scheme(&self) -> SignatureScheme;
    fn compare_config(&self, existing: &Value, desired: &Value) -> bool;
    fn reconcile(&self, existing: &Value, desired: &Value) -> MergeDecision;
    fn allows_multiple_registrations(&self) -> bool;

    fn register_boxed<'a>(
        &'a self,
        registration: &'a RemoteRegistration,
    ) -> BoxFuture<'a, Result<Option<String>, ProviderError>>;

    fn update_boxed<'a>(
        &'a self,
        remote_id: Option<&'a str>,
        registration: &'a RemoteRegistration,
    ) -> BoxFuture<'a, Result<(), ProviderError>>;

    fn unregister_boxed<'a>(
        &'a self,
        target: &'a ExternalTarget,
        remote_id: Option<&'a str>,
    ) -> BoxFuture<'a, Result<(), ProviderError>>;

    fn parse_envelope(
        &self,
        headers: &HashMap<String, String>,
        body: &[u8],
    ) -> Result<EventEnvelope, ProviderError>;

    fn resolve_resource_boxed<'a>(
        &'a self,
        attribute: &'a str,
        id: &'a str,
    ) -> BoxFuture<'a, Result<Option<String>, ProviderError>>;
}

impl<T: WebhookProvider> WebhookProviderDyn for T {
    fn name(&self) -> &str {
        WebhookProvider::name(self)
    }

    fn scheme(&self) -> SignatureScheme {
        WebhookProvider::scheme(self)
    }

    fn compare_config(&self, existing: &Value, desired: &Value) -> bool {
        WebhookProvider::compare_config(self, existing, desired)
    }

    fn reconcile(&self, existing: &Value, desired: &Value) -> MergeDecision {
        WebhookProvider::reconcile(self, existing, desired)
    }

    fn allows_multiple_registrations(&self) -> bool {
        WebhookProvider::allows_multiple_registrations(self)
    }

    fn register_boxed<'a>(
        &'a self,
        registration: &'a RemoteRegistration,
    ) -> BoxFuture<'a, Result<Option<String>, ProviderError>> {
        Box::pin(self.register(registration))
    }

    fn update_boxed<'a>(
        &'a self,
        remote_id: Option<&'a str>,
        registration: &'a RemoteRegistration,
    ) -> BoxFuture<'a, Result<(), ProviderError>> {
        Box::pin(self.update(remote_id, registration))
    }

    fn unregister_boxed<'a>(
        &'a self,
        target: &'a ExternalTarget,
        remote_id: Option<&'a str>,
    ) -> BoxFuture<'a, Result<(), ProviderError>> {
        Box::pin(self.unregister(target, remote_id))
    }

    fn parse_envelope(
        &self,
        headers: &HashMap<String, String>,
        body: &[u8],
    ) -> Result<EventEnvelope, ProviderError> {
        WebhookProvider::parse_envelope(self, headers, body)
    }

    fn resolve_resource_boxed<'a>(
        &'a self,
        attribute: &'a str,
        id: &'a str,
    ) -> BoxFuture<'a, Result<Option<String>, ProviderError>> {
        Box::pin(self.resolve_resource(attribute, id))
    }
}

/// Type-erased provider for runtime selection by name.
pub struct BoxWebhookProvider {
    inner: Box<dyn WebhookProviderDyn>,
}

impl BoxWebhookProvider {
    pub fn new<T: WebhookProvider + 'static>(provider: T) -> Self {
        Self {
            inner: Box::new(provider),
        }
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub fn scheme(&self) -> SignatureScheme {
        self.inner.scheme()
    }

    pub fn compare_config(&self, existing: &Value, desired: &Value) -> bool {
        self.inner.compare_config(existing, desired)
    }

    pub fn reconcile(&self, existing: &Value, desired: &Value) -> MergeDecision {
        self.inner.reconcile(existing, desired)
    }

    pub fn allows_multiple_registrations(&self) -> bool {
        self.inner.allows_multiple_registrations()
    }

    pub async fn register(
        &self,
        registration: &RemoteRegistration,
    ) -> Result<Option<String>, ProviderError> {
        self.inner.register_boxed(registration).await
    }

    pub async fn update(
        &self,
        remote_id: Option<&str>,
        registration: &RemoteRegistration,
    ) -> Result<(), ProviderError> {
        self.inner.update_boxed(remote_id, registration).await
    }

    pub async fn unregister(
        &self,
        target: &ExternalTarget,
        remote_id: Option<&str>,
    ) -> Result<(), ProviderError> {
        self.inner.unregister_boxed(target, remote_id).await
    }

    pub fn parse_envelope(
        &self,
        headers: &HashMap<String, String>,
        body: &[u8],
    ) -> Result<EventEnvelope, ProviderError> {
        self.inner.parse_envelope(headers, body)
    }

    pub async fn resolve_resource(
        &self,
        attribute: &str,
        id: &str,
    ) -> Result<Option<String>, ProviderError> {
        self.inner.resolve_resource_boxed(attribute, id).await
    }
}

impl std::fmt::Debug for BoxWebhookProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxWebhookProvider")
            .field("name", &self.name())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// ProviderRegistry
// ---------------------------------------------------------------------------

/// Name -> provider lookup shared by the subscription manager and router.
#[derive(Debug, Default)]
pub struct ProviderRegistry {
    providers: DashMap<String, Arc<BoxWebhookProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider under its own name, replacing any previous one.
    pub fn register<T: WebhookProvider + 'static>(&self, provider: T) {
        let boxed = BoxWebhookProvider::new(provider);
        tracing::info!(provider = %boxed.name(), "registered webhook provider");
        self.providers
            .insert(boxed.name().to_string(), Arc::new(boxed));
    }

    pub fn get(&self, name: &str) -> Option<Arc<BoxWebhookProvider>> {
        self.providers.get(name).map(|p| p.value().clone())
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.providers.iter().map(|p| p.key().clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}
