//! Webhook subscription repository trait.
//!
//! A subscription's `ref_count` always equals its number of listeners;
//! `attach_listener` and `detach_listener` update both atomically.

use serde_json::Value;
use tether_types::error::RepositoryError;
use tether_types::subscription::{SubscriptionListener, WebhookSubscription};

/// Storage for remote webhook registrations and their listeners.
pub trait SubscriptionRepository: Send + Sync {
    // -----------------------------------------------------------------------
    // Subscriptions
    // -----------------------------------------------------------------------

    /// Active subscriptions registered against `provider`/`target`,
    /// oldest first.
    fn find_active_by_target(
        &self,
        provider: &str,
        target: &str,
    ) -> impl std::future::Future<Output = Result<Vec<WebhookSubscription>, RepositoryError>> + Send;

    fn get_by_binding_key(
        &self,
        binding_key: &str,
    ) -> impl std::future::Future<Output = Result<Option<WebhookSubscription>, RepositoryError>> + Send;

    fn insert(
        &self,
        subscription: &WebhookSubscription,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Record a reconciled remote configuration.
    fn update_registration(
        &self,
        binding_key: &str,
        desired_config: &Value,
        remote_id: Option<&str>,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Flag a subscription whose last listener left.
    fn mark_pending_deletion(
        &self,
        binding_key: &str,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn list_pending_deletion(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<WebhookSubscription>, RepositoryError>> + Send;

    /// Delete a subscription and its listeners. Returns `true` if it existed.
    fn delete(
        &self,
        binding_key: &str,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Listeners
    // -----------------------------------------------------------------------

    /// Upsert the listener (keyed by binding key + node id) and return the
    /// resulting reference count.
    fn attach_listener(
        &self,
        listener: &SubscriptionListener,
    ) -> impl std::future::Future<Output = Result<u32, RepositoryError>> + Send;

    /// Remove the listener and return the remaining reference count.
    /// Detaching an absent listener leaves the count unchanged.
    fn detach_listener(
        &self,
        binding_key: &str,
        node_id: &str,
    ) -> impl std::future::Future<Output = Result<u32, RepositoryError>> + Send;

    fn listeners(
        &self,
        binding_key: &str,
    ) -> impl std::future::Future<Output = Result<Vec<SubscriptionListener>, RepositoryError>> + Send;

    /// Every listener entry a node holds, across subscriptions.
    fn listeners_for_node(
        &self,
        node_id: &str,
    ) -> impl std::future::Future<Output = Result<Vec<SubscriptionListener>, RepositoryError>> + Send;
}
