//! Reference-counted sharing of remote webhook registrations.
//!
//! Several step nodes watching the same external target share one remote
//! registration whenever the provider says their configurations are
//! compatible. Each sharing node is a listener; the registration is deleted
//! remotely when its last listener is released.
//!
//! All decisions for one external target are serialized by a per-target
//! async mutex, so concurrent setups never create duplicate registrations
//! and a release never races an attach. A target's mutex is dropped from
//! the table once no caller holds it.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use serde_json::Value;
use tether_types::error::RepositoryError;
use tether_types::step::SubscriptionRequest;
use tether_types::subscription::{
    ExternalTarget, ListenerMode, SubscriptionListener, SubscriptionState, WebhookSubscription,
};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::provider::{BoxWebhookProvider, MergeDecision, ProviderError, ProviderRegistry, RemoteRegistration};
use super::signature::{generate_binding_key, generate_secret};
use crate::repository::SubscriptionRepository;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum SubscriptionError {
    #[error("no webhook provider registered as '{0}'")]
    UnknownProvider(String),

    #[error("target {target} allows a single registration and its configuration is incompatible")]
    Conflict { target: String },

    #[error("remote registration failed: {0}")]
    RemoteRegistration(#[source] ProviderError),

    #[error("remote update failed: {0}")]
    RemoteUpdate(#[source] ProviderError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

/// How a subscription request was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// A new remote registration was created.
    Created,
    /// An existing registration already covered the request.
    Reused,
    /// An existing registration was widened to cover the request.
    Merged,
    /// The node's own registration was rewritten to the new configuration.
    Reconfigured,
}

/// The subscription a node is now attached to.
#[derive(Debug, Clone)]
pub struct SubscriptionHandle {
    pub binding_key: String,
    pub ref_count: u32,
    pub disposition: Disposition,
}

/// Result of releasing a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// Other listeners remain; the registration stays.
    Retained { remaining: u32 },
    /// Last listener left and the remote registration is gone.
    Deleted,
    /// Last listener left but remote deletion failed; retried later.
    PendingDeletion,
    /// No such subscription (already released).
    NotFound,
}

// ---------------------------------------------------------------------------
// SubscriptionManager
// ---------------------------------------------------------------------------

pub struct SubscriptionManager<S: SubscriptionRepository> {
    repo: Arc<S>,
    providers: Arc<ProviderRegistry>,
    public_base_url: String,
    target_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl<S: SubscriptionRepository> SubscriptionManager<S> {
    pub fn new(repo: Arc<S>, providers: Arc<ProviderRegistry>, public_base_url: impl Into<String>) -> Self {
        Self {
            repo,
            providers,
            public_base_url: public_base_url.into().trim_end_matches('/').to_string(),
            target_locks: DashMap::new(),
        }
    }

    pub fn repository(&self) -> &Arc<S> {
        &self.repo
    }

    pub fn providers(&self) -> &Arc<ProviderRegistry> {
        &self.providers
    }

    /// Callback URL external systems deliver to for `binding_key`.
    pub fn callback_url(&self, binding_key: &str) -> String {
        format!("{}/webhooks/{binding_key}", self.public_base_url)
    }

    fn target_lock(&self, target: &ExternalTarget) -> Arc<Mutex<()>> {
        self.target_locks
            .entry(target.key())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Give back a handle from `target_lock`. The guard must already be dropped.
    fn return_lock(&self, target: &ExternalTarget, lock: Arc<Mutex<()>>) {
        drop(lock);
        // The shard stays write-locked during the check, so no new handle can appear.
        self.target_locks
            .remove_if(&target.key(), |_, l| Arc::strong_count(l) == 1);
    }

    fn provider(&self, name: &str) -> Result<Arc<BoxWebhookProvider>, SubscriptionError> {
        self.providers
            .get(name)
            .ok_or_else(|| SubscriptionError::UnknownProvider(name.to_string()))
    }

    /// Attach `node_id` to a subscription satisfying `request`, reusing,
    /// widening or creating a remote registration as needed.
    ///
    /// Idempotent per node: repeating the call with an equal request keeps
    /// the same binding key and reference count. If the node was attached to
    /// another subscription, on this target or any other, it is released
    /// from it after the new attachment succeeds.
    pub async fn request_subscription(
        &self,
        request: &SubscriptionRequest,
        node_id: &str,
        step_type: &str,
        mode: ListenerMode,
    ) -> Result<SubscriptionHandle, SubscriptionError> {
        let target = &request.target;
        let provider = self.provider(&target.provider)?;
        let lock = self.target_lock(target);
        let guard = lock.lock().await;
        let attached = self.attach_locked(&provider, request, node_id, step_type, mode).await;
        drop(guard);
        self.return_lock(target, lock);
        let (handle, stale) = attached?;

        // Stale keys may live under other targets; their locks are taken one at a time.
        for old_key in stale {
            match self.release_subscription(&old_key, node_id).await {
                Ok(outcome) => {
                    tracing::debug!(binding_key = %old_key, node_id, outcome = ?outcome, "released previous subscription");
                }
                Err(e) => {
                    tracing::warn!(binding_key = %old_key, node_id, error = %e, "failed to release previous subscription");
                }
            }
        }
        Ok(handle)
    }

    /// Caller holds the target lock. Returns the handle and the binding keys
    /// the node held before that it no longer needs.
    async fn attach_locked(
        &self,
        provider: &BoxWebhookProvider,
        request: &SubscriptionRequest,
        node_id: &str,
        step_type: &str,
        mode: ListenerMode,
    ) -> Result<(SubscriptionHandle, Vec<String>), SubscriptionError> {
        let target = &request.target;
        let previous: Vec<String> = self
            .repo
            .listeners_for_node(node_id)
            .await?
            .into_iter()
            .map(|l| l.binding_key)
            .collect();

        let mut candidates = self
            .repo
            .find_active_by_target(&target.provider, &target.target)
            .await?;
        // Prefer the subscription the node already holds.
        candidates.sort_by_key(|s| !previous.contains(&s.binding_key));

        let (subscription, disposition) = match candidates
            .iter()
            .find(|s| provider.compare_config(&s.desired_config, &request.desired_config))
        {
            Some(existing) => (existing.clone(), Disposition::Reused),
            None => match self.try_merge(provider, &candidates, request).await? {
                Some(found) => found,
                None if candidates.is_empty() || provider.allows_multiple_registrations() => {
                    (self.create(provider, request).await?, Disposition::Created)
                }
                None => match self.owned_by(&candidates, node_id).await? {
                    Some(owned) => (
                        self.reconfigure(provider, owned, &request.desired_config).await?,
                        Disposition::Reconfigured,
                    ),
                    None => {
                        return Err(SubscriptionError::Conflict {
                            target: target.to_string(),
                        });
                    }
                },
            },
        };

        let listener = SubscriptionListener {
            binding_key: subscription.binding_key.clone(),
            node_id: node_id.to_string(),
            step_type: step_type.to_string(),
            mode,
            filters: request.filters.clone(),
            attached_at: Utc::now(),
        };
        let ref_count = self.repo.attach_listener(&listener).await?;

        tracing::info!(
            binding_key = %subscription.binding_key,
            node_id,
            external_target = %target,
            ref_count,
            disposition = ?disposition,
            "subscription attached"
        );

        let stale = previous
            .into_iter()
            .filter(|k| *k != subscription.binding_key)
            .collect();
        Ok((
            SubscriptionHandle {
                binding_key: subscription.binding_key,
                ref_count,
                disposition,
            },
            stale,
        ))
    }

    /// A candidate whose only listener is `node_id`.
    async fn owned_by<'a>(
        &self,
        candidates: &'a [WebhookSubscription],
        node_id: &str,
    ) -> Result<Option<&'a WebhookSubscription>, SubscriptionError> {
        for candidate in candidates {
            let listeners = self.repo.listeners(&candidate.binding_key).await?;
            if !listeners.is_empty() && listeners.iter().all(|l| l.node_id == node_id) {
                return Ok(Some(candidate));
            }
        }
        Ok(None)
    }

    /// Rewrite a registration in place to `config`.
    async fn reconfigure(
        &self,
        provider: &BoxWebhookProvider,
        subscription: &WebhookSubscription,
        config: &Value,
    ) -> Result<WebhookSubscription, SubscriptionError> {
        let registration = self.registration(subscription, config);
        provider
            .update(subscription.remote_id.as_deref(), &registration)
            .await
            .map_err(SubscriptionError::RemoteUpdate)?;
        self.repo
            .update_registration(&subscription.binding_key, config, subscription.remote_id.as_deref())
            .await?;
        tracing::info!(
            binding_key = %subscription.binding_key,
            external_target = %subscription.external_target(),
            "remote webhook reconfigured"
        );
        let mut updated = subscription.clone();
        updated.desired_config = config.clone();
        Ok(updated)
    }

    /// First candidate that can absorb the request, widening it remotely if needed.
    async fn try_merge(
        &self,
        provider: &BoxWebhookProvider,
        candidates: &[WebhookSubscription],
        request: &SubscriptionRequest,
    ) -> Result<Option<(WebhookSubscription, Disposition)>, SubscriptionError> {
        for candidate in candidates {
            match provider.reconcile(&candidate.desired_config, &request.desired_config) {
                MergeDecision::Unchanged => {
                    return Ok(Some((candidate.clone(), Disposition::Reused)));
                }
                MergeDecision::Merged(config) => {
                    let registration = self.registration(candidate, &config);
                    provider
                        .update(candidate.remote_id.as_deref(), &registration)
                        .await
                        .map_err(SubscriptionError::RemoteUpdate)?;
                    self.repo
                        .update_registration(&candidate.binding_key, &config, candidate.remote_id.as_deref())
                        .await?;
                    let mut merged = candidate.clone();
                    merged.desired_config = config;
                    return Ok(Some((merged, Disposition::Merged)));
                }
                MergeDecision::Conflict => continue,
            }
        }
        Ok(None)
    }

    async fn create(
        &self,
        provider: &BoxWebhookProvider,
        request: &SubscriptionRequest,
    ) -> Result<WebhookSubscription, SubscriptionError> {
        let scheme = provider.scheme();
        let binding_key = generate_binding_key();
        let secret = scheme.requires_secret().then(generate_secret);
        let registration = RemoteRegistration {
            target: request.target.clone(),
            config: request.desired_config.clone(),
            callback_url: self.callback_url(&binding_key),
            secret: secret.clone(),
        };
        let remote_id = provider
            .register(&registration)
            .await
            .map_err(SubscriptionError::RemoteRegistration)?;

        let now = Utc::now();
        let subscription = WebhookSubscription {
            id: Uuid::now_v7(),
            binding_key,
            provider: request.target.provider.clone(),
            target: request.target.target.clone(),
            remote_id,
            secret,
            scheme,
            desired_config: request.desired_config.clone(),
            ref_count: 0,
            state: SubscriptionState::Active,
            created_at: now,
            updated_at: now,
        };

        if let Err(e) = self.repo.insert(&subscription).await {
            // Do not leave an orphaned registration behind.
            if let Err(cleanup) = provider
                .unregister(&request.target, subscription.remote_id.as_deref())
                .await
            {
                tracing::warn!(external_target = %request.target, error = %cleanup, "failed to roll back remote registration");
            }
            return Err(e.into());
        }

        tracing::info!(
            binding_key = %subscription.binding_key,
            external_target = %request.target,
            remote_id = ?subscription.remote_id,
            "remote webhook registered"
        );
        Ok(subscription)
    }

    fn registration(&self, subscription: &WebhookSubscription, config: &Value) -> RemoteRegistration {
        RemoteRegistration {
            target: subscription.external_target(),
            config: config.clone(),
            callback_url: self.callback_url(&subscription.binding_key),
            secret: subscription.secret.clone(),
        }
    }

    /// Detach `node_id`; delete the remote registration when it was the last
    /// listener. Pending deletions from earlier failures are retried first.
    pub async fn release_subscription(
        &self,
        binding_key: &str,
        node_id: &str,
    ) -> Result<ReleaseOutcome, SubscriptionError> {
        self.retry_pending_deletions().await;

        let Some(subscription) = self.repo.get_by_binding_key(binding_key).await? else {
            return Ok(ReleaseOutcome::NotFound);
        };
        let target = subscription.external_target();
        let provider = self.provider(&target.provider)?;
        let lock = self.target_lock(&target);
        let guard = lock.lock().await;

        // Re-read under the lock; a concurrent release may have removed it.
        let released = match self.repo.get_by_binding_key(binding_key).await {
            Ok(Some(subscription)) => self.release_locked(&provider, &subscription, node_id).await,
            Ok(None) => Ok(ReleaseOutcome::NotFound),
            Err(e) => Err(e.into()),
        };
        drop(guard);
        self.return_lock(&target, lock);
        released
    }

    /// Release every subscription `node_id` listens on.
    pub async fn release_node(&self, node_id: &str) -> Result<Vec<ReleaseOutcome>, SubscriptionError> {
        let mut outcomes = Vec::new();
        for listener in self.repo.listeners_for_node(node_id).await? {
            outcomes.push(self.release_subscription(&listener.binding_key, node_id).await?);
        }
        Ok(outcomes)
    }

    /// Caller holds the target lock.
    async fn release_locked(
        &self,
        provider: &BoxWebhookProvider,
        subscription: &WebhookSubscription,
        node_id: &str,
    ) -> Result<ReleaseOutcome, SubscriptionError> {
        let remaining = self
            .repo
            .detach_listener(&subscription.binding_key, node_id)
            .await?;
        if remaining > 0 {
            tracing::info!(binding_key = %subscription.binding_key, node_id, remaining, "listener released");
            return Ok(ReleaseOutcome::Retained { remaining });
        }

        self.repo.mark_pending_deletion(&subscription.binding_key).await?;
        if self.delete_remote(provider, subscription).await? {
            Ok(ReleaseOutcome::Deleted)
        } else {
            Ok(ReleaseOutcome::PendingDeletion)
        }
    }

    /// Returns `false` when the remote call failed and the record stays
    /// pending deletion.
    async fn delete_remote(
        &self,
        provider: &BoxWebhookProvider,
        subscription: &WebhookSubscription,
    ) -> Result<bool, SubscriptionError> {
        match provider
            .unregister(&subscription.external_target(), subscription.remote_id.as_deref())
            .await
        {
            Ok(()) | Err(ProviderError::NotFound) => {
                self.repo.delete(&subscription.binding_key).await?;
                tracing::info!(
                    binding_key = %subscription.binding_key,
                    external_target = %subscription.external_target(),
                    "remote webhook deleted"
                );
                Ok(true)
            }
            Err(e) => {
                tracing::warn!(
                    binding_key = %subscription.binding_key,
                    external_target = %subscription.external_target(),
                    error = %e,
                    "remote webhook deletion failed; will retry"
                );
                Ok(false)
            }
        }
    }

    /// Retry every pending remote deletion. Returns how many succeeded.
    pub async fn retry_pending_deletions(&self) -> usize {
        let pending = match self.repo.list_pending_deletion().await {
            Ok(pending) => pending,
            Err(e) => {
                tracing::warn!(error = %e, "could not list pending webhook deletions");
                return 0;
            }
        };

        let mut deleted = 0;
        for subscription in pending {
            let target = subscription.external_target();
            let Ok(provider) = self.provider(&target.provider) else {
                tracing::warn!(binding_key = %subscription.binding_key, provider = %target.provider, "pending deletion for unknown provider");
                continue;
            };
            let lock = self.target_lock(&target);
            let guard = lock.lock().await;
            match self.delete_remote(&provider, &subscription).await {
                Ok(true) => deleted += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(binding_key = %subscription.binding_key, error = %e, "pending deletion bookkeeping failed");
                }
            }
            drop(guard);
            self.return_lock(&target, lock);
        }
        deleted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::InMemorySubscriptionRepository;
    use crate::testing::{FakeProvider, ProviderCalls};
    use serde_json::json;
    use tether_types::delivery::FilterSet;

    fn manager(provider: FakeProvider) -> (SubscriptionManager<InMemorySubscriptionRepository>, Arc<ProviderCalls>) {
        let calls = provider.calls();
        let providers = Arc::new(ProviderRegistry::new());
        providers.register(provider);
        let manager = SubscriptionManager::new(
            Arc::new(InMemorySubscriptionRepository::new()),
            providers,
            "https://hooks.example.com/",
        );
        (manager, calls)
    }

    fn request(events: &[&str]) -> SubscriptionRequest {
        SubscriptionRequest {
            target: ExternalTarget::new("registry", "acme/api"),
            desired_config: json!({"events": events, "content_type": "json"}),
            filters: FilterSet::default(),
        }
    }

    #[tokio::test]
    async fn equal_configs_share_one_registration() {
        let (manager, calls) = manager(FakeProvider::new("registry"));

        let a = manager
            .request_subscription(&request(&["push"]), "node-a", "wait_for_event", ListenerMode::Wait)
            .await
            .unwrap();
        let b = manager
            .request_subscription(&request(&["push"]), "node-b", "wait_for_event", ListenerMode::Wait)
            .await
            .unwrap();

        assert_eq!(a.binding_key, b.binding_key);
        assert_eq!(a.disposition, Disposition::Created);
        assert_eq!(b.disposition, Disposition::Reused);
        assert_eq!(b.ref_count, 2);
        assert_eq!(calls.registered(), 1);
    }

    #[tokio::test]
    async fn repeated_setup_is_idempotent() {
        let (manager, calls) = manager(FakeProvider::new("registry"));
        let first = manager
            .request_subscription(&request(&["push"]), "node-a", "wait_for_event", ListenerMode::Wait)
            .await
            .unwrap();
        let again = manager
            .request_subscription(&request(&["push"]), "node-a", "wait_for_event", ListenerMode::Wait)
            .await
            .unwrap();

        assert_eq!(first.binding_key, again.binding_key);
        assert_eq!(again.ref_count, 1);
        assert_eq!(calls.registered(), 1);
    }

    #[tokio::test]
    async fn new_subscription_carries_secret_and_callback() {
        let (manager, _) = manager(FakeProvider::new("registry"));
        let handle = manager
            .request_subscription(&request(&["push"]), "node-a", "wait_for_event", ListenerMode::Wait)
            .await
            .unwrap();

        let stored = manager
            .repository()
            .get_by_binding_key(&handle.binding_key)
            .await
            .unwrap()
            .unwrap();
        assert!(stored.secret.is_some());
        assert_eq!(stored.remote_id.as_deref(), Some("remote-1"));
        assert_eq!(
            manager.callback_url(&handle.binding_key),
            format!("https://hooks.example.com/webhooks/{}", handle.binding_key)
        );
    }

    #[tokio::test]
    async fn incompatible_configs_get_separate_registrations() {
        let (manager, calls) = manager(FakeProvider::new("registry"));
        let a = manager
            .request_subscription(&request(&["push"]), "node-a", "wait_for_event", ListenerMode::Wait)
            .await
            .unwrap();
        let b = manager
            .request_subscription(&request(&["delete"]), "node-b", "wait_for_event", ListenerMode::Wait)
            .await
            .unwrap();

        assert_ne!(a.binding_key, b.binding_key);
        assert_eq!(calls.registered(), 2);
    }

    #[tokio::test]
    async fn mergeable_configs_widen_existing_registration() {
        let (manager, calls) = manager(FakeProvider::new("registry").merging_events());
        let a = manager
            .request_subscription(&request(&["push"]), "node-a", "wait_for_event", ListenerMode::Wait)
            .await
            .unwrap();
        let b = manager
            .request_subscription(&request(&["delete"]), "node-b", "wait_for_event", ListenerMode::Wait)
            .await
            .unwrap();

        assert_eq!(a.binding_key, b.binding_key);
        assert_eq!(b.disposition, Disposition::Merged);
        assert_eq!(calls.registered(), 1);
        assert_eq!(calls.updated(), 1);
        assert_eq!(
            calls.last_config().unwrap()["events"],
            json!(["push", "delete"])
        );
    }

    #[tokio::test]
    async fn single_registration_target_conflicts() {
        let (manager, calls) = manager(FakeProvider::new("registry").single_registration());
        manager
            .request_subscription(&request(&["push"]), "node-a", "wait_for_event", ListenerMode::Wait)
            .await
            .unwrap();
        let err = manager
            .request_subscription(&request(&["delete"]), "node-b", "wait_for_event", ListenerMode::Wait)
            .await
            .unwrap_err();

        assert!(matches!(err, SubscriptionError::Conflict { .. }));
        assert_eq!(calls.registered(), 1);
    }

    #[tokio::test]
    async fn sole_listener_reconfigures_single_registration_in_place() {
        let (manager, calls) = manager(FakeProvider::new("registry").single_registration());
        let first = manager
            .request_subscription(&request(&["push"]), "node-a", "wait_for_event", ListenerMode::Wait)
            .await
            .unwrap();
        let second = manager
            .request_subscription(&request(&["delete"]), "node-a", "wait_for_event", ListenerMode::Wait)
            .await
            .unwrap();

        assert_eq!(first.binding_key, second.binding_key);
        assert_eq!(second.disposition, Disposition::Reconfigured);
        assert_eq!(second.ref_count, 1);
        assert_eq!(calls.registered(), 1);
        assert_eq!(calls.updated(), 1);
        assert_eq!(calls.unregistered(), 0);
        assert_eq!(calls.last_config().unwrap()["events"], json!(["delete"]));
        let stored = manager
            .repository()
            .get_by_binding_key(&second.binding_key)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.desired_config["events"], json!(["delete"]));

        // Once shared, the registration is no longer the node's to rewrite.
        manager
            .request_subscription(&request(&["delete"]), "node-b", "wait_for_event", ListenerMode::Wait)
            .await
            .unwrap();
        let err = manager
            .request_subscription(&request(&["push"]), "node-a", "wait_for_event", ListenerMode::Wait)
            .await
            .unwrap_err();
        assert!(matches!(err, SubscriptionError::Conflict { .. }));
        assert_eq!(calls.updated(), 1);
    }

    #[tokio::test]
    async fn unknown_provider_is_rejected() {
        let (manager, _) = manager(FakeProvider::new("registry"));
        let mut req = request(&["push"]);
        req.target = ExternalTarget::new("pager", "team-a");
        let err = manager
            .request_subscription(&req, "node-a", "wait_for_event", ListenerMode::Wait)
            .await
            .unwrap_err();
        assert!(matches!(err, SubscriptionError::UnknownProvider(_)));
    }

    #[tokio::test]
    async fn release_deletes_only_after_last_listener() {
        let (manager, calls) = manager(FakeProvider::new("registry"));
        let a = manager
            .request_subscription(&request(&["push"]), "node-a", "wait_for_event", ListenerMode::Wait)
            .await
            .unwrap();
        manager
            .request_subscription(&request(&["push"]), "node-b", "wait_for_event", ListenerMode::Wait)
            .await
            .unwrap();

        let first = manager.release_subscription(&a.binding_key, "node-a").await.unwrap();
        assert_eq!(first, ReleaseOutcome::Retained { remaining: 1 });
        assert_eq!(calls.unregistered(), 0);

        let second = manager.release_subscription(&a.binding_key, "node-b").await.unwrap();
        assert_eq!(second, ReleaseOutcome::Deleted);
        assert_eq!(calls.unregistered(), 1);
        assert!(manager
            .repository()
            .get_by_binding_key(&a.binding_key)
            .await
            .unwrap()
            .is_none());

        let again = manager.release_subscription(&a.binding_key, "node-b").await.unwrap();
        assert_eq!(again, ReleaseOutcome::NotFound);
    }

    #[tokio::test]
    async fn failed_deletion_is_retried() {
        let (manager, calls) = manager(FakeProvider::new("registry"));
        let a = manager
            .request_subscription(&request(&["push"]), "node-a", "wait_for_event", ListenerMode::Wait)
            .await
            .unwrap();

        calls.set_fail_unregister(true);
        let outcome = manager.release_subscription(&a.binding_key, "node-a").await.unwrap();
        assert_eq!(outcome, ReleaseOutcome::PendingDeletion);
        let stored = manager
            .repository()
            .get_by_binding_key(&a.binding_key)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.state, SubscriptionState::PendingDeletion);

        // A pending registration is never handed to new listeners.
        let b = manager
            .request_subscription(&request(&["push"]), "node-b", "wait_for_event", ListenerMode::Wait)
            .await
            .unwrap();
        assert_ne!(a.binding_key, b.binding_key);

        calls.set_fail_unregister(false);
        assert_eq!(manager.retry_pending_deletions().await, 1);
        assert!(manager
            .repository()
            .get_by_binding_key(&a.binding_key)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn reconfigured_node_moves_and_releases_old() {
        let (manager, calls) = manager(FakeProvider::new("registry"));
        let old = manager
            .request_subscription(&request(&["push"]), "node-a", "wait_for_event", ListenerMode::Wait)
            .await
            .unwrap();
        let new = manager
            .request_subscription(&request(&["delete"]), "node-a", "wait_for_event", ListenerMode::Wait)
            .await
            .unwrap();

        assert_ne!(old.binding_key, new.binding_key);
        assert_eq!(new.ref_count, 1);
        assert_eq!(calls.unregistered(), 1);
        assert!(manager
            .repository()
            .get_by_binding_key(&old.binding_key)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn node_moved_to_another_target_leaves_the_old_one() {
        let (manager, calls) = manager(FakeProvider::new("registry"));
        let old = manager
            .request_subscription(&request(&["push"]), "node-a", "wait_for_event", ListenerMode::Wait)
            .await
            .unwrap();
        let mut elsewhere = request(&["push"]);
        elsewhere.target = ExternalTarget::new("registry", "acme/web");
        let new = manager
            .request_subscription(&elsewhere, "node-a", "wait_for_event", ListenerMode::Wait)
            .await
            .unwrap();

        assert_ne!(old.binding_key, new.binding_key);
        assert_eq!(calls.registered(), 2);
        assert_eq!(calls.unregistered(), 1);
        assert!(manager
            .repository()
            .get_by_binding_key(&old.binding_key)
            .await
            .unwrap()
            .is_none());
        let held = manager.repository().listeners_for_node("node-a").await.unwrap();
        assert_eq!(held.len(), 1);
        assert_eq!(held[0].binding_key, new.binding_key);
    }

    #[tokio::test]
    async fn release_node_releases_everything_it_holds() {
        let (manager, calls) = manager(FakeProvider::new("registry"));
        for node in ["node-a", "node-b"] {
            manager
                .request_subscription(&request(&["push"]), node, "wait_for_event", ListenerMode::Wait)
                .await
                .unwrap();
        }

        let outcomes = manager.release_node("node-a").await.unwrap();
        assert_eq!(outcomes, vec![ReleaseOutcome::Retained { remaining: 1 }]);
        assert_eq!(calls.unregistered(), 0);

        let outcomes = manager.release_node("node-b").await.unwrap();
        assert_eq!(outcomes, vec![ReleaseOutcome::Deleted]);
        assert_eq!(calls.unregistered(), 1);
        assert!(manager.release_node("node-b").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn target_locks_are_dropped_when_idle() {
        let (manager, calls) = manager(FakeProvider::new("registry"));
        let a = manager
            .request_subscription(&request(&["push"]), "node-a", "wait_for_event", ListenerMode::Wait)
            .await
            .unwrap();
        assert!(manager.target_locks.is_empty());

        calls.set_fail_unregister(true);
        manager.release_subscription(&a.binding_key, "node-a").await.unwrap();
        assert!(manager.target_locks.is_empty());

        calls.set_fail_unregister(false);
        assert_eq!(manager.retry_pending_deletions().await, 1);
        assert!(manager.target_locks.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_equal_requests_register_once() {
        let (manager, calls) = manager(FakeProvider::new("registry"));
        let manager = Arc::new(manager);

        let mut handles = Vec::new();
        for i in 0..8 {
            let manager = manager.clone();
            handles.push(tokio::spawn(async move {
                manager
                    .request_subscription(
                        &request(&["push"]),
                        &format!("node-{i}"),
                        "wait_for_event",
                        ListenerMode::Wait,
                    )
                    .await
                    .unwrap()
                    .binding_key
            }));
        }

        let mut keys = Vec::new();
        for handle in handles {
            keys.push(handle.await.unwrap());
        }
        keys.dedup();
        assert_eq!(keys.len(), 1);
        assert_eq!(calls.registered(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_releases_delete_exactly_once() {
        let (manager, calls) = manager(FakeProvider::new("registry"));
        let manager = Arc::new(manager);

        let mut binding_key = String::new();
        for i in 0..8 {
            binding_key = manager
                .request_subscription(&request(&["push"]), &format!("node-{i}"), "wait_for_event", ListenerMode::Wait)
                .await
                .unwrap()
                .binding_key;
        }
        assert_eq!(calls.registered(), 1);

        let mut handles = Vec::new();
        for i in 0..8 {
            let manager = manager.clone();
            let binding_key = binding_key.clone();
            handles.push(tokio::spawn(async move {
                manager
                    .release_subscription(&binding_key, &format!("node-{i}"))
                    .await
                    .unwrap()
            }));
        }

        let mut deleted = 0;
        let mut retained = 0;
        for handle in handles {
            match handle.await.unwrap() {
                ReleaseOutcome::Deleted => deleted += 1,
                ReleaseOutcome::Retained { .. } => retained += 1,
                other => panic!("unexpected outcome {other:?}"),
            }
        }
        assert_eq!(deleted, 1);
        assert_eq!(retained, 7);
        assert_eq!(calls.unregistered(), 1);
        assert!(manager
            .repository()
            .get_by_binding_key(&binding_key)
            .await
            .unwrap()
            .is_none());
        assert!(manager.target_locks.is_empty());
    }
}
