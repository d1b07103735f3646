//! DashMap-backed repositories.
//!
//! Each record lives in one DashMap entry; the shard write lock held by
//! `get_mut` makes every check-then-write below atomic with respect to
//! other callers touching the same record.

use chrono::Utc;
use dashmap::DashMap;
use serde_json::Value;
use tether_types::error::RepositoryError;
use tether_types::execution::{ClaimOutcome, Execution, ExecutionState, ResolutionOutcome};
use tether_types::subscription::{SubscriptionListener, SubscriptionState, WebhookSubscription};
use uuid::Uuid;

use super::execution::ExecutionRepository;
use super::subscription::SubscriptionRepository;

// ---------------------------------------------------------------------------
// Executions
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct InMemoryExecutionRepository {
    executions: DashMap<Uuid, Execution>,
}

impl InMemoryExecutionRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn transition(
        &self,
        id: &Uuid,
        to: ExecutionState,
        outcome: Option<&ResolutionOutcome>,
    ) -> Result<ClaimOutcome, RepositoryError> {
        let mut entry = self.executions.get_mut(id).ok_or(RepositoryError::NotFound)?;
        if entry.state.is_terminal() {
            return Ok(ClaimOutcome::AlreadyTerminal(entry.state));
        }
        entry.state = to;
        if let Some(outcome) = outcome {
            entry.outcome = Some(outcome.clone());
        }
        entry.updated_at = Utc::now();
        Ok(ClaimOutcome::Claimed)
    }
}

impl ExecutionRepository for InMemoryExecutionRepository {
    async fn create(&self, execution: &Execution) -> Result<(), RepositoryError> {
        if self.executions.contains_key(&execution.id) {
            return Err(RepositoryError::Conflict(format!(
                "execution {} already exists",
                execution.id
            )));
        }
        self.executions.insert(execution.id, execution.clone());
        Ok(())
    }

    async fn get(&self, id: &Uuid) -> Result<Option<Execution>, RepositoryError> {
        Ok(self.executions.get(id).map(|e| e.value().clone()))
    }

    async fn update_metadata(&self, id: &Uuid, metadata: &Value) -> Result<(), RepositoryError> {
        let mut entry = self.executions.get_mut(id).ok_or(RepositoryError::NotFound)?;
        entry.metadata = metadata.clone();
        entry.updated_at = Utc::now();
        Ok(())
    }

    async fn try_claim(
        &self,
        id: &Uuid,
        outcome: &ResolutionOutcome,
    ) -> Result<ClaimOutcome, RepositoryError> {
        self.transition(id, ExecutionState::Resolved, Some(outcome))
    }

    async fn try_cancel(&self, id: &Uuid) -> Result<ClaimOutcome, RepositoryError> {
        self.transition(id, ExecutionState::Cancelled, None)
    }

    async fn record_emission(&self, id: &Uuid, channel: &str) -> Result<bool, RepositoryError> {
        let mut entry = self.executions.get_mut(id).ok_or(RepositoryError::NotFound)?;
        if entry.emitted_channel.is_some() {
            return Ok(false);
        }
        entry.emitted_channel = Some(channel.to_string());
        entry.updated_at = Utc::now();
        Ok(true)
    }

    async fn find_suspended_by_correlation(
        &self,
        node_id: &str,
        correlation_key: &str,
    ) -> Result<Option<Execution>, RepositoryError> {
        Ok(self
            .executions
            .iter()
            .find(|e| {
                e.state == ExecutionState::Suspended
                    && e.node_id == node_id
                    && e.correlation_key.as_deref() == Some(correlation_key)
            })
            .map(|e| e.value().clone()))
    }

    async fn find_latest_by_correlation(
        &self,
        node_id: &str,
        correlation_key: &str,
    ) -> Result<Option<Execution>, RepositoryError> {
        Ok(self
            .executions
            .iter()
            .filter(|e| e.node_id == node_id && e.correlation_key.as_deref() == Some(correlation_key))
            .max_by_key(|e| (e.created_at, e.id))
            .map(|e| e.value().clone()))
    }

    async fn list_suspended(&self) -> Result<Vec<Execution>, RepositoryError> {
        let mut suspended: Vec<Execution> = self
            .executions
            .iter()
            .filter(|e| e.state == ExecutionState::Suspended)
            .map(|e| e.value().clone())
            .collect();
        suspended.sort_by_key(|e| e.created_at);
        Ok(suspended)
    }

    async fn delete(&self, id: &Uuid) -> Result<bool, RepositoryError> {
        Ok(self.executions.remove(id).is_some())
    }
}

// ---------------------------------------------------------------------------
// Subscriptions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct SubscriptionEntry {
    subscription: WebhookSubscription,
    listeners: Vec<SubscriptionListener>,
}

#[derive(Debug, Default)]
pub struct InMemorySubscriptionRepository {
    entries: DashMap<String, SubscriptionEntry>,
}

impl InMemorySubscriptionRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SubscriptionRepository for InMemorySubscriptionRepository {
    async fn find_active_by_target(
        &self,
        provider: &str,
        target: &str,
    ) -> Result<Vec<WebhookSubscription>, RepositoryError> {
        let mut found: Vec<WebhookSubscription> = self
            .entries
            .iter()
            .filter(|e| {
                let s = &e.subscription;
                s.state == SubscriptionState::Active && s.provider == provider && s.target == target
            })
            .map(|e| e.subscription.clone())
            .collect();
        found.sort_by_key(|s| s.created_at);
        Ok(found)
    }

    async fn get_by_binding_key(
        &self,
        binding_key: &str,
    ) -> Result<Option<WebhookSubscription>, RepositoryError> {
        Ok(self
            .entries
            .get(binding_key)
            .map(|e| e.subscription.clone()))
    }

    async fn insert(&self, subscription: &WebhookSubscription) -> Result<(), RepositoryError> {
        if self.entries.contains_key(&subscription.binding_key) {
            return Err(RepositoryError::Conflict(format!(
                "binding key {} already exists",
                subscription.binding_key
            )));
        }
        let mut subscription = subscription.clone();
        subscription.ref_count = 0;
        self.entries.insert(
            subscription.binding_key.clone(),
            SubscriptionEntry {
                subscription,
                listeners: Vec::new(),
            },
        );
        Ok(())
    }

    async fn update_registration(
        &self,
        binding_key: &str,
        desired_config: &Value,
        remote_id: Option<&str>,
    ) -> Result<(), RepositoryError> {
        let mut entry = self
            .entries
            .get_mut(binding_key)
            .ok_or(RepositoryError::NotFound)?;
        entry.subscription.desired_config = desired_config.clone();
        entry.subscription.remote_id = remote_id.map(str::to_string);
        entry.subscription.updated_at = Utc::now();
        Ok(())
    }

    async fn mark_pending_deletion(&self, binding_key: &str) -> Result<(), RepositoryError> {
        let mut entry = self
            .entries
            .get_mut(binding_key)
            .ok_or(RepositoryError::NotFound)?;
        entry.subscription.state = SubscriptionState::PendingDeletion;
        entry.subscription.updated_at = Utc::now();
        Ok(())
    }

    async fn list_pending_deletion(&self) -> Result<Vec<WebhookSubscription>, RepositoryError> {
        Ok(self
            .entries
            .iter()
            .filter(|e| e.subscription.state == SubscriptionState::PendingDeletion)
            .map(|e| e.subscription.clone())
            .collect())
    }

    async fn delete(&self, binding_key: &str) -> Result<bool, RepositoryError> {
        Ok(self.entries.remove(binding_key).is_some())
    }

    async fn attach_listener(&self, listener: &SubscriptionListener) -> Result<u32, RepositoryError> {
        let mut entry = self
            .entries
            .get_mut(&listener.binding_key)
            .ok_or(RepositoryError::NotFound)?;
        match entry
            .listeners
            .iter_mut()
            .find(|l| l.node_id == listener.node_id)
        {
            Some(existing) => *existing = listener.clone(),
            None => entry.listeners.push(listener.clone()),
        }
        let count = entry.listeners.len() as u32;
        entry.subscription.ref_count = count;
        entry.subscription.updated_at = Utc::now();
        Ok(count)
    }

    async fn detach_listener(&self, binding_key: &str, node_id: &str) -> Result<u32, RepositoryError> {
        let mut entry = self
            .entries
            .get_mut(binding_key)
            .ok_or(RepositoryError::NotFound)?;
        entry.listeners.retain(|l| l.node_id != node_id);
        let count = entry.listeners.len() as u32;
        entry.subscription.ref_count = count;
        entry.subscription.updated_at = Utc::now();
        Ok(count)
    }

    async fn listeners(&self, binding_key: &str) -> Result<Vec<SubscriptionListener>, RepositoryError> {
        Ok(self
            .entries
            .get(binding_key)
            .map(|e| e.listeners.clone())
            .unwrap_or_default())
    }

    async fn listeners_for_node(
        &self,
        node_id: &str,
    ) -> Result<Vec<SubscriptionListener>, RepositoryError> {
        Ok(self
            .entries
            .iter()
            .flat_map(|e| {
                e.listeners
                    .iter()
                    .filter(|l| l.node_id == node_id)
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use tether_types::delivery::FilterSet;
    use tether_types::execution::ResolutionSource;
    use tether_types::subscription::{ListenerMode, SignatureScheme};

    fn execution() -> Execution {
        Execution::new(
            "wait-1",
            "wait_for_event",
            vec!["received".to_string(), "timeout".to_string()],
            json!({}),
        )
    }

    fn subscription(key: &str) -> WebhookSubscription {
        let now = Utc::now();
        WebhookSubscription {
            id: Uuid::now_v7(),
            binding_key: key.to_string(),
            provider: "registry".to_string(),
            target: "acme/api".to_string(),
            remote_id: Some("42".to_string()),
            secret: Some("s3cret".to_string()),
            scheme: SignatureScheme::HmacSha256 {
                header: "x-signature".to_string(),
            },
            desired_config: json!({"events": ["push"]}),
            ref_count: 0,
            state: SubscriptionState::Active,
            created_at: now,
            updated_at: now,
        }
    }

    fn listener(key: &str, node: &str) -> SubscriptionListener {
        SubscriptionListener {
            binding_key: key.to_string(),
            node_id: node.to_string(),
            step_type: "wait_for_event".to_string(),
            mode: ListenerMode::Wait,
            filters: FilterSet::default(),
            attached_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn claim_then_cancel_reports_terminal() {
        let repo = InMemoryExecutionRepository::new();
        let exec = execution();
        repo.create(&exec).await.unwrap();

        let outcome = ResolutionOutcome::new("receive", json!({}), ResolutionSource::Webhook);
        assert_eq!(repo.try_claim(&exec.id, &outcome).await.unwrap(), ClaimOutcome::Claimed);
        assert_eq!(
            repo.try_cancel(&exec.id).await.unwrap(),
            ClaimOutcome::AlreadyTerminal(ExecutionState::Resolved)
        );

        let stored = repo.get(&exec.id).await.unwrap().unwrap();
        assert_eq!(stored.outcome.unwrap().action, "receive");
    }

    #[tokio::test]
    async fn claim_unknown_execution_is_not_found() {
        let repo = InMemoryExecutionRepository::new();
        let outcome = ResolutionOutcome::new("receive", json!({}), ResolutionSource::Direct);
        assert!(matches!(
            repo.try_claim(&Uuid::now_v7(), &outcome).await,
            Err(RepositoryError::NotFound)
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_claims_have_one_winner() {
        let repo = Arc::new(InMemoryExecutionRepository::new());
        let exec = execution();
        repo.create(&exec).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..16 {
            let repo = repo.clone();
            let id = exec.id;
            handles.push(tokio::spawn(async move {
                let outcome =
                    ResolutionOutcome::new(format!("a{i}"), json!({}), ResolutionSource::Direct);
                repo.try_claim(&id, &outcome).await.unwrap()
            }));
        }

        let mut claimed = 0;
        for handle in handles {
            if handle.await.unwrap() == ClaimOutcome::Claimed {
                claimed += 1;
            }
        }
        assert_eq!(claimed, 1);
    }

    #[tokio::test]
    async fn first_emission_wins() {
        let repo = InMemoryExecutionRepository::new();
        let exec = execution();
        repo.create(&exec).await.unwrap();

        assert!(repo.record_emission(&exec.id, "received").await.unwrap());
        assert!(!repo.record_emission(&exec.id, "timeout").await.unwrap());
        let stored = repo.get(&exec.id).await.unwrap().unwrap();
        assert_eq!(stored.emitted_channel.as_deref(), Some("received"));
    }

    #[tokio::test]
    async fn find_by_correlation_skips_resolved() {
        let repo = InMemoryExecutionRepository::new();
        let mut exec = execution();
        exec.correlation_key = Some("msg-1".to_string());
        repo.create(&exec).await.unwrap();

        let found = repo
            .find_suspended_by_correlation("wait-1", "msg-1")
            .await
            .unwrap();
        assert_eq!(found.map(|e| e.id), Some(exec.id));

        repo.try_cancel(&exec.id).await.unwrap();
        assert!(repo
            .find_suspended_by_correlation("wait-1", "msg-1")
            .await
            .unwrap()
            .is_none());
        let latest = repo
            .find_latest_by_correlation("wait-1", "msg-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.state, ExecutionState::Cancelled);
        assert!(repo.list_suspended().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn listener_attach_is_idempotent_per_node() {
        let repo = InMemorySubscriptionRepository::new();
        repo.insert(&subscription("k1")).await.unwrap();

        assert_eq!(repo.attach_listener(&listener("k1", "a")).await.unwrap(), 1);
        assert_eq!(repo.attach_listener(&listener("k1", "a")).await.unwrap(), 1);
        assert_eq!(repo.attach_listener(&listener("k1", "b")).await.unwrap(), 2);
        assert_eq!(
            repo.get_by_binding_key("k1").await.unwrap().unwrap().ref_count,
            2
        );

        assert_eq!(repo.detach_listener("k1", "a").await.unwrap(), 1);
        assert_eq!(repo.detach_listener("k1", "a").await.unwrap(), 1);
        assert_eq!(repo.detach_listener("k1", "b").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn pending_deletion_hides_from_target_lookup() {
        let repo = InMemorySubscriptionRepository::new();
        repo.insert(&subscription("k1")).await.unwrap();
        assert_eq!(
            repo.find_active_by_target("registry", "acme/api")
                .await
                .unwrap()
                .len(),
            1
        );

        repo.mark_pending_deletion("k1").await.unwrap();
        assert!(repo
            .find_active_by_target("registry", "acme/api")
            .await
            .unwrap()
            .is_empty());
        assert_eq!(repo.list_pending_deletion().await.unwrap().len(), 1);
        assert!(repo.delete("k1").await.unwrap());
        assert!(!repo.delete("k1").await.unwrap());
    }

    #[tokio::test]
    async fn listeners_for_node_spans_subscriptions() {
        let repo = InMemorySubscriptionRepository::new();
        repo.insert(&subscription("k1")).await.unwrap();
        repo.insert(&subscription("k2")).await.unwrap();
        repo.attach_listener(&listener("k1", "a")).await.unwrap();
        repo.attach_listener(&listener("k2", "a")).await.unwrap();
        repo.attach_listener(&listener("k2", "b")).await.unwrap();

        let held = repo.listeners_for_node("a").await.unwrap();
        assert_eq!(held.len(), 2);
        assert_eq!(repo.listeners("k2").await.unwrap().len(), 2);
    }
}
