//! SQLite webhook subscription repository implementation.
//!
//! Subscription secrets are encrypted with the vault key before they touch
//! disk and decrypted on read. Listener changes run in one transaction that
//! also rewrites `ref_count`, so the count never drifts from the listener
//! rows.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use sqlx::Row;
use tether_core::repository::subscription::SubscriptionRepository;
use tether_types::error::RepositoryError;
use tether_types::subscription::{
    ListenerMode, SubscriptionListener, SubscriptionState, WebhookSubscription,
};

use super::pool::DatabasePool;
use super::{
    format_datetime, from_json, is_unique_violation, parse_datetime, parse_uuid, query_err,
    to_json,
};
use crate::crypto::VaultCrypto;

const SELECT_SUBSCRIPTION: &str = "SELECT id, binding_key, provider, target, remote_id, \
     secret_encrypted, scheme, desired_config, ref_count, state, created_at, updated_at \
     FROM webhook_subscriptions";

const SELECT_LISTENER: &str = "SELECT binding_key, node_id, step_type, mode, filters, attached_at \
     FROM subscription_listeners";

/// SQLite-backed implementation of `SubscriptionRepository`.
pub struct SqliteSubscriptionRepository {
    pool: DatabasePool,
    vault: Arc<VaultCrypto>,
}

impl SqliteSubscriptionRepository {
    pub fn new(pool: DatabasePool, vault: Arc<VaultCrypto>) -> Self {
        Self { pool, vault }
    }

    fn seal(&self, secret: Option<&str>) -> Result<Option<String>, RepositoryError> {
        secret
            .map(|s| {
                self.vault.encrypt_string(s).map_err(|e| {
                    tracing::error!(error = %e, "failed to encrypt subscription secret");
                    RepositoryError::Encryption
                })
            })
            .transpose()
    }

    fn decode(&self, row: &sqlx::sqlite::SqliteRow) -> Result<WebhookSubscription, RepositoryError> {
        SubscriptionRow::from_row(row)
            .map_err(query_err)?
            .into_subscription(&self.vault)
    }

    /// Recount listeners and store the result on the subscription row.
    async fn sync_ref_count(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        binding_key: &str,
    ) -> Result<u32, RepositoryError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM subscription_listeners WHERE binding_key = ?")
                .bind(binding_key)
                .fetch_one(&mut **tx)
                .await
                .map_err(query_err)?;

        sqlx::query("UPDATE webhook_subscriptions SET ref_count = ?, updated_at = ? WHERE binding_key = ?")
            .bind(count)
            .bind(format_datetime(&Utc::now()))
            .bind(binding_key)
            .execute(&mut **tx)
            .await
            .map_err(query_err)?;

        Ok(count as u32)
    }

    async fn require_subscription(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        binding_key: &str,
    ) -> Result<(), RepositoryError> {
        let exists = sqlx::query("SELECT 1 FROM webhook_subscriptions WHERE binding_key = ?")
            .bind(binding_key)
            .fetch_optional(&mut **tx)
            .await
            .map_err(query_err)?;

        match exists {
            Some(_) => Ok(()),
            None => Err(RepositoryError::NotFound),
        }
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct SubscriptionRow {
    id: String,
    binding_key: String,
    provider: String,
    target: String,
    remote_id: Option<String>,
    secret_encrypted: Option<String>,
    scheme: String,
    desired_config: String,
    ref_count: i64,
    state: String,
    created_at: String,
    updated_at: String,
}

impl SubscriptionRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            binding_key: row.try_get("binding_key")?,
            provider: row.try_get("provider")?,
            target: row.try_get("target")?,
            remote_id: row.try_get("remote_id")?,
            secret_encrypted: row.try_get("secret_encrypted")?,
            scheme: row.try_get("scheme")?,
            desired_config: row.try_get("desired_config")?,
            ref_count: row.try_get("ref_count")?,
            state: row.try_get("state")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn into_subscription(self, vault: &VaultCrypto) -> Result<WebhookSubscription, RepositoryError> {
        let secret = self
            .secret_encrypted
            .as_deref()
            .map(|s| {
                vault.decrypt_string(s).map_err(|e| {
                    tracing::error!(binding_key = %self.binding_key, error = %e, "failed to decrypt subscription secret");
                    RepositoryError::Encryption
                })
            })
            .transpose()?;

        let state = self
            .state
            .parse::<SubscriptionState>()
            .map_err(RepositoryError::Query)?;

        Ok(WebhookSubscription {
            id: parse_uuid(&self.id)?,
            binding_key: self.binding_key,
            provider: self.provider,
            target: self.target,
            remote_id: self.remote_id,
            secret,
            scheme: from_json("scheme", &self.scheme)?,
            desired_config: from_json("desired_config", &self.desired_config)?,
            ref_count: self.ref_count as u32,
            state,
            created_at: parse_datetime(&self.created_at)?,
            updated_at: parse_datetime(&self.updated_at)?,
        })
    }
}

fn decode_listener(row: &sqlx::sqlite::SqliteRow) -> Result<SubscriptionListener, RepositoryError> {
    let get = |column: &str| -> Result<String, RepositoryError> {
        row.try_get::<String, _>(column).map_err(query_err)
    };

    let mode = get("mode")?
        .parse::<ListenerMode>()
        .map_err(RepositoryError::Query)?;

    Ok(SubscriptionListener {
        binding_key: get("binding_key")?,
        node_id: get("node_id")?,
        step_type: get("step_type")?,
        mode,
        filters: from_json("filters", &get("filters")?)?,
        attached_at: parse_datetime(&get("attached_at")?)?,
    })
}

// ---------------------------------------------------------------------------
// SubscriptionRepository impl
// ---------------------------------------------------------------------------

impl SubscriptionRepository for SqliteSubscriptionRepository {
    async fn find_active_by_target(
        &self,
        provider: &str,
        target: &str,
    ) -> Result<Vec<WebhookSubscription>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "{SELECT_SUBSCRIPTION} WHERE provider = ? AND target = ? AND state = 'active' ORDER BY id ASC"
        ))
        .bind(provider)
        .bind(target)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_err)?;

        rows.iter().map(|row| self.decode(row)).collect()
    }

    async fn get_by_binding_key(
        &self,
        binding_key: &str,
    ) -> Result<Option<WebhookSubscription>, RepositoryError> {
        let row = sqlx::query(&format!("{SELECT_SUBSCRIPTION} WHERE binding_key = ?"))
            .bind(binding_key)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_err)?;

        row.as_ref().map(|row| self.decode(row)).transpose()
    }

    async fn insert(&self, subscription: &WebhookSubscription) -> Result<(), RepositoryError> {
        let secret_encrypted = self.seal(subscription.secret.as_deref())?;

        // ref_count starts at zero; it only moves through attach/detach.
        let result = sqlx::query(
            r#"INSERT INTO webhook_subscriptions
               (id, binding_key, provider, target, remote_id, secret_encrypted, scheme,
                desired_config, ref_count, state, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?, ?)"#,
        )
        .bind(subscription.id.to_string())
        .bind(&subscription.binding_key)
        .bind(&subscription.provider)
        .bind(&subscription.target)
        .bind(&subscription.remote_id)
        .bind(&secret_encrypted)
        .bind(to_json(&subscription.scheme)?)
        .bind(to_json(&subscription.desired_config)?)
        .bind(subscription.state.to_string())
        .bind(format_datetime(&subscription.created_at))
        .bind(format_datetime(&subscription.updated_at))
        .execute(&self.pool.writer)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(RepositoryError::Conflict(format!(
                "binding key {} already exists",
                subscription.binding_key
            ))),
            Err(e) => Err(query_err(e)),
        }
    }

    async fn update_registration(
        &self,
        binding_key: &str,
        desired_config: &Value,
        remote_id: Option<&str>,
    ) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            "UPDATE webhook_subscriptions SET desired_config = ?, remote_id = ?, updated_at = ?
             WHERE binding_key = ?",
        )
        .bind(to_json(desired_config)?)
        .bind(remote_id)
        .bind(format_datetime(&Utc::now()))
        .bind(binding_key)
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn mark_pending_deletion(&self, binding_key: &str) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            "UPDATE webhook_subscriptions SET state = 'pending_deletion', updated_at = ?
             WHERE binding_key = ?",
        )
        .bind(format_datetime(&Utc::now()))
        .bind(binding_key)
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn list_pending_deletion(&self) -> Result<Vec<WebhookSubscription>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "{SELECT_SUBSCRIPTION} WHERE state = 'pending_deletion' ORDER BY id ASC"
        ))
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_err)?;

        rows.iter().map(|row| self.decode(row)).collect()
    }

    async fn delete(&self, binding_key: &str) -> Result<bool, RepositoryError> {
        let result = sqlx::query("DELETE FROM webhook_subscriptions WHERE binding_key = ?")
            .bind(binding_key)
            .execute(&self.pool.writer)
            .await
            .map_err(query_err)?;

        Ok(result.rows_affected() > 0)
    }

    async fn attach_listener(&self, listener: &SubscriptionListener) -> Result<u32, RepositoryError> {
        let mut tx = self.pool.writer.begin().await.map_err(query_err)?;

        Self::require_subscription(&mut tx, &listener.binding_key).await?;

        sqlx::query(
            r#"INSERT INTO subscription_listeners
               (binding_key, node_id, step_type, mode, filters, attached_at)
               VALUES (?, ?, ?, ?, ?, ?)
               ON CONFLICT(binding_key, node_id) DO UPDATE SET
                 step_type = excluded.step_type,
                 mode = excluded.mode,
                 filters = excluded.filters,
                 attached_at = excluded.attached_at"#,
        )
        .bind(&listener.binding_key)
        .bind(&listener.node_id)
        .bind(&listener.step_type)
        .bind(listener.mode.to_string())
        .bind(to_json(&listener.filters)?)
        .bind(format_datetime(&listener.attached_at))
        .execute(&mut *tx)
        .await
        .map_err(query_err)?;

        let count = Self::sync_ref_count(&mut tx, &listener.binding_key).await?;
        tx.commit().await.map_err(query_err)?;
        Ok(count)
    }

    async fn detach_listener(&self, binding_key: &str, node_id: &str) -> Result<u32, RepositoryError> {
        let mut tx = self.pool.writer.begin().await.map_err(query_err)?;

        Self::require_subscription(&mut tx, binding_key).await?;

        sqlx::query("DELETE FROM subscription_listeners WHERE binding_key = ? AND node_id = ?")
            .bind(binding_key)
            .bind(node_id)
            .execute(&mut *tx)
            .await
            .map_err(query_err)?;

        let count = Self::sync_ref_count(&mut tx, binding_key).await?;
        tx.commit().await.map_err(query_err)?;
        Ok(count)
    }

    async fn listeners(&self, binding_key: &str) -> Result<Vec<SubscriptionListener>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "{SELECT_LISTENER} WHERE binding_key = ? ORDER BY attached_at ASC, node_id ASC"
        ))
        .bind(binding_key)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_err)?;

        rows.iter().map(decode_listener).collect()
    }

    async fn listeners_for_node(
        &self,
        node_id: &str,
    ) -> Result<Vec<SubscriptionListener>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "{SELECT_LISTENER} WHERE node_id = ? ORDER BY attached_at ASC, binding_key ASC"
        ))
        .bind(node_id)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_err)?;

        rows.iter().map(decode_listener).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite::pool::test_pool;
    use serde_json::json;
    use tether_types::delivery::FilterSet;
    use tether_types::subscription::SignatureScheme;
    use uuid::Uuid;

    fn vault() -> Arc<VaultCrypto> {
        Arc::new(VaultCrypto::new(&[7u8; 32]))
    }

    async fn make_repo() -> SqliteSubscriptionRepository {
        SqliteSubscriptionRepository::new(test_pool().await, vault())
    }

    fn make_subscription(key: &str, target: &str) -> WebhookSubscription {
        let now = Utc::now();
        WebhookSubscription {
            id: Uuid::now_v7(),
            binding_key: key.to_string(),
            provider: "registry".to_string(),
            target: target.to_string(),
            remote_id: Some("hook-1".to_string()),
            secret: Some("s3cret".to_string()),
            scheme: SignatureScheme::HmacSha256 {
                header: "x-signature".to_string(),
            },
            desired_config: json!({"events": ["push"]}),
            ref_count: 5,
            state: SubscriptionState::Active,
            created_at: now,
            updated_at: now,
        }
    }

    fn make_listener(key: &str, node: &str) -> SubscriptionListener {
        SubscriptionListener {
            binding_key: key.to_string(),
            node_id: node.to_string(),
            step_type: "wait_for_event".to_string(),
            mode: ListenerMode::Wait,
            filters: FilterSet {
                event_types: vec!["push".to_string()],
                ..FilterSet::default()
            },
            attached_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_insert_round_trips_and_encrypts_secret() {
        let pool = test_pool().await;
        let repo = SqliteSubscriptionRepository::new(pool.clone(), vault());
        let sub = make_subscription("bk-1", "acme/api");
        repo.insert(&sub).await.unwrap();

        let loaded = repo.get_by_binding_key("bk-1").await.unwrap().unwrap();
        assert_eq!(loaded.id, sub.id);
        assert_eq!(loaded.secret.as_deref(), Some("s3cret"));
        assert_eq!(loaded.scheme, sub.scheme);
        assert_eq!(loaded.desired_config, json!({"events": ["push"]}));
        assert_eq!(loaded.ref_count, 0);
        assert_eq!(loaded.state, SubscriptionState::Active);

        let stored: Option<String> = sqlx::query_scalar(
            "SELECT secret_encrypted FROM webhook_subscriptions WHERE binding_key = 'bk-1'",
        )
        .fetch_one(&pool.reader)
        .await
        .unwrap();
        let stored = stored.unwrap();
        assert!(!stored.contains("s3cret"));

        assert!(repo.get_by_binding_key("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_wrong_key_fails_decryption() {
        let pool = test_pool().await;
        let writer = SqliteSubscriptionRepository::new(pool.clone(), vault());
        writer.insert(&make_subscription("bk-1", "acme/api")).await.unwrap();

        let reader = SqliteSubscriptionRepository::new(pool, Arc::new(VaultCrypto::new(&[9u8; 32])));
        let err = reader.get_by_binding_key("bk-1").await.unwrap_err();
        assert!(matches!(err, RepositoryError::Encryption));
    }

    #[tokio::test]
    async fn test_duplicate_binding_key_is_conflict() {
        let repo = make_repo().await;
        repo.insert(&make_subscription("bk-1", "acme/api")).await.unwrap();
        let err = repo
            .insert(&make_subscription("bk-1", "acme/web"))
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_listener_attach_is_idempotent_per_node() {
        let repo = make_repo().await;
        repo.insert(&make_subscription("bk-1", "acme/api")).await.unwrap();

        assert_eq!(repo.attach_listener(&make_listener("bk-1", "a")).await.unwrap(), 1);
        assert_eq!(repo.attach_listener(&make_listener("bk-1", "b")).await.unwrap(), 2);

        let mut updated = make_listener("bk-1", "a");
        updated.mode = ListenerMode::Trigger;
        assert_eq!(repo.attach_listener(&updated).await.unwrap(), 2);

        let listeners = repo.listeners("bk-1").await.unwrap();
        assert_eq!(listeners.len(), 2);
        let a = listeners.iter().find(|l| l.node_id == "a").unwrap();
        assert_eq!(a.mode, ListenerMode::Trigger);
        assert_eq!(a.filters.event_types, vec!["push"]);

        let sub = repo.get_by_binding_key("bk-1").await.unwrap().unwrap();
        assert_eq!(sub.ref_count, 2);
    }

    #[tokio::test]
    async fn test_detach_updates_ref_count() {
        let repo = make_repo().await;
        repo.insert(&make_subscription("bk-1", "acme/api")).await.unwrap();
        repo.attach_listener(&make_listener("bk-1", "a")).await.unwrap();
        repo.attach_listener(&make_listener("bk-1", "b")).await.unwrap();

        assert_eq!(repo.detach_listener("bk-1", "a").await.unwrap(), 1);
        assert_eq!(repo.detach_listener("bk-1", "a").await.unwrap(), 1);
        assert_eq!(repo.detach_listener("bk-1", "b").await.unwrap(), 0);
        assert_eq!(
            repo.get_by_binding_key("bk-1").await.unwrap().unwrap().ref_count,
            0
        );
    }

    #[tokio::test]
    async fn test_listener_ops_on_missing_subscription() {
        let repo = make_repo().await;
        assert!(matches!(
            repo.attach_listener(&make_listener("nope", "a")).await.unwrap_err(),
            RepositoryError::NotFound
        ));
        assert!(matches!(
            repo.detach_listener("nope", "a").await.unwrap_err(),
            RepositoryError::NotFound
        ));
        assert!(repo.listeners("nope").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_pending_deletion_hides_from_target_lookup() {
        let repo = make_repo().await;
        repo.insert(&make_subscription("bk-1", "acme/api")).await.unwrap();
        repo.insert(&make_subscription("bk-2", "acme/api")).await.unwrap();
        repo.insert(&make_subscription("bk-3", "acme/web")).await.unwrap();

        let active = repo.find_active_by_target("registry", "acme/api").await.unwrap();
        let keys: Vec<&str> = active.iter().map(|s| s.binding_key.as_str()).collect();
        assert_eq!(keys, vec!["bk-1", "bk-2"]);

        repo.mark_pending_deletion("bk-1").await.unwrap();
        let active = repo.find_active_by_target("registry", "acme/api").await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].binding_key, "bk-2");

        let pending = repo.list_pending_deletion().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].state, SubscriptionState::PendingDeletion);

        assert!(matches!(
            repo.mark_pending_deletion("nope").await.unwrap_err(),
            RepositoryError::NotFound
        ));
    }

    #[tokio::test]
    async fn test_update_registration() {
        let repo = make_repo().await;
        repo.insert(&make_subscription("bk-1", "acme/api")).await.unwrap();

        repo.update_registration("bk-1", &json!({"events": ["push", "tag"]}), Some("hook-9"))
            .await
            .unwrap();
        let sub = repo.get_by_binding_key("bk-1").await.unwrap().unwrap();
        assert_eq!(sub.desired_config, json!({"events": ["push", "tag"]}));
        assert_eq!(sub.remote_id.as_deref(), Some("hook-9"));

        assert!(matches!(
            repo.update_registration("nope", &json!({}), None).await.unwrap_err(),
            RepositoryError::NotFound
        ));
    }

    #[tokio::test]
    async fn test_delete_cascades_to_listeners() {
        let repo = make_repo().await;
        repo.insert(&make_subscription("bk-1", "acme/api")).await.unwrap();
        repo.insert(&make_subscription("bk-2", "acme/web")).await.unwrap();
        repo.attach_listener(&make_listener("bk-1", "a")).await.unwrap();
        repo.attach_listener(&make_listener("bk-2", "a")).await.unwrap();

        assert_eq!(repo.listeners_for_node("a").await.unwrap().len(), 2);

        assert!(repo.delete("bk-1").await.unwrap());
        assert!(!repo.delete("bk-1").await.unwrap());
        assert!(repo.listeners("bk-1").await.unwrap().is_empty());

        let remaining = repo.listeners_for_node("a").await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].binding_key, "bk-2");
    }

    #[tokio::test]
    async fn test_unauthenticated_subscription_has_no_secret() {
        let repo = make_repo().await;
        let mut sub = make_subscription("bk-1", "acme/api");
        sub.secret = None;
        sub.scheme = SignatureScheme::None;
        repo.insert(&sub).await.unwrap();

        let loaded = repo.get_by_binding_key("bk-1").await.unwrap().unwrap();
        assert!(loaded.secret.is_none());
        assert_eq!(loaded.scheme, SignatureScheme::None);
    }
}
