//! Application state wiring storage, providers and the correlation service.
//!
//! The service is generic over its repositories; `AppState` pins it to the
//! SQLite implementations.

use std::sync::Arc;

use tether_core::service::{CorrelationService, ServiceSettings};
use tether_core::step::StepRegistry;
use tether_core::webhook::ProviderRegistry;
use tether_infra::crypto::VaultCrypto;
use tether_infra::filesystem::DataLayout;
use tether_infra::provider::build_registry;
use tether_infra::sqlite::{DatabasePool, SqliteExecutionRepository, SqliteSubscriptionRepository};
use tether_types::config::TetherConfig;
use tokio::task::JoinHandle;

/// The correlation service pinned to SQLite storage.
pub type ConcreteCorrelationService =
    CorrelationService<SqliteSubscriptionRepository, SqliteExecutionRepository>;

/// Shared state handed to every HTTP handler.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<ConcreteCorrelationService>,
    pub providers: Arc<ProviderRegistry>,
    pub db_pool: DatabasePool,
}

impl AppState {
    /// Open storage and wire the correlation service from `config`.
    pub async fn init(config: &TetherConfig) -> anyhow::Result<Self> {
        let layout = DataLayout::new(config);
        layout.ensure().await?;
        tracing::info!(data_dir = %layout.data_dir.display(), "using data directory");

        let vault = VaultCrypto::from_key_file(&layout.vault_key_path).await?;
        let db_pool = DatabasePool::new(&layout.database_url).await?;
        let providers = Arc::new(build_registry(&config.providers)?);
        if providers.is_empty() {
            tracing::warn!("no [[providers]] configured; steps cannot register webhooks");
        }

        Ok(Self::assemble(
            db_pool,
            Arc::new(vault),
            providers,
            ServiceSettings::from_config(config),
        ))
    }

    /// Wire the service from already-open parts.
    pub fn assemble(
        db_pool: DatabasePool,
        vault: Arc<VaultCrypto>,
        providers: Arc<ProviderRegistry>,
        settings: ServiceSettings,
    ) -> Self {
        let subscriptions = Arc::new(SqliteSubscriptionRepository::new(db_pool.clone(), vault));
        let executions = Arc::new(SqliteExecutionRepository::new(db_pool.clone()));
        let steps = Arc::new(StepRegistry::with_builtins());

        let service = CorrelationService::new(
            subscriptions,
            executions,
            providers.clone(),
            steps,
            settings,
        );

        Self {
            service: Arc::new(service),
            providers,
            db_pool,
        }
    }

    /// Re-arm persisted timers, then start the background tasks.
    pub async fn start(&self) -> anyhow::Result<Vec<JoinHandle<()>>> {
        let recovered = self.service.recover_timers().await?;
        if recovered > 0 {
            tracing::info!(recovered, "re-armed timers of suspended executions");
        }
        Ok(self.service.start())
    }
}
