//! CorrelationService: one entry point for the workflow runtime and ingress.
//!
//! Wires the step registry, subscription manager, event router and
//! resolution engine together and runs the node lifecycle:
//! `setup_step` -> `execute_step` (any number of runs) -> `teardown_step`.
//! Inbound deliveries go through `handle_delivery`; direct calls through
//! `invoke_action` and `schedule_action_call`.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tether_types::config::TetherConfig;
use tether_types::delivery::{Delivery, RouteOutcome};
use tether_types::error::RepositoryError;
use tether_types::event::CorrelationEvent;
use tether_types::execution::{Execution, PendingTimer, ResolutionSource};
use tether_types::step::{StepKind, StepNode};
use tether_types::timer::{FiredTimer, TimerHandle, TimerRequest};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::event::EventBus;
use crate::repository::{ExecutionRepository, SubscriptionRepository};
use crate::resolution::{Resolution, ResolutionEngine, ResolutionError};
use crate::step::{BoxStepType, StepError, StepRegistry};
use crate::webhook::filter::FilterEngine;
use crate::webhook::provider::ProviderRegistry;
use crate::webhook::router::{EventRouter, RouteError};
use crate::webhook::subscription::{
    ReleaseOutcome, SubscriptionError, SubscriptionHandle, SubscriptionManager,
};

// ---------------------------------------------------------------------------
// Settings and errors
// ---------------------------------------------------------------------------

/// Runtime knobs taken from `TetherConfig`.
#[derive(Debug, Clone)]
pub struct ServiceSettings {
    /// Base of every callback URL handed to providers.
    pub public_base_url: String,
    /// Lifetime of cached resource id -> name lookups.
    pub resource_cache_ttl: Duration,
    /// Period of the background retry of failed remote deletions.
    pub deletion_retry_interval: Duration,
}

impl ServiceSettings {
    pub fn from_config(config: &TetherConfig) -> Self {
        Self {
            public_base_url: config.server.public_base_url.clone(),
            resource_cache_ttl: Duration::from_secs(config.filters.resource_cache_ttl_secs),
            deletion_retry_interval: Duration::from_secs(
                config.subscriptions.deletion_retry_interval_secs,
            ),
        }
    }
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self::from_config(&TetherConfig::default())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("unknown step type '{0}'")]
    UnknownStepType(String),

    #[error("step type '{0}' is a trigger and cannot be executed")]
    NotExecutable(String),

    #[error("execution not found: {0}")]
    ExecutionNotFound(Uuid),

    #[error("execution {0} is no longer suspended")]
    NotSuspended(Uuid),

    #[error("step type '{step_type}' has no action '{action}'")]
    UnknownAction { step_type: String, action: String },

    #[error(transparent)]
    Step(#[from] StepError),

    #[error(transparent)]
    Subscription(#[from] SubscriptionError),

    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

// ---------------------------------------------------------------------------
// CorrelationService
// ---------------------------------------------------------------------------

pub struct CorrelationService<S: SubscriptionRepository, E: ExecutionRepository> {
    steps: Arc<StepRegistry>,
    executions: Arc<E>,
    subscriptions: Arc<SubscriptionManager<S>>,
    engine: Arc<ResolutionEngine<E>>,
    router: EventRouter<S, E>,
    bus: EventBus,
    fired: Mutex<Option<mpsc::UnboundedReceiver<FiredTimer>>>,
    deletion_retry_interval: Duration,
}

impl<S, E> CorrelationService<S, E>
where
    S: SubscriptionRepository + 'static,
    E: ExecutionRepository + 'static,
{
    pub fn new(
        subscriptions: Arc<S>,
        executions: Arc<E>,
        providers: Arc<ProviderRegistry>,
        steps: Arc<StepRegistry>,
        settings: ServiceSettings,
    ) -> Self {
        let bus = EventBus::default();
        let (engine, fired) = ResolutionEngine::new(executions.clone(), steps.clone(), bus.clone());
        let engine = Arc::new(engine);
        let router = EventRouter::new(
            subscriptions.clone(),
            executions.clone(),
            providers.clone(),
            steps.clone(),
            FilterEngine::new(settings.resource_cache_ttl),
            engine.clone(),
            bus.clone(),
        );
        let manager = SubscriptionManager::new(subscriptions, providers, settings.public_base_url);

        Self {
            steps,
            executions,
            subscriptions: Arc::new(manager),
            engine,
            router,
            bus,
            fired: Mutex::new(Some(fired)),
            deletion_retry_interval: settings.deletion_retry_interval,
        }
    }

    pub fn steps(&self) -> &Arc<StepRegistry> {
        &self.steps
    }

    pub fn subscriptions(&self) -> &Arc<SubscriptionManager<S>> {
        &self.subscriptions
    }

    /// Receive every lifecycle event published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<CorrelationEvent> {
        self.bus.subscribe()
    }

    /// Spawn the timer dispatch loop and the deletion sweeper.
    ///
    /// Only the first call spawns anything.
    pub fn start(&self) -> Vec<JoinHandle<()>> {
        let fired = match self.fired.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        let Some(fired) = fired else {
            tracing::warn!("correlation service already started");
            return Vec::new();
        };
        tracing::info!(
            step_types = self.steps.len(),
            providers = self.subscriptions.providers().len(),
            "correlation service started"
        );
        vec![
            self.engine.spawn_timer_dispatch(fired),
            self.spawn_deletion_sweeper(),
        ]
    }

    fn step(&self, name: &str) -> Result<Arc<BoxStepType>, ServiceError> {
        self.steps
            .get(name)
            .ok_or_else(|| ServiceError::UnknownStepType(name.to_string()))
    }

    // -----------------------------------------------------------------------
    // Node lifecycle
    // -----------------------------------------------------------------------

    /// Run a node's setup and attach it to the subscription it asks for.
    pub async fn setup_step(&self, node: &StepNode) -> Result<Option<SubscriptionHandle>, ServiceError> {
        let step = self.step(&node.step_type)?;
        let plan = step.setup(node).await?;
        let Some(request) = plan.subscription else {
            tracing::debug!(node_id = %node.id, step_type = %node.step_type, "setup without subscription");
            return Ok(None);
        };
        let handle = self
            .subscriptions
            .request_subscription(&request, &node.id, step.name(), step.listener_mode())
            .await?;
        tracing::info!(
            node_id = %node.id,
            binding_key = %handle.binding_key,
            ref_count = handle.ref_count,
            disposition = ?handle.disposition,
            "node set up"
        );
        Ok(Some(handle))
    }

    /// Start one run of a node: perform its side effect, persist a
    /// suspended execution, arm its timer.
    pub async fn execute_step(&self, node: &StepNode, input: &Value) -> Result<Execution, ServiceError> {
        let step = self.step(&node.step_type)?;
        if step.kind() == StepKind::Trigger {
            return Err(ServiceError::NotExecutable(node.step_type.clone()));
        }
        let plan = step.execute(node, input).await?;

        let mut execution = Execution::new(
            node.id.as_str(),
            step.name(),
            step.output_channels(),
            plan.metadata,
        );
        execution.correlation_key = plan.correlation_key;
        execution.pending_timer = plan.timer.as_ref().map(|timer| PendingTimer {
            action: timer.action.clone(),
            fire_at: fire_at(timer.delay),
            parameters: timer.parameters.clone(),
        });
        self.executions.create(&execution).await?;

        if let Some(timer) = &plan.timer {
            self.engine.schedule(execution.id, timer);
        }
        tracing::info!(
            execution_id = %execution.id,
            node_id = %node.id,
            correlation_key = ?execution.correlation_key,
            "execution suspended"
        );
        Ok(execution)
    }

    /// Run a node's cleanup and release every subscription it holds.
    pub async fn teardown_step(&self, node: &StepNode) -> Result<Vec<ReleaseOutcome>, ServiceError> {
        let step = self.step(&node.step_type)?;
        step.cleanup(node).await?;
        let outcomes = self.subscriptions.release_node(&node.id).await?;
        tracing::info!(node_id = %node.id, released = outcomes.len(), "node torn down");
        Ok(outcomes)
    }

    // -----------------------------------------------------------------------
    // Resolution paths
    // -----------------------------------------------------------------------

    pub async fn handle_delivery(&self, delivery: &Delivery) -> Result<RouteOutcome, RouteError> {
        self.router.route(delivery).await
    }

    /// Resolve an execution directly, bypassing webhooks.
    pub async fn invoke_action(
        &self,
        execution_id: Uuid,
        action: &str,
        parameters: Value,
    ) -> Result<Resolution, ResolutionError> {
        self.engine
            .try_resolve(execution_id, action, parameters, ResolutionSource::Direct)
            .await
    }

    /// Arm a deferred call of `action` on a suspended execution.
    pub async fn schedule_action_call(
        &self,
        execution_id: Uuid,
        action: &str,
        delay: Duration,
        parameters: Value,
    ) -> Result<TimerHandle, ServiceError> {
        let execution = self
            .executions
            .get(&execution_id)
            .await?
            .ok_or(ServiceError::ExecutionNotFound(execution_id))?;
        if execution.is_resolved() {
            return Err(ServiceError::NotSuspended(execution_id));
        }
        let step = self.step(&execution.step_type)?;
        if step.action_channel(action).is_none() {
            return Err(ServiceError::UnknownAction {
                step_type: execution.step_type,
                action: action.to_string(),
            });
        }

        let mut request = TimerRequest::new(action, delay);
        request.parameters = parameters;
        Ok(self.engine.schedule(execution_id, &request))
    }

    /// Cancel one scheduled call. False if it already fired or was replaced.
    pub fn cancel_action_call(&self, handle: &TimerHandle) -> bool {
        self.engine.timers().cancel(handle)
    }

    pub async fn cancel_execution(&self, execution_id: Uuid) -> Result<bool, ResolutionError> {
        self.engine.cancel(execution_id).await
    }

    pub async fn execution(&self, execution_id: Uuid) -> Result<Option<Execution>, RepositoryError> {
        self.executions.get(&execution_id).await
    }

    // -----------------------------------------------------------------------
    // Background work
    // -----------------------------------------------------------------------

    /// Re-arm the persisted timers of every suspended execution. Timers
    /// whose deadline passed while the process was down fire immediately.
    pub async fn recover_timers(&self) -> Result<usize, ServiceError> {
        let mut recovered = 0;
        for execution in self.executions.list_suspended().await? {
            let Some(pending) = execution.pending_timer else {
                continue;
            };
            let delay = (pending.fire_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            let mut request = TimerRequest::new(pending.action, delay);
            request.parameters = pending.parameters;
            self.engine.schedule(execution.id, &request);
            recovered += 1;
        }
        if recovered > 0 {
            tracing::info!(recovered, "re-armed persisted timers");
        }
        Ok(recovered)
    }

    /// Periodically retry remote deletions that failed earlier.
    pub fn spawn_deletion_sweeper(&self) -> JoinHandle<()> {
        let manager = self.subscriptions.clone();
        let period = self.deletion_retry_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            interval.tick().await;
            loop {
                interval.tick().await;
                let deleted = manager.retry_pending_deletions().await;
                if deleted > 0 {
                    tracing::info!(deleted, "retried pending remote deletions");
                }
            }
        })
    }
}

fn fire_at(delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| Utc::now().checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
