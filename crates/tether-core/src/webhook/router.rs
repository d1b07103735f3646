//! Delivery routing: binding key -> verified envelope -> intents.
//!
//! Processing order for one delivery:
//! 1. look up the subscription by binding key
//! 2. verify the signature (nothing is parsed before this passes)
//! 3. let the provider parse the body into an `EventEnvelope`
//! 4. for every attached listener, apply its filters and ask its step type
//!    whether the event invokes an action
//! 5. dispatch: wait listeners resolve their correlated execution through
//!    the `ResolutionEngine`; trigger listeners publish `TriggerFired`
//!
//! A shared subscription fans out to every listener; each listener yields
//! at most one intent.

use std::sync::Arc;

use tether_types::delivery::{Delivery, IgnoreReason, IntentTarget, RouteOutcome, RoutedIntent};
use tether_types::error::RepositoryError;
use tether_types::event::CorrelationEvent;
use tether_types::execution::ResolutionSource;
use tether_types::step::WebhookDecision;
use tether_types::subscription::{ListenerMode, SubscriptionListener};

use super::filter::FilterEngine;
use super::provider::{ProviderError, ProviderRegistry};
use super::signature::{SignatureError, verify_delivery};
use crate::event::EventBus;
use crate::repository::{ExecutionRepository, SubscriptionRepository};
use crate::resolution::{Resolution, ResolutionEngine, ResolutionError};
use crate::step::StepRegistry;

#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error("delivery rejected: {0}")]
    Authentication(#[from] SignatureError),

    #[error("malformed delivery: {0}")]
    Parse(ProviderError),

    #[error("subscription references unknown provider '{0}'")]
    UnknownProvider(String),

    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

/// Outcome of offering a delivery to one listener.
enum ListenerOutcome {
    Intent(RoutedIntent),
    Skipped(IgnoreReason),
}

pub struct EventRouter<S: SubscriptionRepository, E: ExecutionRepository> {
    subscriptions: Arc<S>,
    executions: Arc<E>,
    providers: Arc<ProviderRegistry>,
    steps: Arc<StepRegistry>,
    filters: FilterEngine,
    engine: Arc<ResolutionEngine<E>>,
    bus: EventBus,
}

impl<S, E> EventRouter<S, E>
where
    S: SubscriptionRepository,
    E: ExecutionRepository + 'static,
{
    pub fn new(
        subscriptions: Arc<S>,
        executions: Arc<E>,
        providers: Arc<ProviderRegistry>,
        steps: Arc<StepRegistry>,
        filters: FilterEngine,
        engine: Arc<ResolutionEngine<E>>,
        bus: EventBus,
    ) -> Self {
        Self {
            subscriptions,
            executions,
            providers,
            steps,
            filters,
            engine,
            bus,
        }
    }

    /// Route one inbound delivery.
    ///
    /// Errors mean the delivery was rejected (bad signature, malformed body)
    /// or an internal failure occurred. Authenticated deliveries that simply
    /// match nothing come back as `RouteOutcome::Ignored`.
    pub async fn route(&self, delivery: &Delivery) -> Result<RouteOutcome, RouteError> {
        let Some(subscription) = self
            .subscriptions
            .get_by_binding_key(&delivery.binding_key)
            .await?
        else {
            tracing::debug!(binding_key = %delivery.binding_key, "delivery for unknown binding key");
            return Ok(RouteOutcome::Ignored(IgnoreReason::UnknownBinding));
        };

        verify_delivery(delivery, &subscription.scheme, subscription.secret.as_deref()).inspect_err(
            |e| {
                tracing::warn!(
                    binding_key = %delivery.binding_key,
                    provider = %subscription.provider,
                    error = %e,
                    "delivery failed verification"
                );
            },
        )?;

        let provider = self
            .providers
            .get(&subscription.provider)
            .ok_or_else(|| RouteError::UnknownProvider(subscription.provider.clone()))?;
        let envelope = provider
            .parse_envelope(&delivery.headers, &delivery.body)
            .map_err(RouteError::Parse)?;

        let listeners = self.subscriptions.listeners(&delivery.binding_key).await?;
        if listeners.is_empty() {
            tracing::debug!(binding_key = %delivery.binding_key, "subscription has no listeners");
            return Ok(RouteOutcome::Ignored(IgnoreReason::NoListeners));
        }

        let mut intents = Vec::new();
        let mut reason = IgnoreReason::FilteredOut;
        let mut failure = None;
        for listener in &listeners {
            if !self.filters.matches(&listener.filters, &envelope, &provider).await {
                continue;
            }
            let Some(step) = self.steps.get(&listener.step_type) else {
                tracing::warn!(node_id = %listener.node_id, step_type = %listener.step_type, "listener has unknown step type");
                continue;
            };
            let WebhookDecision::Invoke { action, parameters } = step.handle_webhook(listener, &envelope)
            else {
                continue;
            };

            match self
                .dispatch(listener, envelope.correlation.as_deref(), action, parameters)
                .await
            {
                Ok(ListenerOutcome::Intent(intent)) => intents.push(intent),
                Ok(ListenerOutcome::Skipped(skipped)) => reason = more_specific(reason, skipped),
                Err(e) => {
                    tracing::error!(
                        binding_key = %delivery.binding_key,
                        node_id = %listener.node_id,
                        error = %e,
                        "listener dispatch failed"
                    );
                    failure.get_or_insert(e);
                }
            }
        }

        tracing::debug!(
            binding_key = %delivery.binding_key,
            event_type = %envelope.event_type,
            listeners = listeners.len(),
            intents = intents.len(),
            "delivery routed"
        );
        if intents.is_empty() {
            match failure {
                Some(e) => Err(e),
                None => Ok(RouteOutcome::Ignored(reason)),
            }
        } else {
            Ok(RouteOutcome::Dispatched(intents))
        }
    }

    async fn dispatch(
        &self,
        listener: &SubscriptionListener,
        correlation: Option<&str>,
        action: String,
        parameters: serde_json::Value,
    ) -> Result<ListenerOutcome, RouteError> {
        match listener.mode {
            ListenerMode::Trigger => {
                tracing::info!(node_id = %listener.node_id, action = %action, "trigger fired");
                self.bus.publish(CorrelationEvent::TriggerFired {
                    node_id: listener.node_id.clone(),
                    step_type: listener.step_type.clone(),
                    binding_key: listener.binding_key.clone(),
                    action: action.clone(),
                    parameters: parameters.clone(),
                });
                Ok(ListenerOutcome::Intent(RoutedIntent {
                    target: IntentTarget::Trigger {
                        node_id: listener.node_id.clone(),
                    },
                    action,
                    parameters,
                }))
            }
            ListenerMode::Wait => {
                let Some(key) = correlation else {
                    return Ok(ListenerOutcome::Skipped(IgnoreReason::NoCorrelation));
                };
                let execution = match self
                    .executions
                    .find_suspended_by_correlation(&listener.node_id, key)
                    .await?
                {
                    Some(execution) => execution,
                    None => {
                        // A terminal match means this is a redelivery.
                        let latest = self
                            .executions
                            .find_latest_by_correlation(&listener.node_id, key)
                            .await?;
                        let skipped = match latest {
                            Some(_) => IgnoreReason::AlreadyResolved,
                            None => IgnoreReason::NoSuspendedExecution,
                        };
                        return Ok(ListenerOutcome::Skipped(skipped));
                    }
                };

                match self
                    .engine
                    .try_resolve(execution.id, &action, parameters.clone(), ResolutionSource::Webhook)
                    .await?
                {
                    Resolution::Won { .. } | Resolution::WonWithoutOutput { .. } => {
                        Ok(ListenerOutcome::Intent(RoutedIntent {
                            target: IntentTarget::Execution {
                                execution_id: execution.id,
                            },
                            action,
                            parameters,
                        }))
                    }
                    Resolution::AlreadyResolved => {
                        Ok(ListenerOutcome::Skipped(IgnoreReason::AlreadyResolved))
                    }
                }
            }
        }
    }
}

/// Keep whichever reason says more about why nothing happened.
fn more_specific(current: IgnoreReason, candidate: IgnoreReason) -> IgnoreReason {
    fn rank(reason: IgnoreReason) -> u8 {
        match reason {
            IgnoreReason::UnknownBinding | IgnoreReason::NoListeners | IgnoreReason::FilteredOut => 0,
            IgnoreReason::NoCorrelation => 1,
            IgnoreReason::NoSuspendedExecution => 2,
            IgnoreReason::AlreadyResolved => 3,
        }
    }
    if rank(candidate) > rank(current) {
        candidate
    } else {
        current
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::{InMemoryExecutionRepository, InMemorySubscriptionRepository};
    use crate::testing::{FailingStep, FakeProvider, ProviderCalls};
    use crate::webhook::signature::compute_hmac_sha256_hex;
    use crate::webhook::subscription::SubscriptionManager;
    use serde_json::{Value, json};
    use std::time::Duration;
    use tether_types::delivery::FilterSet;
    use tether_types::execution::{Execution, ExecutionState};
    use tether_types::step::SubscriptionRequest;
    use tether_types::subscription::ExternalTarget;

    type Router = EventRouter<InMemorySubscriptionRepository, InMemoryExecutionRepository>;

    struct Fixture {
        router: Router,
        manager: SubscriptionManager<InMemorySubscriptionRepository>,
        subscriptions: Arc<InMemorySubscriptionRepository>,
        executions: Arc<InMemoryExecutionRepository>,
        bus: EventBus,
        calls: Arc<ProviderCalls>,
    }

    fn fixture() -> Fixture {
        let subscriptions = Arc::new(InMemorySubscriptionRepository::new());
        let executions = Arc::new(InMemoryExecutionRepository::new());
        let providers = Arc::new(ProviderRegistry::new());
        let fake = FakeProvider::new("registry").with_resource("17", "acme/api");
        let calls = fake.calls();
        providers.register(fake);
        let steps = StepRegistry::with_builtins();
        steps.register(FailingStep).unwrap();
        let steps = Arc::new(steps);
        let bus = EventBus::default();
        let (engine, _fired) = ResolutionEngine::new(executions.clone(), steps.clone(), bus.clone());
        let router = EventRouter::new(
            subscriptions.clone(),
            executions.clone(),
            providers.clone(),
            steps,
            FilterEngine::new(Duration::from_secs(300)),
            Arc::new(engine),
            bus.clone(),
        );
        let manager = SubscriptionManager::new(subscriptions.clone(), providers, "https://tether.test");
        Fixture {
            router,
            manager,
            subscriptions,
            executions,
            bus,
            calls,
        }
    }

    impl Fixture {
        async fn listen(&self, node_id: &str, step_type: &str, mode: ListenerMode, filters: FilterSet) -> String {
            let request = SubscriptionRequest {
                target: ExternalTarget::new("registry", "acme/api"),
                desired_config: json!({"events": ["artifact.pushed"]}),
                filters,
            };
            self.manager
                .request_subscription(&request, node_id, step_type, mode)
                .await
                .unwrap()
                .binding_key
        }

        async fn suspend(&self, node_id: &str, correlation: &str) -> Execution {
            let mut exec = Execution::new(
                node_id,
                "wait_for_event",
                vec!["received".to_string(), "timeout".to_string()],
                json!({}),
            );
            exec.correlation_key = Some(correlation.to_string());
            self.executions.create(&exec).await.unwrap();
            exec
        }

        async fn signed(&self, binding_key: &str, body: Value) -> Delivery {
            let secret = self
                .subscriptions
                .get_by_binding_key(binding_key)
                .await
                .unwrap()
                .unwrap()
                .secret
                .unwrap();
            let body = serde_json::to_vec(&body).unwrap();
            let signature = compute_hmac_sha256_hex(secret.as_bytes(), &body).unwrap();
            Delivery::new(binding_key, vec![("X-Signature", signature)], body)
        }
    }

    fn emissions(rx: &mut tokio::sync::broadcast::Receiver<CorrelationEvent>) -> usize {
        let mut count = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, CorrelationEvent::OutputEmitted { .. }) {
                count += 1;
            }
        }
        count
    }

    #[tokio::test]
    async fn unknown_binding_is_ignored() {
        let f = fixture();
        let delivery = Delivery::new("nope", Vec::<(&str, String)>::new(), b"{}".to_vec());
        let outcome = f.router.route(&delivery).await.unwrap();
        assert_eq!(outcome, RouteOutcome::Ignored(IgnoreReason::UnknownBinding));
    }

    #[tokio::test]
    async fn bad_signature_never_reaches_filters_or_engine() {
        let f = fixture();
        let filters = FilterSet {
            resources: vec![tether_types::delivery::ResourceFilter {
                attribute: "repository".to_string(),
                value: "17".to_string(),
                by_id: true,
            }],
            ..Default::default()
        };
        let key = f.listen("wait", "wait_for_event", ListenerMode::Wait, filters).await;
        let exec = f.suspend("wait", "order-1").await;

        let mut delivery = f
            .signed(&key, json!({"type": "artifact.pushed", "correlation": "order-1"}))
            .await;
        delivery.body = br#"{"type":"artifact.pushed","correlation":"order-1","x":1}"#.to_vec();

        let err = f.router.route(&delivery).await.unwrap_err();
        assert!(matches!(err, RouteError::Authentication(SignatureError::Mismatch)));
        assert_eq!(f.calls.resolved(), 0);
        let stored = f.executions.get(&exec.id).await.unwrap().unwrap();
        assert_eq!(stored.state, ExecutionState::Suspended);

        let unsigned = Delivery::new(key.as_str(), Vec::<(&str, String)>::new(), b"{}".to_vec());
        let err = f.router.route(&unsigned).await.unwrap_err();
        assert!(matches!(err, RouteError::Authentication(ref e) if e.is_missing()));
    }

    #[tokio::test]
    async fn malformed_body_is_parse_error() {
        let f = fixture();
        let key = f.listen("wait", "wait_for_event", ListenerMode::Wait, FilterSet::default()).await;
        let delivery = f.signed(&key, json!({"no_type": true})).await;
        assert!(matches!(f.router.route(&delivery).await, Err(RouteError::Parse(_))));
    }

    #[tokio::test]
    async fn resolves_correlated_execution_once() {
        let f = fixture();
        let mut rx = f.bus.subscribe();
        let key = f.listen("wait", "wait_for_event", ListenerMode::Wait, FilterSet::default()).await;
        let exec = f.suspend("wait", "order-1").await;
        let delivery = f
            .signed(&key, json!({"type": "artifact.pushed", "correlation": "order-1"}))
            .await;

        match f.router.route(&delivery).await.unwrap() {
            RouteOutcome::Dispatched(intents) => {
                assert_eq!(intents.len(), 1);
                assert_eq!(intents[0].target, IntentTarget::Execution { execution_id: exec.id });
                assert_eq!(intents[0].action, "receive");
            }
            other => panic!("expected dispatch, got {other:?}"),
        }

        let again = f.router.route(&delivery).await.unwrap();
        assert_eq!(again, RouteOutcome::Ignored(IgnoreReason::AlreadyResolved));
        assert_eq!(emissions(&mut rx), 1);

        let stored = f.executions.get(&exec.id).await.unwrap().unwrap();
        assert_eq!(stored.emitted_channel.as_deref(), Some("received"));
    }

    #[tokio::test]
    async fn uncorrelated_and_unknown_correlation_are_ignored() {
        let f = fixture();
        let key = f.listen("wait", "wait_for_event", ListenerMode::Wait, FilterSet::default()).await;
        f.suspend("wait", "order-1").await;

        let delivery = f.signed(&key, json!({"type": "artifact.pushed"})).await;
        assert_eq!(
            f.router.route(&delivery).await.unwrap(),
            RouteOutcome::Ignored(IgnoreReason::NoCorrelation)
        );

        let delivery = f
            .signed(&key, json!({"type": "artifact.pushed", "correlation": "order-2"}))
            .await;
        assert_eq!(
            f.router.route(&delivery).await.unwrap(),
            RouteOutcome::Ignored(IgnoreReason::NoSuspendedExecution)
        );
    }

    #[tokio::test]
    async fn shared_subscription_fans_out_per_listener_filters() {
        let f = fixture();
        let pushed_only = FilterSet {
            event_types: vec!["artifact.pushed".to_string()],
            ..Default::default()
        };
        let deleted_only = FilterSet {
            event_types: vec!["artifact.deleted".to_string()],
            ..Default::default()
        };
        let a = f.listen("wait-a", "wait_for_event", ListenerMode::Wait, pushed_only.clone()).await;
        let b = f.listen("wait-b", "wait_for_event", ListenerMode::Wait, pushed_only).await;
        let c = f.listen("wait-c", "wait_for_event", ListenerMode::Wait, deleted_only).await;
        assert_eq!(a, b);
        assert_eq!(b, c);
        assert_eq!(f.calls.registered(), 1);

        let exec_a = f.suspend("wait-a", "order-1").await;
        let exec_b = f.suspend("wait-b", "order-1").await;
        let exec_c = f.suspend("wait-c", "order-1").await;

        let delivery = f
            .signed(&a, json!({"type": "artifact.pushed", "correlation": "order-1"}))
            .await;
        let RouteOutcome::Dispatched(intents) = f.router.route(&delivery).await.unwrap() else {
            panic!("expected dispatch");
        };
        let mut targets: Vec<IntentTarget> = intents.into_iter().map(|i| i.target).collect();
        targets.sort_by_key(|t| format!("{t:?}"));
        let mut expected = vec![
            IntentTarget::Execution { execution_id: exec_a.id },
            IntentTarget::Execution { execution_id: exec_b.id },
        ];
        expected.sort_by_key(|t| format!("{t:?}"));
        assert_eq!(targets, expected);

        let untouched = f.executions.get(&exec_c.id).await.unwrap().unwrap();
        assert_eq!(untouched.state, ExecutionState::Suspended);
    }

    #[tokio::test]
    async fn filtered_out_when_no_listener_matches() {
        let f = fixture();
        let filters = FilterSet {
            statuses: vec!["failed".to_string()],
            ..Default::default()
        };
        let key = f.listen("wait", "wait_for_event", ListenerMode::Wait, filters).await;
        f.suspend("wait", "order-1").await;
        let delivery = f
            .signed(
                &key,
                json!({"type": "artifact.pushed", "status": "success", "correlation": "order-1"}),
            )
            .await;
        assert_eq!(
            f.router.route(&delivery).await.unwrap(),
            RouteOutcome::Ignored(IgnoreReason::FilteredOut)
        );
    }

    #[tokio::test]
    async fn trigger_listener_publishes_trigger_fired() {
        let f = fixture();
        let mut rx = f.bus.subscribe();
        let key = f
            .listen("on-push", "event_trigger", ListenerMode::Trigger, FilterSet::default())
            .await;
        let delivery = f
            .signed(&key, json!({"type": "artifact.pushed", "attributes": {"tag": "v1"}}))
            .await;

        let RouteOutcome::Dispatched(intents) = f.router.route(&delivery).await.unwrap() else {
            panic!("expected dispatch");
        };
        assert_eq!(
            intents[0].target,
            IntentTarget::Trigger {
                node_id: "on-push".to_string()
            }
        );
        match rx.recv().await.unwrap() {
            CorrelationEvent::TriggerFired { node_id, binding_key, .. } => {
                assert_eq!(node_id, "on-push");
                assert_eq!(binding_key, key);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn failing_listener_does_not_hide_sibling_effects() {
        let f = fixture();
        let mut rx = f.bus.subscribe();
        let trigger = f
            .listen("on-push", "event_trigger", ListenerMode::Trigger, FilterSet::default())
            .await;
        let wait = f.listen("flaky", FailingStep::NAME, ListenerMode::Wait, FilterSet::default()).await;
        assert_eq!(trigger, wait);

        let mut exec = Execution::new("flaky", FailingStep::NAME, vec!["done".to_string()], json!({}));
        exec.correlation_key = Some("order-1".to_string());
        f.executions.create(&exec).await.unwrap();

        let delivery = f
            .signed(&wait, json!({"type": "artifact.pushed", "correlation": "order-1"}))
            .await;
        let RouteOutcome::Dispatched(intents) = f.router.route(&delivery).await.unwrap() else {
            panic!("expected dispatch");
        };
        assert_eq!(intents.len(), 2);

        let mut triggers = 0;
        let mut outputs = 0;
        while let Ok(event) = rx.try_recv() {
            match event {
                CorrelationEvent::TriggerFired { .. } => triggers += 1,
                CorrelationEvent::OutputEmitted { .. } => outputs += 1,
                _ => {}
            }
        }
        assert_eq!(triggers, 1);
        assert_eq!(outputs, 0);

        let stored = f.executions.get(&exec.id).await.unwrap().unwrap();
        assert_eq!(stored.state, ExecutionState::Resolved);
        assert_eq!(stored.emitted_channel, None);

        let again = f.router.route(&delivery).await.unwrap();
        assert!(matches!(again, RouteOutcome::Dispatched(ref i) if i.len() == 1));
    }

    #[tokio::test]
    async fn released_subscription_has_no_listeners() {
        let f = fixture();
        let key = f.listen("wait", "wait_for_event", ListenerMode::Wait, FilterSet::default()).await;
        f.calls.set_fail_unregister(true);
        f.manager.release_subscription(&key, "wait").await.unwrap();

        let delivery = f.signed(&key, json!({"type": "artifact.pushed"})).await;
        assert_eq!(
            f.router.route(&delivery).await.unwrap(),
            RouteOutcome::Ignored(IgnoreReason::NoListeners)
        );
    }
}
