//! Shared test doubles.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use dashmap::DashMap;
use serde_json::Value;
use tether_types::delivery::EventEnvelope;
use tether_types::execution::Execution;
use tether_types::step::{ActionResult, ActionSpec, StepKind, WebhookDecision};
use tether_types::subscription::{ExternalTarget, SignatureScheme, SubscriptionListener};

use crate::step::{StepError, StepType};
use crate::webhook::provider::{MergeDecision, ProviderError, RemoteRegistration, WebhookProvider};

/// Counters shared between a `FakeProvider` and the test that built it.
#[derive(Debug, Default)]
pub struct ProviderCalls {
    registered: AtomicUsize,
    updated: AtomicUsize,
    unregistered: AtomicUsize,
    resolved: AtomicUsize,
    fail_unregister: AtomicBool,
    last_config: std::sync::Mutex<Option<Value>>,
}

impl ProviderCalls {
    pub fn registered(&self) -> usize {
        self.registered.load(Ordering::SeqCst)
    }

    pub fn updated(&self) -> usize {
        self.updated.load(Ordering::SeqCst)
    }

    pub fn unregistered(&self) -> usize {
        self.unregistered.load(Ordering::SeqCst)
    }

    pub fn resolved(&self) -> usize {
        self.resolved.load(Ordering::SeqCst)
    }

    pub fn set_fail_unregister(&self, fail: bool) {
        self.fail_unregister.store(fail, Ordering::SeqCst);
    }

    pub fn last_config(&self) -> Option<Value> {
        self.last_config.lock().ok().and_then(|c| c.clone())
    }
}

/// In-process provider: HMAC-signed JSON bodies shaped like
/// `{"type", "status", "category", "source", "attributes", "correlation"}`.
///
/// Configs merge when they differ only in their `events` arrays.
pub struct FakeProvider {
    name: String,
    scheme: SignatureScheme,
    multiple: bool,
    merge_events: bool,
    calls: Arc<ProviderCalls>,
    resources: DashMap<String, String>,
}

impl FakeProvider {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            scheme: SignatureScheme::HmacSha256 {
                header: "x-signature".to_string(),
            },
            multiple: true,
            merge_events: false,
            calls: Arc::new(ProviderCalls::default()),
            resources: DashMap::new(),
        }
    }

    pub fn single_registration(mut self) -> Self {
        self.multiple = false;
        self
    }

    pub fn merging_events(mut self) -> Self {
        self.merge_events = true;
        self
    }

    pub fn with_scheme(mut self, scheme: SignatureScheme) -> Self {
        self.scheme = scheme;
        self
    }

    pub fn with_resource(self, id: &str, name: &str) -> Self {
        self.resources.insert(id.to_string(), name.to_string());
        self
    }

    pub fn calls(&self) -> Arc<ProviderCalls> {
        self.calls.clone()
    }

    fn without_events(config: &Value) -> Value {
        let mut config = config.clone();
        if let Some(obj) = config.as_object_mut() {
            obj.remove("events");
        }
        config
    }

    fn events(config: &Value) -> Vec<String> {
        config
            .get("events")
            .and_then(Value::as_array)
            .map(|a| {
                a.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl WebhookProvider for FakeProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn scheme(&self) -> SignatureScheme {
        self.scheme.clone()
    }

    fn reconcile(&self, existing: &Value, desired: &Value) -> MergeDecision {
        if self.compare_config(existing, desired) {
            return MergeDecision::Unchanged;
        }
        if !self.merge_events || Self::without_events(existing) != Self::without_events(desired) {
            return MergeDecision::Conflict;
        }
        let mut events = Self::events(existing);
        for event in Self::events(desired) {
            if !events.contains(&event) {
                events.push(event);
            }
        }
        let mut merged = existing.clone();
        if let Some(obj) = merged.as_object_mut() {
            obj.insert("events".to_string(), serde_json::json!(events));
        }
        if &merged == existing {
            MergeDecision::Unchanged
        } else {
            MergeDecision::Merged(merged)
        }
    }

    fn allows_multiple_registrations(&self) -> bool {
        self.multiple
    }

    async fn register(&self, registration: &RemoteRegistration) -> Result<Option<String>, ProviderError> {
        let n = self.calls.registered.fetch_add(1, Ordering::SeqCst) + 1;
        if let Ok(mut last) = self.calls.last_config.lock() {
            *last = Some(registration.config.clone());
        }
        Ok(Some(format!("remote-{n}")))
    }

    async fn update(
        &self,
        _remote_id: Option<&str>,
        registration: &RemoteRegistration,
    ) -> Result<(), ProviderError> {
        self.calls.updated.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut last) = self.calls.last_config.lock() {
            *last = Some(registration.config.clone());
        }
        Ok(())
    }

    async fn unregister(
        &self,
        _target: &ExternalTarget,
        _remote_id: Option<&str>,
    ) -> Result<(), ProviderError> {
        if self.calls.fail_unregister.load(Ordering::SeqCst) {
            return Err(ProviderError::Transport("connection reset".to_string()));
        }
        self.calls.unregistered.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn parse_envelope(
        &self,
        _headers: &HashMap<String, String>,
        body: &[u8],
    ) -> Result<EventEnvelope, ProviderError> {
        let payload: Value =
            serde_json::from_slice(body).map_err(|e| ProviderError::Parse(e.to_string()))?;
        let text = |key: &str| payload.get(key).and_then(Value::as_str).map(str::to_string);
        let event_type = text("type").ok_or_else(|| ProviderError::Parse("missing type".to_string()))?;
        let attributes: BTreeMap<String, String> = payload
            .get("attributes")
            .and_then(Value::as_object)
            .map(|o| {
                o.iter()
                    .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                    .collect()
            })
            .unwrap_or_default();
        Ok(EventEnvelope {
            event_type,
            status: text("status"),
            category: text("category"),
            source: text("source"),
            attributes,
            correlation: text("correlation"),
            payload,
        })
    }

    async fn resolve_resource(&self, _attribute: &str, id: &str) -> Result<Option<String>, ProviderError> {
        self.calls.resolved.fetch_add(1, Ordering::SeqCst);
        Ok(self.resources.get(id).map(|n| n.value().clone()))
    }
}

/// Waiting step whose every action fails after the claim.
pub struct FailingStep;

impl FailingStep {
    pub const NAME: &'static str = "failing_wait";
}

impl StepType for FailingStep {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn kind(&self) -> StepKind {
        StepKind::Component
    }

    fn output_channels(&self) -> Vec<String> {
        vec!["done".to_string()]
    }

    fn actions(&self) -> Vec<ActionSpec> {
        vec![ActionSpec::new("finish", "done")]
    }

    fn handle_webhook(&self, _listener: &SubscriptionListener, envelope: &EventEnvelope) -> WebhookDecision {
        WebhookDecision::Invoke {
            action: "finish".to_string(),
            parameters: envelope.payload.clone(),
        }
    }

    fn handle_action(
        &self,
        _execution: &Execution,
        _action: &str,
        _parameters: &Value,
    ) -> Result<ActionResult, StepError> {
        Err(StepError::Failed("downstream unavailable".to_string()))
    }
}
