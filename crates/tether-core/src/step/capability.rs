//! StepType trait, its object-safe wrapper and step errors.
//!
//! A step type declares its output channels and actions up front and
//! implements a subset of the capabilities. Every capability returns a plan
//! or decision; the correlation core performs the effects (subscriptions,
//! timers, claims, emission), so step types hold no shared state.
//!
//! Dynamic dispatch follows the blanket-impl pattern:
//! 1. `StepTypeDyn` is object-safe with boxed futures
//! 2. every `T: StepType` implements it
//! 3. `BoxStepType` wraps `Box<dyn StepTypeDyn>` and delegates

use std::future::Future;
use std::pin::Pin;

use serde_json::Value;
use tether_types::delivery::EventEnvelope;
use tether_types::execution::Execution;
use tether_types::step::{
    ActionResult, ActionSpec, ExecutePlan, SetupPlan, StepKind, StepNode, WebhookDecision,
};
use tether_types::subscription::{ListenerMode, SubscriptionListener};

#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error("invalid step configuration: {0}")]
    InvalidConfig(String),

    #[error("unknown action '{0}'")]
    UnknownAction(String),

    #[error("step type does not support {0}")]
    Unsupported(&'static str),

    #[error("step failed: {0}")]
    Failed(String),
}

// ---------------------------------------------------------------------------
// StepType
// ---------------------------------------------------------------------------

/// A suspendable workflow step type.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait StepType: Send + Sync {
    /// Registered name, e.g. "wait_for_event".
    fn name(&self) -> &str;

    fn kind(&self) -> StepKind;

    /// Output channels, in declaration order. Exactly one receives the
    /// terminal payload of each execution.
    fn output_channels(&self) -> Vec<String>;

    /// Actions the step accepts and the channel each emits on.
    fn actions(&self) -> Vec<ActionSpec>;

    /// Register external resources for a node. Runs once per node, before
    /// any execution.
    fn setup(&self, _node: &StepNode) -> impl Future<Output = Result<SetupPlan, StepError>> + Send {
        async { Ok(SetupPlan::default()) }
    }

    /// Start the side effect of one run and describe how it waits.
    fn execute(
        &self,
        _node: &StepNode,
        _input: &Value,
    ) -> impl Future<Output = Result<ExecutePlan, StepError>> + Send {
        async { Err(StepError::Unsupported("execute")) }
    }

    /// Decide whether a filtered delivery should invoke an action.
    fn handle_webhook(
        &self,
        _listener: &SubscriptionListener,
        _envelope: &EventEnvelope,
    ) -> WebhookDecision {
        WebhookDecision::Ignore
    }

    /// Compute the terminal payload for the action that won `execution`.
    fn handle_action(
        &self,
        execution: &Execution,
        action: &str,
        parameters: &Value,
    ) -> Result<ActionResult, StepError>;

    /// Tear down what `setup` created. Runs before the subscription is released.
    fn cleanup(&self, _node: &StepNode) -> impl Future<Output = Result<(), StepError>> + Send {
        async { Ok(()) }
    }

    /// How this step's subscription listeners react to deliveries.
    fn listener_mode(&self) -> ListenerMode {
        match self.kind() {
            StepKind::Trigger => ListenerMode::Trigger,
            StepKind::Component => ListenerMode::Wait,
        }
    }
}

// ---------------------------------------------------------------------------
// Dynamic dispatch
// ---------------------------------------------------------------------------

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Object-safe version of [`StepType`].
pub trait StepTypeDyn: Send + Sync {
    fn name(&self) -> &str;
    fn kind(&self) -> StepKind;
    fn output_channels(&self) -> Vec<String>;
    fn actions(&self) -> Vec<ActionSpec>;
    fn listener_mode(&self) -> ListenerMode;

    fn setup_boxed<'a>(&'a self, node: &'a StepNode) -> BoxFuture<'a, Result<SetupPlan, StepError>>;

    fn execute_boxed<'a>(
        &'a self,
        node: &'a StepNode,
        input: &'a Value,
    ) -> BoxFuture<'a, Result<ExecutePlan, StepError>>;

    fn handle_webhook(
        &self,
        listener: &SubscriptionListener,
        envelope: &EventEnvelope,
    ) -> WebhookDecision;

    fn handle_action(
        &self,
        execution: &Execution,
        action: &str,
        parameters: &Value,
    ) -> Result<ActionResult, StepError>;

    fn cleanup_boxed<'a>(&'a self, node: &'a StepNode) -> BoxFuture<'a, Result<(), StepError>>;
}

impl<T: StepType> StepTypeDyn for T {
    fn name(&self) -> &str {
        StepType::name(self)
    }

    fn kind(&self) -> StepKind {
        StepType::kind(self)
    }

    fn output_channels(&self) -> Vec<String> {
        StepType::output_channels(self)
    }

    fn actions(&self) -> Vec<ActionSpec> {
        StepType::actions(self)
    }

    fn listener_mode(&self) -> ListenerMode {
        StepType::listener_mode(self)
    }

    fn setup_boxed<'a>(&'a self, node: &'a StepNode) -> BoxFuture<'a, Result<SetupPlan, StepError>> {
        Box::pin(self.setup(node))
    }

    fn execute_boxed<'a>(
        &'a self,
        node: &'a StepNode,
        input: &'a Value,
    ) -> BoxFuture<'a, Result<ExecutePlan, StepError>> {
        Box::pin(self.execute(node, input))
    }

    fn handle_webhook(
        &self,
        listener: &SubscriptionListener,
        envelope: &EventEnvelope,
    ) -> WebhookDecision {
        StepType::handle_webhook(self, listener, envelope)
    }

    fn handle_action(
        &self,
        execution: &Execution,
        action: &str,
        parameters: &Value,
    ) -> Result<ActionResult, StepError> {
        StepType::handle_action(self, execution, action, parameters)
    }

    fn cleanup_boxed<'a>(&'a self, node: &'a StepNode) -> BoxFuture<'a, Result<(), StepError>> {
        Box::pin(self.cleanup(node))
    }
}

/// Type-erased step type for runtime lookup by name.
pub struct BoxStepType {
    inner: Box<dyn StepTypeDyn>,
}

impl BoxStepType {
    pub fn new<T: StepType + 'static>(step: T) -> Self {
        Self {
            inner: Box::new(step),
        }
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub fn kind(&self) -> StepKind {
        self.inner.kind()
    }

    pub fn output_channels(&self) -> Vec<String> {
        self.inner.output_channels()
    }

    pub fn actions(&self) -> Vec<ActionSpec> {
        self.inner.actions()
    }

    pub fn listener_mode(&self) -> ListenerMode {
        self.inner.listener_mode()
    }

    /// Channel the named action emits on, if the action is declared.
    pub fn action_channel(&self, action: &str) -> Option<String> {
        self.actions()
            .into_iter()
            .find(|a| a.name == action)
            .map(|a| a.channel)
    }

    pub async fn setup(&self, node: &StepNode) -> Result<SetupPlan, StepError> {
        self.inner.setup_boxed(node).await
    }

    pub async fn execute(&self, node: &StepNode, input: &Value) -> Result<ExecutePlan, StepError> {
        self.inner.execute_boxed(node, input).await
    }

    pub fn handle_webhook(
        &self,
        listener: &SubscriptionListener,
        envelope: &EventEnvelope,
    ) -> WebhookDecision {
        self.inner.handle_webhook(listener, envelope)
    }

    pub fn handle_action(
        &self,
        execution: &Execution,
        action: &str,
        parameters: &Value,
    ) -> Result<ActionResult, StepError> {
        self.inner.handle_action(execution, action, parameters)
    }

    pub async fn cleanup(&self, node: &StepNode) -> Result<(), StepError> {
        self.inner.cleanup_boxed(node).await
    }
}

impl std::fmt::Debug for BoxStepType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxStepType")
            .field("name", &self.name())
            .field("kind", &self.kind())
            .finish()
    }
}
