//! Step capability data types.
//!
//! Step types describe their side effects declaratively: `setup` returns a
//! `SetupPlan`, `execute` an `ExecutePlan`, `handle_webhook` a
//! `WebhookDecision` and `handle_action` an `ActionResult`. The correlation
//! core carries each plan out (subscription requests, timers, resolution,
//! emission) so step types never touch shared state directly.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::delivery::FilterSet;
use crate::subscription::ExternalTarget;
use crate::timer::TimerRequest;

// ---------------------------------------------------------------------------
// StepNode
// ---------------------------------------------------------------------------

/// A configured step instance in a workflow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepNode {
    /// Unique node id within the workflow (e.g. "wait-for-upload").
    pub id: String,
    /// Registered step type name.
    pub step_type: String,
    /// Step-specific configuration record.
    #[serde(default)]
    pub config: Value,
}

impl StepNode {
    pub fn new(id: impl Into<String>, step_type: impl Into<String>, config: Value) -> Self {
        Self {
            id: id.into(),
            step_type: step_type.into(),
            config,
        }
    }
}

/// Whether a step runs once per workflow run or starts runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    /// Executes once per run and produces output.
    Component,
    /// Starts workflow runs from external events.
    Trigger,
}

/// Declares that `action` emits on `channel`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionSpec {
    pub name: String,
    pub channel: String,
}

impl ActionSpec {
    pub fn new(name: impl Into<String>, channel: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            channel: channel.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Plans
// ---------------------------------------------------------------------------

/// A step's request for a shared webhook subscription.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionRequest {
    pub target: ExternalTarget,
    /// Parameters pushed to the external system; compared with the
    /// provider's `compare_config` to decide sharing.
    pub desired_config: Value,
    /// Node-local filters evaluated on every delivery.
    #[serde(default)]
    pub filters: FilterSet,
}

/// What the core must do when a node is set up.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SetupPlan {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription: Option<SubscriptionRequest>,
}

/// What the core must do after a step's `execute` side effect.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutePlan {
    /// Initial step-owned metadata document.
    #[serde(default)]
    pub metadata: Value,
    /// Key an inbound delivery will carry to find this execution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_key: Option<String>,
    /// Wait bound to arm, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timer: Option<TimerRequest>,
}

/// A step's verdict on a delivery that passed its filters.
#[derive(Debug, Clone, PartialEq)]
pub enum WebhookDecision {
    Invoke { action: String, parameters: Value },
    Ignore,
}

/// Output of a winning action: the channel and terminal payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionResult {
    pub channel: String,
    pub payload: Value,
}

impl ActionResult {
    pub fn new(channel: impl Into<String>, payload: Value) -> Self {
        Self {
            channel: channel.into(),
            payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_step_node_config_defaults_to_null() {
        let node: StepNode =
            serde_json::from_value(json!({"id": "a", "step_type": "event_trigger"})).unwrap();
        assert_eq!(node.config, Value::Null);
    }

    #[test]
    fn test_execute_plan_defaults() {
        let plan = ExecutePlan::default();
        assert!(plan.timer.is_none());
        assert!(plan.correlation_key.is_none());
    }
}
