//! Built-in generic step types.
//!
//! These carry no vendor glue: the external system is whatever provider the
//! node's `subscription` block names.
//!
//! Shared node configuration:
//!
//! ```json
//! {
//!   "subscription": {
//!     "provider": "registry",
//!     "target": "acme/api",
//!     "config": { "events": ["artifact.pushed"] },
//!     "filters": { "statuses": ["success"] }
//!   },
//!   "timeout_secs": 30,
//!   "correlation_key": "deploy-42",
//!   "correlation_pointer": "/request/id"
//! }
//! ```

pub mod event_trigger;
pub mod wait_for_decision;
pub mod wait_for_event;

use std::time::Duration;

use serde::Deserialize;
use serde_json::{Value, json};
use tether_types::delivery::FilterSet;
use tether_types::step::{ExecutePlan, SetupPlan, StepNode, SubscriptionRequest};
use tether_types::subscription::ExternalTarget;
use tether_types::timer::TimerRequest;

pub use event_trigger::EventTrigger;
pub use wait_for_decision::WaitForDecision;
pub use wait_for_event::WaitForEvent;

use super::capability::{BoxStepType, StepError};

/// Action every built-in timer calls.
pub const TIMEOUT_ACTION: &str = "timeout";

/// Every built-in step type, boxed for registration.
pub fn all() -> Vec<BoxStepType> {
    vec![
        BoxStepType::new(WaitForEvent),
        BoxStepType::new(WaitForDecision),
        BoxStepType::new(EventTrigger),
    ]
}

#[derive(Debug, Clone, Deserialize)]
struct SubscriptionBlock {
    provider: String,
    target: String,
    #[serde(default)]
    config: Value,
    #[serde(default)]
    filters: FilterSet,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct NodeConfig {
    #[serde(default)]
    subscription: Option<SubscriptionBlock>,
    #[serde(default)]
    timeout_secs: Option<u64>,
    /// Literal correlation key.
    #[serde(default)]
    correlation_key: Option<String>,
    /// JSON pointer into the execute input yielding the correlation key.
    #[serde(default)]
    correlation_pointer: Option<String>,
}

impl NodeConfig {
    fn parse(node: &StepNode) -> Result<Self, StepError> {
        if node.config.is_null() {
            return Ok(Self::default());
        }
        serde_json::from_value(node.config.clone())
            .map_err(|e| StepError::InvalidConfig(format!("node '{}': {e}", node.id)))
    }

    fn setup_plan(&self) -> SetupPlan {
        SetupPlan {
            subscription: self.subscription.as_ref().map(|s| SubscriptionRequest {
                target: ExternalTarget::new(&s.provider, &s.target),
                desired_config: s.config.clone(),
                filters: s.filters.clone(),
            }),
        }
    }

    /// A waiting node with a subscription must name a correlation source.
    fn require_correlation(&self, node_id: &str) -> Result<(), StepError> {
        if self.subscription.is_some()
            && self.correlation_key.is_none()
            && self.correlation_pointer.is_none()
        {
            return Err(StepError::InvalidConfig(format!(
                "node '{node_id}' waits on a subscription but sets neither correlation_key nor correlation_pointer"
            )));
        }
        Ok(())
    }

    /// Setup shared by the waiting built-ins.
    fn waiting_setup_plan(&self, node_id: &str) -> Result<SetupPlan, StepError> {
        self.require_correlation(node_id)?;
        Ok(self.setup_plan())
    }

    fn correlation(&self, input: &Value) -> Result<Option<String>, StepError> {
        if let Some(key) = &self.correlation_key {
            return Ok(Some(key.clone()));
        }
        let Some(pointer) = &self.correlation_pointer else {
            return Ok(None);
        };
        match input.pointer(pointer) {
            Some(Value::String(s)) => Ok(Some(s.clone())),
            Some(Value::Number(n)) => Ok(Some(n.to_string())),
            _ => Err(StepError::InvalidConfig(format!(
                "correlation_pointer '{pointer}' does not resolve to a string or number"
            ))),
        }
    }

    /// Plan shared by the waiting built-ins: remember the input, correlate,
    /// and arm the timeout if one is configured.
    fn wait_plan(&self, node_id: &str, input: &Value) -> Result<ExecutePlan, StepError> {
        self.require_correlation(node_id)?;
        Ok(ExecutePlan {
            metadata: json!({ "input": input }),
            correlation_key: self.correlation(input)?,
            timer: self
                .timeout_secs
                .map(|secs| TimerRequest::new(TIMEOUT_ACTION, Duration::from_secs(secs))),
        })
    }
}
