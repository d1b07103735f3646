//! `wait_for_event`: suspend until a matching delivery or a timeout.
//!
//! Channels: `received` (payload: the delivery payload), `timeout` (payload `{}`).

use serde_json::{Value, json};
use tether_types::delivery::EventEnvelope;
use tether_types::execution::Execution;
use tether_types::step::{
    ActionResult, ActionSpec, ExecutePlan, SetupPlan, StepKind, StepNode, WebhookDecision,
};
use tether_types::subscription::SubscriptionListener;

use super::{NodeConfig, TIMEOUT_ACTION};
use crate::step::capability::{StepError, StepType};

pub const NAME: &str = "wait_for_event";

pub struct WaitForEvent;

impl StepType for WaitForEvent {
    fn name(&self) -> &str {
        NAME
    }

    fn kind(&self) -> StepKind {
        StepKind::Component
    }

    fn output_channels(&self) -> Vec<String> {
        vec!["received".to_string(), "timeout".to_string()]
    }

    fn actions(&self) -> Vec<ActionSpec> {
        vec![
            ActionSpec::new("receive", "received"),
            ActionSpec::new(TIMEOUT_ACTION, "timeout"),
        ]
    }

    async fn setup(&self, node: &StepNode) -> Result<SetupPlan, StepError> {
        NodeConfig::parse(node)?.waiting_setup_plan(&node.id)
    }

    async fn execute(&self, node: &StepNode, input: &Value) -> Result<ExecutePlan, StepError> {
        NodeConfig::parse(node)?.wait_plan(&node.id, input)
    }

    fn handle_webhook(
        &self,
        _listener: &SubscriptionListener,
        envelope: &EventEnvelope,
    ) -> WebhookDecision {
        WebhookDecision::Invoke {
            action: "receive".to_string(),
            parameters: json!({
                "event_type": envelope.event_type,
                "payload": envelope.payload,
            }),
        }
    }

    fn handle_action(
        &self,
        _execution: &Execution,
        action: &str,
        parameters: &Value,
    ) -> Result<ActionResult, StepError> {
        match action {
            "receive" => Ok(ActionResult::new("received", parameters.clone())),
            TIMEOUT_ACTION => Ok(ActionResult::new("timeout", json!({}))),
            other => Err(StepError::UnknownAction(other.to_string())),
        }
    }
}
