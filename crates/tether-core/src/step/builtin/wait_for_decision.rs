//! `wait_for_decision`: suspend until someone approves or rejects.
//!
//! The provider maps the vendor body onto the envelope attribute
//! `decision` ("approve"/"approved" or "reject"/"rejected"); an optional
//! `actor` attribute is passed through. Any other delivery is ignored.

use serde_json::{Value, json};
use tether_types::delivery::EventEnvelope;
use tether_types::execution::Execution;
use tether_types::step::{
    ActionResult, ActionSpec, ExecutePlan, SetupPlan, StepKind, StepNode, WebhookDecision,
};
use tether_types::subscription::SubscriptionListener;

use super::{NodeConfig, TIMEOUT_ACTION};
use crate::step::capability::{StepError, StepType};

pub const NAME: &str = "wait_for_decision";

pub struct WaitForDecision;

impl StepType for WaitForDecision {
    fn name(&self) -> &str {
        NAME
    }

    fn kind(&self) -> StepKind {
        StepKind::Component
    }

    fn output_channels(&self) -> Vec<String> {
        vec![
            "approved".to_string(),
            "rejected".to_string(),
            "timeout".to_string(),
        ]
    }

    fn actions(&self) -> Vec<ActionSpec> {
        vec![
            ActionSpec::new("approve", "approved"),
            ActionSpec::new("reject", "rejected"),
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
        let action = match envelope.attributes.get("decision").map(String::as_str) {
            Some("approve" | "approved") => "approve",
            Some("reject" | "rejected") => "reject",
            _ => return WebhookDecision::Ignore,
        };
        WebhookDecision::Invoke {
            action: action.to_string(),
            parameters: json!({
                "actor": envelope.attributes.get("actor"),
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
            "approve" => Ok(ActionResult::new("approved", parameters.clone())),
            "reject" => Ok(ActionResult::new("rejected", parameters.clone())),
            TIMEOUT_ACTION => Ok(ActionResult::new("timeout", json!({}))),
            other => Err(StepError::UnknownAction(other.to_string())),
        }
    }
}
