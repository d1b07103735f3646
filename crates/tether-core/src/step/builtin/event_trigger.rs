//! `event_trigger`: start a workflow run for every matching delivery.
//!
//! Trigger steps never suspend; each match is published on the event bus
//! as `TriggerFired` and emits on `default`.

use serde_json::{Value, json};
use tether_types::delivery::EventEnvelope;
use tether_types::execution::Execution;
use tether_types::step::{ActionResult, ActionSpec, SetupPlan, StepKind, StepNode, WebhookDecision};
use tether_types::subscription::SubscriptionListener;

use super::NodeConfig;
use crate::step::capability::{StepError, StepType};

pub const NAME: &str = "event_trigger";

/// Action invoked for each matching delivery.
pub const FIRE_ACTION: &str = "fire";

pub struct EventTrigger;

impl StepType for EventTrigger {
    fn name(&self) -> &str {
        NAME
    }

    fn kind(&self) -> StepKind {
        StepKind::Trigger
    }

    fn output_channels(&self) -> Vec<String> {
        vec!["default".to_string()]
    }

    fn actions(&self) -> Vec<ActionSpec> {
        vec![ActionSpec::new(FIRE_ACTION, "default")]
    }

    async fn setup(&self, node: &StepNode) -> Result<SetupPlan, StepError> {
        let plan = NodeConfig::parse(node)?.setup_plan();
        if plan.subscription.is_none() {
            return Err(StepError::InvalidConfig(format!(
                "trigger node '{}' needs a subscription block",
                node.id
            )));
        }
        Ok(plan)
    }

    fn handle_webhook(
        &self,
        _listener: &SubscriptionListener,
        envelope: &EventEnvelope,
    ) -> WebhookDecision {
        WebhookDecision::Invoke {
            action: FIRE_ACTION.to_string(),
            parameters: json!({
                "event_type": envelope.event_type,
                "attributes": envelope.attributes,
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
            FIRE_ACTION => Ok(ActionResult::new("default", parameters.clone())),
            other => Err(StepError::UnknownAction(other.to_string())),
        }
    }
}
