//! Events published on the correlation event bus.
//!
//! The workflow runtime subscribes to these to start runs (`TriggerFired`)
//! and to continue a workflow past a suspended step (`OutputEmitted`).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::execution::ResolutionSource;

/// Events broadcast by the correlation core.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CorrelationEvent {
    /// A fire-and-forget trigger matched a delivery.
    TriggerFired {
        node_id: String,
        step_type: String,
        binding_key: String,
        action: String,
        parameters: Value,
    },
    /// An execution was claimed by the given action.
    ExecutionResolved {
        execution_id: Uuid,
        action: String,
        source: ResolutionSource,
    },
    /// An execution was cancelled before resolution.
    ExecutionCancelled { execution_id: Uuid },
    /// The terminal payload of an execution, on its output channel.
    OutputEmitted {
        execution_id: Uuid,
        channel: String,
        payload: Value,
    },
}

impl CorrelationEvent {
    /// Execution this event concerns, if any.
    pub fn execution_id(&self) -> Option<Uuid> {
        match self {
            CorrelationEvent::TriggerFired { .. } => None,
            CorrelationEvent::ExecutionResolved { execution_id, .. }
            | CorrelationEvent::ExecutionCancelled { execution_id }
            | CorrelationEvent::OutputEmitted { execution_id, .. } => Some(*execution_id),
        }
    }
}
