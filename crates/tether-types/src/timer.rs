//! Timer types for deferred action calls.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Identifies one armed timer.
///
/// At most one timer is armed per `(execution_id, action)`; re-arming
/// produces a handle with a new `id` and invalidates the previous one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimerHandle {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub action: String,
}

/// Request to call `action` on the execution after `delay`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimerRequest {
    pub action: String,
    pub delay: Duration,
    #[serde(default)]
    pub parameters: Value,
}

impl TimerRequest {
    pub fn new(action: impl Into<String>, delay: Duration) -> Self {
        Self {
            action: action.into(),
            delay,
            parameters: Value::Object(Default::default()),
        }
    }
}

/// A timer that expired and must be fed to the resolution engine.
#[derive(Debug, Clone, PartialEq)]
pub struct FiredTimer {
    pub handle: TimerHandle,
    pub parameters: Value,
}
