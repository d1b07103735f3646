//! Execution domain types.
//!
//! An `Execution` is one run of a suspendable step. The step owns the opaque
//! `metadata` document; the correlation core only reads and writes the
//! reserved resolution fields (`state`, `outcome`, `emitted_channel`), which
//! are stored beside the document rather than inside it.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// ExecutionState
// ---------------------------------------------------------------------------

/// Lifecycle state of an execution.
///
/// `Suspended -> {Resolved, Cancelled}`. Both targets are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    Suspended,
    Resolved,
    Cancelled,
}

impl ExecutionState {
    /// Whether no further transitions are allowed.
    pub fn is_terminal(self) -> bool {
        !matches!(self, ExecutionState::Suspended)
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionState::Suspended => write!(f, "suspended"),
            ExecutionState::Resolved => write!(f, "resolved"),
            ExecutionState::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl FromStr for ExecutionState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "suspended" => Ok(ExecutionState::Suspended),
            "resolved" => Ok(ExecutionState::Resolved),
            "cancelled" => Ok(ExecutionState::Cancelled),
            other => Err(format!("invalid execution state: '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// ResolutionOutcome
// ---------------------------------------------------------------------------

/// Which path produced a resolution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionSource {
    /// A verified, routed inbound delivery.
    Webhook,
    /// An expired timer.
    Timer,
    /// An explicit `invoke_action` call from the runtime.
    Direct,
}

impl fmt::Display for ResolutionSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolutionSource::Webhook => write!(f, "webhook"),
            ResolutionSource::Timer => write!(f, "timer"),
            ResolutionSource::Direct => write!(f, "direct"),
        }
    }
}

/// Immutable record of the action that won an execution.
///
/// Written exactly once per execution by the claim operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolutionOutcome {
    /// Winning action name (e.g. "receive", "timeout").
    pub action: String,
    /// Parameters the action was invoked with.
    pub parameters: Value,
    /// Which path delivered the winning action.
    pub source: ResolutionSource,
    /// When the claim succeeded.
    pub resolved_at: DateTime<Utc>,
}

impl ResolutionOutcome {
    /// Build an outcome stamped with the current time.
    pub fn new(action: impl Into<String>, parameters: Value, source: ResolutionSource) -> Self {
        Self {
            action: action.into(),
            parameters,
            source,
            resolved_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// PendingTimer
// ---------------------------------------------------------------------------

/// Timer that was armed for a suspended execution.
///
/// Persisted so that timers can be re-armed after a restart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingTimer {
    pub action: String,
    pub fire_at: DateTime<Utc>,
    #[serde(default)]
    pub parameters: Value,
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

/// One concrete run of a suspendable step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    /// UUIDv7, stable for the lifetime of the run.
    pub id: Uuid,
    /// The step node (workflow graph node) this execution belongs to.
    pub node_id: String,
    /// Registered step type name.
    pub step_type: String,
    /// Lifecycle state. Mutated only through claim/cancel.
    pub state: ExecutionState,
    /// Opaque step-owned document.
    #[serde(default)]
    pub metadata: Value,
    /// Output channels declared by the step type, in declaration order.
    pub output_channels: Vec<String>,
    /// Key used to find this execution from an inbound delivery.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_key: Option<String>,
    /// Wait bound armed at execute time, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_timer: Option<PendingTimer>,
    /// The winning action, once resolved.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<ResolutionOutcome>,
    /// Channel that received the terminal payload, once emitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub emitted_channel: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Execution {
    /// Create a new suspended execution.
    pub fn new(
        node_id: impl Into<String>,
        step_type: impl Into<String>,
        output_channels: Vec<String>,
        metadata: Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            node_id: node_id.into(),
            step_type: step_type.into(),
            state: ExecutionState::Suspended,
            metadata,
            output_channels,
            correlation_key: None,
            pending_timer: None,
            outcome: None,
            emitted_channel: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// The reserved `resolved` flag: true once any terminal transition happened.
    pub fn is_resolved(&self) -> bool {
        self.state.is_terminal()
    }

    /// Whether `channel` is one of the declared output channels.
    pub fn declares_channel(&self, channel: &str) -> bool {
        self.output_channels.iter().any(|c| c == channel)
    }
}

/// Result of an atomic state transition attempt on an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// This caller performed the transition.
    Claimed,
    /// The execution was already terminal; nothing changed.
    AlreadyTerminal(ExecutionState),
}
