//! Inbound delivery and routing types.
//!
//! A `Delivery` is a raw inbound webhook request. Providers turn its body into
//! an `EventEnvelope` (the filter-relevant subset), listeners' `FilterSet`s
//! decide whether it matters, and the router emits `RoutedIntent`s.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Delivery
// ---------------------------------------------------------------------------

/// A raw inbound webhook request.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Routing token taken from the callback path.
    pub binding_key: String,
    /// Request headers with lower-cased names.
    pub headers: HashMap<String, String>,
    /// Raw body bytes, exactly as received (signatures cover these bytes).
    pub body: Vec<u8>,
}

impl Delivery {
    /// Build a delivery, lower-casing header names.
    pub fn new<I, K, V>(binding_key: impl Into<String>, headers: I, body: Vec<u8>) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        Self {
            binding_key: binding_key.into(),
            headers: headers
                .into_iter()
                .map(|(k, v)| (k.as_ref().to_ascii_lowercase(), v.into()))
                .collect(),
            body,
        }
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }
}

// ---------------------------------------------------------------------------
// EventEnvelope
// ---------------------------------------------------------------------------

/// Filter-relevant subset extracted from a vendor-specific delivery body.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Event-type discriminator (e.g. "artifact.pushed").
    pub event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Named resource attributes (e.g. "repository" -> "acme/api").
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    /// In-body reference to the execution this delivery answers, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation: Option<String>,
    /// The full parsed body.
    #[serde(default)]
    pub payload: Value,
}

impl EventEnvelope {
    /// JSON context used for `when` clause evaluation.
    ///
    /// Shape: `{ "event": { "type", "status", "category", "source", "attributes" }, "payload": <body> }`
    pub fn to_eval_context(&self) -> Value {
        serde_json::json!({
            "event": {
                "type": self.event_type,
                "status": self.status,
                "category": self.category,
                "source": self.source,
                "attributes": self.attributes,
            },
            "payload": self.payload,
        })
    }
}

// ---------------------------------------------------------------------------
// FilterSet
// ---------------------------------------------------------------------------

/// Matches an envelope attribute against a resource name or id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceFilter {
    /// Envelope attribute to compare (e.g. "repository").
    pub attribute: String,
    /// Expected resource name, or resource id when `by_id` is set.
    pub value: String,
    /// When true, `value` is an id that must be resolved to a name first.
    #[serde(default)]
    pub by_id: bool,
}

/// Filter predicates a listener declares. Empty allow-lists admit everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterSet {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub event_types: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub statuses: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub categories: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<ResourceFilter>,
    /// Optional JEXL expression evaluated against `EventEnvelope::to_eval_context`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<String>,
}

impl FilterSet {
    /// True when no predicate is declared.
    pub fn is_empty(&self) -> bool {
        self.event_types.is_empty()
            && self.statuses.is_empty()
            && self.categories.is_empty()
            && self.sources.is_empty()
            && self.resources.is_empty()
            && self.when.is_none()
    }
}

// ---------------------------------------------------------------------------
// Routing results
// ---------------------------------------------------------------------------

/// Who a routed intent is addressed to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IntentTarget {
    /// A suspended execution waiting for this delivery.
    Execution { execution_id: Uuid },
    /// A trigger node that starts a new workflow run.
    Trigger { node_id: String },
}

/// Which waiting step (or trigger), which logical action, with what parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutedIntent {
    pub target: IntentTarget,
    pub action: String,
    pub parameters: Value,
}

/// Why an authenticated, well-formed delivery produced no effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IgnoreReason {
    /// No subscription carries this binding key.
    UnknownBinding,
    /// The subscription has no attached listeners.
    NoListeners,
    /// Listener filters (or the step itself) rejected the event.
    FilteredOut,
    /// A waiting listener matched but the delivery carries no correlation.
    NoCorrelation,
    /// No suspended execution matches the delivery's correlation.
    NoSuspendedExecution,
    /// The matching execution was already resolved or cancelled.
    AlreadyResolved,
}

impl fmt::Display for IgnoreReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            IgnoreReason::UnknownBinding => "unknown_binding",
            IgnoreReason::NoListeners => "no_listeners",
            IgnoreReason::FilteredOut => "filtered_out",
            IgnoreReason::NoCorrelation => "no_correlation",
            IgnoreReason::NoSuspendedExecution => "no_suspended_execution",
            IgnoreReason::AlreadyResolved => "already_resolved",
        };
        write!(f, "{s}")
    }
}

/// Result of routing one delivery.
#[derive(Debug, Clone, PartialEq)]
pub enum RouteOutcome {
    /// At least one listener acted; one intent per acting listener.
    Dispatched(Vec<RoutedIntent>),
    /// Accepted but nothing acted on it.
    Ignored(IgnoreReason),
}

impl RouteOutcome {
    pub fn is_dispatched(&self) -> bool {
        matches!(self, RouteOutcome::Dispatched(_))
    }
}
