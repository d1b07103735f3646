//! Webhook subscription types.
//!
//! A `WebhookSubscription` is one "please call me back" registration against
//! an external system. Several step nodes may share it; each sharing node is
//! a `SubscriptionListener` and the subscription's `ref_count` equals the
//! number of listeners.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::delivery::FilterSet;

// ---------------------------------------------------------------------------
// ExternalTarget
// ---------------------------------------------------------------------------

/// Handle identifying one external system endpoint that webhooks are
/// registered against (e.g. provider "registry", target "acme/api").
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExternalTarget {
    /// Registered provider name.
    pub provider: String,
    /// Provider-specific target identifier.
    pub target: String,
}

impl ExternalTarget {
    pub fn new(provider: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            target: target.into(),
        }
    }

    /// Stable key used for per-target locking.
    pub fn key(&self) -> String {
        format!("{}:{}", self.provider, self.target)
    }
}

impl fmt::Display for ExternalTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.provider, self.target)
    }
}

// ---------------------------------------------------------------------------
// SignatureScheme
// ---------------------------------------------------------------------------

/// How deliveries for a subscription prove their origin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignatureScheme {
    /// HMAC-SHA256 over the raw body, hex-encoded in `header`.
    HmacSha256 { header: String },
    /// Shared token presented in `header` (optionally `Bearer `-prefixed).
    BearerToken { header: String },
    /// No secret configured; deliveries pass through unauthenticated.
    None,
}

impl SignatureScheme {
    /// Whether a secret must be minted for subscriptions using this scheme.
    pub fn requires_secret(&self) -> bool {
        !matches!(self, SignatureScheme::None)
    }
}

// ---------------------------------------------------------------------------
// WebhookSubscription
// ---------------------------------------------------------------------------

/// Lifecycle state of a subscription record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionState {
    /// Registered and accepting listeners.
    Active,
    /// Last listener released; remote deletion has not succeeded yet.
    PendingDeletion,
}

impl fmt::Display for SubscriptionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubscriptionState::Active => write!(f, "active"),
            SubscriptionState::PendingDeletion => write!(f, "pending_deletion"),
        }
    }
}

impl FromStr for SubscriptionState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(SubscriptionState::Active),
            "pending_deletion" => Ok(SubscriptionState::PendingDeletion),
            other => Err(format!("invalid subscription state: '{other}'")),
        }
    }
}

/// A remote webhook registration, possibly shared by several step nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookSubscription {
    pub id: Uuid,
    /// Opaque routing token embedded in the callback URL.
    pub binding_key: String,
    /// Provider name (see `ExternalTarget`).
    pub provider: String,
    /// Provider-specific target (see `ExternalTarget`).
    pub target: String,
    /// Identifier assigned by the external system, if it has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_id: Option<String>,
    /// Shared secret for signature/token checks. `None` for unauthenticated
    /// subscriptions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    /// Authentication scheme deliveries must satisfy.
    pub scheme: SignatureScheme,
    /// Filter/target parameters pushed to the external system.
    pub desired_config: Value,
    /// Number of attached listeners.
    pub ref_count: u32,
    pub state: SubscriptionState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WebhookSubscription {
    /// The external target this subscription is registered against.
    pub fn external_target(&self) -> ExternalTarget {
        ExternalTarget::new(&self.provider, &self.target)
    }
}

// ---------------------------------------------------------------------------
// SubscriptionListener
// ---------------------------------------------------------------------------

/// How a listener reacts to a matching delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListenerMode {
    /// Fire-and-forget: each match starts a workflow.
    Trigger,
    /// Wait-and-resume: a match resolves a suspended execution.
    Wait,
}

impl fmt::Display for ListenerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenerMode::Trigger => write!(f, "trigger"),
            ListenerMode::Wait => write!(f, "wait"),
        }
    }
}

impl FromStr for ListenerMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "trigger" => Ok(ListenerMode::Trigger),
            "wait" => Ok(ListenerMode::Wait),
            other => Err(format!("invalid listener mode: '{other}'")),
        }
    }
}

/// One step node attached to a subscription.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionListener {
    pub binding_key: String,
    pub node_id: String,
    pub step_type: String,
    pub mode: ListenerMode,
    /// The node's own filters; the shared subscription config may be broader.
    #[serde(default)]
    pub filters: FilterSet,
    pub attached_at: DateTime<Utc>,
}
