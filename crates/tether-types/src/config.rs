//! Configuration types for the Tether correlation service.
//!
//! `TetherConfig` is the top-level `config.toml`. Every section and field
//! has a default so an empty (or missing) file yields a working setup.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TetherConfig {
    /// Data directory. `None` means "resolve from `TETHER_DATA_DIR` or `~/.tether`".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,

    /// Path to the 32-byte key used to encrypt subscription secrets.
    /// Defaults to `{data_dir}/vault.key`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vault_key_path: Option<PathBuf>,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub subscriptions: SubscriptionConfig,

    #[serde(default)]
    pub filters: FilterConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    /// `[[providers]]`: external systems webhooks are registered with.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub providers: Vec<ProviderConfig>,
}

impl TetherConfig {
    /// Reject configurations the service cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = &self.server.public_base_url;
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(ConfigError::InvalidBaseUrl(url.clone()));
        }
        if self.server.port == 0 {
            return Err(ConfigError::InvalidPort(self.server.port));
        }
        let mut names = std::collections::HashSet::new();
        for provider in &self.providers {
            if !names.insert(provider.name.as_str()) {
                return Err(ConfigError::DuplicateProvider(provider.name.clone()));
            }
            if provider.kind == ProviderKind::Http && provider.api_base.is_none() {
                return Err(ConfigError::MissingApiBase(provider.name.clone()));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

/// `[server]`: ingress listener and the public callback base.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Externally reachable base URL; callbacks are
    /// `{public_base_url}/webhooks/{binding_key}`.
    #[serde(default = "default_public_base_url")]
    pub public_base_url: String,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8420
}

fn default_public_base_url() -> String {
    format!("http://{}:{}", default_host(), default_port())
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            public_base_url: default_public_base_url(),
        }
    }
}

impl ServerConfig {
    /// Callback URL registered with external systems for a binding key.
    pub fn callback_url(&self, binding_key: &str) -> String {
        format!(
            "{}/webhooks/{binding_key}",
            self.public_base_url.trim_end_matches('/')
        )
    }
}

/// `[database]`: SQLite location. `None` means `sqlite://{data_dir}/tether.db`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// `[subscriptions]`: remote registration housekeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionConfig {
    /// Interval at which failed remote deletions are retried.
    #[serde(default = "default_deletion_retry_interval_secs")]
    pub deletion_retry_interval_secs: u64,
}

fn default_deletion_retry_interval_secs() -> u64 {
    300
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            deletion_retry_interval_secs: default_deletion_retry_interval_secs(),
        }
    }
}

/// `[filters]`: delivery filter evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterConfig {
    /// How long a resolved resource id -> name mapping stays cached.
    #[serde(default = "default_resource_cache_ttl_secs")]
    pub resource_cache_ttl_secs: u64,
}

fn default_resource_cache_ttl_secs() -> u64 {
    300
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            resource_cache_ttl_secs: default_resource_cache_ttl_secs(),
        }
    }
}

/// `[logging]`: tracing subscriber setup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default `EnvFilter` directive; `RUST_LOG` takes precedence.
    #[serde(default = "default_log_filter")]
    pub filter: String,

    /// Emit JSON lines instead of human-readable output.
    #[serde(default)]
    pub json: bool,

    /// Bridge spans to OpenTelemetry (stdout exporter).
    #[serde(default)]
    pub otel: bool,
}

fn default_log_filter() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
            json: false,
            otel: false,
        }
    }
}

/// Which adapter serves a `[[providers]]` entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// REST registry with addressable webhook objects.
    Http,
    /// Fixed endpoint with no remote object to manage.
    Static,
}

/// `[[providers]]`: one external system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Name steps use in `ExternalTarget::provider`.
    pub name: String,

    pub kind: ProviderKind,

    /// REST base for `http` providers (e.g. `https://registry.example.com/api`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_base: Option<String>,

    /// Bearer credential for the provider API.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    /// Header carrying the HMAC-SHA256 signature of each delivery.
    #[serde(default = "default_signature_header")]
    pub signature_header: String,

    #[serde(default)]
    pub envelope: EnvelopeConfig,
}

fn default_signature_header() -> String {
    "x-signature".to_string()
}

/// JSON pointers locating envelope fields inside a vendor body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvelopeConfig {
    #[serde(default = "default_event_type_pointer")]
    pub event_type: String,

    /// Header consulted when the body has no event type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_type_header: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation: Option<String>,

    /// Attribute name -> pointer (e.g. `repository = "/repository/name"`).
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

fn default_event_type_pointer() -> String {
    "/event".to_string()
}

impl Default for EnvelopeConfig {
    fn default() -> Self {
        Self {
            event_type: default_event_type_pointer(),
            event_type_header: None,
            status: Some("/status".to_string()),
            category: None,
            source: None,
            correlation: Some("/correlation".to_string()),
            attributes: BTreeMap::new(),
        }
    }
}
