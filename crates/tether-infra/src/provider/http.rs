//! Generic REST webhook registry provider.
//!
//! Talks to an external system exposing:
//! - `POST   {api_base}/webhooks`                       -> `{ "id": ... }`
//! - `PATCH  {api_base}/webhooks/{id}`
//! - `DELETE {api_base}/webhooks/{id}`
//! - `GET    {api_base}/resources/{attribute}/{id}`     -> `{ "name": ... }`
//!
//! Registrations carry an `events` allow-list. Two configurations that differ
//! only in `events` share one registration widened to the union of both.

use std::collections::HashMap;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde_json::{Map, Value, json};
use tether_core::webhook::WebhookProvider;
use tether_core::webhook::provider::{MergeDecision, ProviderError, RemoteRegistration};
use tether_types::config::{EnvelopeConfig, ProviderConfig};
use tether_types::delivery::EventEnvelope;
use tether_types::subscription::{ExternalTarget, SignatureScheme};

use super::envelope::extract_envelope;

/// Per-request timeout for registry calls.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Event name that matches every event.
const ALL_EVENTS: &str = "*";

/// REST webhook registry adapter.
///
/// The bearer token is stored as a [`SecretString`] and is only exposed when
/// building request headers.
pub struct HttpWebhookProvider {
    name: String,
    api_base: String,
    token: Option<SecretString>,
    signature_header: String,
    envelope: EnvelopeConfig,
    client: reqwest::Client,
}

impl HttpWebhookProvider {
    pub fn new(name: impl Into<String>, api_base: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            api_base: api_base.into().trim_end_matches('/').to_string(),
            token: None,
            signature_header: "x-signature".to_string(),
            envelope: EnvelopeConfig::default(),
            client: reqwest::Client::new(),
        }
    }

    /// Build from a `[[providers]]` entry of kind `http`.
    pub fn from_config(config: &ProviderConfig) -> Result<Self, ProviderError> {
        let api_base = config.api_base.as_deref().ok_or_else(|| {
            ProviderError::InvalidConfig(format!("provider '{}' has no api_base", config.name))
        })?;
        let mut provider = Self::new(&config.name, api_base)
            .with_signature_header(&config.signature_header)
            .with_envelope(config.envelope.clone());
        if let Some(token) = &config.token {
            provider = provider.with_token(SecretString::from(token.clone()));
        }
        Ok(provider)
    }

    pub fn with_token(mut self, token: SecretString) -> Self {
        self.token = Some(token);
        self
    }

    pub fn with_signature_header(mut self, header: &str) -> Self {
        self.signature_header = header.to_ascii_lowercase();
        self
    }

    pub fn with_envelope(mut self, envelope: EnvelopeConfig) -> Self {
        self.envelope = envelope;
        self
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let builder = self
            .client
            .request(method, format!("{}{path}", self.api_base))
            .timeout(REQUEST_TIMEOUT);
        match &self.token {
            Some(token) => builder.bearer_auth(token.expose_secret()),
            None => builder,
        }
    }

    fn registration_body(registration: &RemoteRegistration) -> Value {
        json!({
            "target": registration.target.target,
            "url": registration.callback_url,
            "secret": registration.secret,
            "config": registration.config,
        })
    }
}

/// Send a request and map transport and non-2xx failures.
async fn send(builder: reqwest::RequestBuilder) -> Result<reqwest::Response, ProviderError> {
    let response = builder
        .send()
        .await
        .map_err(|e| ProviderError::Transport(e.to_string()))?;

    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == reqwest::StatusCode::NOT_FOUND {
        return Err(ProviderError::NotFound);
    }
    let message = response.text().await.unwrap_or_default();
    Err(ProviderError::Rejected {
        status: status.as_u16(),
        message,
    })
}

// ---------------------------------------------------------------------------
// Config comparison
// ---------------------------------------------------------------------------

/// Split a config into its `events` list (`None` = all events) and the rest.
fn split_events(config: &Value) -> (Option<Vec<String>>, Value) {
    let Value::Object(map) = config else {
        return (None, config.clone());
    };
    let mut rest = map.clone();
    let events = rest.remove("events").and_then(|v| match v {
        Value::Array(items) => Some(
            items
                .into_iter()
                .filter_map(|i| i.as_str().map(str::to_string))
                .collect::<Vec<_>>(),
        ),
        _ => None,
    });
    let events = events.filter(|e| !e.iter().any(|name| name == ALL_EVENTS));
    (events, Value::Object(rest))
}

/// Whether an `existing` events list receives everything `desired` asks for.
fn events_cover(existing: &Option<Vec<String>>, desired: &Option<Vec<String>>) -> bool {
    match (existing, desired) {
        (None, _) => true,
        (Some(_), None) => false,
        (Some(have), Some(want)) => want.iter().all(|w| have.contains(w)),
    }
}

fn with_events(rest: Value, events: Option<Vec<String>>) -> Value {
    let mut map = match rest {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    if let Some(events) = events {
        map.insert("events".to_string(), json!(events));
    }
    Value::Object(map)
}

impl WebhookProvider for HttpWebhookProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn scheme(&self) -> SignatureScheme {
        SignatureScheme::HmacSha256 {
            header: self.signature_header.clone(),
        }
    }

    fn compare_config(&self, existing: &Value, desired: &Value) -> bool {
        let (have, have_rest) = split_events(existing);
        let (want, want_rest) = split_events(desired);
        have_rest == want_rest && events_cover(&have, &want)
    }

    fn reconcile(&self, existing: &Value, desired: &Value) -> MergeDecision {
        let (have, have_rest) = split_events(existing);
        let (want, want_rest) = split_events(desired);
        if have_rest != want_rest {
            return MergeDecision::Conflict;
        }
        if events_cover(&have, &want) {
            return MergeDecision::Unchanged;
        }
        let merged = match (have, want) {
            (Some(mut union), Some(want)) => {
                for event in want {
                    if !union.contains(&event) {
                        union.push(event);
                    }
                }
                Some(union)
            }
            _ => None,
        };
        MergeDecision::Merged(with_events(have_rest, merged))
    }

    async fn register(
        &self,
        registration: &RemoteRegistration,
    ) -> Result<Option<String>, ProviderError> {
        let response = send(
            self.request(reqwest::Method::POST, "/webhooks")
                .json(&Self::registration_body(registration)),
        )
        .await?;

        let body: Value = response
            .json()
            .await
            .map_err(|e| ProviderError::Parse(format!("registration response: {e}")))?;
        let remote_id = match body.get("id") {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            _ => {
                return Err(ProviderError::Parse(
                    "registration response has no id".to_string(),
                ));
            }
        };

        tracing::debug!(
            provider = %self.name,
            external_target = %registration.target,
            %remote_id,
            "remote webhook registered"
        );
        Ok(Some(remote_id))
    }

    async fn update(
        &self,
        remote_id: Option<&str>,
        registration: &RemoteRegistration,
    ) -> Result<(), ProviderError> {
        let remote_id = remote_id.ok_or_else(|| {
            ProviderError::InvalidConfig("cannot update a registration without an id".to_string())
        })?;
        send(
            self.request(reqwest::Method::PATCH, &format!("/webhooks/{remote_id}"))
                .json(&Self::registration_body(registration)),
        )
        .await?;
        tracing::debug!(provider = %self.name, %remote_id, "remote webhook updated");
        Ok(())
    }

    async fn unregister(
        &self,
        target: &ExternalTarget,
        remote_id: Option<&str>,
    ) -> Result<(), ProviderError> {
        let Some(remote_id) = remote_id else {
            tracing::debug!(provider = %self.name, external_target = %target, "no remote id; nothing to delete");
            return Ok(());
        };
        send(self.request(reqwest::Method::DELETE, &format!("/webhooks/{remote_id}"))).await?;
        tracing::debug!(provider = %self.name, external_target = %target, %remote_id, "remote webhook deleted");
        Ok(())
    }

    fn parse_envelope(
        &self,
        headers: &HashMap<String, String>,
        body: &[u8],
    ) -> Result<EventEnvelope, ProviderError> {
        extract_envelope(&self.envelope, headers, body)
    }

    async fn resolve_resource(
        &self,
        attribute: &str,
        id: &str,
    ) -> Result<Option<String>, ProviderError> {
        let response = match send(
            self.request(reqwest::Method::GET, &format!("/resources/{attribute}/{id}")),
        )
        .await
        {
            Ok(response) => response,
            Err(ProviderError::NotFound) => return Ok(None),
            Err(e) => return Err(e),
        };
        let body: Value = response
            .json()
            .await
            .map_err(|e| ProviderError::Parse(format!("resource response: {e}")))?;
        Ok(body.get("name").and_then(Value::as_str).map(str::to_string))
    }
}
