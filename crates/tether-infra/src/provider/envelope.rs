//! Vendor body -> `EventEnvelope` extraction driven by JSON pointers.

use std::collections::{BTreeMap, HashMap};

use serde_json::Value;
use tether_core::webhook::ProviderError;
use tether_types::config::EnvelopeConfig;
use tether_types::delivery::EventEnvelope;

/// Parse `body` as JSON and pull the envelope fields `mapping` points at.
///
/// The event type is mandatory: a body without one (and no fallback header)
/// is a parse failure. Every other field is optional.
pub fn extract_envelope(
    mapping: &EnvelopeConfig,
    headers: &HashMap<String, String>,
    body: &[u8],
) -> Result<EventEnvelope, ProviderError> {
    let payload: Value =
        serde_json::from_slice(body).map_err(|e| ProviderError::Parse(e.to_string()))?;

    let event_type = lookup(&payload, &mapping.event_type)
        .or_else(|| {
            mapping
                .event_type_header
                .as_ref()
                .and_then(|h| headers.get(&h.to_ascii_lowercase()).cloned())
        })
        .ok_or_else(|| {
            ProviderError::Parse(format!("no event type at '{}'", mapping.event_type))
        })?;

    let optional = |pointer: &Option<String>| pointer.as_deref().and_then(|p| lookup(&payload, p));

    let attributes: BTreeMap<String, String> = mapping
        .attributes
        .iter()
        .filter_map(|(name, pointer)| lookup(&payload, pointer).map(|v| (name.clone(), v)))
        .collect();

    Ok(EventEnvelope {
        event_type,
        status: optional(&mapping.status),
        category: optional(&mapping.category),
        source: optional(&mapping.source),
        attributes,
        correlation: optional(&mapping.correlation),
        payload,
    })
}

/// Scalar at `pointer`, stringified. Objects, arrays and null count as absent.
fn lookup(payload: &Value, pointer: &str) -> Option<String> {
    match payload.pointer(pointer)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}
