//! Webhook receiver handler.
//!
//! Turns the raw request into a `Delivery` (body bytes untouched, header
//! names lower-cased) and hands it to the correlation service. Verification,
//! parsing, filtering and resolution all happen there; this handler only
//! maps the outcome onto a status code.

use std::time::Instant;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::Response;
use serde_json::json;
use tether_types::delivery::{Delivery, RouteOutcome};

use crate::http::error::AppError;
use crate::http::response::ApiResponse;
use crate::state::AppState;

/// POST /webhooks/{binding_key} - Receive one delivery.
///
/// - 200: dispatched, or accepted and ignored (unknown binding, filtered
///   out, already resolved, ...)
/// - 400: the body could not be parsed
/// - 401/403: missing or rejected credential
/// - 500: storage or provider failure
pub async fn receive_webhook(
    State(state): State<AppState>,
    Path(binding_key): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    let start = Instant::now();
    let request_id = uuid::Uuid::now_v7().to_string();

    let delivery = Delivery::new(binding_key.clone(), delivery_headers(&headers), body.to_vec());

    let outcome = state.service.handle_delivery(&delivery).await?;

    let data = match &outcome {
        RouteOutcome::Dispatched(intents) => {
            tracing::info!(%binding_key, intents = intents.len(), %request_id, "delivery dispatched");
            json!({ "status": "dispatched", "intents": intents })
        }
        RouteOutcome::Ignored(reason) => {
            tracing::debug!(%binding_key, %reason, %request_id, "delivery ignored");
            json!({ "status": "ignored", "reason": reason })
        }
    };

    let elapsed = start.elapsed().as_millis() as u64;
    Ok(ApiResponse::success(data, request_id, elapsed).into_response_with(axum::http::StatusCode::OK))
}

/// Header pairs for a `Delivery`. Values that are not visible ASCII are
/// skipped; a skipped credential header then surfaces as a missing one.
fn delivery_headers(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .filter_map(|(name, value)| match value.to_str() {
            Ok(v) => Some((name.as_str().to_string(), v.to_string())),
            Err(_) => {
                tracing::debug!(header = %name, "dropping header value that is not visible ASCII");
                None
            }
        })
        .collect()
}
