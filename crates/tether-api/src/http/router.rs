//! Axum router configuration with middleware.
//!
//! Routes: `POST /webhooks/{binding_key}` and `GET /health`.
//! Middleware: CORS, tracing.

use axum::Router;
use axum::routing::{get, post};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::http::handlers;
use crate::state::AppState;

/// Build the complete router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/webhooks/{binding_key}", post(handlers::webhook::receive_webhook))
        .route("/health", get(handlers::health::health_check))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::{Value, json};
    use tether_core::repository::SubscriptionRepository;
    use tether_core::service::ServiceSettings;
    use tether_core::webhook::ProviderRegistry;
    use tether_core::webhook::signature::compute_hmac_sha256_hex;
    use tether_infra::crypto::VaultCrypto;
    use tether_infra::provider::StaticEndpointProvider;
    use tether_infra::sqlite::DatabasePool;
    use tether_types::execution::ExecutionState;
    use tether_types::step::StepNode;
    use tower::ServiceExt;

    use super::build_router;
    use crate::state::AppState;

    async fn test_state() -> (AppState, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("tether.db").display());
        let pool = DatabasePool::new(&url).await.unwrap();
        let providers = Arc::new(ProviderRegistry::new());
        providers.register(StaticEndpointProvider::new("chat"));
        let state = AppState::assemble(
            pool,
            Arc::new(VaultCrypto::new(&[7u8; 32])),
            providers,
            ServiceSettings::default(),
        );
        (state, dir)
    }

    fn wait_node() -> StepNode {
        StepNode::new(
            "approve",
            "wait_for_event",
            json!({
                "subscription": {"provider": "chat", "target": "ops-room"},
                "correlation_pointer": "/ticket"
            }),
        )
    }

    async fn secret_for(state: &AppState, binding_key: &str) -> String {
        state
            .service
            .subscriptions()
            .repository()
            .get_by_binding_key(binding_key)
            .await
            .unwrap()
            .unwrap()
            .secret
            .unwrap()
    }

    async fn post(
        state: &AppState,
        binding_key: &str,
        signature: Option<&str>,
        body: &[u8],
    ) -> (StatusCode, Value) {
        let mut request = Request::builder()
            .method("POST")
            .uri(format!("/webhooks/{binding_key}"))
            .header("content-type", "application/json");
        if let Some(signature) = signature {
            request = request.header("X-Signature", signature);
        }
        let response = build_router(state.clone())
            .oneshot(request.body(Body::from(body.to_vec())).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn health_lists_providers_and_step_types() {
        let (state, _dir) = test_state().await;
        let response = build_router(state)
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["status"], "ok");
        assert_eq!(body["providers"], json!(["chat"]));
        assert!(
            body["step_types"]
                .as_array()
                .unwrap()
                .contains(&json!("wait_for_event"))
        );
    }

    #[tokio::test]
    async fn unknown_binding_is_accepted_and_ignored() {
        let (state, _dir) = test_state().await;
        let (status, body) = post(&state, "nope", None, br#"{"event": "x"}"#).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["status"], "ignored");
        assert_eq!(body["data"]["reason"], "unknown_binding");
    }

    #[tokio::test]
    async fn signed_delivery_resolves_execution_once() {
        let (state, _dir) = test_state().await;
        let node = wait_node();
        let handle = state.service.setup_step(&node).await.unwrap().unwrap();
        let execution = state
            .service
            .execute_step(&node, &json!({"ticket": "T-9"}))
            .await
            .unwrap();

        let secret = secret_for(&state, &handle.binding_key).await;
        let body = serde_json::to_vec(&json!({"event": "approved", "correlation": "T-9"})).unwrap();
        let signature = compute_hmac_sha256_hex(secret.as_bytes(), &body).unwrap();

        let (status, response) = post(&state, &handle.binding_key, Some(&signature), &body).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(response["data"]["status"], "dispatched");
        assert_eq!(response["data"]["intents"].as_array().unwrap().len(), 1);
        assert_eq!(response["data"]["intents"][0]["action"], "receive");

        let stored = state.service.execution(execution.id).await.unwrap().unwrap();
        assert_eq!(stored.state, ExecutionState::Resolved);

        // Redelivery of the same event is acknowledged without effect.
        let (status, response) = post(&state, &handle.binding_key, Some(&signature), &body).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(response["data"]["status"], "ignored");
        assert_eq!(response["data"]["reason"], "already_resolved");
    }

    #[tokio::test]
    async fn credentials_are_enforced() {
        let (state, _dir) = test_state().await;
        let handle = state.service.setup_step(&wait_node()).await.unwrap().unwrap();
        let body = br#"{"event": "approved", "correlation": "T-9"}"#;

        let (status, response) = post(&state, &handle.binding_key, None, body).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(response["errors"][0]["code"], "UNAUTHORIZED");

        let forged = compute_hmac_sha256_hex(b"not-the-secret", body).unwrap();
        let (status, response) = post(&state, &handle.binding_key, Some(&forged), body).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(response["errors"][0]["code"], "FORBIDDEN");
    }

    #[tokio::test]
    async fn malformed_body_is_bad_request() {
        let (state, _dir) = test_state().await;
        let handle = state.service.setup_step(&wait_node()).await.unwrap().unwrap();
        let secret = secret_for(&state, &handle.binding_key).await;
        let body = b"not json";
        let signature = compute_hmac_sha256_hex(secret.as_bytes(), body).unwrap();

        let (status, response) = post(&state, &handle.binding_key, Some(&signature), body).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(response["errors"][0]["code"], "VALIDATION_ERROR");
    }
}
