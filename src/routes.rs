use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::error::TranslateError;
use crate::handler::{self, CommandPayload};
use crate::registry::ScheduledBackend;
use crate::state::AppState;
use crate::translator::{TranslationRequest, TranslationResult};

/// State for one legacy listener: the single backend its port maps to.
#[derive(Clone)]
pub struct PortState {
    pub state: AppState,
    pub backend: Arc<ScheduledBackend>,
}

/// Router served on each legacy per-translator port.
pub fn legacy_routes(state: AppState, backend: Arc<ScheduledBackend>) -> Router {
    Router::new()
        .route("/", post(legacy_dispatch))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(PortState { state, backend })
}

/// Router served on the root port.
pub fn api_routes(state: AppState) -> Router {
    Router::new()
        .route("/api/translate", post(api_translate))
        .route("/api/health", get(health_check))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn legacy_dispatch(
    State(port_state): State<PortState>,
    Json(payload): Json<CommandPayload>,
) -> Result<Json<Value>, TranslateError> {
    let deadline = port_state.state.default_deadline();
    let response = handler::receive_command(&port_state.backend, payload, deadline).await?;
    Ok(Json(response))
}

async fn api_translate(
    State(state): State<AppState>,
    Json(request): Json<TranslationRequest>,
) -> Result<Json<TranslationResult>, TranslateError> {
    let result = state.registry.translate(&request).await?;
    Ok(Json(result))
}

async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let backends: serde_json::Map<String, Value> = state
        .registry
        .backends()
        .map(|b| (b.name().to_string(), json!(b.is_ready())))
        .collect();
    let all_ready = backends.values().all(|v| v == &json!(true));
    let status = if all_ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(json!({
            "status": if all_ready { "ok" } else { "degraded" },
            "backends": backends,
        })),
    )
}
