// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// All endpoints live under `/api/v1/`. The health check is public; every
// other endpoint requires a valid Bearer token via the `AuthBearer`
// extractor.  Manual-action failures return a short reason string with an
// error status code, surfaced verbatim by the operator UI.
//
// CORS is configured permissively for development; tighten `allowed_origins`
// in production.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::api::auth::AuthBearer;
use crate::app_state::AppState;
use crate::scheduler::set_strategy_mode;
use crate::types::StrategyMode;

type ApiError = (StatusCode, Json<serde_json::Value>);

fn error_response(status: StatusCode, reason: impl Into<String>) -> ApiError {
    (status, Json(serde_json::json!({ "error": reason.into() })))
}

// =============================================================================
// Router construction
// =============================================================================

/// Build the full REST API router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ── Public ──────────────────────────────────────────────────
        .route("/api/v1/health", get(health))
        // ── Authenticated ───────────────────────────────────────────
        .route("/api/v1/state", get(full_state))
        .route("/api/v1/positions", get(positions))
        .route("/api/v1/signals", get(signals))
        .route("/api/v1/control/run-now", post(control_run_now))
        .route("/api/v1/control/strategy-mode", post(control_strategy_mode))
        .route("/api/v1/control/panic", post(control_panic))
        .route("/api/v1/positions/:id/approve", post(approve_position))
        .route("/api/v1/positions/:id/close", post(close_position))
        // ── Middleware & State ───────────────────────────────────────
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Health (public)
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    state_version: u64,
    server_time: i64,
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let resp = HealthResponse {
        status: "ok",
        state_version: state.current_state_version(),
        server_time: chrono::Utc::now().timestamp_millis(),
    };
    Json(resp)
}

// =============================================================================
// Read endpoints (authenticated)
// =============================================================================

async fn full_state(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, ApiError> {
    let snapshot = state
        .build_snapshot()
        .map_err(|e| error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(Json(snapshot))
}

async fn positions(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, ApiError> {
    let positions = state
        .store
        .get_active_positions()
        .map_err(|e| error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(Json(positions))
}

async fn signals(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, ApiError> {
    let signals = state
        .store
        .recent_signals(100)
        .map_err(|e| error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(Json(signals))
}

// =============================================================================
// Control endpoints (authenticated)
// =============================================================================

async fn control_run_now(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    info!("manual scan requested via API");
    state.scheduler.run_now().await;
    state.increment_version();

    Json(serde_json::json!({
        "status": "ok",
        "last_scan": state.scheduler.last_scan(),
    }))
}

#[derive(Deserialize)]
struct StrategyModeRequest {
    mode: String,
}

async fn control_strategy_mode(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Json(req): Json<StrategyModeRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let mode = StrategyMode::from_str(&req.mode.to_uppercase()).ok_or_else(|| {
        error_response(
            StatusCode::BAD_REQUEST,
            format!("Invalid strategy mode: '{}'. Use 'SCALPER' or 'INVESTOR'.", req.mode),
        )
    })?;

    let snapshot = set_strategy_mode(&state.config, mode);
    state.increment_version();

    // Persist best-effort so the hint survives a restart.
    if let Err(e) = snapshot.save(crate::runtime_config::CONFIG_PATH) {
        warn!(error = %e, "failed to persist strategy mode");
    }

    Ok(Json(serde_json::json!({ "strategy_mode": mode })))
}

#[derive(Deserialize)]
struct PanicRequest {
    user_id: i64,
}

async fn control_panic(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Json(req): Json<PanicRequest>,
) -> Result<impl IntoResponse, ApiError> {
    warn!(user_id = req.user_id, "PANIC close-all requested via API");

    match state.bodyguard.close_all_for_user(req.user_id).await {
        Ok(closed) => {
            state.increment_version();
            Ok(Json(serde_json::json!({
                "status": "ok",
                "closed": closed,
            })))
        }
        Err(e) => Err(error_response(StatusCode::CONFLICT, e.to_string())),
    }
}

// =============================================================================
// Per-position actions (authenticated)
// =============================================================================

async fn approve_position(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let approved = state
        .store
        .approve_position(&id)
        .map_err(|e| error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    if !approved {
        return Err(error_response(
            StatusCode::CONFLICT,
            format!("position {id} is not awaiting approval"),
        ));
    }

    info!(position_id = %id, "position approved via API");
    state.increment_version();
    Ok(Json(serde_json::json!({ "status": "ok" })))
}

async fn close_position(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    match state.bodyguard.close_manual(&id).await {
        Ok(()) => {
            info!(position_id = %id, "position closed via API");
            state.increment_version();
            Ok(Json(serde_json::json!({ "status": "ok" })))
        }
        Err(e) => Err(error_response(StatusCode::CONFLICT, e.to_string())),
    }
}
