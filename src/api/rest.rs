// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// All endpoints live under `/api/v1/`. CORS is configured permissively for
// development; tighten `allowed_origins` in production.
//
//   GET  /api/v1/health                   service heartbeat
//   POST /api/v1/analyses                 submit an analysis
//   GET  /api/v1/analyses                 recent submissions
//   GET  /api/v1/analyses/:id             full analysis record
//   GET  /api/v1/analyses/:id/result      denormalized final artifact
//   POST /api/v1/analyses/:id/cancel      cancel an in-flight run
//   GET  /api/v1/analyses/:id/drift       latest drift status per symbol
//   GET  /api/v1/analyses/:id/alerts      drift alerts, newest first
//   GET  /api/v1/analyses/:id/ws          progress stream (WebSocket)
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::app_state::AppState;
use crate::store::AnalysisRequest;
use crate::types::AnalysisStatus;

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
        .route("/api/v1/health", get(health))
        .route("/api/v1/analyses", post(submit_analysis))
        .route("/api/v1/analyses", get(list_analyses))
        .route("/api/v1/analyses/:id", get(get_analysis))
        .route("/api/v1/analyses/:id/result", get(get_result))
        .route("/api/v1/analyses/:id/cancel", post(cancel_analysis))
        .route("/api/v1/analyses/:id/drift", get(get_drift))
        .route("/api/v1/analyses/:id/alerts", get(get_alerts))
        .route("/api/v1/analyses/:id/ws", get(crate::api::ws::ws_handler))
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Health
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime_seconds: u64,
    running_analyses: usize,
    registered_agents: usize,
    active_streams: usize,
    server_time: i64,
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        uptime_seconds: state.start_time.elapsed().as_secs(),
        running_analyses: state.store.running_count(),
        registered_agents: state.registry.len(),
        active_streams: state.bus.active_channels(),
        server_time: chrono::Utc::now().timestamp_millis(),
    })
}

// =============================================================================
// Submission
// =============================================================================

#[derive(Deserialize)]
struct SubmitRequest {
    #[serde(default)]
    query: String,
    symbols: Vec<String>,
}

#[derive(Serialize)]
struct SubmitResponse {
    analysis_id: String,
    status: AnalysisStatus,
}

async fn submit_analysis(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SubmitRequest>,
) -> Result<impl IntoResponse, (StatusCode, Json<serde_json::Value>)> {
    let symbols: Vec<String> = body
        .symbols
        .iter()
        .map(|s| s.trim().to_uppercase())
        .filter(|s| !s.is_empty())
        .collect();

    if symbols.is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({
                "error": "at least one ticker symbol is required",
            })),
        ));
    }

    let request = AnalysisRequest::new(body.query, symbols);
    let record = state.orchestrator.submit(request);
    info!(analysis_id = %record.id, symbols = ?record.symbols, "analysis submitted via API");

    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitResponse {
            analysis_id: record.id,
            status: record.status,
        }),
    ))
}

// =============================================================================
// Retrieval
// =============================================================================

#[derive(Deserialize)]
struct ListQuery {
    #[serde(default = "default_list_limit")]
    limit: usize,
}

fn default_list_limit() -> usize {
    20
}

async fn list_analyses(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> impl IntoResponse {
    Json(state.store.recent_summaries(query.limit.min(200)))
}

async fn get_analysis(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, StatusCode> {
    state
        .store
        .get(&id)
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

async fn get_result(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, StatusCode> {
    state
        .store
        .result(&id)
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

// =============================================================================
// Cancellation
// =============================================================================

async fn cancel_analysis(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, StatusCode> {
    if state.store.get(&id).is_none() {
        return Err(StatusCode::NOT_FOUND);
    }
    let cancelled = state.orchestrator.cancel(&id);
    Ok(Json(serde_json::json!({
        "analysis_id": id,
        "cancelled": cancelled,
    })))
}

// =============================================================================
// Drift
// =============================================================================

async fn get_drift(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, StatusCode> {
    let record = state.store.get(&id).ok_or(StatusCode::NOT_FOUND)?;
    let requires_reanalysis = record
        .drift_status
        .values()
        .any(|snapshot| snapshot.requires_reanalysis());
    let history = state.store.drift_history_for(&id);

    Ok(Json(serde_json::json!({
        "analysis_id": record.id,
        "drift_status": record.drift_status,
        "requires_reanalysis": requires_reanalysis,
        "history": history,
    })))
}

async fn get_alerts(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, StatusCode> {
    if state.store.get(&id).is_none() {
        return Err(StatusCode::NOT_FOUND);
    }
    Ok(Json(state.store.alerts_for(&id)))
}
