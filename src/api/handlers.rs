//! API request handlers
//!
//! Reads come from the `AppState` snapshot or straight from the incident
//! store. The only write, acknowledgment, is forwarded to the processing
//! loop as a [`ControlCommand`] so the dispatch path stays the single
//! mutator of the active set.

use axum::extract::{Query, State};
use axum::response::Response;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, RwLock};

use super::envelope::{ApiErrorResponse, ApiResponse};
use crate::config;
use crate::config::defaults::INCIDENT_LIST_LIMIT;
use crate::detection::AnomalyState;
use crate::incidents::{ActiveAlert, IncidentStats, IncidentStore};
use crate::pipeline::{AppState, ControlCommand, CoordinatorStats};
use crate::types::AlertKey;

/// Upper bound on `?limit=`.
const MAX_INCIDENT_LIMIT: usize = 1000;

/// How long an acknowledgment waits for the processing loop.
const ACK_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared state for all handlers.
#[derive(Clone)]
pub struct ApiState {
    pub app_state: Arc<RwLock<AppState>>,
    pub store: Arc<dyn IncidentStore>,
    pub control_tx: mpsc::Sender<ControlCommand>,
}

// ============================================================================
// Health & Status
// ============================================================================

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub pipeline: String,
    pub uptime_secs: u64,
}

/// GET /health
pub async fn get_health(State(state): State<ApiState>) -> Response {
    let app = state.app_state.read().await;
    ApiResponse::ok(HealthResponse {
        status: "ok",
        pipeline: app.status.to_string(),
        uptime_secs: app.uptime_secs(),
    })
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: String,
    pub source: String,
    pub sink: String,
    pub uptime_secs: u64,
    pub last_message_at: Option<DateTime<Utc>>,
    pub window_count: usize,
    pub stats: CoordinatorStats,
    pub incidents: IncidentStats,
    pub active_alerts: Vec<ActiveAlert>,
}

/// GET /api/v1/status
pub async fn get_status(State(state): State<ApiState>) -> Response {
    let app = state.app_state.read().await;
    ApiResponse::ok(StatusResponse {
        status: app.status.to_string(),
        source: app.source.clone(),
        sink: app.sink.clone(),
        uptime_secs: app.uptime_secs(),
        last_message_at: app.last_message_at,
        window_count: app.window_count,
        stats: app.stats.clone(),
        incidents: app.incident_stats.clone(),
        active_alerts: app.active_alerts.clone(),
    })
}

/// GET /api/v1/config - effective configuration as loaded at startup
pub async fn get_config() -> Response {
    match config::get() {
        Some(stream_config) => ApiResponse::ok(stream_config),
        None => ApiErrorResponse::service_unavailable("configuration not initialized"),
    }
}

/// GET /api/v1/signals - active drought/flood signals per entity
pub async fn get_signals(State(state): State<ApiState>) -> Response {
    let signals: BTreeMap<String, AnomalyState> = state.app_state.read().await.signals.clone();
    ApiResponse::ok(signals)
}

// ============================================================================
// Incidents
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct IncidentQuery {
    pub limit: Option<usize>,
}

/// GET /api/v1/incidents?limit=N - newest first
pub async fn list_incidents(State(state): State<ApiState>, Query(query): Query<IncidentQuery>) -> Response {
    let limit = query.limit.unwrap_or(INCIDENT_LIST_LIMIT).min(MAX_INCIDENT_LIMIT);
    match state.store.recent(limit) {
        Ok(incidents) => ApiResponse::ok(incidents),
        Err(e) => ApiErrorResponse::internal(e.to_string()),
    }
}

/// GET /api/v1/incidents/open
pub async fn open_incidents(State(state): State<ApiState>) -> Response {
    match state.store.open_incidents() {
        Ok(incidents) => ApiResponse::ok(incidents),
        Err(e) => ApiErrorResponse::internal(e.to_string()),
    }
}

#[derive(Debug, Deserialize)]
pub struct AcknowledgeRequest {
    /// Alert key, `subject:kind` (e.g. `ingest-a:lag`)
    pub key: String,
}

#[derive(Debug, Serialize)]
pub struct AcknowledgeResponse {
    pub key: String,
    /// `false` when no incident was open for the key
    pub acknowledged: bool,
}

/// POST /api/v1/incidents/acknowledge
pub async fn acknowledge_incident(
    State(state): State<ApiState>,
    Json(request): Json<AcknowledgeRequest>,
) -> Response {
    let Some(key) = AlertKey::parse(&request.key) else {
        return ApiErrorResponse::bad_request(format!(
            "invalid alert key '{}' (expected subject:kind)",
            request.key
        ));
    };

    let (respond_to, response) = oneshot::channel();
    let command = ControlCommand::Acknowledge {
        key: key.clone(),
        respond_to,
    };
    if state.control_tx.send(command).await.is_err() {
        return ApiErrorResponse::service_unavailable("stream processor is not running");
    }

    match tokio::time::timeout(ACK_TIMEOUT, response).await {
        Ok(Ok(acknowledged)) => {
            tracing::info!(key = %key, acknowledged, "Acknowledge request handled");
            ApiResponse::ok(AcknowledgeResponse {
                key: key.to_string(),
                acknowledged,
            })
        }
        Ok(Err(_)) => ApiErrorResponse::service_unavailable("stream processor stopped"),
        Err(_) => ApiErrorResponse::service_unavailable("timed out waiting for stream processor"),
    }
}
