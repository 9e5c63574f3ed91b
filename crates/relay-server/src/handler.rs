use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::response::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use relay_engine::{DrainReport, Lifecycle, RelayStatus};
use relay_types::{DeliveryState, EventId};

use crate::error::{ServerError, ServerResult};
use crate::router::AppState;

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub lifecycle: Lifecycle,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PauseResponse {
    pub paused: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct DrainParams {
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AbandonResponse {
    pub id: String,
    pub key: String,
    pub state: DeliveryState,
    pub updated_at: DateTime<Utc>,
}

/// Health check handler. Reports `halted` once a storage fault stopped the relay.
pub async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let lifecycle = state.relay.lifecycle();
    let status = if lifecycle == Lifecycle::Halted { "halted" } else { "ok" };
    Json(HealthResponse {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        lifecycle,
    })
}

pub async fn status_handler(State(state): State<AppState>) -> ServerResult<Json<RelayStatus>> {
    Ok(Json(state.relay.status()?))
}

pub async fn pause_handler(State(state): State<AppState>) -> ServerResult<Json<PauseResponse>> {
    state.relay.pause()?;
    Ok(Json(PauseResponse { paused: true }))
}

pub async fn resume_handler(State(state): State<AppState>) -> ServerResult<Json<PauseResponse>> {
    state.relay.resume()?;
    Ok(Json(PauseResponse { paused: false }))
}

pub async fn drain_handler(
    State(state): State<AppState>,
    Query(params): Query<DrainParams>,
) -> ServerResult<Json<DrainReport>> {
    let timeout_ms = params
        .timeout_ms
        .unwrap_or(state.config.default_drain_timeout_ms);
    let report = state.relay.drain(Duration::from_millis(timeout_ms)).await?;
    Ok(Json(report))
}

pub async fn abandon_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ServerResult<Json<AbandonResponse>> {
    let event_id = EventId::from_hex(&id).map_err(|e| ServerError::InvalidId(e.to_string()))?;
    let record = state.relay.abandon(&event_id)?;
    Ok(Json(AbandonResponse {
        id: record.id().to_hex(),
        key: record.event.source_record_key().to_string(),
        state: record.state,
        updated_at: record.updated_at,
    }))
}
