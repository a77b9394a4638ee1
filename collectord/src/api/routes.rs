use axum::{
    extract::{Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use shared::protocol::API_PREFIX;
use shared::types::Record;
use crate::config::Capacities;
use crate::pipeline_manager::{CommandError, PipelineHandle, StatsSnapshot};

const DEFAULT_SAMPLE_LIMIT: usize = 10;

#[derive(Clone)]
pub struct AppState {
    pub pipeline: PipelineHandle,
    pub digest_rx: watch::Receiver<String>,
    pub capacities: Capacities,
    pub auxiliary_memory: bool,
    pub api_port: u16,
}

#[derive(Serialize)]
pub struct ConfigResponse {
    pub auxiliary_memory: bool,
    pub device_slots: usize,
    pub staging_slots: usize,
    pub vendor_slots: usize,
    pub oui_slots: usize,
    pub api_port: u16,
}

#[derive(Serialize)]
pub struct PruneResponse {
    pub removed: usize,
}

#[derive(Deserialize)]
pub struct SampleQuery {
    pub limit: Option<usize>,
}

pub fn router(state: AppState) -> Router {
    let path = |suffix: &str| format!("{API_PREFIX}{suffix}");
    Router::new()
        .route(&path("/config"), get(get_config))
        .route(&path("/stats"), get(get_stats))
        .route(&path("/devices"), get(get_devices))
        .route(&path("/devices/hash"), get(get_hash))
        .route(&path("/samples"), get(get_samples))
        .route(&path("/scan/pause"), post(pause))
        .route(&path("/scan/resume"), post(resume))
        .route(&path("/store/prune"), post(prune))
        .route(&path("/store/reset"), post(reset))
        .with_state(state)
}

/// Map a pipeline command failure to an HTTP status.
fn status_for(operation: &str, err: anyhow::Error) -> StatusCode {
    match err.downcast_ref::<CommandError>() {
        Some(CommandError::NotPaused) => StatusCode::CONFLICT,
        Some(CommandError::StoreUnavailable) => StatusCode::SERVICE_UNAVAILABLE,
        None => {
            tracing::error!("Failed to {}: {:#}", operation, err);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

async fn get_config(State(state): State<AppState>) -> Json<ConfigResponse> {
    Json(ConfigResponse {
        auxiliary_memory: state.auxiliary_memory,
        device_slots: state.capacities.devices,
        staging_slots: state.capacities.staging,
        vendor_slots: state.capacities.vendors,
        oui_slots: state.capacities.oui,
        api_port: state.api_port,
    })
}

async fn get_stats(State(state): State<AppState>) -> Result<Json<StatsSnapshot>, StatusCode> {
    state
        .pipeline
        .stats()
        .await
        .map(Json)
        .map_err(|e| status_for("query stats", e))
}

async fn get_devices(State(state): State<AppState>) -> Result<Json<Vec<Record>>, StatusCode> {
    state
        .pipeline
        .devices()
        .await
        .map(Json)
        .map_err(|e| status_for("list devices", e))
}

async fn get_hash(State(state): State<AppState>) -> String {
    state.digest_rx.borrow().clone()
}

async fn get_samples(
    State(state): State<AppState>,
    Query(params): Query<SampleQuery>,
) -> Result<Json<Vec<Record>>, StatusCode> {
    let limit = params.limit.unwrap_or(DEFAULT_SAMPLE_LIMIT);
    state
        .pipeline
        .samples(limit)
        .await
        .map(Json)
        .map_err(|e| status_for("sample store", e))
}

async fn pause(State(state): State<AppState>) -> StatusCode {
    match state.pipeline.pause().await {
        Ok(()) => StatusCode::NO_CONTENT,
        Err(e) => status_for("pause scanning", e),
    }
}

async fn resume(State(state): State<AppState>) -> StatusCode {
    match state.pipeline.resume().await {
        Ok(()) => StatusCode::NO_CONTENT,
        Err(e) => status_for("resume scanning", e),
    }
}

async fn prune(State(state): State<AppState>) -> Result<Json<PruneResponse>, StatusCode> {
    let removed = state
        .pipeline
        .prune()
        .await
        .map_err(|e| status_for("prune store", e))?;
    Ok(Json(PruneResponse { removed }))
}

async fn reset(State(state): State<AppState>) -> StatusCode {
    match state.pipeline.reset().await {
        Ok(()) => StatusCode::NO_CONTENT,
        Err(e) => status_for("reset store", e),
    }
}
