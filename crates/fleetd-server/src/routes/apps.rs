//! `/apps/:id`, `/apps/:id/stop` — lookup and graceful stop of one deployed
//! application.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::state::AppState;

const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Serialize)]
pub struct AppStatusResponse {
    pub app_id: String,
    pub app_version: String,
    pub state: String,
    pub pid: Option<u32>,
    pub restart_count: u32,
}

#[derive(Debug, Deserialize, Default)]
pub struct StopRequest {
    pub timeout_secs: Option<u64>,
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/apps/{id}", get(get_app)).route("/apps/{id}/stop", post(stop_app))
}

async fn get_app(State(state): State<Arc<AppState>>, Path(app_id): Path<String>) -> Result<Json<AppStatusResponse>, AppError> {
    let process = state.manager.get(&app_id).await.ok_or_else(|| {
        AppError::from(fleetd_errors::Error::new(fleetd_errors::ErrorCode::NotFound, format!("app {app_id} not found")))
    })?;

    Ok(Json(AppStatusResponse {
        app_id: process.app_id.clone(),
        app_version: process.app_version.clone(),
        state: process.state().as_str().to_owned(),
        pid: process.pid(),
        restart_count: process.restart_count(),
    }))
}

async fn stop_app(State(state): State<Arc<AppState>>, Path(app_id): Path<String>, body: Option<Json<StopRequest>>) -> Result<(), AppError> {
    let timeout = body.and_then(|Json(req)| req.timeout_secs).map_or(DEFAULT_STOP_TIMEOUT, Duration::from_secs);
    state.manager.stop(&app_id, timeout).await?;
    Ok(())
}
