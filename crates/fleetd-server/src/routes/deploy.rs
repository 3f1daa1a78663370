//! `/deploy` — thin wrapper around [`fleetd_agent::ProcessManager::deploy`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use fleetd_agent::{Artifact, DeploySpec, HealthCheckSpec, ResourceLimits, RestartPolicy};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::AppError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct DeployRequest {
    pub app_id: String,
    pub app_name: String,
    pub app_version: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default = "default_restart_policy")]
    pub restart_policy: RestartPolicy,
    #[serde(default)]
    pub resources: ResourceLimits,
    #[serde(default)]
    pub health_check: Option<HealthCheckSpec>,
    #[serde(default = "default_graceful_shutdown_timeout")]
    pub graceful_shutdown_timeout: Duration,
    pub artifacts: Vec<Artifact>,
}

fn default_restart_policy() -> RestartPolicy {
    RestartPolicy::OnFailure
}

fn default_graceful_shutdown_timeout() -> Duration {
    Duration::from_secs(10)
}

#[derive(Debug, Serialize)]
pub struct DeployResponse {
    pub app_id: String,
    pub state: String,
    pub pid: Option<u32>,
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/deploy", post(deploy))
}

async fn deploy(State(state): State<Arc<AppState>>, Json(body): Json<DeployRequest>) -> Result<Json<DeployResponse>, AppError> {
    let mut spec = DeploySpec::new(body.app_id, body.app_name, body.app_version, body.artifacts);
    spec.device_id = Some(state.device_id.clone());
    spec.args = body.args;
    spec.env = body.env;
    spec.user = body.user;
    spec.group = body.group;
    spec.restart_policy = body.restart_policy;
    spec.resources = body.resources;
    spec.health_check = body.health_check;
    spec.graceful_shutdown_timeout = body.graceful_shutdown_timeout;

    let ctx = CancellationToken::new();
    let process = state.manager.deploy(&ctx, spec).await?;

    Ok(Json(DeployResponse { app_id: process.app_id.clone(), state: process.state().as_str().to_owned(), pid: process.pid() }))
}
