//! Shared application state handed to every Axum handler.

use std::sync::Arc;

use fleetd_agent::ProcessManager;
use fleetd_auth::{JwtManager, PolicyEvaluator, RbacEvaluator};
use fleetd_vault::Vault;

pub struct AppState {
    pub manager: Arc<ProcessManager>,
    pub rbac: Arc<RbacEvaluator>,
    pub policy: Arc<PolicyEvaluator>,
    pub jwt: Arc<JwtManager>,
    pub vault: Arc<Vault>,
    pub device_id: String,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState").field("device_id", &self.device_id).finish_non_exhaustive()
    }
}
