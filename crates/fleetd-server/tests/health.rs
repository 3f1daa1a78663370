//! Integration test: the `/healthz` route on a real loopback listener.

use std::sync::Arc;

use fleetd_agent::{ProcessManager, ReqwestFetcher, TracingSink};
use fleetd_auth::{JwtManager, MemoryPolicyRepository, MemoryUserRepository, PolicyEvaluator, RbacEvaluator, SigningKey};
use fleetd_resilience::{Clock, RealClock};
use fleetd_server::routes;
use fleetd_server::state::AppState;
use fleetd_vault::{Vault, VaultConfig};
use tokio::net::TcpListener;

async fn test_state(deploy_root: &std::path::Path, vault_root: &std::path::Path) -> Arc<AppState> {
    let clock: Arc<dyn Clock> = Arc::new(RealClock);
    let manager = ProcessManager::new(deploy_root, Arc::new(ReqwestFetcher::new()), Arc::clone(&clock), Arc::new(TracingSink), Arc::new(TracingSink));
    let rbac = Arc::new(RbacEvaluator::new(Arc::new(MemoryUserRepository::new())));
    let policy = Arc::new(PolicyEvaluator::new(Arc::new(MemoryPolicyRepository::new())));
    let jwt = Arc::new(JwtManager::new(SigningKey::Hmac(b"test-secret".to_vec()), "fleetd-test", "fleetd-test-agents"));
    let vault = Vault::init(VaultConfig::new(vault_root), b"test-password", Arc::clone(&clock)).await.unwrap();

    Arc::new(AppState { manager, rbac, policy, jwt, vault: Arc::new(vault), device_id: "test-device".to_owned() })
}

#[tokio::test]
async fn healthz_reports_device_id() {
    let deploy_dir = tempfile::tempdir().unwrap();
    let vault_dir = tempfile::tempdir().unwrap();
    let state = test_state(deploy_dir.path(), vault_dir.path()).await;

    let app = routes::health::router().with_state(state);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let response = reqwest::get(format!("http://{addr}/healthz")).await.unwrap();
    assert!(response.status().is_success());

    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["device_id"], "test-device");
}
