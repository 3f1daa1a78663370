//! Fleet of [`ManagedProcess`]es behind deploy/get/stop/shutdown orchestration
//! (spec §4.H).
//!
//! The manager owns the `app-id -> ManagedProcess` map exclusively; a
//! `ManagedProcess` handle never escapes to a caller except via
//! [`ProcessManager::get`], and its monitor task's [`JoinHandle`] is tracked
//! here so [`ProcessManager::shutdown`] can guarantee every monitor task has
//! exited before returning (spec §4.H invariant 3).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use fleetd_errors::{Error as CoreError, ErrorCode};
use fleetd_resilience::{Clock, CircuitBreakerConfig, CircuitBreakerGroup};
use tokio::sync::{watch, RwLock};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::artifact::{self, Artifact, Fetcher};
use crate::config::{HealthCheckSpec, ProcessConfig, ResourceLimits, RestartPolicy};
use crate::error::AgentError;
use crate::metrics::{ErrorSink, MetricsSink};
use crate::process::ManagedProcess;

const DEPLOY_STOP_BUDGET: Duration = Duration::from_secs(30);
const SHUTDOWN_STOP_BUDGET: Duration = Duration::from_secs(60);
const SIGNAL_SHUTDOWN_BUDGET: Duration = Duration::from_secs(2 * 60);
const BREAKER_MAX_FAILURES: u32 = 5;
const BREAKER_INTERVAL: Duration = Duration::from_secs(60);
const BREAKER_TIMEOUT: Duration = Duration::from_secs(30);

/// Everything needed to deploy one application version (spec §4.H
/// `deploy(ctx, app, artifacts)`).
#[derive(Clone)]
pub struct DeploySpec {
    pub app_id: String,
    pub app_name: String,
    pub app_version: String,
    pub device_id: Option<String>,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub user: Option<String>,
    pub group: Option<String>,
    pub restart_policy: RestartPolicy,
    pub resources: ResourceLimits,
    pub health_check: Option<HealthCheckSpec>,
    pub graceful_shutdown_timeout: Duration,
    pub pre_stop_hook: Option<String>,
    pub post_stop_hook: Option<String>,
    pub artifacts: Vec<Artifact>,
}

impl DeploySpec {
    #[must_use]
    pub fn new(app_id: impl Into<String>, app_name: impl Into<String>, app_version: impl Into<String>, artifacts: Vec<Artifact>) -> Self {
        Self {
            app_id: app_id.into(),
            app_name: app_name.into(),
            app_version: app_version.into(),
            device_id: None,
            args: Vec::new(),
            env: HashMap::new(),
            user: None,
            group: None,
            restart_policy: RestartPolicy::OnFailure,
            resources: ResourceLimits::default(),
            health_check: None,
            graceful_shutdown_timeout: Duration::from_secs(10),
            pre_stop_hook: None,
            post_stop_hook: None,
            artifacts,
        }
    }
}

fn retryable(err: &CoreError) -> bool {
    matches!(err.code, ErrorCode::DeadlineExceeded | ErrorCode::Unavailable | ErrorCode::ResourceExhausted)
}

/// Owns the fleet of [`ManagedProcess`]es on one device (spec §4.H).
pub struct ProcessManager {
    processes: RwLock<HashMap<String, Arc<ManagedProcess>>>,
    monitor_handles: tokio::sync::Mutex<HashMap<String, JoinHandle<()>>>,
    breakers: CircuitBreakerGroup,
    deploy_root: PathBuf,
    fetcher: Arc<dyn Fetcher>,
    clock: Arc<dyn Clock>,
    metrics_sink: Arc<dyn MetricsSink>,
    error_sink: Arc<dyn ErrorSink>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProcessManager {
    #[must_use]
    pub fn new(
        deploy_root: impl Into<PathBuf>,
        fetcher: Arc<dyn Fetcher>,
        clock: Arc<dyn Clock>,
        metrics_sink: Arc<dyn MetricsSink>,
        error_sink: Arc<dyn ErrorSink>,
    ) -> Arc<Self> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let breaker_config = CircuitBreakerConfig {
            max_failures: BREAKER_MAX_FAILURES,
            max_requests_in_half_open: 1,
            interval: BREAKER_INTERVAL,
            timeout: BREAKER_TIMEOUT,
            should_trip: Arc::new(|_| true),
            on_state_change: None,
        };

        Arc::new(Self {
            processes: RwLock::new(HashMap::new()),
            monitor_handles: tokio::sync::Mutex::new(HashMap::new()),
            breakers: CircuitBreakerGroup::new(breaker_config),
            deploy_root: deploy_root.into(),
            fetcher,
            clock,
            metrics_sink,
            error_sink,
            shutdown_tx,
            shutdown_rx,
        })
    }

    /// `get(app-id)` (spec §4.H): read-locked map lookup.
    pub async fn get(&self, app_id: &str) -> Option<Arc<ManagedProcess>> {
        self.processes.read().await.get(app_id).cloned()
    }

    /// `deploy(ctx, app, artifacts)` (spec §4.H): guarded by a per-app
    /// circuit breaker and the bounded retry engine, retrying only on
    /// timeout/unavailable/resource-exhausted.
    ///
    /// # Errors
    ///
    /// Returns the wrapped last error once the circuit breaker rejects the
    /// call or the retry budget is exhausted.
    pub async fn deploy(self: &Arc<Self>, ctx: &CancellationToken, spec: DeploySpec) -> Result<Arc<ManagedProcess>, AgentError> {
        let breaker = self.breakers.get(&spec.app_id, self.clock.as_ref()).await;
        let retry_ctx = fleetd_resilience::RetryContext::new();
        let retry_config = fleetd_resilience::RetryConfig::new(3, Duration::from_secs(1), Duration::from_secs(10), 2.0);

        let this = Arc::clone(self);
        let spec = spec.clone();
        let ctx = ctx.clone();

        let result = breaker
            .execute(self.clock.as_ref(), || {
                let this = Arc::clone(&this);
                let spec = spec.clone();
                let ctx = ctx.clone();
                async move {
                    fleetd_resilience::retry(&retry_ctx, this.clock.as_ref(), &retry_config, retryable, move || {
                        let this = Arc::clone(&this);
                        let spec = spec.clone();
                        let ctx = ctx.clone();
                        async move { this.deploy_attempt(&ctx, spec).await.map_err(CoreError::from) }
                    })
                    .await
                }
            })
            .await;

        result.map_err(AgentError::Core)
    }

    async fn deploy_attempt(self: &Arc<Self>, ctx: &CancellationToken, spec: DeploySpec) -> Result<Arc<ManagedProcess>, AgentError> {
        if let Some(existing) = self.get(&spec.app_id).await {
            if let Err(error) = existing.stop(DEPLOY_STOP_BUDGET).await {
                tracing::warn!(app_id = %spec.app_id, %error, "prior deployment did not stop cleanly, proceeding");
            }
            self.retire(&spec.app_id).await;
        }

        let executable = tokio::select! {
            result = artifact::prepare_deployment(self.fetcher.as_ref(), &spec.app_name, &spec.app_version, &spec.artifacts, &self.deploy_root) => result?,
            () = ctx.cancelled() => return Err(AgentError::DeadlineExceeded),
        };

        let working_dir = self.deploy_root.join(&spec.app_name).join(&spec.app_version);
        let mut config = ProcessConfig::new(executable, working_dir)
            .with_args(spec.args)
            .with_env(spec.env)
            .with_restart_policy(spec.restart_policy);
        config.user = spec.user;
        config.group = spec.group;
        config.resources = spec.resources;
        config.graceful_shutdown_timeout = spec.graceful_shutdown_timeout;
        config.pre_stop_hook = spec.pre_stop_hook;
        config.post_stop_hook = spec.post_stop_hook;
        if let Some(health_check) = spec.health_check {
            config = config.with_health_check(health_check);
        }

        let process = ManagedProcess::with_device_id(&spec.app_id, &spec.app_version, spec.device_id, config, Arc::clone(&self.clock));
        process.start_with_retry().await?;

        self.processes.write().await.insert(spec.app_id.clone(), Arc::clone(&process));

        let monitor_process = Arc::clone(&process);
        let metrics_sink = Arc::clone(&self.metrics_sink);
        let error_sink = Arc::clone(&self.error_sink);
        let handle = tokio::spawn(async move {
            monitor_process.monitor(metrics_sink, error_sink).await;
        });
        self.monitor_handles.lock().await.insert(spec.app_id.clone(), handle);

        Ok(process)
    }

    /// Remove `app_id` from the map and await its monitor task's exit,
    /// short-circuiting after a grace period so a wedged monitor task can
    /// never hang `stop`/`shutdown` forever.
    async fn retire(&self, app_id: &str) {
        self.processes.write().await.remove(app_id);
        let handle = self.monitor_handles.lock().await.remove(app_id);
        if let Some(handle) = handle {
            if tokio::time::timeout(Duration::from_secs(5), handle).await.is_err() {
                tracing::warn!(app_id, "monitor task did not exit within grace period");
            }
        }
    }

    /// `stop(ctx, app-id, timeout)` (spec §4.H): idempotent, no-op if
    /// absent.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::DeadlineExceeded`] if the process does not
    /// reach a terminal state within `timeout`.
    pub async fn stop(&self, app_id: &str, timeout: Duration) -> Result<(), AgentError> {
        let Some(process) = self.get(app_id).await else {
            return Ok(());
        };
        process.stop(timeout).await?;
        self.retire(app_id).await;
        Ok(())
    }

    /// `shutdown(ctx)` (spec §4.H): idempotent, stops every deployed app in
    /// parallel with a 60s per-process budget, and waits for every monitor
    /// task to exit before returning (invariant 3).
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::DeadlineExceeded`] if `ctx` is cancelled before
    /// every app has stopped.
    pub async fn shutdown(self: &Arc<Self>, ctx: &CancellationToken) -> Result<(), AgentError> {
        let _ = self.shutdown_tx.send(true);
        let app_ids: Vec<String> = self.processes.read().await.keys().cloned().collect();

        let mut joins = JoinSet::new();
        for app_id in app_ids {
            let this = Arc::clone(self);
            joins.spawn(async move {
                if let Err(error) = this.stop(&app_id, SHUTDOWN_STOP_BUDGET).await {
                    tracing::warn!(app_id, %error, "app did not stop cleanly during shutdown");
                }
            });
        }

        let wait_all = async {
            while joins.join_next().await.is_some() {}
        };

        tokio::select! {
            () = wait_all => Ok(()),
            () = ctx.cancelled() => Err(AgentError::DeadlineExceeded),
        }
    }

    /// Whether [`Self::shutdown`] has been invoked.
    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    /// `handle-signals(ctx)` (spec §4.H): SIGINT/SIGTERM trigger a bounded
    /// shutdown; SIGHUP is logged as reload-not-implemented. On non-unix
    /// targets only Ctrl+C is observed.
    pub async fn handle_signals(self: &Arc<Self>, ctx: &CancellationToken) {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(s) => s,
                Err(error) => {
                    tracing::error!(%error, "failed to install SIGTERM handler");
                    return;
                }
            };
            let mut sighup = match signal(SignalKind::hangup()) {
                Ok(s) => s,
                Err(error) => {
                    tracing::error!(%error, "failed to install SIGHUP handler");
                    return;
                }
            };

            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        tracing::info!("received interrupt, shutting down");
                        break;
                    }
                    _ = sigterm.recv() => {
                        tracing::info!("received terminate, shutting down");
                        break;
                    }
                    _ = sighup.recv() => {
                        tracing::info!("received hangup, reload not implemented");
                    }
                }
            }
        }

        #[cfg(not(unix))]
        {
            if tokio::signal::ctrl_c().await.is_err() {
                tracing::error!("failed to install interrupt handler");
                return;
            }
            tracing::info!("received interrupt, shutting down");
        }

        let shutdown_ctx = CancellationToken::new();
        let guard = shutdown_ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(SIGNAL_SHUTDOWN_BUDGET).await;
            guard.cancel();
        });

        if let Err(error) = self.shutdown(&shutdown_ctx).await {
            tracing::error!(%error, "shutdown did not complete within budget");
        }
        ctx.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::ArtifactType;
    use crate::metrics::RecordingSink;
    use fleetd_resilience::RealClock;

    struct LocalScriptFetcher;

    #[async_trait::async_trait]
    impl Fetcher for LocalScriptFetcher {
        async fn get(&self, _url: &str) -> Result<Vec<u8>, AgentError> {
            Ok(b"#!/bin/sh\nwhile true; do sleep 0.1; done\n".to_vec())
        }
    }

    fn artifact() -> Artifact {
        Artifact::new("run.sh", ArtifactType::Script, "https://artifacts.test/run.sh")
    }

    async fn new_manager() -> (Arc<ProcessManager>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(RecordingSink::new());
        let manager = ProcessManager::new(dir.path(), Arc::new(LocalScriptFetcher), Arc::new(RealClock), sink.clone(), sink);
        (manager, dir)
    }

    #[tokio::test]
    async fn deploy_registers_process_and_get_returns_it() {
        let (manager, _dir) = new_manager().await;
        let ctx = CancellationToken::new();
        let spec = DeploySpec::new("app-1", "app-1", "1.0.0", vec![artifact()]);

        let process = manager.deploy(&ctx, spec).await.unwrap();
        assert_eq!(process.app_id, "app-1");
        assert!(manager.get("app-1").await.is_some());

        manager.stop("app-1", Duration::from_secs(5)).await.unwrap();
        assert!(manager.get("app-1").await.is_none());
    }

    #[tokio::test]
    async fn redeploy_stops_prior_instance_first() {
        let (manager, _dir) = new_manager().await;
        let ctx = CancellationToken::new();
        let spec = DeploySpec::new("app-2", "app-2", "1.0.0", vec![artifact()]);

        let first = manager.deploy(&ctx, spec.clone()).await.unwrap();
        let first_pid = first.pid();

        let mut redeploy_spec = spec;
        redeploy_spec.app_version = "2.0.0".to_owned();
        let second = manager.deploy(&ctx, redeploy_spec).await.unwrap();

        assert_eq!(manager.processes.read().await.len(), 1);
        assert_ne!(first_pid, second.pid());

        manager.stop("app-2", Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn stop_is_idempotent_for_unknown_app() {
        let (manager, _dir) = new_manager().await;
        manager.stop("does-not-exist", Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_stops_all_and_waits_for_monitor_tasks() {
        let (manager, _dir) = new_manager().await;
        let ctx = CancellationToken::new();

        manager.deploy(&ctx, DeploySpec::new("app-3", "app-3", "1.0.0", vec![artifact()])).await.unwrap();
        manager.deploy(&ctx, DeploySpec::new("app-4", "app-4", "1.0.0", vec![artifact()])).await.unwrap();

        let shutdown_ctx = CancellationToken::new();
        manager.shutdown(&shutdown_ctx).await.unwrap();

        assert!(manager.get("app-3").await.is_none());
        assert!(manager.get("app-4").await.is_none());
        assert!(manager.monitor_handles.lock().await.is_empty());
        assert!(manager.is_shutting_down());
    }
}
