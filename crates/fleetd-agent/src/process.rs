//! Per-application process supervisor (spec §3 `ProcessState`/`ManagedProcess`,
//! §4.G).
//!
//! A [`ManagedProcess`] owns exactly one child OS process at a time plus the
//! sub-tasks that watch it: stdout/stderr pumps, an optional health checker,
//! and the supervise loop that waits for exit and applies the restart
//! policy. Sub-components only ever see a cloned `Arc<ManagedProcess>` or a
//! narrow reference (app id, cancellation token) — never the child handle
//! itself, which stays owned by the supervise loop (spec §9 design note on
//! breaking cyclic references by construction order).

use std::process::Stdio;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use fleetd_errors::{Error as CoreError, ErrorCode};
use fleetd_resilience::{retry, Clock, RetryConfig, RetryContext};
use rand::Rng;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Child;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

use crate::config::ProcessConfig;
use crate::error::AgentError;
use crate::metrics::{ErrorSink, HealthStatus, MetricsSink, ProcessMetrics};

const RESTART_BUDGET: u32 = 10;
const MAX_RESTART_DELAY: Duration = Duration::from_secs(30);
const PRE_STOP_HOOK_TIMEOUT: Duration = Duration::from_secs(5);
const POST_STOP_HOOK_TIMEOUT: Duration = Duration::from_secs(5);
const START_DEADLINE: Duration = Duration::from_secs(10);
const METRICS_INTERVAL: Duration = Duration::from_secs(10);
const ERROR_CHANNEL_CAPACITY: usize = 64;

/// Lifecycle states of a single managed application process (spec §3).
///
/// Transition graph: `Unknown -> Starting -> {Running | Crashed}`,
/// `Running -> {Stopping, Crashed}`, `Stopping -> Stopped`,
/// `Crashed -> Restarting -> Starting`. Terminal: `Stopped` (after a
/// requested stop), `Crashed` (after the restart budget is exhausted).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProcessState {
    Unknown = 0,
    Starting = 1,
    Running = 2,
    Stopping = 3,
    Stopped = 4,
    Crashed = 5,
    Restarting = 6,
}

impl ProcessState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Starting,
            2 => Self::Running,
            3 => Self::Stopping,
            4 => Self::Stopped,
            5 => Self::Crashed,
            6 => Self::Restarting,
            _ => Self::Unknown,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Crashed => "crashed",
            Self::Restarting => "restarting",
        }
    }
}

/// A single managed application process: supervisor state, child OS
/// process ownership, and support tasks (spec §3 `ManagedProcess`).
pub struct ManagedProcess {
    pub app_id: String,
    pub app_version: String,
    pub device_id: Option<String>,
    config: ProcessConfig,
    state: AtomicU8,
    current_pid: AtomicU32,
    restart_count: AtomicU32,
    start_time: Mutex<Option<DateTime<Utc>>>,
    stop_tx: watch::Sender<bool>,
    stop_rx: watch::Receiver<bool>,
    health_tx: watch::Sender<Option<HealthStatus>>,
    health_rx: watch::Receiver<Option<HealthStatus>>,
    error_tx: mpsc::Sender<CoreError>,
    error_rx: Mutex<Option<mpsc::Receiver<CoreError>>>,
    cancel: tokio_util::sync::CancellationToken,
    clock: Arc<dyn Clock>,
    supervisor_handle: Mutex<Option<JoinHandle<()>>>,
    health_handle: Mutex<Option<JoinHandle<()>>>,
    stop_timeout: std::sync::Mutex<Duration>,
}

impl ManagedProcess {
    #[must_use]
    pub fn new(app_id: impl Into<String>, app_version: impl Into<String>, config: ProcessConfig, clock: Arc<dyn Clock>) -> Arc<Self> {
        Self::with_device_id(app_id, app_version, None, config, clock)
    }

    #[must_use]
    pub fn with_device_id(
        app_id: impl Into<String>,
        app_version: impl Into<String>,
        device_id: Option<String>,
        config: ProcessConfig,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        let (stop_tx, stop_rx) = watch::channel(false);
        let (health_tx, health_rx) = watch::channel(None);
        let (error_tx, error_rx) = mpsc::channel(ERROR_CHANNEL_CAPACITY);
        let default_stop_timeout = config.graceful_shutdown_timeout;

        Arc::new(Self {
            app_id: app_id.into(),
            app_version: app_version.into(),
            device_id,
            config,
            state: AtomicU8::new(ProcessState::Unknown as u8),
            stop_timeout: std::sync::Mutex::new(default_stop_timeout),
            current_pid: AtomicU32::new(0),
            restart_count: AtomicU32::new(0),
            start_time: Mutex::new(None),
            stop_tx,
            stop_rx,
            health_tx,
            health_rx,
            error_tx,
            error_rx: Mutex::new(Some(error_rx)),
            cancel: tokio_util::sync::CancellationToken::new(),
            clock,
            supervisor_handle: Mutex::new(None),
            health_handle: Mutex::new(None),
        })
    }

    #[must_use]
    pub fn state(&self) -> ProcessState {
        ProcessState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn transition(&self, to: ProcessState) {
        let from = self.state();
        self.state.store(to as u8, Ordering::SeqCst);
        tracing::info!(app_id = %self.app_id, from = from.as_str(), to = to.as_str(), "process state transition");
    }

    #[must_use]
    pub fn restart_count(&self) -> u32 {
        self.restart_count.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        match self.current_pid.load(Ordering::SeqCst) {
            0 => None,
            pid => Some(pid),
        }
    }

    #[must_use]
    pub fn health_subscriber(&self) -> watch::Receiver<Option<HealthStatus>> {
        self.health_rx.clone()
    }

    pub async fn started_at(&self) -> Option<DateTime<Utc>> {
        *self.start_time.lock().await
    }

    /// `start-with-retry(ctx)` (spec §4.G): wraps [`Self::start`] in the
    /// retry engine (3 attempts, 500ms initial, 5s max, x2 multiplier).
    ///
    /// # Errors
    ///
    /// Returns the last error after the retry budget is exhausted.
    pub async fn start_with_retry(self: &Arc<Self>) -> Result<(), AgentError> {
        let retry_ctx = RetryContext::new();
        let config = RetryConfig::new(3, Duration::from_millis(500), Duration::from_secs(5), 2.0);
        let this = Arc::clone(self);

        retry(&retry_ctx, this.clock.as_ref(), &config, |err| err.retryable, move || {
            let this = Arc::clone(&this);
            async move { this.start().await.map_err(CoreError::from) }
        })
        .await
        .map_err(AgentError::Core)
    }

    /// `start(ctx)` (spec §4.G): validate config, spawn the child under a
    /// 10-second start deadline, stamp `start_time`, transition
    /// `Starting -> Running`, and launch the long-running supervise loop
    /// (stdout/stderr pumps, exit monitor + restart policy) and the health
    /// checker if configured.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::StartFailed`] if validation or spawn fails or
    /// the start deadline elapses.
    pub async fn start(self: &Arc<Self>) -> Result<(), AgentError> {
        self.config.validate().await?;
        self.transition(ProcessState::Starting);

        let child = match tokio::time::timeout(START_DEADLINE, self.spawn_child()).await {
            Ok(Ok(child)) => child,
            Ok(Err(err)) => {
                self.transition(ProcessState::Crashed);
                return Err(err);
            }
            Err(_) => {
                self.transition(ProcessState::Crashed);
                return Err(AgentError::DeadlineExceeded);
            }
        };

        self.current_pid.store(child.id().unwrap_or(0), Ordering::SeqCst);
        *self.start_time.lock().await = Some(Utc::now());
        self.transition(ProcessState::Running);

        let supervisor = Arc::clone(self);
        let handle = tokio::spawn(async move { supervisor.supervise(child).await });
        *self.supervisor_handle.lock().await = Some(handle);

        if self.config.health_check.is_some() {
            let checker = Arc::clone(self);
            let handle = tokio::spawn(async move { checker.run_health_checker().await });
            *self.health_handle.lock().await = Some(handle);
        }

        Ok(())
    }

    async fn spawn_child(&self) -> Result<Child, AgentError> {
        let mut command = tokio::process::Command::new(&self.config.executable);
        command
            .args(&self.config.args)
            .envs(&self.config.env)
            .current_dir(&self.config.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        #[cfg(unix)]
        apply_unix_identity(&mut command, &self.config);

        // Resource limits (spec §3 `ProcessConfig.resources`) are advisory
        // and platform-specific (spec §4.G): no `pre_exec` rlimit hook is
        // installed here since this workspace forbids `unsafe_code`, so
        // cpu/memory/fd caps are logged but not enforced in-process.
        if self.config.resources.cpu_shares.is_some()
            || self.config.resources.memory_bytes.is_some()
            || self.config.resources.fd_limit.is_some()
        {
            tracing::debug!(app_id = %self.app_id, "resource limits configured but not enforced on this platform");
        }

        command.spawn().map_err(|e| AgentError::StartFailed(e.to_string()))
    }

    /// The long-running supervise loop: owns the child handle, attaches
    /// the log pumps, waits for either exit or a stop request, and applies
    /// the restart policy with capped, jittered backoff (spec §4.G exit
    /// monitoring, §9 "restart backoff with cap and jitter").
    async fn supervise(self: Arc<Self>, mut child: Child) {
        loop {
            self.attach_pumps(&mut child);
            let mut stop_rx = self.stop_rx.clone();

            tokio::select! {
                exit = child.wait() => {
                    self.current_pid.store(0, Ordering::SeqCst);

                    if *stop_rx.borrow() {
                        self.transition(ProcessState::Stopped);
                        return;
                    }

                    let exit_code = exit.ok().and_then(|status| status.code());
                    let err = CoreError::new(
                        ErrorCode::DeploymentFailed,
                        format!("process {} exited unexpectedly (code={exit_code:?})", self.app_id),
                    );
                    let _ = self.error_tx.try_send(err);

                    if !self.config.restart_policy.should_restart(exit_code) || self.restart_count() >= RESTART_BUDGET {
                        self.transition(ProcessState::Crashed);
                        return;
                    }

                    self.transition(ProcessState::Restarting);
                    let attempt = self.restart_count.fetch_add(1, Ordering::SeqCst) + 1;
                    let delay = jittered_restart_delay(attempt);

                    tokio::select! {
                        () = self.clock.sleep(delay) => {}
                        () = self.cancel.cancelled() => {}
                    }

                    if *stop_rx.borrow() {
                        self.transition(ProcessState::Stopped);
                        return;
                    }

                    self.transition(ProcessState::Starting);
                    match self.spawn_child().await {
                        Ok(new_child) => {
                            self.current_pid.store(new_child.id().unwrap_or(0), Ordering::SeqCst);
                            *self.start_time.lock().await = Some(Utc::now());
                            self.transition(ProcessState::Running);
                            child = new_child;
                        }
                        Err(err) => {
                            let _ = self.error_tx.try_send(err.into());
                            self.transition(ProcessState::Crashed);
                            return;
                        }
                    }
                }
                _ = stop_rx.wait_for(|requested| *requested) => {
                    self.transition(ProcessState::Stopping);
                    self.run_hook(self.config.pre_stop_hook.as_deref(), PRE_STOP_HOOK_TIMEOUT).await;

                    let pid = self.current_pid.load(Ordering::SeqCst);
                    send_sigterm(pid);

                    let graceful_budget = self.stop_timeout_budget();
                    if tokio::time::timeout(graceful_budget, child.wait()).await.is_err() {
                        send_sigkill(&mut child, pid).await;
                        let _ = child.wait().await;
                    }

                    self.current_pid.store(0, Ordering::SeqCst);
                    self.run_hook(self.config.post_stop_hook.as_deref(), POST_STOP_HOOK_TIMEOUT).await;
                    self.transition(ProcessState::Stopped);
                    return;
                }
            }
        }
    }

    fn stop_timeout_budget(&self) -> Duration {
        *self.stop_timeout.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Wires stdout/stderr pumps for the current child's pipes, each
    /// guarded so a pump panic is recovered and reported through the error
    /// channel instead of killing the managed process (spec §4.G).
    fn attach_pumps(self: &Arc<Self>, child: &mut Child) {
        if let Some(stdout) = child.stdout.take() {
            let this = Arc::clone(self);
            spawn_guarded(self.app_id.clone(), "stdout-pump", self.error_tx.clone(), async move {
                pump_lines(stdout, &this.app_id, tracing::Level::INFO).await;
            });
        }
        if let Some(stderr) = child.stderr.take() {
            let this = Arc::clone(self);
            spawn_guarded(self.app_id.clone(), "stderr-pump", self.error_tx.clone(), async move {
                pump_lines(stderr, &this.app_id, tracing::Level::WARN).await;
            });
        }
    }

    async fn run_hook(&self, hook: Option<&str>, timeout: Duration) {
        let Some(command) = hook else { return };
        let pid = self.current_pid.load(Ordering::SeqCst);

        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c").arg(command).env("APP_ID", &self.app_id).env("APP_PID", pid.to_string());

        match tokio::time::timeout(timeout, cmd.output()).await {
            Ok(Ok(output)) if !output.status.success() => {
                tracing::warn!(app_id = %self.app_id, code = ?output.status.code(), "hook exited non-zero");
            }
            Ok(Err(error)) => tracing::warn!(app_id = %self.app_id, %error, "hook failed to run"),
            Err(_) => tracing::warn!(app_id = %self.app_id, "hook timed out"),
            Ok(Ok(_)) => {}
        }
    }

    /// `stop(timeout)` (spec §4.G): close the stop channel and wait (bounded
    /// by `timeout`) for the supervise loop to reach a terminal state. The
    /// actual hook/SIGTERM/SIGKILL sequence runs inside [`Self::supervise`],
    /// which is the sole owner of the child handle.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::DeadlineExceeded`] if the process hasn't
    /// reached `Stopped`/`Crashed` within `timeout`.
    pub async fn stop(&self, timeout: Duration) -> Result<(), AgentError> {
        *self.stop_timeout.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = timeout.min(self.config.graceful_shutdown_timeout);
        let _ = self.stop_tx.send(true);

        if matches!(self.state(), ProcessState::Stopped | ProcessState::Crashed | ProcessState::Unknown) {
            return Ok(());
        }

        let mut state_poll = tokio::time::interval(Duration::from_millis(50));
        let wait = async {
            loop {
                if matches!(self.state(), ProcessState::Stopped | ProcessState::Crashed) {
                    return;
                }
                state_poll.tick().await;
            }
        };

        tokio::time::timeout(timeout, wait).await.map_err(|_| AgentError::DeadlineExceeded)
    }

    /// `monitor(metrics-sink)` (spec §4.G): every 10 seconds samples
    /// resource usage and publishes a [`ProcessMetrics`] record; drains the
    /// internal error channel into `error_sink`. Returns on stop signal or
    /// cancellation.
    pub async fn monitor(self: Arc<Self>, metrics_sink: Arc<dyn MetricsSink>, error_sink: Arc<dyn ErrorSink>) {
        let mut error_rx = match self.error_rx.lock().await.take() {
            Some(rx) => rx,
            None => {
                tracing::warn!(app_id = %self.app_id, "monitor called more than once");
                return;
            }
        };
        let mut ticker = tokio::time::interval(METRICS_INTERVAL);
        let mut stop_rx = self.stop_rx.clone();
        let mut sys = sysinfo::System::new();

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Some(pid) = self.pid() {
                        metrics_sink.publish(self.sample_metrics(&mut sys, pid)).await;
                    }
                }
                Some(err) = error_rx.recv() => {
                    error_sink.record(&self.app_id, &err).await;
                }
                _ = stop_rx.wait_for(|requested| *requested) => {
                    return;
                }
                () = self.cancel.cancelled() => {
                    return;
                }
            }
        }
    }

    fn sample_metrics(&self, sys: &mut sysinfo::System, pid: u32) -> ProcessMetrics {
        sys.refresh_processes(sysinfo::ProcessesToUpdate::All, true);
        let sys_pid = sysinfo::Pid::from_u32(pid);

        let (cpu_percent, memory_bytes, disk_read, disk_write) = sys
            .process(sys_pid)
            .map(|p| {
                let disk = p.disk_usage();
                (p.cpu_usage(), p.memory(), disk.total_read_bytes, disk.total_written_bytes)
            })
            .unwrap_or_default();

        let (fd_count, thread_count) = linux_fd_and_thread_counts(pid);

        ProcessMetrics {
            app_id: self.app_id.clone(),
            device_id: self.device_id.clone(),
            pid: Some(pid),
            cpu_percent,
            memory_bytes,
            disk_read_bytes: disk_read,
            disk_write_bytes: disk_write,
            net_rx_bytes: 0,
            net_tx_bytes: 0,
            fd_count,
            thread_count,
            timestamp: Utc::now(),
        }
    }

    /// Periodic liveness probe (spec §4.G health). Runs until stop or
    /// cancellation; publishes into the drop-on-full health channel (a
    /// `watch` channel naturally keeps only the latest value).
    async fn run_health_checker(self: Arc<Self>) {
        let spec = self.config.health_check.clone().expect("only spawned when configured");
        let mut ticker = tokio::time::interval(spec.interval);
        let mut stop_rx = self.stop_rx.clone();

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let status = self.probe_health(&spec).await;
                    let _ = self.health_tx.send(Some(status));
                }
                _ = stop_rx.wait_for(|requested| *requested) => return,
                () = self.cancel.cancelled() => return,
            }
        }
    }

    async fn probe_health(&self, spec: &crate::config::HealthCheckSpec) -> HealthStatus {
        let pid_alive = self.pid().is_some() && self.state() == ProcessState::Running;
        if !pid_alive {
            return HealthStatus::unhealthy("process not running");
        }

        let Some(command) = &spec.command else {
            return HealthStatus::healthy();
        };

        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c").arg(command);
        match tokio::time::timeout(spec.timeout, cmd.output()).await {
            Ok(Ok(output)) if output.status.success() => HealthStatus::healthy(),
            Ok(Ok(output)) => HealthStatus::unhealthy(format!("health command exited with {:?}", output.status.code())),
            Ok(Err(error)) => HealthStatus::unhealthy(format!("health command failed: {error}")),
            Err(_) => HealthStatus::unhealthy("health command timed out"),
        }
    }
}

/// Jittered restart backoff (spec §4.G / §8 scenario S3): `min(attempt *
/// 1s, 30s)` with +/-10% multiplicative jitter.
fn jittered_restart_delay(attempt: u32) -> Duration {
    let base = Duration::from_secs(u64::from(attempt)).min(MAX_RESTART_DELAY);
    let spread = base.as_millis() as f64 * 0.10;
    let offset = rand::thread_rng().gen_range(-spread..=spread);
    let millis = (base.as_millis() as f64 + offset).max(0.0);
    Duration::from_millis(millis as u64)
}

#[cfg(unix)]
fn apply_unix_identity(command: &mut tokio::process::Command, config: &ProcessConfig) {
    use std::os::unix::process::CommandExt;
    if let Some(uid) = config.user.as_deref().and_then(|u| u.parse::<u32>().ok()) {
        command.uid(uid);
    }
    if let Some(gid) = config.group.as_deref().and_then(|g| g.parse::<u32>().ok()) {
        command.gid(gid);
    }
}

#[cfg(unix)]
fn send_sigterm(pid: u32) {
    if pid == 0 {
        return;
    }
    let _ = nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), nix::sys::signal::Signal::SIGTERM);
}

#[cfg(not(unix))]
fn send_sigterm(_pid: u32) {}

#[cfg(unix)]
async fn send_sigkill(child: &mut Child, pid: u32) {
    if pid != 0 {
        let _ = nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), nix::sys::signal::Signal::SIGKILL);
    }
    let _ = child.start_kill();
}

#[cfg(not(unix))]
async fn send_sigkill(child: &mut Child, _pid: u32) {
    let _ = child.start_kill();
}

#[cfg(target_os = "linux")]
fn linux_fd_and_thread_counts(pid: u32) -> (u64, u64) {
    let fd_count = std::fs::read_dir(format!("/proc/{pid}/fd")).map(|entries| entries.count() as u64).unwrap_or(0);
    let thread_count = std::fs::read_to_string(format!("/proc/{pid}/status"))
        .ok()
        .and_then(|contents| {
            contents.lines().find_map(|line| line.strip_prefix("Threads:").map(|v| v.trim().parse::<u64>().unwrap_or(0)))
        })
        .unwrap_or(0);
    (fd_count, thread_count)
}

#[cfg(not(target_os = "linux"))]
fn linux_fd_and_thread_counts(_pid: u32) -> (u64, u64) {
    (0, 0)
}

/// Reads `source` line-by-line, emitting a structured log record per line
/// at `level` with a `line` field (spec §4.G log streaming).
async fn pump_lines<R: tokio::io::AsyncRead + Unpin>(source: R, app_id: &str, level: tracing::Level) {
    let mut lines = BufReader::new(source).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => match level {
                tracing::Level::WARN => tracing::warn!(app_id, line, "child stderr"),
                _ => tracing::info!(app_id, line, "child stdout"),
            },
            Ok(None) => return,
            Err(error) => {
                tracing::warn!(app_id, %error, "log pump read error");
                return;
            }
        }
    }
}

/// Spawns `fut` in its own task and a guard task that awaits it; a panic
/// inside `fut` is recovered via the `JoinError` and turned into an
/// `internal` error posted to `error_tx`, matching spec §4.G's "a panic
/// inside a pump recovers, logs at error, and posts an internal error to
/// the error channel" without `catch_unwind` inside async code.
fn spawn_guarded<F>(app_id: String, label: &'static str, error_tx: mpsc::Sender<CoreError>, fut: F) -> JoinHandle<()>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let handle = tokio::spawn(fut);
        if let Err(join_error) = handle.await {
            if join_error.is_panic() {
                let payload = join_error.into_panic();
                let err = fleetd_errors::from_panic(payload.as_ref());
                tracing::error!(app_id, label, "{} panicked: {}", label, err.message);
                let _ = error_tx.send(err).await;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RestartPolicy;
    use crate::metrics::RecordingSink;
    use fleetd_resilience::RealClock;
    use std::os::unix::fs::PermissionsExt;

    async fn write_script(dir: &std::path::Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        tokio::fs::write(&path, body).await.unwrap();
        tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).await.unwrap();
        path
    }

    #[tokio::test]
    async fn start_transitions_to_running_and_stop_transitions_to_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "run.sh", "#!/bin/sh\nwhile true; do sleep 0.1; done\n").await;
        let config = ProcessConfig::new(&script, dir.path());
        let process = ManagedProcess::new("a1", "1", config, Arc::new(RealClock));

        process.start().await.unwrap();
        assert_eq!(process.state(), ProcessState::Running);
        assert!(process.pid().is_some());

        process.stop(Duration::from_secs(5)).await.unwrap();
        assert_eq!(process.state(), ProcessState::Stopped);
    }

    #[tokio::test]
    async fn on_failure_policy_restarts_after_crash() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "crash.sh", "#!/bin/sh\nsleep 0.1\nexit 1\n").await;
        let config = ProcessConfig::new(&script, dir.path()).with_restart_policy(RestartPolicy::OnFailure);
        let process = ManagedProcess::new("a2", "1", config, Arc::new(RealClock));

        process.start().await.unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
        while process.restart_count() < 1 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(process.restart_count() >= 1);
        assert_ne!(process.state(), ProcessState::Crashed);

        process.stop(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn no_policy_never_restarts_and_latches_crashed() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "exit.sh", "#!/bin/sh\nexit 1\n").await;
        let config = ProcessConfig::new(&script, dir.path()).with_restart_policy(RestartPolicy::No);
        let process = ManagedProcess::new("a3", "1", config, Arc::new(RealClock));

        process.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(process.state(), ProcessState::Crashed);
        assert_eq!(process.restart_count(), 0);
    }

    #[tokio::test]
    async fn monitor_publishes_metrics_while_running() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "run.sh", "#!/bin/sh\nwhile true; do sleep 0.1; done\n").await;
        let config = ProcessConfig::new(&script, dir.path());
        let process = ManagedProcess::new("a4", "1", config, Arc::new(RealClock));
        process.start().await.unwrap();

        let sink = Arc::new(RecordingSink::new());
        let monitor_process = Arc::clone(&process);
        let monitor_sink = Arc::clone(&sink);
        let handle = tokio::spawn(async move {
            monitor_process.monitor(monitor_sink.clone(), monitor_sink).await;
        });

        process.stop(Duration::from_secs(5)).await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
    }
}
