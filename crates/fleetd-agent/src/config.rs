//! Process configuration types (spec §3 `ProcessConfig`/`Artifact`).

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::AgentError;

/// What happens to a [`crate::process::ManagedProcess`] after its child
/// exits (spec §4.G exit monitoring).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    Always,
    OnFailure,
    No,
}

impl RestartPolicy {
    /// Whether a process that exited with `exit_code` (`None` means killed
    /// by signal) should be restarted under this policy.
    #[must_use]
    pub fn should_restart(self, exit_code: Option<i32>) -> bool {
        match self {
            Self::Always => true,
            Self::OnFailure => exit_code != Some(0),
            Self::No => false,
        }
    }
}

/// Best-effort resource isolation hints (spec §3 `ProcessConfig.resources`).
/// Application on Linux is via `setrlimit`/cgroups; on other platforms this
/// is advisory only and silently not enforced (spec §4.G: "platform-specific").
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub cpu_shares: Option<u32>,
    pub memory_bytes: Option<u64>,
    pub fd_limit: Option<u64>,
}

/// A liveness/readiness probe spec (spec §4.G health).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckSpec {
    /// How often the probe runs. Default 30s per spec §4.G.
    pub interval: Duration,
    /// Optional shell command whose exit code 0 means healthy, run in
    /// addition to the baseline pid-is-running check.
    pub command: Option<String>,
    pub timeout: Duration,
}

impl Default for HealthCheckSpec {
    fn default() -> Self {
        Self { interval: Duration::from_secs(30), command: None, timeout: Duration::from_secs(5) }
    }
}

/// Full configuration for one managed application process (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessConfig {
    pub executable: PathBuf,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub working_dir: PathBuf,
    pub user: Option<String>,
    pub group: Option<String>,
    pub restart_policy: RestartPolicy,
    pub resources: ResourceLimits,
    pub health_check: Option<HealthCheckSpec>,
    pub graceful_shutdown_timeout: Duration,
    pub pre_stop_hook: Option<String>,
    pub post_stop_hook: Option<String>,
}

impl ProcessConfig {
    #[must_use]
    pub fn new(executable: impl Into<PathBuf>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            args: Vec::new(),
            env: HashMap::new(),
            working_dir: working_dir.into(),
            user: None,
            group: None,
            restart_policy: RestartPolicy::OnFailure,
            resources: ResourceLimits::default(),
            health_check: None,
            graceful_shutdown_timeout: Duration::from_secs(10),
            pre_stop_hook: None,
            post_stop_hook: None,
        }
    }

    #[must_use]
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    #[must_use]
    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    #[must_use]
    pub fn with_restart_policy(mut self, policy: RestartPolicy) -> Self {
        self.restart_policy = policy;
        self
    }

    #[must_use]
    pub fn with_health_check(mut self, spec: HealthCheckSpec) -> Self {
        self.health_check = Some(spec);
        self
    }

    /// Validate `executable` exists, is a regular file, and (on unix) has
    /// an execute bit set. Spec §3 invariant: checked before the process
    /// state machine leaves `Unknown`.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::StartFailed`] if any check fails.
    pub async fn validate(&self) -> Result<(), AgentError> {
        let meta = tokio::fs::metadata(&self.executable)
            .await
            .map_err(|e| AgentError::StartFailed(format!("executable {} not accessible: {e}", self.executable.display())))?;

        if !meta.is_file() {
            return Err(AgentError::StartFailed(format!("executable {} is not a regular file", self.executable.display())));
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if meta.permissions().mode() & 0o111 == 0 {
                return Err(AgentError::StartFailed(format!("executable {} has no execute bit set", self.executable.display())));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn always_restarts_regardless_of_exit_code() {
        assert!(RestartPolicy::Always.should_restart(Some(0)));
        assert!(RestartPolicy::Always.should_restart(Some(1)));
        assert!(RestartPolicy::Always.should_restart(None));
    }

    #[test]
    fn on_failure_restarts_only_on_nonzero_exit() {
        assert!(!RestartPolicy::OnFailure.should_restart(Some(0)));
        assert!(RestartPolicy::OnFailure.should_restart(Some(1)));
        assert!(RestartPolicy::OnFailure.should_restart(None));
    }

    #[test]
    fn no_never_restarts() {
        assert!(!RestartPolicy::No.should_restart(Some(1)));
    }

    #[tokio::test]
    async fn validate_rejects_missing_executable() {
        let config = ProcessConfig::new("/nonexistent/binary", "/tmp");
        assert!(config.validate().await.is_err());
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn validate_rejects_non_executable_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("not-exec");
        tokio::fs::write(&path, b"data").await.unwrap();
        let config = ProcessConfig::new(&path, dir.path());
        assert!(config.validate().await.is_err());
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn validate_accepts_executable_file() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.sh");
        tokio::fs::write(&path, b"#!/bin/sh\nexit 0\n").await.unwrap();
        tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).await.unwrap();
        let config = ProcessConfig::new(&path, dir.path());
        assert!(config.validate().await.is_ok());
    }
}
