//! Structured audit trail for vault and RBAC operations.
//!
//! Generalizes the teacher's `AuditManager`/file-backed sink pattern: a
//! pluggable [`AuditSink`] trait with an in-memory ring buffer (tests, the
//! default local agent) and a JSON-lines file sink, fanned out by
//! [`AuditManager`]. Reused by `fleetd-auth` for RBAC/policy decisions.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// One audit record: who did what to what, and whether it was allowed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub actor: String,
    pub action: String,
    pub resource: String,
    pub outcome: AuditOutcome,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditOutcome {
    Allowed,
    Denied,
    Error,
}

impl AuditEntry {
    #[must_use]
    pub fn new(actor: impl Into<String>, action: impl Into<String>, resource: impl Into<String>, outcome: AuditOutcome) -> Self {
        Self {
            timestamp: Utc::now(),
            actor: actor.into(),
            action: action.into(),
            resource: resource.into(),
            outcome,
            detail: None,
        }
    }

    #[must_use]
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

#[async_trait::async_trait]
pub trait AuditSink: Send + Sync + 'static {
    fn name(&self) -> &str;
    async fn log(&self, entry: &AuditEntry);
}

/// In-memory ring buffer sink — bounded so a runaway audit volume can't
/// exhaust memory; used by tests and as the default when no file sink is
/// configured.
pub struct MemoryAuditSink {
    capacity: usize,
    entries: Mutex<VecDeque<AuditEntry>>,
}

impl MemoryAuditSink {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self { capacity, entries: Mutex::new(VecDeque::with_capacity(capacity)) }
    }

    pub async fn entries(&self) -> Vec<AuditEntry> {
        self.entries.lock().await.iter().cloned().collect()
    }
}

#[async_trait::async_trait]
impl AuditSink for MemoryAuditSink {
    fn name(&self) -> &str {
        "memory"
    }

    async fn log(&self, entry: &AuditEntry) {
        let mut guard = self.entries.lock().await;
        if guard.len() >= self.capacity {
            guard.pop_front();
        }
        guard.push_back(entry.clone());
    }
}

/// Appends JSON-lines audit entries to a file, opened lazily and kept open
/// across writes. Write failures are logged, never propagated — audit is
/// best-effort observability, not a transactional log.
pub struct FileAuditSink {
    path: PathBuf,
    writer: Mutex<Option<tokio::fs::File>>,
}

impl FileAuditSink {
    #[must_use]
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self { path: path.as_ref().to_path_buf(), writer: Mutex::new(None) }
    }
}

#[async_trait::async_trait]
impl AuditSink for FileAuditSink {
    fn name(&self) -> &str {
        "file"
    }

    async fn log(&self, entry: &AuditEntry) {
        let Ok(mut line) = serde_json::to_vec(entry) else {
            tracing::warn!("failed to serialize audit entry");
            return;
        };
        line.push(b'\n');

        let mut guard = self.writer.lock().await;
        if guard.is_none() {
            match OpenOptions::new().create(true).append(true).mode_for_audit().open(&self.path).await {
                Ok(file) => *guard = Some(file),
                Err(err) => {
                    tracing::warn!(path = %self.path.display(), error = %err, "failed to open audit log file");
                    return;
                }
            }
        }

        if let Some(file) = guard.as_mut() {
            if let Err(err) = file.write_all(&line).await {
                tracing::warn!(error = %err, "failed to write audit entry");
            }
        }
    }
}

/// Extension so the file sink's `OpenOptions` carries the spec's 0600 mode
/// (§6: vault files are mode 0600) without a `cfg(unix)` branch at every
/// call site.
trait ModeForAudit {
    fn mode_for_audit(self) -> Self;
}

impl ModeForAudit for OpenOptions {
    #[cfg(unix)]
    fn mode_for_audit(mut self) -> Self {
        use std::os::unix::fs::OpenOptionsExt;
        self.mode(0o600);
        self
    }

    #[cfg(not(unix))]
    fn mode_for_audit(self) -> Self {
        self
    }
}

/// Fans audit entries out to every registered sink. Sink failures never
/// block the operation being audited.
#[derive(Default)]
pub struct AuditManager {
    sinks: Vec<Arc<dyn AuditSink>>,
}

impl AuditManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_sink(&mut self, sink: Arc<dyn AuditSink>) {
        self.sinks.push(sink);
    }

    pub async fn record(&self, entry: AuditEntry) {
        for sink in &self.sinks {
            sink.log(&entry).await;
        }
    }
}
