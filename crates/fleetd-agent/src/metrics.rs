//! Records emitted to external collaborators (spec §6): process metrics,
//! health status, and the sink traits the process supervisor publishes
//! through. Neither trait implementation lives here — they're external
//! collaborators per spec §1 ("telemetry/log shipping... emits structured
//! records to sinks").

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Periodic resource-usage sample for one managed process (spec §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessMetrics {
    pub app_id: String,
    pub device_id: Option<String>,
    pub pid: Option<u32>,
    pub cpu_percent: f32,
    pub memory_bytes: u64,
    pub disk_read_bytes: u64,
    pub disk_write_bytes: u64,
    pub net_rx_bytes: u64,
    pub net_tx_bytes: u64,
    pub fd_count: u64,
    pub thread_count: u64,
    pub timestamp: DateTime<Utc>,
}

/// Result of a liveness/readiness probe (spec §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub healthy: bool,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl HealthStatus {
    #[must_use]
    pub fn healthy() -> Self {
        Self { healthy: true, message: "ok".to_owned(), timestamp: Utc::now() }
    }

    #[must_use]
    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self { healthy: false, message: message.into(), timestamp: Utc::now() }
    }
}

/// Where [`ProcessMetrics`] samples go. An external collaborator (spec §1) —
/// the in-memory implementation here exists for tests and for the minimal
/// `fleetd-server` wrapper to poll without standing up a real metrics
/// backend.
#[async_trait::async_trait]
pub trait MetricsSink: Send + Sync + 'static {
    async fn publish(&self, metrics: ProcessMetrics);
}

/// Sink for recovered-panic / unexpected-failure error records from a
/// managed process's sub-tasks (spec §4.G: "posts an internal error to the
/// error channel").
#[async_trait::async_trait]
pub trait ErrorSink: Send + Sync + 'static {
    async fn record(&self, app_id: &str, error: &fleetd_errors::Error);
}

/// In-memory [`MetricsSink`]/[`ErrorSink`] that just logs via `tracing` —
/// the default wiring when no real telemetry backend is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

#[async_trait::async_trait]
impl MetricsSink for TracingSink {
    async fn publish(&self, metrics: ProcessMetrics) {
        tracing::debug!(
            app_id = %metrics.app_id,
            cpu_percent = metrics.cpu_percent,
            memory_bytes = metrics.memory_bytes,
            fd_count = metrics.fd_count,
            thread_count = metrics.thread_count,
            "process metrics sample"
        );
    }
}

#[async_trait::async_trait]
impl ErrorSink for TracingSink {
    async fn record(&self, app_id: &str, error: &fleetd_errors::Error) {
        tracing::error!(app_id, code = %error.code, severity = %error.severity, "managed process error: {}", error.message);
    }
}

/// `MetricsSink` that appends every sample to an in-memory vec, for tests.
#[derive(Debug, Default)]
pub struct RecordingSink {
    pub metrics: tokio::sync::Mutex<Vec<ProcessMetrics>>,
    pub errors: tokio::sync::Mutex<Vec<(String, fleetd_errors::Error)>>,
}

impl RecordingSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl MetricsSink for RecordingSink {
    async fn publish(&self, metrics: ProcessMetrics) {
        self.metrics.lock().await.push(metrics);
    }
}

#[async_trait::async_trait]
impl ErrorSink for RecordingSink {
    async fn record(&self, app_id: &str, error: &fleetd_errors::Error) {
        self.errors.lock().await.push((app_id.to_owned(), error.clone()));
    }
}
