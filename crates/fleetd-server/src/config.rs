//! Server configuration, loaded from environment variables with sensible
//! defaults (spec's ambient config layer).

use std::net::SocketAddr;
use std::path::PathBuf;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind the HTTP listener to.
    pub bind_addr: SocketAddr,
    /// Log level filter (e.g., `info`, `debug`, `warn`).
    pub log_level: String,
    /// Directory deployed application versions are unpacked into.
    pub deploy_root: PathBuf,
    /// Directory the credential vault persists its encrypted store under.
    pub vault_root: PathBuf,
    /// Identifier for the device this agent runs on.
    pub device_id: String,
    /// Interval, in seconds, between background health/metrics sweeps.
    pub sweep_interval_secs: u64,
    /// Issuer claim stamped onto every JWT this server issues.
    pub jwt_issuer: String,
    /// Audience claim stamped onto every JWT this server issues.
    pub jwt_audience: String,
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// - `FLEETD_BIND_ADDR` — full bind address (overrides `PORT`, default `127.0.0.1:7700`)
    /// - `PORT` — port to bind on (platform convention, binds to `0.0.0.0`)
    /// - `FLEETD_LOG_LEVEL` — log filter (default `info`)
    /// - `FLEETD_DEPLOY_ROOT` — deployment root directory (default `./deployments`)
    /// - `FLEETD_DEVICE_ID` — device identifier (default a random UUID)
    /// - `FLEETD_SWEEP_INTERVAL_SECS` — background sweep interval (default `60`)
    #[must_use]
    pub fn from_env() -> Self {
        let bind_addr = if let Ok(addr) = std::env::var("FLEETD_BIND_ADDR") {
            addr.parse().unwrap_or_else(|_| SocketAddr::from(([127, 0, 0, 1], 7700)))
        } else if let Ok(port_str) = std::env::var("PORT") {
            let port: u16 = port_str.parse().unwrap_or(7700);
            SocketAddr::from(([0, 0, 0, 0], port))
        } else {
            SocketAddr::from(([127, 0, 0, 1], 7700))
        };

        let log_level = std::env::var("FLEETD_LOG_LEVEL").unwrap_or_else(|_| "info".to_owned());

        let deploy_root = std::env::var("FLEETD_DEPLOY_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./deployments"));

        let vault_root = std::env::var("FLEETD_VAULT_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./vault"));

        let device_id = std::env::var("FLEETD_DEVICE_ID").unwrap_or_else(|_| uuid::Uuid::new_v4().to_string());

        let sweep_interval_secs = std::env::var("FLEETD_SWEEP_INTERVAL_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(60);

        let jwt_issuer = std::env::var("FLEETD_JWT_ISSUER").unwrap_or_else(|_| "fleetd".to_owned());
        let jwt_audience = std::env::var("FLEETD_JWT_AUDIENCE").unwrap_or_else(|_| "fleetd-agents".to_owned());

        Self { bind_addr, log_level, deploy_root, vault_root, device_id, sweep_interval_secs, jwt_issuer, jwt_audience }
    }
}
