//! HTTP control-plane surface: a thin axum wrapper over
//! [`fleetd_agent::ProcessManager`], the authorization core, and the
//! credential vault. No transport concern beyond routing/error-mapping is
//! reimplemented here — CORS, rate limiting, and migrations stay named-only
//! external collaborators.

pub mod config;
pub mod error;
pub mod routes;
pub mod state;

pub use config::ServerConfig;
pub use error::AppError;
pub use state::AppState;
