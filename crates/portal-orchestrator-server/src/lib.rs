//! Portal orchestrator server: REST API, CLI plumbing and an HTTP fetch backend for the orchestration engine.

pub mod backend;
pub mod config;
pub mod error;
pub mod rest;

pub use backend::{HttpBackend, HttpBackendConfig};
pub use config::{resolve_config_path, CliOverrides, ServerConfig};
pub use error::ApiError;
pub use rest::{router, AppState};

use std::sync::Arc;
use std::time::Duration;

use portal_orchestrator::Orchestrator;

/// Build an orchestrator over the HTTP backend from resolved settings.
pub fn build_orchestrator(config: &ServerConfig) -> Orchestrator {
    let backend = HttpBackend::new(HttpBackendConfig {
        user_agent: config.user_agent.clone(),
        same_origin: config.same_origin,
        request_timeout: config.defaults.timeout.max(Duration::from_secs(1)),
    });
    Orchestrator::new(Arc::new(backend))
        .with_history_limit(config.history_limit)
        .with_defaults(config.defaults.clone())
}
