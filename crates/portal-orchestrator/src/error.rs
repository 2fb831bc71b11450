//! Error taxonomy for the orchestration engine.
//!
//! Only admission, configuration and lookup failures surface as errors.
//! Per-unit failures (a single task or visit) are recorded on the execution
//! as outcome values and never abort the caller.

use std::time::Duration;

use crate::types::{ExecutionId, JobClass};

/// Stable machine-readable error codes.
pub mod error_codes {
    pub const VALIDATION: &str = "E_VALIDATION";
    pub const CONFLICT: &str = "E_CONFLICT";
    pub const NOT_FOUND: &str = "E_NOT_FOUND";
    pub const ACQUIRE_TIMEOUT: &str = "E_ACQUIRE_TIMEOUT";
    pub const UNIT_FAILURE: &str = "E_UNIT_FAILURE";
    pub const FATAL: &str = "E_FATAL";
    pub const BACKEND: &str = "E_BACKEND";
}

/// All errors that can occur in the orchestration engine.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum OrchestratorError {
    /// Malformed or out-of-range configuration. Rejected before any mutation.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A same-class execution is already running.
    #[error("Conflict: a {job_class} execution is already running ({active})")]
    Conflict {
        job_class: JobClass,
        active: ExecutionId,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Timed out after {}ms waiting for a worker", .0.as_millis())]
    AcquireTimeout(Duration),

    #[error("Unit failed: {0}")]
    UnitFailure(String),

    #[error("Fatal execution error: {0}")]
    FatalExecution(String),

    #[error("Backend error: {0}")]
    Backend(String),
}

impl OrchestratorError {
    pub fn code(&self) -> &'static str {
        use error_codes::*;
        match self {
            OrchestratorError::Validation(_) => VALIDATION,
            OrchestratorError::Conflict { .. } => CONFLICT,
            OrchestratorError::NotFound(_) => NOT_FOUND,
            OrchestratorError::AcquireTimeout(_) => ACQUIRE_TIMEOUT,
            OrchestratorError::UnitFailure(_) => UNIT_FAILURE,
            OrchestratorError::FatalExecution(_) => FATAL,
            OrchestratorError::Backend(_) => BACKEND,
        }
    }

    /// Shorthand for an unknown execution id.
    pub fn unknown_execution(id: &ExecutionId) -> Self {
        OrchestratorError::NotFound(format!("execution {id}"))
    }
}

/// Convenience result type.
pub type OrchestratorResult<T> = Result<T, OrchestratorError>;
