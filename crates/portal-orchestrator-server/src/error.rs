//! REST error responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use portal_orchestrator::OrchestratorError;

/// An error returned by a REST handler.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),

    /// Malformed request input that never reached the engine.
    #[error("Invalid request: {0}")]
    BadRequest(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Orchestrator(e) => match e {
                OrchestratorError::Validation(_) => StatusCode::BAD_REQUEST,
                OrchestratorError::Conflict { .. } => StatusCode::CONFLICT,
                OrchestratorError::NotFound(_) => StatusCode::NOT_FOUND,
                OrchestratorError::AcquireTimeout(_) => StatusCode::SERVICE_UNAVAILABLE,
                OrchestratorError::UnitFailure(_)
                | OrchestratorError::FatalExecution(_)
                | OrchestratorError::Backend(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiError::BadRequest(_) => portal_orchestrator::error::error_codes::VALIDATION,
            ApiError::Orchestrator(e) => e.code(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("request failed: {self}");
        }
        let mut body = json!({
            "error": { "code": self.code(), "message": self.to_string() }
        });
        if let ApiError::Orchestrator(OrchestratorError::Conflict { active, .. }) = &self {
            body["error"]["activeExecutionId"] = json!(active);
        }
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (OrchestratorError::Validation("x".into()), StatusCode::BAD_REQUEST),
            (OrchestratorError::NotFound("x".into()), StatusCode::NOT_FOUND),
            (
                OrchestratorError::AcquireTimeout(std::time::Duration::from_secs(1)),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (OrchestratorError::Backend("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status(), status);
        }
    }

    #[test]
    fn test_conflict_body_carries_active_id() {
        let active = uuid::Uuid::new_v4();
        let response = ApiError::from(OrchestratorError::Conflict {
            job_class: portal_orchestrator::JobClass::Bulk,
            active,
        })
        .into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }
}
