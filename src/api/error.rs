//! API error types with structured JSON responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::api::types::FingerprintInfo;
use crate::core_state::CoreError;
use crate::pipeline::intake::IntakeError;
use crate::pipeline::orchestrator::PipelineError;

/// Structured error response body.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    pub code: &'static str,
    pub message: String,
    /// Present only for duplicate-decision responses: the submission the
    /// content collides with.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prior: Option<FingerprintInfo>,
}

/// API-level errors with HTTP status mapping.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Invalid request: {0}")]
    BadRequest(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Duplicate content requires a decision")]
    DuplicateDecisionRequired(FingerprintInfo),
    #[error("An active job already exists for this subject")]
    DuplicateInFlight,
    #[error("Internal error: {0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message, prior) = match self {
            ApiError::BadRequest(detail) => {
                (StatusCode::BAD_REQUEST, "BAD_REQUEST", detail, None)
            }
            ApiError::NotFound(detail) => (StatusCode::NOT_FOUND, "NOT_FOUND", detail, None),
            ApiError::DuplicateDecisionRequired(prior) => (
                StatusCode::CONFLICT,
                "DUPLICATE_DECISION_REQUIRED",
                "Content matches a prior submission; choose skip, replace or process_as_new"
                    .to_string(),
                Some(prior),
            ),
            ApiError::DuplicateInFlight => (
                StatusCode::CONFLICT,
                "DUPLICATE_IN_FLIGHT",
                "A job is already running for this subject".to_string(),
                None,
            ),
            ApiError::Internal(detail) => {
                tracing::error!(detail = %detail, "API internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL",
                    "An internal error occurred".to_string(),
                    None,
                )
            }
        };

        let body = ErrorBody {
            error: ErrorDetail {
                code,
                message,
                prior,
            },
        };
        (status, Json(body)).into_response()
    }
}

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        ApiError::Internal(err.to_string())
    }
}

impl From<crate::db::DatabaseError> for ApiError {
    fn from(err: crate::db::DatabaseError) -> Self {
        ApiError::Internal(err.to_string())
    }
}

impl From<IntakeError> for ApiError {
    fn from(err: IntakeError) -> Self {
        match err {
            IntakeError::Validation(message) => ApiError::BadRequest(message),
            IntakeError::DuplicateRequiresDecision(prior) => {
                ApiError::DuplicateDecisionRequired(prior.into())
            }
            IntakeError::DuplicateInFlight(_) => ApiError::DuplicateInFlight,
            IntakeError::Core(e) => e.into(),
        }
    }
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::JobNotFound(id) => ApiError::NotFound(format!("job {id} not found")),
            PipelineError::DuplicateInFlight(_) => ApiError::DuplicateInFlight,
            other => ApiError::Internal(other.to_string()),
        }
    }
}
