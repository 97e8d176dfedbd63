//! Submission endpoints: admit a note, or pre-check it for duplication.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::api::error::ApiError;
use crate::api::types::{ApiContext, CheckRequest, CheckResponse, SubmitRequest, SubmitResponse};
use crate::pipeline::intake::{self, IntakeOutcome, SubmissionRequest};
use crate::pipeline::orchestrator;

/// `POST /api/submissions` — admit a note and start its pipeline run.
///
/// 202 with the job id on acceptance; 200 when a duplicate was skipped;
/// 409 when the content needs a duplicate decision or the subject already
/// has a job in flight.
pub async fn submit(
    State(ctx): State<ApiContext>,
    Json(request): Json<SubmitRequest>,
) -> Result<Response, ApiError> {
    let core = ctx.core.clone();
    let submission = SubmissionRequest {
        raw_text: request.raw_text,
        original_name: request.original_name,
        billed_codes: request.billed_codes,
        duplicate_action: request.duplicate_action,
    };

    let outcome = tokio::task::spawn_blocking(move || intake::admit(&core, submission))
        .await
        .map_err(|e| ApiError::Internal(format!("intake task: {e}")))??;

    match outcome {
        IntakeOutcome::Accepted { job, .. } => {
            let core = ctx.core.clone();
            let job_id = job.id;
            tokio::spawn(async move {
                if let Err(e) = orchestrator::run_job(core, job_id).await {
                    tracing::error!(job_id = %job_id, error = %e, "Stage driver failed");
                }
            });
            Ok((
                StatusCode::ACCEPTED,
                Json(SubmitResponse::Accepted {
                    job_id: job.id,
                    subject_id: job.subject_id,
                }),
            )
                .into_response())
        }
        IntakeOutcome::Skipped { prior } => Ok((
            StatusCode::OK,
            Json(SubmitResponse::Skipped {
                prior: prior.into(),
            }),
        )
            .into_response()),
    }
}

/// `POST /api/submissions/check` — ask whether content is already known,
/// without submitting it.
pub async fn check(
    State(ctx): State<ApiContext>,
    Json(request): Json<CheckRequest>,
) -> Result<Json<CheckResponse>, ApiError> {
    let core = ctx.core.clone();
    let prior = tokio::task::spawn_blocking(move || intake::check(&core, &request.raw_text))
        .await
        .map_err(|e| ApiError::Internal(format!("check task: {e}")))??;

    Ok(Json(CheckResponse {
        is_duplicate: prior.is_some(),
        prior: prior.map(Into::into),
    }))
}
