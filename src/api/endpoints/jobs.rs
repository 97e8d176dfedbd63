//! Job status and cancellation endpoints.

use axum::extract::{Path, State};
use axum::Json;
use uuid::Uuid;

use crate::api::error::ApiError;
use crate::api::types::ApiContext;
use crate::db::repository::job as ledger;
use crate::models::StatusSnapshot;
use crate::pipeline::orchestrator;

/// `GET /api/jobs/:id/status` — the poll side of status distribution.
///
/// Serves the broker's snapshot when the job is live; falls back to the
/// ledger for terminal (retired) jobs. Both views carry the same shape.
pub async fn status(
    State(ctx): State<ApiContext>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<StatusSnapshot>, ApiError> {
    if let Some(snapshot) = ctx.core.broker().snapshot(&job_id) {
        return Ok(Json(snapshot));
    }

    let core = ctx.core.clone();
    let job = tokio::task::spawn_blocking(move || core.with_db(|c| ledger::get_job(c, &job_id)))
        .await
        .map_err(|e| ApiError::Internal(format!("status task: {e}")))??
        .ok_or_else(|| ApiError::NotFound(format!("job {job_id} not found")))?;

    Ok(Json(StatusSnapshot::from_job(&job)))
}

/// `POST /api/jobs/:id/cancel` — request cancellation; returns the job's
/// state after the request took effect (immediately `failed` when no
/// driver was mid-call, otherwise the still-running state).
pub async fn cancel(
    State(ctx): State<ApiContext>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<StatusSnapshot>, ApiError> {
    let core = ctx.core.clone();
    let job = tokio::task::spawn_blocking(move || orchestrator::cancel(&core, job_id))
        .await
        .map_err(|e| ApiError::Internal(format!("cancel task: {e}")))??;

    Ok(Json(StatusSnapshot::from_job(&job)))
}
