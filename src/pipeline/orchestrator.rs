//! Pipeline orchestrator: drives a job through its ordered stages.
//!
//! One stage driver runs per job (single-writer discipline via the per-job
//! lock in `CoreState`); jobs for different subjects run fully in parallel.
//! Each stage performs one external collaborator call under a timeout,
//! retrying transient failures with jittered exponential backoff. Every
//! transition is persisted to the ledger first, then published to the
//! status broker; terminal transitions additionally fan out to the webhook
//! delivery queue.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::time::timeout;
use uuid::Uuid;

use crate::config::{MAX_STAGE_ATTEMPTS, STAGE_RETRY_BASE, STAGE_RETRY_CAP, STAGE_TIMEOUT};
use crate::core_state::{CoreError, CoreState};
use crate::db::repository::job as ledger;
use crate::db::DatabaseError;
use crate::models::{ErrorKind, EventKind, Job, JobStage, StatusSnapshot, WebhookEvent};
use crate::pipeline::collaborators::{CollaboratorError, Deidentified};
use crate::webhooks::dispatcher;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("an active job already exists for subject {0}")]
    DuplicateInFlight(Uuid),
    #[error("job not found: {0}")]
    JobNotFound(Uuid),
    #[error(transparent)]
    Core(#[from] CoreError),
}

/// Create a job in `Pending` for an accepted submission.
///
/// Fails with `DuplicateInFlight` when a non-terminal job already exists
/// for the subject — enforced by the ledger's partial unique index, not by
/// a read-then-write.
pub fn submit(state: &CoreState, subject_id: Uuid) -> Result<Job, PipelineError> {
    let job = Job::new(subject_id);
    let result = state.with_db(|conn| ledger::insert_job(conn, &job));
    match result {
        Ok(()) => {}
        Err(CoreError::Database(DatabaseError::ConstraintViolation(_))) => {
            return Err(PipelineError::DuplicateInFlight(subject_id));
        }
        Err(e) => return Err(e.into()),
    }
    state.broker().publish(StatusSnapshot::from_job(&job));
    tracing::info!(job_id = %job.id, subject_id = %subject_id, "Job submitted");
    Ok(job)
}

/// Drive a job until it reaches a terminal stage.
///
/// Holds the job's driver lock for the whole run; a second `run_job` for
/// the same job blocks, then observes the terminal state and no-ops
/// (re-emitting the final event).
pub async fn run_job(state: Arc<CoreState>, job_id: Uuid) -> Result<Job, PipelineError> {
    let lock = state.job_lock(job_id);
    let _guard = lock.lock().await;

    let initial = load(&state, job_id)?;
    if initial.stage.is_terminal() {
        // Re-emit the final event for any subscribers, then finish again
        // so the re-created broker channel is retired rather than leaked
        state.broker().publish(StatusSnapshot::from_job(&initial));
        finish(&state, &initial)?;
        return Ok(initial);
    }

    let mut driver = StageDriver {
        state: state.clone(),
        job_id,
        retry_count: initial.retry_count,
        ctx: StageContext::default(),
    };

    loop {
        let job = driver.advance().await?;
        if job.stage.is_terminal() {
            finish(&state, &job)?;
            return Ok(job);
        }
    }
}

/// Cancel a non-terminal job.
///
/// Sets the cancellation flag (observed by an active driver between
/// attempts) and, when no driver holds the lock, performs the `Failed`
/// transition directly. The in-flight collaborator call, if any, may still
/// complete — its result is discarded.
pub fn cancel(state: &Arc<CoreState>, job_id: Uuid) -> Result<Job, PipelineError> {
    state.request_cancel(job_id);

    let lock = state.job_lock(job_id);
    if let Ok(_guard) = lock.try_lock() {
        let job = load(state, job_id)?;
        if job.stage.is_terminal() {
            return Ok(job);
        }
        let failed = fail_job(state, &job, ErrorKind::Cancelled, job.retry_count)?;
        finish(state, &failed)?;
        tracing::info!(job_id = %job_id, "Job cancelled");
        return Ok(failed);
    }

    // A driver is active; it will observe the flag at the next checkpoint
    tracing::info!(job_id = %job_id, "Cancellation requested for running job");
    load(state, job_id)
}

// ═══════════════════════════════════════════════════════════
// Stage driver
// ═══════════════════════════════════════════════════════════

/// Intermediate stage outputs, alive only for the duration of one run.
#[derive(Default)]
struct StageContext {
    extracted_text: Option<String>,
    deidentified: Option<Deidentified>,
    inferred_codes: Option<Vec<String>>,
}

struct StageDriver {
    state: Arc<CoreState>,
    job_id: Uuid,
    retry_count: u32,
    ctx: StageContext,
}

/// Why a stage could not produce a result.
enum StageFailure {
    Cancelled,
    Fatal,
    RetriesExhausted,
}

impl StageDriver {
    /// Perform the external call for the current stage and, on success,
    /// transition to the next stage and emit a progress event. Terminal
    /// jobs are a no-op that re-emits the last event.
    async fn advance(&mut self) -> Result<Job, PipelineError> {
        let job = load(&self.state, self.job_id)?;
        if job.stage.is_terminal() {
            self.state.broker().publish(StatusSnapshot::from_job(&job));
            return Ok(job);
        }

        if self.cancelled() {
            return fail_job(&self.state, &job, ErrorKind::Cancelled, self.retry_count);
        }

        let outcome = match job.stage {
            // Entering the pipeline costs nothing; the first real work
            // happens once the job is visibly Extracting.
            JobStage::Pending => Ok(()),
            JobStage::Extracting => self.run_extract().await,
            JobStage::Deidentifying => self.run_deidentify().await,
            JobStage::InferringCodes => self.run_infer_codes().await,
            JobStage::Analyzing => self.run_analyze().await,
            JobStage::Complete | JobStage::Failed => unreachable!("terminal handled above"),
        };

        match outcome {
            Ok(()) => {
                let next = job
                    .stage
                    .next()
                    .expect("non-terminal stage always has a successor");
                self.transition(&job, next)
            }
            Err(StageFailure::Cancelled) => {
                fail_job(&self.state, &job, ErrorKind::Cancelled, self.retry_count)
            }
            Err(StageFailure::Fatal) => {
                fail_job(&self.state, &job, ErrorKind::FatalStageFailure, self.retry_count)
            }
            Err(StageFailure::RetriesExhausted) => {
                fail_job(&self.state, &job, ErrorKind::TransientStageFailure, self.retry_count)
            }
        }
    }

    async fn run_extract(&mut self) -> Result<(), StageFailure> {
        let input = self
            .state
            .input(&self.job_id)
            .ok_or(StageFailure::Fatal)?;
        let extractor = self.state.collaborators().extractor.clone();
        let raw = input.raw_text;
        let text = self
            .with_retry(JobStage::Extracting, move || {
                let extractor = extractor.clone();
                let raw = raw.clone();
                async move { extractor.extract(&raw).await }
            })
            .await?;
        self.ctx.extracted_text = Some(text);
        Ok(())
    }

    async fn run_deidentify(&mut self) -> Result<(), StageFailure> {
        let text = match &self.ctx.extracted_text {
            Some(t) => t.clone(),
            // Driver restarted mid-pipeline; the raw input is still around
            None => {
                self.state
                    .input(&self.job_id)
                    .ok_or(StageFailure::Fatal)?
                    .raw_text
            }
        };
        let deidentifier = self.state.collaborators().deidentifier.clone();
        let cleaned = self
            .with_retry(JobStage::Deidentifying, move || {
                let deidentifier = deidentifier.clone();
                let text = text.clone();
                async move { deidentifier.deidentify(&text).await }
            })
            .await?;
        tracing::debug!(
            job_id = %self.job_id,
            entities = cleaned.detected_entities.len(),
            "De-identification complete"
        );
        self.ctx.deidentified = Some(cleaned);
        Ok(())
    }

    async fn run_infer_codes(&mut self) -> Result<(), StageFailure> {
        let clean = self
            .ctx
            .deidentified
            .as_ref()
            .map(|d| d.clean_text.clone())
            .ok_or(StageFailure::Fatal)?;
        let analyzer = self.state.collaborators().analyzer.clone();
        let codes = self
            .with_retry(JobStage::InferringCodes, move || {
                let analyzer = analyzer.clone();
                let clean = clean.clone();
                async move { analyzer.infer_codes(&clean).await }
            })
            .await?;
        self.ctx.inferred_codes = Some(codes);
        Ok(())
    }

    async fn run_analyze(&mut self) -> Result<(), StageFailure> {
        let clean = self
            .ctx
            .deidentified
            .as_ref()
            .map(|d| d.clean_text.clone())
            .ok_or(StageFailure::Fatal)?;
        let inferred = self.ctx.inferred_codes.clone().unwrap_or_default();
        let billed = self
            .state
            .input(&self.job_id)
            .map(|i| i.billed_codes)
            .unwrap_or_default();
        let analyzer = self.state.collaborators().analyzer.clone();
        let report = self
            .with_retry(JobStage::Analyzing, move || {
                let analyzer = analyzer.clone();
                let clean = clean.clone();
                let billed = billed.clone();
                let inferred = inferred.clone();
                async move { analyzer.analyze(&clean, &billed, &inferred).await }
            })
            .await?;
        tracing::debug!(job_id = %self.job_id, report_bytes = report.to_string().len(), "Analysis complete");
        Ok(())
    }

    /// Run one collaborator call with the stage timeout and the transient
    /// retry policy. Cancellation is checked before each attempt and after
    /// each result — a completed call for a cancelled job is discarded.
    async fn with_retry<T, F, Fut>(
        &mut self,
        stage: JobStage,
        mut op: F,
    ) -> Result<T, StageFailure>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, CollaboratorError>>,
    {
        let mut attempt: u32 = 0;
        loop {
            if self.cancelled() {
                return Err(StageFailure::Cancelled);
            }
            attempt += 1;

            let transient_reason = match timeout(STAGE_TIMEOUT, op()).await {
                Ok(Ok(value)) => {
                    if self.cancelled() {
                        return Err(StageFailure::Cancelled);
                    }
                    return Ok(value);
                }
                Ok(Err(CollaboratorError::Fatal(reason))) => {
                    tracing::warn!(
                        job_id = %self.job_id, stage = %stage, error = %reason,
                        "Stage failed fatally"
                    );
                    return Err(StageFailure::Fatal);
                }
                Ok(Err(CollaboratorError::Transient(reason))) => reason,
                Err(_) => format!("stage timed out after {:?}", STAGE_TIMEOUT),
            };

            if attempt >= MAX_STAGE_ATTEMPTS {
                tracing::warn!(
                    job_id = %self.job_id, stage = %stage, attempts = attempt,
                    error = %transient_reason,
                    "Stage retries exhausted"
                );
                return Err(StageFailure::RetriesExhausted);
            }

            self.retry_count += 1;
            let delay = backoff_delay(STAGE_RETRY_BASE, STAGE_RETRY_CAP, attempt);
            tracing::debug!(
                job_id = %self.job_id, stage = %stage, attempt,
                delay_ms = delay.as_millis() as u64,
                error = %transient_reason,
                "Transient stage failure, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }

    fn transition(&self, job: &Job, next: JobStage) -> Result<Job, PipelineError> {
        self.state
            .with_db(|conn| ledger::update_stage(conn, &job.id, next, self.retry_count))?;
        let updated = load(&self.state, job.id)?;
        self.state.broker().publish(StatusSnapshot::from_job(&updated));
        tracing::info!(
            job_id = %job.id, stage = %next,
            progress = updated.progress_percent,
            "Stage transition"
        );
        Ok(updated)
    }

    fn cancelled(&self) -> bool {
        self.state.cancel_flag(self.job_id).load(Ordering::Relaxed)
    }
}

// ═══════════════════════════════════════════════════════════
// Shared transitions
// ═══════════════════════════════════════════════════════════

fn load(state: &CoreState, job_id: Uuid) -> Result<Job, PipelineError> {
    state
        .with_db(|conn| ledger::get_job(conn, &job_id))?
        .ok_or(PipelineError::JobNotFound(job_id))
}

/// Move a job to `Failed` with a sanitized error payload and publish.
fn fail_job(
    state: &CoreState,
    job: &Job,
    kind: ErrorKind,
    retry_count: u32,
) -> Result<Job, PipelineError> {
    state.with_db(|conn| {
        ledger::mark_failed(conn, &job.id, kind, kind.detail_template(), retry_count)
    })?;
    let failed = load(state, job.id)?;
    state.broker().publish(StatusSnapshot::from_job(&failed));
    tracing::warn!(job_id = %job.id, error_kind = %kind, "Job failed");
    Ok(failed)
}

/// Terminal fan-out: enqueue webhook deliveries, retire the status channel,
/// drop per-job runtime. Safe to call more than once — the enqueue is
/// idempotent and the rest is idempotent removal.
fn finish(state: &CoreState, job: &Job) -> Result<(), PipelineError> {
    let kind = match job.stage {
        JobStage::Complete => EventKind::JobCompleted,
        JobStage::Failed => EventKind::JobFailed,
        other => {
            debug_assert!(false, "finish called for non-terminal stage {other}");
            return Ok(());
        }
    };

    let event = WebhookEvent::for_job(kind, job);
    let enqueued = state.with_db(|conn| dispatcher::enqueue_event(conn, &event))?;
    if enqueued > 0 {
        tracing::info!(job_id = %job.id, event_kind = %kind, count = enqueued, "Webhook deliveries enqueued");
    }

    state.broker().retire(&job.id);
    state.clear_job_runtime(&job.id);
    Ok(())
}

/// Exponential backoff with full jitter: `base * 2^(attempt-1)` capped,
/// then a uniformly random fraction of that span added.
pub(crate) fn backoff_delay(base: Duration, cap: Duration, attempt: u32) -> Duration {
    let exp = base.saturating_mul(1u32 << attempt.saturating_sub(1).min(16));
    let bounded = exp.min(cap);
    let jitter_ms = rand::thread_rng().gen_range(0..=bounded.as_millis() as u64 / 2);
    (bounded + Duration::from_millis(jitter_ms)).min(cap)
}
