//! Submission intake: validation, duplicate handling, and job creation.
//!
//! Intake is the only path that creates jobs. A submission is validated,
//! checked against the fingerprint store, and — depending on the caller's
//! duplicate decision — either accepted (fingerprint claimed, job created,
//! input parked for the stage driver) or bounced back for a decision.

use chrono::Utc;
use uuid::Uuid;

use crate::core_state::{CoreError, CoreState, SubmissionInput};
use crate::db::repository::fingerprint as store;
use crate::db::repository::job as ledger;
use crate::models::{DuplicateAction, FingerprintRecord, Job};
use crate::pipeline::fingerprint;
use crate::pipeline::orchestrator::{self, PipelineError};

/// Largest accepted note, in bytes of raw text.
pub const MAX_NOTE_BYTES: usize = 1024 * 1024;

/// A clinical-note submission as received from the API surface.
#[derive(Debug, Clone)]
pub struct SubmissionRequest {
    pub raw_text: String,
    pub original_name: String,
    pub billed_codes: Vec<String>,
    /// The caller's decision when the content is a known duplicate.
    /// `None` means "I don't know yet" — a duplicate is bounced back.
    pub duplicate_action: Option<DuplicateAction>,
}

/// What intake did with a submission.
#[derive(Debug)]
pub enum IntakeOutcome {
    /// A job was created and is ready to run.
    Accepted { job: Job, record: FingerprintRecord },
    /// Known duplicate and the caller chose SKIP: no job, here is the
    /// prior submission.
    Skipped { prior: FingerprintRecord },
}

#[derive(Debug, thiserror::Error)]
pub enum IntakeError {
    #[error("{0}")]
    Validation(String),
    /// The content matches a prior submission and no duplicate action was
    /// given; the caller must decide.
    #[error("duplicate content; a duplicate action is required")]
    DuplicateRequiresDecision(FingerprintRecord),
    #[error("an active job already exists for subject {0}")]
    DuplicateInFlight(Uuid),
    #[error(transparent)]
    Core(#[from] CoreError),
}

/// Validate and admit a submission, creating its job.
///
/// Callers are expected to follow up an `Accepted` outcome by spawning
/// `orchestrator::run_job` for the returned job.
pub fn admit(state: &CoreState, request: SubmissionRequest) -> Result<IntakeOutcome, IntakeError> {
    validate(&request)?;

    let duplicate = state.with_db(|conn| fingerprint::check_duplicate(conn, &request.raw_text))?;

    let record = match (duplicate.prior_record, request.duplicate_action) {
        // Fresh content: claim it. Losing the claim means an identical
        // submission slipped in since the check — treat it as the
        // duplicate it now is.
        (None, _) => match claim_new(state, &request, Uuid::new_v4())? {
            Ok(record) => record,
            Err(prior) => return Err(IntakeError::DuplicateRequiresDecision(prior)),
        },
        (Some(prior), None) => return Err(IntakeError::DuplicateRequiresDecision(prior)),
        (Some(prior), Some(DuplicateAction::Skip)) => {
            tracing::info!(subject_id = %prior.subject_id, "Duplicate submission skipped");
            return Ok(IntakeOutcome::Skipped { prior });
        }
        (Some(prior), Some(DuplicateAction::Replace)) => {
            // Refuse before touching the store: while the prior subject's
            // job is still running there is nothing to replace yet, and a
            // refused attempt must leave no trace.
            let active = state
                .with_db(|conn| ledger::get_active_job_for_subject(conn, &prior.subject_id))?;
            if active.is_some() {
                return Err(IntakeError::DuplicateInFlight(prior.subject_id));
            }
            // Retire the prior record, then reclaim for the same subject:
            // the replacement is a new run over the same subject identity.
            state.with_db(|conn| store::supersede_fingerprint(conn, &prior.fingerprint))?;
            match claim_new(state, &request, prior.subject_id)? {
                Ok(record) => record,
                Err(raced) => return Err(IntakeError::DuplicateRequiresDecision(raced)),
            }
        }
        (Some(prior), Some(DuplicateAction::ProcessAsNew)) => {
            // Deliberate reprocess under a fresh subject. The claim stays
            // with the prior submission; an audit row records this one.
            let record = FingerprintRecord {
                fingerprint: prior.fingerprint.clone(),
                subject_id: Uuid::new_v4(),
                submitted_at: Utc::now(),
                original_name: request.original_name.clone(),
                size_bytes: request.raw_text.len() as u64,
                superseded: true,
            };
            state.with_db(|conn| store::insert_audit_record(conn, &record))?;
            record
        }
    };

    let job = match orchestrator::submit(state, record.subject_id) {
        Ok(job) => job,
        Err(PipelineError::DuplicateInFlight(subject)) => {
            return Err(IntakeError::DuplicateInFlight(subject));
        }
        Err(PipelineError::Core(e)) => return Err(e.into()),
        Err(other) => {
            // submit only fails the two ways above
            return Err(IntakeError::Validation(other.to_string()));
        }
    };

    state.put_input(
        job.id,
        SubmissionInput {
            raw_text: request.raw_text,
            billed_codes: request.billed_codes,
        },
    );

    Ok(IntakeOutcome::Accepted { job, record })
}

/// Duplicate pre-check for the two-step submit flow: lets a client ask
/// before uploading whether content is already known.
pub fn check(state: &CoreState, raw_text: &str) -> Result<Option<FingerprintRecord>, IntakeError> {
    if raw_text.trim().is_empty() {
        return Err(IntakeError::Validation("note text is empty".into()));
    }
    let duplicate = state.with_db(|conn| fingerprint::check_duplicate(conn, raw_text))?;
    Ok(duplicate.prior_record)
}

fn claim_new(
    state: &CoreState,
    request: &SubmissionRequest,
    subject_id: Uuid,
) -> Result<Result<FingerprintRecord, FingerprintRecord>, CoreError> {
    state.with_db(|conn| {
        fingerprint::claim(
            conn,
            &request.raw_text,
            subject_id,
            &request.original_name,
            request.raw_text.len() as u64,
        )
    })
}

fn validate(request: &SubmissionRequest) -> Result<(), IntakeError> {
    if request.raw_text.trim().is_empty() {
        return Err(IntakeError::Validation("note text is empty".into()));
    }
    if request.raw_text.len() > MAX_NOTE_BYTES {
        return Err(IntakeError::Validation(format!(
            "note exceeds {MAX_NOTE_BYTES} bytes"
        )));
    }
    if request.original_name.trim().is_empty() {
        return Err(IntakeError::Validation("original name is empty".into()));
    }
    if request.billed_codes.iter().any(|c| c.trim().is_empty()) {
        return Err(IntakeError::Validation("billed codes must be non-empty".into()));
    }
    Ok(())
}
