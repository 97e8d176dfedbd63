use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::enums::{ErrorKind, EventKind, JobStage};
use super::job::Job;

/// Emitted by the orchestrator on every stage transition. Ephemeral — not
/// persisted beyond webhook delivery bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub job_id: Uuid,
    pub stage: JobStage,
    pub progress_percent: u8,
    pub emitted_at: DateTime<Utc>,
}

impl ProgressEvent {
    pub fn from_job(job: &Job) -> Self {
        Self {
            job_id: job.id,
            stage: job.stage,
            progress_percent: job.progress_percent,
            emitted_at: Utc::now(),
        }
    }
}

/// The snapshot shape shared by the poll endpoint and the push channel.
/// Both read paths must serve exactly this for the same point in time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub job_id: Uuid,
    pub stage: JobStage,
    pub progress_percent: u8,
    pub current_step_label: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_remaining_ms: Option<u64>,
}

impl StatusSnapshot {
    pub fn from_job(job: &Job) -> Self {
        Self {
            job_id: job.id,
            stage: job.stage,
            progress_percent: job.progress_percent,
            current_step_label: job.stage.step_label().to_string(),
            error_kind: job.error_kind,
            error_detail: job.error_detail.clone(),
            estimated_remaining_ms: estimated_remaining_ms(job.stage),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.stage.is_terminal()
    }
}

/// Rough per-stage duration estimates for the `estimated_remaining_ms`
/// field. Deliberately coarse — the UI only uses it for a progress hint.
fn nominal_stage_ms(stage: JobStage) -> u64 {
    match stage {
        JobStage::Extracting => 5_000,
        JobStage::Deidentifying => 8_000,
        JobStage::InferringCodes => 12_000,
        JobStage::Analyzing => 20_000,
        _ => 0,
    }
}

fn estimated_remaining_ms(current: JobStage) -> Option<u64> {
    if current.is_terminal() {
        return None;
    }
    let remaining: u64 = JobStage::ORDER
        .iter()
        .filter(|s| s.order_index() >= current.order_index())
        .map(|s| nominal_stage_ms(*s))
        .sum();
    Some(remaining)
}

/// Outbound webhook payload: `{event_kind, subject_id, job_id, occurred_at,
/// data}`. Serialized once at enqueue time; the stored bytes are what gets
/// signed and delivered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub event_kind: EventKind,
    pub subject_id: Uuid,
    pub job_id: Uuid,
    pub occurred_at: DateTime<Utc>,
    pub data: serde_json::Value,
}

impl WebhookEvent {
    /// Build the event payload for a job's current state.
    pub fn for_job(kind: EventKind, job: &Job) -> Self {
        let data = match kind {
            EventKind::JobCompleted => serde_json::json!({
                "stage": job.stage,
                "progress_percent": job.progress_percent,
                "completed_at": job.completed_at,
            }),
            EventKind::JobFailed => serde_json::json!({
                "stage": job.stage,
                "error_kind": job.error_kind,
                "error_detail": job.error_detail,
            }),
            EventKind::JobProgress => serde_json::json!({
                "stage": job.stage,
                "progress_percent": job.progress_percent,
            }),
        };
        Self {
            event_kind: kind,
            subject_id: job.subject_id,
            job_id: job.id,
            occurred_at: Utc::now(),
            data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_mirrors_job_fields() {
        let mut job = Job::new(Uuid::new_v4());
        job.stage = JobStage::Deidentifying;
        job.progress_percent = 35;

        let snap = StatusSnapshot::from_job(&job);
        assert_eq!(snap.job_id, job.id);
        assert_eq!(snap.stage, JobStage::Deidentifying);
        assert_eq!(snap.progress_percent, 35);
        assert_eq!(snap.current_step_label, "Removing identifying information");
        assert!(snap.estimated_remaining_ms.is_some());
    }

    #[test]
    fn terminal_snapshot_has_no_estimate() {
        let mut job = Job::new(Uuid::new_v4());
        job.stage = JobStage::Complete;
        job.progress_percent = 100;
        let snap = StatusSnapshot::from_job(&job);
        assert!(snap.estimated_remaining_ms.is_none());
        assert!(snap.is_terminal());
    }

    #[test]
    fn estimate_shrinks_as_stages_advance() {
        let early = estimated_remaining_ms(JobStage::Extracting).unwrap();
        let late = estimated_remaining_ms(JobStage::Analyzing).unwrap();
        assert!(late < early);
    }

    #[test]
    fn failed_event_carries_error_fields() {
        let mut job = Job::new(Uuid::new_v4());
        job.stage = JobStage::Failed;
        job.error_kind = Some(ErrorKind::Cancelled);
        job.error_detail = Some(ErrorKind::Cancelled.detail_template().to_string());

        let event = WebhookEvent::for_job(EventKind::JobFailed, &job);
        assert_eq!(event.event_kind, EventKind::JobFailed);
        assert_eq!(event.data["error_kind"], "cancelled");
    }

    #[test]
    fn event_kind_serializes_with_dotted_name() {
        let job = Job::new(Uuid::new_v4());
        let event = WebhookEvent::for_job(EventKind::JobCompleted, &job);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event_kind"], "job.completed");
    }
}
