use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::enums::{ErrorKind, JobStage};

/// One run of the processing pipeline for a single accepted submission.
///
/// Owned exclusively by the orchestrator: the status layer and the webhook
/// subsystem only ever read it. Once `stage` is terminal the row is frozen.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub subject_id: Uuid,
    pub stage: JobStage,
    pub progress_percent: u8,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_kind: Option<ErrorKind>,
    pub error_detail: Option<String>,
    pub retry_count: u32,
}

impl Job {
    /// A fresh job in `Pending` for the given subject.
    pub fn new(subject_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            subject_id,
            stage: JobStage::Pending,
            progress_percent: 0,
            started_at: Utc::now(),
            completed_at: None,
            error_kind: None,
            error_detail: None,
            retry_count: 0,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.stage.is_terminal()
    }
}
