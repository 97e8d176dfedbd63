//! Shared API context and request/response DTOs.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core_state::CoreState;
use crate::models::{DuplicateAction, FingerprintRecord};

/// Shared context injected into all handlers.
#[derive(Clone)]
pub struct ApiContext {
    pub core: Arc<CoreState>,
}

impl ApiContext {
    pub fn new(core: Arc<CoreState>) -> Self {
        Self { core }
    }
}

/// Body of `POST /api/submissions`.
#[derive(Debug, Deserialize)]
pub struct SubmitRequest {
    pub raw_text: String,
    pub original_name: String,
    #[serde(default)]
    pub billed_codes: Vec<String>,
    #[serde(default)]
    pub duplicate_action: Option<DuplicateAction>,
}

/// Prior-submission info surfaced to clients on duplicate hits.
#[derive(Debug, Serialize)]
pub struct FingerprintInfo {
    pub subject_id: Uuid,
    pub submitted_at: DateTime<Utc>,
    pub original_name: String,
    pub size_bytes: u64,
}

impl From<FingerprintRecord> for FingerprintInfo {
    fn from(record: FingerprintRecord) -> Self {
        Self {
            subject_id: record.subject_id,
            submitted_at: record.submitted_at,
            original_name: record.original_name,
            size_bytes: record.size_bytes,
        }
    }
}

/// Body of the submission response, tagged by what intake decided.
#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SubmitResponse {
    Accepted { job_id: Uuid, subject_id: Uuid },
    Skipped { prior: FingerprintInfo },
}

/// Body of `POST /api/submissions/check`.
#[derive(Debug, Deserialize)]
pub struct CheckRequest {
    pub raw_text: String,
}

#[derive(Debug, Serialize)]
pub struct CheckResponse {
    pub is_duplicate: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prior: Option<FingerprintInfo>,
}
