use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Created at first sight of a content fingerprint; read on every new
/// submission. Never mutated except for the `superseded` flag — superseded
/// records remain for audit after a REPLACE.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FingerprintRecord {
    pub fingerprint: String,
    pub subject_id: Uuid,
    pub submitted_at: DateTime<Utc>,
    pub original_name: String,
    pub size_bytes: u64,
    pub superseded: bool,
}

/// What the duplicate detector reports back to the intake gateway.
#[derive(Debug, Clone, Serialize)]
pub struct DuplicateCheck {
    pub is_duplicate: bool,
    pub prior_record: Option<FingerprintRecord>,
}
