//! Content fingerprinting for duplicate-submission detection.
//!
//! The fingerprint is a SHA-256 over whitespace-normalized text, so the
//! same note re-encoded with different line endings or indentation still
//! maps to the same record. The check-and-create against the store is a
//! single atomic insert — see `db::repository::fingerprint`.

use base64::Engine;
use chrono::Utc;
use rusqlite::Connection;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::db::repository::fingerprint as store;
use crate::db::DatabaseError;
use crate::models::{DuplicateCheck, FingerprintRecord};

/// Compute the content fingerprint for submitted text.
///
/// Normalization collapses whitespace runs to single spaces and trims the
/// ends, making the hash stable under trivial re-encoding.
pub fn fingerprint_text(content: &str) -> String {
    let normalized = normalize_whitespace(content);
    let hash = Sha256::digest(normalized.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hash)
}

fn normalize_whitespace(content: &str) -> String {
    content.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Look up submitted content against the fingerprint store.
pub fn check_duplicate(
    conn: &Connection,
    content: &str,
) -> Result<DuplicateCheck, DatabaseError> {
    let fingerprint = fingerprint_text(content);
    let prior = store::find_active_fingerprint(conn, &fingerprint)?;
    Ok(DuplicateCheck {
        is_duplicate: prior.is_some(),
        prior_record: prior,
    })
}

/// Try to claim a fingerprint for a new subject. Returns the created
/// record on success, or the prior record when another submission already
/// holds the fingerprint (including a concurrent one that won the race).
pub fn claim(
    conn: &Connection,
    content: &str,
    subject_id: Uuid,
    original_name: &str,
    size_bytes: u64,
) -> Result<Result<FingerprintRecord, FingerprintRecord>, DatabaseError> {
    let record = FingerprintRecord {
        fingerprint: fingerprint_text(content),
        subject_id,
        submitted_at: Utc::now(),
        original_name: original_name.to_string(),
        size_bytes,
        superseded: false,
    };

    if store::claim_fingerprint(conn, &record)? {
        return Ok(Ok(record));
    }

    // Lost the race (or a plain duplicate): report the winner
    let prior = store::find_active_fingerprint(conn, &record.fingerprint)?.ok_or_else(|| {
        DatabaseError::NotFound {
            entity_type: "fingerprint".into(),
            id: record.fingerprint.clone(),
        }
    })?;
    Ok(Err(prior))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::sqlite::open_memory_database;

    #[test]
    fn fingerprint_deterministic() {
        let a = fingerprint_text("Patient presents with acute sinusitis.");
        let b = fingerprint_text("Patient presents with acute sinusitis.");
        assert_eq!(a, b);
    }

    #[test]
    fn different_content_different_fingerprint() {
        let a = fingerprint_text("Content A");
        let b = fingerprint_text("Content B");
        assert_ne!(a, b);
    }

    #[test]
    fn fingerprint_stable_under_whitespace_reencoding() {
        let unix = fingerprint_text("line one\nline two\n");
        let dos = fingerprint_text("line one\r\nline two\r\n");
        let padded = fingerprint_text("  line one \t line two  ");
        assert_eq!(unix, dos);
        assert_eq!(unix, padded);
    }

    #[test]
    fn whitespace_only_difference_is_not_content() {
        assert_ne!(fingerprint_text("ab"), fingerprint_text("a b"));
    }

    #[test]
    fn check_duplicate_empty_store_is_new() {
        let conn = open_memory_database().unwrap();
        let check = check_duplicate(&conn, "some note").unwrap();
        assert!(!check.is_duplicate);
        assert!(check.prior_record.is_none());
    }

    #[test]
    fn claim_then_check_reports_duplicate() {
        let conn = open_memory_database().unwrap();
        let subject = Uuid::new_v4();
        let claimed = claim(&conn, "the note", subject, "note.txt", 8).unwrap();
        assert!(claimed.is_ok());

        let check = check_duplicate(&conn, "the  note\n").unwrap();
        assert!(check.is_duplicate, "normalized content must match");
        assert_eq!(check.prior_record.unwrap().subject_id, subject);
    }

    #[test]
    fn second_claim_loses_and_sees_winner() {
        let conn = open_memory_database().unwrap();
        let winner = Uuid::new_v4();
        claim(&conn, "identical", winner, "a.txt", 9).unwrap().unwrap();

        let lost = claim(&conn, "identical", Uuid::new_v4(), "b.txt", 9)
            .unwrap()
            .unwrap_err();
        assert_eq!(lost.subject_id, winner);
    }
}
