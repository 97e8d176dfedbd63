use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use super::job::{parse_ts, parse_uuid};
use crate::db::DatabaseError;
use crate::models::FingerprintRecord;

/// Atomically claim a fingerprint: insert the record if no active record
/// exists for that hash. Returns `true` if this call created the record,
/// `false` if another submission already holds it.
///
/// The partial unique index on `(fingerprint) WHERE superseded = 0` makes
/// the check-and-create a single statement — two concurrent identical
/// uploads cannot both win.
pub fn claim_fingerprint(
    conn: &Connection,
    record: &FingerprintRecord,
) -> Result<bool, DatabaseError> {
    let affected = conn.execute(
        "INSERT INTO fingerprints
         (fingerprint, subject_id, submitted_at, original_name, size_bytes, superseded)
         VALUES (?1, ?2, ?3, ?4, ?5, 0)
         ON CONFLICT DO NOTHING",
        params![
            record.fingerprint,
            record.subject_id.to_string(),
            record.submitted_at.to_rfc3339(),
            record.original_name,
            record.size_bytes,
        ],
    )?;
    Ok(affected == 1)
}

/// Record a submission that knowingly reprocessed duplicate content
/// (PROCESS-AS-NEW). The row is written already superseded, so the active
/// claim and its unique index are untouched; the table still shows who
/// submitted what, when.
pub fn insert_audit_record(
    conn: &Connection,
    record: &FingerprintRecord,
) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO fingerprints
         (fingerprint, subject_id, submitted_at, original_name, size_bytes, superseded)
         VALUES (?1, ?2, ?3, ?4, ?5, 1)",
        params![
            record.fingerprint,
            record.subject_id.to_string(),
            record.submitted_at.to_rfc3339(),
            record.original_name,
            record.size_bytes,
        ],
    )?;
    Ok(())
}

/// The active (non-superseded) record for a fingerprint, if any.
pub fn find_active_fingerprint(
    conn: &Connection,
    fingerprint: &str,
) -> Result<Option<FingerprintRecord>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT fingerprint, subject_id, submitted_at, original_name, size_bytes, superseded
         FROM fingerprints
         WHERE fingerprint = ?1 AND superseded = 0",
    )?;

    let row = stmt
        .query_row(params![fingerprint], map_fingerprint_row)
        .optional()?;
    row.map(row_to_record).transpose()
}

/// Soft-supersede the active record for a fingerprint (REPLACE flow).
/// The row stays in the table for audit; only the flag flips.
pub fn supersede_fingerprint(conn: &Connection, fingerprint: &str) -> Result<(), DatabaseError> {
    let affected = conn.execute(
        "UPDATE fingerprints SET superseded = 1
         WHERE fingerprint = ?1 AND superseded = 0",
        params![fingerprint],
    )?;
    if affected == 0 {
        return Err(DatabaseError::NotFound {
            entity_type: "fingerprint".into(),
            id: fingerprint.into(),
        });
    }
    Ok(())
}

/// All records for a fingerprint, superseded included (audit view).
pub fn fingerprint_history(
    conn: &Connection,
    fingerprint: &str,
) -> Result<Vec<FingerprintRecord>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT fingerprint, subject_id, submitted_at, original_name, size_bytes, superseded
         FROM fingerprints
         WHERE fingerprint = ?1
         ORDER BY submitted_at ASC",
    )?;

    let rows = stmt.query_map(params![fingerprint], map_fingerprint_row)?;
    let mut records = Vec::new();
    for row in rows {
        records.push(row_to_record(row?)?);
    }
    Ok(records)
}

struct FingerprintRow {
    fingerprint: String,
    subject_id: String,
    submitted_at: String,
    original_name: String,
    size_bytes: u64,
    superseded: i32,
}

fn map_fingerprint_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<FingerprintRow> {
    Ok(FingerprintRow {
        fingerprint: row.get(0)?,
        subject_id: row.get(1)?,
        submitted_at: row.get(2)?,
        original_name: row.get(3)?,
        size_bytes: row.get(4)?,
        superseded: row.get(5)?,
    })
}

fn row_to_record(row: FingerprintRow) -> Result<FingerprintRecord, DatabaseError> {
    Ok(FingerprintRecord {
        fingerprint: row.fingerprint,
        subject_id: parse_uuid(&row.subject_id)?,
        submitted_at: parse_ts(&row.submitted_at)?,
        original_name: row.original_name,
        size_bytes: row.size_bytes,
        superseded: row.superseded != 0,
    })
}
