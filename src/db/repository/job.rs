use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use crate::db::DatabaseError;
use crate::models::{ErrorKind, Job, JobStage};

pub fn insert_job(conn: &Connection, job: &Job) -> Result<(), DatabaseError> {
    let result = conn.execute(
        "INSERT INTO jobs (id, subject_id, stage, progress_percent, started_at,
         completed_at, error_kind, error_detail, retry_count)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            job.id.to_string(),
            job.subject_id.to_string(),
            job.stage.as_str(),
            job.progress_percent,
            job.started_at.to_rfc3339(),
            job.completed_at.map(|t| t.to_rfc3339()),
            job.error_kind.map(|k| k.as_str()),
            job.error_detail,
            job.retry_count,
        ],
    );

    match result {
        Ok(_) => Ok(()),
        Err(rusqlite::Error::SqliteFailure(e, _))
            if e.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            Err(DatabaseError::ConstraintViolation(format!(
                "active job already exists for subject {}",
                job.subject_id
            )))
        }
        Err(e) => Err(e.into()),
    }
}

pub fn get_job(conn: &Connection, id: &Uuid) -> Result<Option<Job>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT id, subject_id, stage, progress_percent, started_at,
         completed_at, error_kind, error_detail, retry_count
         FROM jobs WHERE id = ?1",
    )?;

    let row = stmt
        .query_row(params![id.to_string()], map_job_row)
        .optional()?;
    row.map(row_to_job).transpose()
}

/// The one non-terminal job for a subject, if any. The partial unique index
/// guarantees there is at most one.
pub fn get_active_job_for_subject(
    conn: &Connection,
    subject_id: &Uuid,
) -> Result<Option<Job>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT id, subject_id, stage, progress_percent, started_at,
         completed_at, error_kind, error_detail, retry_count
         FROM jobs
         WHERE subject_id = ?1 AND stage NOT IN ('complete', 'failed')",
    )?;

    let row = stmt
        .query_row(params![subject_id.to_string()], map_job_row)
        .optional()?;
    row.map(row_to_job).transpose()
}

/// Move a job forward to `stage`. Refuses to touch terminal rows — the
/// `stage NOT IN (...)` guard makes the terminal freeze a database-level
/// invariant, not just orchestrator discipline.
pub fn update_stage(
    conn: &Connection,
    id: &Uuid,
    stage: JobStage,
    retry_count: u32,
) -> Result<(), DatabaseError> {
    let completed_at = if stage == JobStage::Complete {
        Some(Utc::now().to_rfc3339())
    } else {
        None
    };

    let affected = conn.execute(
        "UPDATE jobs
         SET stage = ?2, progress_percent = ?3, completed_at = ?4, retry_count = ?5
         WHERE id = ?1 AND stage NOT IN ('complete', 'failed')",
        params![
            id.to_string(),
            stage.as_str(),
            stage.progress_percent(),
            completed_at,
            retry_count,
        ],
    )?;

    if affected == 0 {
        return frozen_or_missing(conn, id);
    }
    Ok(())
}

/// Transition a job to `Failed` with a sanitized error payload, freezing
/// the progress percentage at its last value.
pub fn mark_failed(
    conn: &Connection,
    id: &Uuid,
    kind: ErrorKind,
    detail: &str,
    retry_count: u32,
) -> Result<(), DatabaseError> {
    let affected = conn.execute(
        "UPDATE jobs
         SET stage = 'failed', completed_at = ?2, error_kind = ?3,
             error_detail = ?4, retry_count = ?5
         WHERE id = ?1 AND stage NOT IN ('complete', 'failed')",
        params![
            id.to_string(),
            Utc::now().to_rfc3339(),
            kind.as_str(),
            detail,
            retry_count,
        ],
    )?;

    if affected == 0 {
        return frozen_or_missing(conn, id);
    }
    Ok(())
}

pub fn count_jobs(conn: &Connection) -> Result<u32, DatabaseError> {
    let count = conn.query_row("SELECT COUNT(*) FROM jobs", [], |row| row.get(0))?;
    Ok(count)
}

fn frozen_or_missing(conn: &Connection, id: &Uuid) -> Result<(), DatabaseError> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM jobs WHERE id = ?1)",
        params![id.to_string()],
        |row| row.get(0),
    )?;
    if exists {
        Err(DatabaseError::ConstraintViolation(format!(
            "job {id} is terminal and frozen"
        )))
    } else {
        Err(DatabaseError::NotFound {
            entity_type: "job".into(),
            id: id.to_string(),
        })
    }
}

struct JobRow {
    id: String,
    subject_id: String,
    stage: String,
    progress_percent: u8,
    started_at: String,
    completed_at: Option<String>,
    error_kind: Option<String>,
    error_detail: Option<String>,
    retry_count: u32,
}

fn map_job_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<JobRow> {
    Ok(JobRow {
        id: row.get(0)?,
        subject_id: row.get(1)?,
        stage: row.get(2)?,
        progress_percent: row.get(3)?,
        started_at: row.get(4)?,
        completed_at: row.get(5)?,
        error_kind: row.get(6)?,
        error_detail: row.get(7)?,
        retry_count: row.get(8)?,
    })
}

fn row_to_job(row: JobRow) -> Result<Job, DatabaseError> {
    Ok(Job {
        id: parse_uuid(&row.id)?,
        subject_id: parse_uuid(&row.subject_id)?,
        stage: JobStage::from_str(&row.stage)?,
        progress_percent: row.progress_percent,
        started_at: parse_ts(&row.started_at)?,
        completed_at: row.completed_at.as_deref().map(parse_ts).transpose()?,
        error_kind: row.error_kind.as_deref().map(ErrorKind::from_str).transpose()?,
        error_detail: row.error_detail,
        retry_count: row.retry_count,
    })
}

pub(crate) fn parse_uuid(s: &str) -> Result<Uuid, DatabaseError> {
    Uuid::parse_str(s).map_err(|_| DatabaseError::InvalidEnum {
        field: "uuid".into(),
        value: s.into(),
    })
}

pub(crate) fn parse_ts(s: &str) -> Result<DateTime<Utc>, DatabaseError> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| DatabaseError::InvalidEnum {
            field: "timestamp".into(),
            value: s.into(),
        })
}
