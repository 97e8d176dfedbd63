//! Transport-agnostic application state.
//!
//! `CoreState` is the single shared state between the axum API surface,
//! the pipeline stage drivers, and the webhook delivery worker. The job
//! ledger connection sits behind a mutex; per-job runtime (driver lock,
//! cancellation flag, submission input) lives in small keyed maps that are
//! cleared when a job reaches a terminal stage.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use rusqlite::Connection;
use uuid::Uuid;

use crate::db::{self, DatabaseError};
use crate::pipeline::collaborators::Collaborators;
use crate::status::StatusBroker;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("lock poisoned")]
    LockPoisoned,
    #[error("database error: {0}")]
    Database(#[from] DatabaseError),
}

/// The raw material a job's stage drivers work from. Held in memory only —
/// artifact storage is out of scope for the ledger.
#[derive(Debug, Clone)]
pub struct SubmissionInput {
    pub raw_text: String,
    pub billed_codes: Vec<String>,
}

/// Shared service state. Wrapped in `Arc` at startup so the API server,
/// stage drivers and the delivery worker share one instance.
pub struct CoreState {
    db: Mutex<Connection>,
    broker: StatusBroker,
    collaborators: Collaborators,
    /// Single-writer-per-job discipline: exactly one stage driver may hold
    /// a job's lock at any instant.
    job_locks: Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>,
    /// Cancellation requests, checked between stage attempts.
    cancel_flags: Mutex<HashMap<Uuid, Arc<AtomicBool>>>,
    /// Submission inputs for jobs that have not finished yet.
    inputs: Mutex<HashMap<Uuid, SubmissionInput>>,
}

impl CoreState {
    pub fn new(conn: Connection, collaborators: Collaborators) -> Self {
        Self {
            db: Mutex::new(conn),
            broker: StatusBroker::new(),
            collaborators,
            job_locks: Mutex::new(HashMap::new()),
            cancel_flags: Mutex::new(HashMap::new()),
            inputs: Mutex::new(HashMap::new()),
        }
    }

    /// State over an in-memory database (tests and local experiments).
    pub fn in_memory(collaborators: Collaborators) -> Result<Self, DatabaseError> {
        Ok(Self::new(db::open_memory_database()?, collaborators))
    }

    /// Run a closure against the ledger connection.
    ///
    /// Individual ledger operations are short; the closure must not block
    /// on anything other than SQLite itself.
    pub fn with_db<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, DatabaseError>,
    ) -> Result<T, CoreError> {
        let conn = self.db.lock().map_err(|_| CoreError::LockPoisoned)?;
        f(&conn).map_err(CoreError::Database)
    }

    pub fn broker(&self) -> &StatusBroker {
        &self.broker
    }

    pub fn collaborators(&self) -> &Collaborators {
        &self.collaborators
    }

    // ── Per-job runtime ─────────────────────────────────────

    /// The serialization lock for a job, created on first use.
    pub fn job_lock(&self, job_id: Uuid) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.job_locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry(job_id)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// The cancellation flag for a job, created on first use.
    pub fn cancel_flag(&self, job_id: Uuid) -> Arc<AtomicBool> {
        let mut flags = self.cancel_flags.lock().unwrap_or_else(|e| e.into_inner());
        flags
            .entry(job_id)
            .or_insert_with(|| Arc::new(AtomicBool::new(false)))
            .clone()
    }

    /// Request cancellation. The active driver notices between attempts;
    /// an in-flight collaborator call may still complete but its result is
    /// discarded.
    pub fn request_cancel(&self, job_id: Uuid) {
        self.cancel_flag(job_id).store(true, Ordering::Relaxed);
    }

    pub fn put_input(&self, job_id: Uuid, input: SubmissionInput) {
        let mut inputs = self.inputs.lock().unwrap_or_else(|e| e.into_inner());
        inputs.insert(job_id, input);
    }

    pub fn input(&self, job_id: &Uuid) -> Option<SubmissionInput> {
        let inputs = self.inputs.lock().unwrap_or_else(|e| e.into_inner());
        inputs.get(job_id).cloned()
    }

    /// Drop all per-job runtime once a job is terminal.
    pub fn clear_job_runtime(&self, job_id: &Uuid) {
        self.job_locks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(job_id);
        self.cancel_flags
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(job_id);
        self.inputs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(job_id);
    }
}
