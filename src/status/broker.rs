//! Per-job status fan-out with a convergent snapshot.
//!
//! The broker is the single point both read paths go through: the poll
//! endpoint reads the latest snapshot, the push channel subscribes to the
//! event stream. Snapshot and stream are updated under one lock, so a
//! subscriber always gets a catch-up snapshot plus every later event —
//! neither path can observe a state older than the other delivered.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::broadcast;
use uuid::Uuid;

use crate::models::{ProgressEvent, StatusSnapshot};

/// Buffered events per job channel. A job emits at most one event per
/// stage transition, so this never lags in practice.
const CHANNEL_CAPACITY: usize = 64;

struct JobChannel {
    tx: broadcast::Sender<ProgressEvent>,
    latest: StatusSnapshot,
}

/// Shared status broker, one channel per in-flight job.
pub struct StatusBroker {
    channels: Mutex<HashMap<Uuid, JobChannel>>,
}

impl StatusBroker {
    pub fn new() -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// Publish a new snapshot for a job and broadcast the matching event.
    ///
    /// Stale publishes (an older stage, or a lower progress within the same
    /// stage) are dropped rather than rewinding the snapshot — progress is
    /// monotonic for every observer.
    pub fn publish(&self, snapshot: StatusSnapshot) {
        let event = ProgressEvent {
            job_id: snapshot.job_id,
            stage: snapshot.stage,
            progress_percent: snapshot.progress_percent,
            emitted_at: chrono::Utc::now(),
        };

        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        let entry = channels.entry(snapshot.job_id).or_insert_with(|| JobChannel {
            tx: broadcast::channel(CHANNEL_CAPACITY).0,
            latest: snapshot.clone(),
        });

        if is_stale(&entry.latest, &snapshot) {
            return;
        }
        entry.latest = snapshot;
        // No receivers is fine — the poll path still sees the snapshot
        let _ = entry.tx.send(event);
    }

    /// Subscribe to a job's event stream, seeding the channel from the
    /// ledger snapshot if nothing has been published yet.
    ///
    /// Returns the catch-up snapshot (never older than anything already
    /// broadcast) and a receiver for subsequent events.
    pub fn subscribe(
        &self,
        ledger_snapshot: StatusSnapshot,
    ) -> (StatusSnapshot, broadcast::Receiver<ProgressEvent>) {
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        let entry = channels
            .entry(ledger_snapshot.job_id)
            .or_insert_with(|| JobChannel {
                tx: broadcast::channel(CHANNEL_CAPACITY).0,
                latest: ledger_snapshot.clone(),
            });

        // The ledger may be ahead of the broker (entry created before the
        // first publish) — keep whichever is newer.
        if !is_stale(&entry.latest, &ledger_snapshot) {
            entry.latest = ledger_snapshot;
        }
        (entry.latest.clone(), entry.tx.subscribe())
    }

    /// Latest snapshot for a job, if the broker has one in memory.
    /// Callers fall back to the job ledger when this returns None.
    pub fn snapshot(&self, job_id: &Uuid) -> Option<StatusSnapshot> {
        let channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        channels.get(job_id).map(|c| c.latest.clone())
    }

    /// Drop the channel for a terminal job. Existing receivers have already
    /// seen the final event; late subscribers are served from the ledger.
    pub fn retire(&self, job_id: &Uuid) {
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        channels.remove(job_id);
    }
}

impl Default for StatusBroker {
    fn default() -> Self {
        Self::new()
    }
}

/// True when `candidate` would rewind `current`.
fn is_stale(current: &StatusSnapshot, candidate: &StatusSnapshot) -> bool {
    let (cur, cand) = (current.stage.order_index(), candidate.stage.order_index());
    cand < cur || (cand == cur && candidate.progress_percent < current.progress_percent)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Job, JobStage};

    fn snapshot(job: &mut Job, stage: JobStage) -> StatusSnapshot {
        job.stage = stage;
        job.progress_percent = stage.progress_percent();
        StatusSnapshot::from_job(job)
    }

    #[tokio::test]
    async fn subscriber_gets_catchup_then_events() {
        let broker = StatusBroker::new();
        let mut job = Job::new(Uuid::new_v4());

        broker.publish(snapshot(&mut job, JobStage::Extracting));

        let (catchup, mut rx) = broker.subscribe(snapshot(&mut job, JobStage::Extracting));
        assert_eq!(catchup.stage, JobStage::Extracting);

        broker.publish(snapshot(&mut job, JobStage::Deidentifying));
        broker.publish(snapshot(&mut job, JobStage::InferringCodes));

        assert_eq!(rx.recv().await.unwrap().stage, JobStage::Deidentifying);
        assert_eq!(rx.recv().await.unwrap().stage, JobStage::InferringCodes);
    }

    #[tokio::test]
    async fn stale_publish_is_dropped() {
        let broker = StatusBroker::new();
        let mut job = Job::new(Uuid::new_v4());

        broker.publish(snapshot(&mut job, JobStage::Analyzing));
        broker.publish(snapshot(&mut job, JobStage::Extracting)); // stale

        let snap = broker.snapshot(&job.id).unwrap();
        assert_eq!(snap.stage, JobStage::Analyzing);
    }

    #[tokio::test]
    async fn poll_and_push_views_agree() {
        let broker = StatusBroker::new();
        let mut job = Job::new(Uuid::new_v4());

        let (_, mut rx) = broker.subscribe(snapshot(&mut job, JobStage::Pending));
        broker.publish(snapshot(&mut job, JobStage::Extracting));

        let pushed = rx.recv().await.unwrap();
        let polled = broker.snapshot(&job.id).unwrap();
        assert_eq!(pushed.stage, polled.stage);
        assert_eq!(pushed.progress_percent, polled.progress_percent);
    }

    #[tokio::test]
    async fn subscribe_seeds_from_ledger_when_broker_empty() {
        let broker = StatusBroker::new();
        let mut job = Job::new(Uuid::new_v4());

        let ledger = snapshot(&mut job, JobStage::Deidentifying);
        let (catchup, _rx) = broker.subscribe(ledger);
        assert_eq!(catchup.stage, JobStage::Deidentifying);
        assert_eq!(
            broker.snapshot(&job.id).unwrap().stage,
            JobStage::Deidentifying
        );
    }

    #[tokio::test]
    async fn subscribe_never_rewinds_broker_state() {
        let broker = StatusBroker::new();
        let mut job = Job::new(Uuid::new_v4());

        broker.publish(snapshot(&mut job, JobStage::Analyzing));
        // A stale ledger read must not rewind the channel
        let (catchup, _rx) = broker.subscribe(snapshot(&mut job, JobStage::Extracting));
        assert_eq!(catchup.stage, JobStage::Analyzing);
    }

    #[tokio::test]
    async fn retire_removes_channel_but_ledger_still_serves() {
        let broker = StatusBroker::new();
        let mut job = Job::new(Uuid::new_v4());

        broker.publish(snapshot(&mut job, JobStage::Complete));
        broker.retire(&job.id);
        assert!(broker.snapshot(&job.id).is_none());
    }
}
