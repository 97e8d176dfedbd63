//! Client-side job watcher: push first, polling as a fallback.
//!
//! The watcher prefers the push channel and reconnects with backoff when
//! it drops; after too many consecutive failures it degrades to polling
//! the status endpoint. Whichever channel an update arrives on, the
//! watcher deduplicates and enforces forward-only progress, and emits the
//! terminal state exactly once. The decision logic lives in
//! `WatcherState`, a plain state machine the async driver consults, so it
//! is testable without any transport.

use std::time::Duration;

use async_trait::async_trait;

use crate::config::{MAX_RECONNECT_ATTEMPTS, POLL_INTERVAL, RECONNECT_BACKOFF_CAP};
use crate::models::StatusSnapshot;
use crate::pipeline::orchestrator::backoff_delay;

/// Base delay for push reconnect backoff.
const RECONNECT_BASE: Duration = Duration::from_millis(500);

#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    #[error("transport failure: {0}")]
    Transport(String),
}

/// An update surfaced to the watcher's consumer.
#[derive(Debug, Clone)]
pub enum WatchEvent {
    Update(StatusSnapshot),
    /// Emitted exactly once, for the first terminal snapshot observed.
    Terminal(StatusSnapshot),
}

/// What to do after the push channel drops.
#[derive(Debug, PartialEq)]
pub enum Fallback {
    /// Try the push channel again after this delay.
    Reconnect(Duration),
    /// Give up on push; poll from now on.
    Poll,
}

// ═══════════════════════════════════════════════════════════
// Decision state machine
// ═══════════════════════════════════════════════════════════

/// Channel-agnostic watcher state: reconnect accounting plus the
/// monotonicity/dedup filter over incoming snapshots.
pub struct WatcherState {
    reconnect_attempts: u32,
    last: Option<StatusSnapshot>,
    terminal_emitted: bool,
}

impl WatcherState {
    pub fn new() -> Self {
        Self {
            reconnect_attempts: 0,
            last: None,
            terminal_emitted: false,
        }
    }

    /// A push connection was established; the failure streak resets.
    pub fn on_connected(&mut self) {
        self.reconnect_attempts = 0;
    }

    /// The push channel dropped (or failed to connect).
    pub fn on_disconnect(&mut self) -> Fallback {
        self.reconnect_attempts += 1;
        if self.reconnect_attempts >= MAX_RECONNECT_ATTEMPTS {
            Fallback::Poll
        } else {
            Fallback::Reconnect(backoff_delay(
                RECONNECT_BASE,
                RECONNECT_BACKOFF_CAP,
                self.reconnect_attempts,
            ))
        }
    }

    /// Filter one incoming snapshot, from either channel.
    ///
    /// Returns the event to surface, or `None` when the snapshot is a
    /// repeat, a rewind, or a terminal state already emitted.
    pub fn observe(&mut self, snapshot: StatusSnapshot) -> Option<WatchEvent> {
        if self.terminal_emitted {
            return None;
        }
        if let Some(last) = &self.last {
            if !advances(last, &snapshot) {
                return None;
            }
        }

        let terminal = snapshot.is_terminal();
        self.last = Some(snapshot.clone());
        if terminal {
            self.terminal_emitted = true;
            Some(WatchEvent::Terminal(snapshot))
        } else {
            Some(WatchEvent::Update(snapshot))
        }
    }

    pub fn finished(&self) -> bool {
        self.terminal_emitted
    }
}

impl Default for WatcherState {
    fn default() -> Self {
        Self::new()
    }
}

/// Forward-only ordering over snapshots: later stage, or more progress
/// within the same stage.
fn advances(from: &StatusSnapshot, to: &StatusSnapshot) -> bool {
    let (from_ord, to_ord) = (from.stage.order_index(), to.stage.order_index());
    to_ord > from_ord || (to_ord == from_ord && to.progress_percent > from.progress_percent)
}

// ═══════════════════════════════════════════════════════════
// Transports
// ═══════════════════════════════════════════════════════════

/// A push connection factory (a WebSocket dialer in production).
#[async_trait]
pub trait PushTransport: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn PushStream>, WatchError>;
}

/// An open push stream. `Ok(None)` is a clean server-side close.
#[async_trait]
pub trait PushStream: Send {
    async fn next_update(&mut self) -> Result<Option<StatusSnapshot>, WatchError>;
}

/// The poll fallback (a GET against the status endpoint in production).
#[async_trait]
pub trait PollTransport: Send + Sync {
    async fn fetch(&self) -> Result<StatusSnapshot, WatchError>;
}

// ═══════════════════════════════════════════════════════════
// Driver
// ═══════════════════════════════════════════════════════════

/// Watch a job until it reaches a terminal state, surfacing filtered
/// updates through `on_event`. Returns the terminal snapshot.
pub async fn watch_job(
    push: &dyn PushTransport,
    poll: &dyn PollTransport,
    mut on_event: impl FnMut(WatchEvent) + Send,
) -> StatusSnapshot {
    let mut state = WatcherState::new();

    // Push phase: stream updates, reconnecting on drops, until either the
    // job finishes or the failure streak forces the poll fallback.
    loop {
        match push.connect().await {
            Ok(mut stream) => {
                state.on_connected();
                loop {
                    match stream.next_update().await {
                        Ok(Some(snapshot)) => {
                            if let Some(terminal) = surface(&mut state, snapshot, &mut on_event) {
                                return terminal;
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            tracing::debug!(error = %e, "Push stream error");
                            break;
                        }
                    }
                }
            }
            Err(e) => {
                tracing::debug!(error = %e, "Push connect failed");
            }
        }

        match state.on_disconnect() {
            Fallback::Reconnect(delay) => tokio::time::sleep(delay).await,
            Fallback::Poll => {
                tracing::info!("Push channel unavailable, degrading to polling");
                break;
            }
        }
    }

    // Poll phase: same filter, so duplicates and rewinds across the
    // channel switch are absorbed.
    loop {
        match poll.fetch().await {
            Ok(snapshot) => {
                if let Some(terminal) = surface(&mut state, snapshot, &mut on_event) {
                    return terminal;
                }
            }
            Err(e) => {
                tracing::debug!(error = %e, "Status poll failed");
            }
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Run one snapshot through the filter; the terminal snapshot, once
/// surfaced, ends the watch.
fn surface(
    state: &mut WatcherState,
    snapshot: StatusSnapshot,
    on_event: &mut impl FnMut(WatchEvent),
) -> Option<StatusSnapshot> {
    match state.observe(snapshot) {
        Some(WatchEvent::Terminal(snapshot)) => {
            on_event(WatchEvent::Terminal(snapshot.clone()));
            Some(snapshot)
        }
        Some(event) => {
            on_event(event);
            None
        }
        None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use uuid::Uuid;

    use crate::models::{Job, JobStage};

    fn snapshot(job_id: Uuid, stage: JobStage) -> StatusSnapshot {
        let mut job = Job::new(job_id);
        job.id = job_id;
        job.stage = stage;
        job.progress_percent = stage.progress_percent();
        StatusSnapshot::from_job(&job)
    }

    // ── State machine ───────────────────────────────────────

    #[test]
    fn reconnects_then_degrades_to_polling() {
        let mut state = WatcherState::new();
        for _ in 0..MAX_RECONNECT_ATTEMPTS - 1 {
            match state.on_disconnect() {
                Fallback::Reconnect(delay) => {
                    assert!(delay <= RECONNECT_BACKOFF_CAP);
                }
                Fallback::Poll => panic!("degraded too early"),
            }
        }
        assert_eq!(state.on_disconnect(), Fallback::Poll);
    }

    #[test]
    fn successful_connect_resets_the_streak() {
        let mut state = WatcherState::new();
        for _ in 0..MAX_RECONNECT_ATTEMPTS - 1 {
            state.on_disconnect();
        }
        state.on_connected();
        assert!(matches!(state.on_disconnect(), Fallback::Reconnect(_)));
    }

    #[test]
    fn observe_filters_repeats_and_rewinds() {
        let id = Uuid::new_v4();
        let mut state = WatcherState::new();

        assert!(state.observe(snapshot(id, JobStage::Extracting)).is_some());
        // Repeat of the same stage: dropped
        assert!(state.observe(snapshot(id, JobStage::Extracting)).is_none());
        // Rewind: dropped
        assert!(state.observe(snapshot(id, JobStage::Pending)).is_none());
        // Forward: surfaced
        assert!(state.observe(snapshot(id, JobStage::Analyzing)).is_some());
    }

    #[test]
    fn terminal_surfaced_exactly_once() {
        let id = Uuid::new_v4();
        let mut state = WatcherState::new();

        state.observe(snapshot(id, JobStage::Analyzing));
        let first = state.observe(snapshot(id, JobStage::Complete));
        assert!(matches!(first, Some(WatchEvent::Terminal(_))));
        assert!(state.finished());

        assert!(state.observe(snapshot(id, JobStage::Complete)).is_none());
        assert!(state.observe(snapshot(id, JobStage::Analyzing)).is_none());
    }

    // ── Driver with scripted transports ─────────────────────

    /// Each `connect` pops one script entry: a stream of snapshots, or a
    /// connect failure. An exhausted script refuses further connects.
    struct ScriptedPush {
        connects: Mutex<Vec<Result<Vec<StatusSnapshot>, ()>>>,
    }

    struct ScriptedStream {
        updates: Vec<StatusSnapshot>,
    }

    #[async_trait]
    impl PushTransport for ScriptedPush {
        async fn connect(&self) -> Result<Box<dyn PushStream>, WatchError> {
            let mut connects = self.connects.lock().unwrap();
            if connects.is_empty() {
                return Err(WatchError::Transport("connection refused".into()));
            }
            match connects.remove(0) {
                Ok(updates) => Ok(Box::new(ScriptedStream { updates })),
                Err(()) => Err(WatchError::Transport("connection refused".into())),
            }
        }
    }

    #[async_trait]
    impl PushStream for ScriptedStream {
        async fn next_update(&mut self) -> Result<Option<StatusSnapshot>, WatchError> {
            if self.updates.is_empty() {
                Ok(None)
            } else {
                Ok(Some(self.updates.remove(0)))
            }
        }
    }

    /// Pops one snapshot per fetch; repeats the last one when exhausted.
    struct ScriptedPoll {
        fetches: Mutex<Vec<StatusSnapshot>>,
    }

    #[async_trait]
    impl PollTransport for ScriptedPoll {
        async fn fetch(&self) -> Result<StatusSnapshot, WatchError> {
            let mut fetches = self.fetches.lock().unwrap();
            if fetches.len() > 1 {
                Ok(fetches.remove(0))
            } else {
                fetches
                    .first()
                    .cloned()
                    .ok_or_else(|| WatchError::Transport("no status".into()))
            }
        }
    }

    fn stages_of(events: &[WatchEvent]) -> Vec<JobStage> {
        events
            .iter()
            .map(|e| match e {
                WatchEvent::Update(s) | WatchEvent::Terminal(s) => s.stage,
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn push_only_happy_path() {
        let id = Uuid::new_v4();
        let push = ScriptedPush {
            connects: Mutex::new(vec![Ok(vec![
                snapshot(id, JobStage::Extracting),
                snapshot(id, JobStage::Deidentifying),
                snapshot(id, JobStage::Complete),
            ])]),
        };
        let poll = ScriptedPoll {
            fetches: Mutex::new(vec![]),
        };

        let mut events = Vec::new();
        let terminal = watch_job(&push, &poll, |e| events.push(e)).await;

        assert_eq!(terminal.stage, JobStage::Complete);
        assert_eq!(
            stages_of(&events),
            vec![JobStage::Extracting, JobStage::Deidentifying, JobStage::Complete]
        );
        assert!(matches!(events.last(), Some(WatchEvent::Terminal(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_then_finish_on_push() {
        let id = Uuid::new_v4();
        let push = ScriptedPush {
            connects: Mutex::new(vec![
                Ok(vec![snapshot(id, JobStage::Extracting)]),
                Err(()),
                Ok(vec![
                    snapshot(id, JobStage::Extracting), // replayed catch-up, filtered
                    snapshot(id, JobStage::Complete),
                ]),
            ]),
        };
        let poll = ScriptedPoll {
            fetches: Mutex::new(vec![]),
        };

        let mut events = Vec::new();
        let terminal = watch_job(&push, &poll, |e| events.push(e)).await;

        assert_eq!(terminal.stage, JobStage::Complete);
        assert_eq!(
            stages_of(&events),
            vec![JobStage::Extracting, JobStage::Complete]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn degrades_to_polling_and_finishes() {
        let id = Uuid::new_v4();
        // Push never connects
        let push = ScriptedPush {
            connects: Mutex::new(vec![]),
        };
        let poll = ScriptedPoll {
            fetches: Mutex::new(vec![
                snapshot(id, JobStage::InferringCodes),
                snapshot(id, JobStage::InferringCodes), // repeat, filtered
                snapshot(id, JobStage::Failed),
            ]),
        };

        let mut events = Vec::new();
        let terminal = watch_job(&push, &poll, |e| events.push(e)).await;

        assert_eq!(terminal.stage, JobStage::Failed);
        assert_eq!(
            stages_of(&events),
            vec![JobStage::InferringCodes, JobStage::Failed]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn channel_switch_does_not_duplicate_updates() {
        let id = Uuid::new_v4();
        // One good push session that dies mid-job, then nothing
        let push = ScriptedPush {
            connects: Mutex::new(vec![Ok(vec![
                snapshot(id, JobStage::Extracting),
                snapshot(id, JobStage::Deidentifying),
            ])]),
        };
        // Poll replays the stage push already delivered
        let poll = ScriptedPoll {
            fetches: Mutex::new(vec![
                snapshot(id, JobStage::Deidentifying),
                snapshot(id, JobStage::Complete),
            ]),
        };

        let mut events = Vec::new();
        watch_job(&push, &poll, |e| events.push(e)).await;

        assert_eq!(
            stages_of(&events),
            vec![JobStage::Extracting, JobStage::Deidentifying, JobStage::Complete]
        );
        let terminals = events
            .iter()
            .filter(|e| matches!(e, WatchEvent::Terminal(_)))
            .count();
        assert_eq!(terminals, 1);
    }
}
