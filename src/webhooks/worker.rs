//! Background delivery worker.
//!
//! Scans the delivery queue on an interval, claims due rows with a lease,
//! POSTs the stored payload with its signature, and records the outcome.
//! Any 2xx settles a row as delivered; anything else schedules a retry
//! with jittered exponential backoff until the attempt budget runs out,
//! after which the row is failed permanently and preserved for audit.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};

use crate::config::{
    WEBHOOK_CLAIM_LEASE, WEBHOOK_MAX_ATTEMPTS, WEBHOOK_REQUEST_TIMEOUT, WEBHOOK_RETRY_BASE,
    WEBHOOK_RETRY_CAP, WEBHOOK_SCAN_INTERVAL,
};
use crate::core_state::{CoreError, CoreState};
use crate::db::repository::{delivery, webhook};
use crate::models::WebhookDelivery;
use crate::pipeline::orchestrator::backoff_delay;
use crate::webhooks::signing;

/// Rows claimed per scan.
const CLAIM_BATCH: usize = 16;

/// Outcome of one POST to a receiver.
pub enum SendOutcome {
    /// Got an HTTP response, whatever the status.
    Status(u16),
    /// No response at all (connect failure, timeout, DNS).
    TransportError(String),
}

/// The wire side of a delivery attempt, separated for testability.
#[async_trait]
pub trait DeliverySender: Send + Sync {
    async fn send(&self, url: &str, payload: &str, signature: &str, event_kind: &str)
        -> SendOutcome;
}

/// Production sender: JSON POST with the signature header.
pub struct HttpSender {
    client: reqwest::Client,
}

impl HttpSender {
    pub fn new() -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(WEBHOOK_REQUEST_TIMEOUT)
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl DeliverySender for HttpSender {
    async fn send(
        &self,
        url: &str,
        payload: &str,
        signature: &str,
        event_kind: &str,
    ) -> SendOutcome {
        let result = self
            .client
            .post(url)
            .header("Content-Type", "application/json")
            .header(signing::SIGNATURE_HEADER, signature)
            .header("X-Codessa-Event", event_kind)
            .body(payload.to_string())
            .send()
            .await;
        match result {
            Ok(response) => SendOutcome::Status(response.status().as_u16()),
            Err(e) => SendOutcome::TransportError(e.to_string()),
        }
    }
}

pub struct DeliveryWorker {
    state: Arc<CoreState>,
    sender: Arc<dyn DeliverySender>,
    shutdown: Arc<AtomicBool>,
}

/// Handle for stopping a spawned worker.
pub struct WorkerHandle {
    shutdown: Arc<AtomicBool>,
    join: tokio::task::JoinHandle<()>,
}

impl WorkerHandle {
    pub async fn stop(self) {
        self.shutdown.store(true, Ordering::SeqCst);
        let _ = self.join.await;
    }
}

impl DeliveryWorker {
    pub fn new(state: Arc<CoreState>, sender: Arc<dyn DeliverySender>) -> Self {
        Self {
            state,
            sender,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Spawn the scan loop onto the runtime.
    pub fn spawn(self) -> WorkerHandle {
        let shutdown = self.shutdown.clone();
        let join = tokio::spawn(async move {
            tracing::info!("Webhook delivery worker started");
            while !self.shutdown.load(Ordering::SeqCst) {
                match self.scan_once().await {
                    Ok(0) => {}
                    Ok(n) => tracing::debug!(settled = n, "Delivery scan settled rows"),
                    Err(e) => tracing::error!(error = %e, "Delivery scan failed"),
                }
                tokio::time::sleep(WEBHOOK_SCAN_INTERVAL).await;
            }
            tracing::info!("Webhook delivery worker stopped");
        });
        WorkerHandle { shutdown, join }
    }

    /// One pass: claim due rows, attempt each, record outcomes.
    pub async fn scan_once(&self) -> Result<usize, CoreError> {
        let now = Utc::now();
        let lease_until = now
            + ChronoDuration::from_std(WEBHOOK_CLAIM_LEASE)
                .unwrap_or_else(|_| ChronoDuration::seconds(120));

        let claimed = self
            .state
            .with_db(|conn| delivery::claim_due_deliveries(conn, now, lease_until, CLAIM_BATCH))?;

        let mut settled = 0;
        for row in claimed {
            self.attempt(&row).await?;
            settled += 1;
        }
        Ok(settled)
    }

    async fn attempt(&self, row: &WebhookDelivery) -> Result<(), CoreError> {
        let hook = self
            .state
            .with_db(|conn| webhook::get_webhook(conn, &row.webhook_id))?;
        let hook = match hook.filter(|h| h.is_active) {
            Some(h) => h,
            None => {
                // Receiver deactivated while deliveries were pending
                tracing::warn!(delivery_id = %row.id, webhook_id = %row.webhook_id, "Webhook inactive, failing delivery");
                self.state.with_db(|conn| {
                    delivery::record_delivery_failure(conn, &row.id, None, Utc::now(), None)
                })?;
                return Ok(());
            }
        };

        let signature = signing::sign(&hook.secret, row.payload.as_bytes());
        let outcome = self
            .sender
            .send(&hook.url, &row.payload, &signature, row.event_kind.as_str())
            .await;

        let now = Utc::now();
        match outcome {
            SendOutcome::Status(code) if (200..300).contains(&code) => {
                tracing::info!(
                    delivery_id = %row.id, webhook_id = %hook.id, code,
                    attempt = row.attempt + 1,
                    "Webhook delivered"
                );
                self.state
                    .with_db(|conn| delivery::record_delivery_success(conn, &row.id, code, now))?;
            }
            SendOutcome::Status(code) => {
                self.record_failure(row, Some(code), now)?;
            }
            SendOutcome::TransportError(reason) => {
                tracing::debug!(delivery_id = %row.id, error = %reason, "Webhook transport failure");
                self.record_failure(row, None, now)?;
            }
        }
        Ok(())
    }

    fn record_failure(
        &self,
        row: &WebhookDelivery,
        response_code: Option<u16>,
        now: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        let attempts_made = row.attempt + 1;
        let next_attempt_at = plan_retry(attempts_made, now);

        if next_attempt_at.is_none() {
            tracing::warn!(
                delivery_id = %row.id, webhook_id = %row.webhook_id,
                attempts = attempts_made, code = response_code,
                "Webhook delivery exhausted"
            );
        } else {
            tracing::debug!(
                delivery_id = %row.id, attempt = attempts_made, code = response_code,
                "Webhook delivery failed, will retry"
            );
        }

        self.state.with_db(|conn| {
            delivery::record_delivery_failure(conn, &row.id, response_code, now, next_attempt_at)
        })
    }
}

/// When to try again after `attempts_made` failed attempts, or `None` once
/// the budget is exhausted.
fn plan_retry(attempts_made: u32, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    if attempts_made >= WEBHOOK_MAX_ATTEMPTS {
        return None;
    }
    let delay = backoff_delay(WEBHOOK_RETRY_BASE, WEBHOOK_RETRY_CAP, attempts_made);
    let delay = ChronoDuration::from_std(delay).unwrap_or_else(|_| ChronoDuration::seconds(3600));
    Some(now + delay)
}
