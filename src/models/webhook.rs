use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::enums::{DeliveryStatus, EventKind};

/// An externally registered endpoint subscribed to pipeline events.
/// Created and updated by an external management surface; the delivery
/// subsystem consumes it read-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Webhook {
    pub id: Uuid,
    pub url: String,
    pub secret: String,
    pub subscribed_events: Vec<EventKind>,
    pub is_active: bool,
    pub owner_id: String,
}

impl Webhook {
    pub fn is_subscribed(&self, kind: EventKind) -> bool {
        self.is_active && self.subscribed_events.contains(&kind)
    }
}

/// One tracked attempt-sequence of notifying a single webhook of a single
/// event. Mutated in place across retries; terminal once `Delivered` or
/// retries are exhausted.
#[derive(Debug, Clone)]
pub struct WebhookDelivery {
    pub id: Uuid,
    pub webhook_id: Uuid,
    pub event_kind: EventKind,
    pub subject_id: Uuid,
    pub idempotency_key: String,
    /// Exact payload bytes, serialized once at enqueue time. Every attempt
    /// signs and sends these same bytes.
    pub payload: String,
    pub payload_digest: String,
    pub attempt: u32,
    pub status: DeliveryStatus,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub response_code: Option<u16>,
}
