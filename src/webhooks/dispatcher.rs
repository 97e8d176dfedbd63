//! Event fan-out: turn one pipeline event into pending delivery rows, one
//! per subscribed webhook.
//!
//! The payload is serialized exactly once here; every retry later sends
//! these same bytes, and the signature is computed over them. Idempotency
//! keys are derived (not random), so re-emitting a terminal event — a
//! driver re-run, a cancel racing a completion — collapses to a no-op at
//! the queue.

use rusqlite::Connection;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::db::repository::{delivery, webhook};
use crate::db::DatabaseError;
use crate::models::{DeliveryStatus, EventKind, WebhookDelivery, WebhookEvent};

/// Deterministic delivery identity: the same event for the same webhook
/// always maps to the same key.
pub fn idempotency_key(webhook_id: &Uuid, kind: EventKind, subject_id: &Uuid) -> String {
    let material = format!("{webhook_id}|{}|{subject_id}", kind.as_str());
    hex::encode(Sha256::digest(material.as_bytes()))
}

/// Enqueue one delivery per active webhook subscribed to the event's kind.
///
/// Returns the number of rows actually inserted; rows deduplicated by
/// idempotency key do not count.
pub fn enqueue_event(conn: &Connection, event: &WebhookEvent) -> Result<usize, DatabaseError> {
    let hooks = webhook::list_subscribed_webhooks(conn, event.event_kind)?;
    if hooks.is_empty() {
        return Ok(0);
    }

    let payload = serde_json::to_string(event)
        .map_err(|e| DatabaseError::ConstraintViolation(format!("event payload: {e}")))?;
    let payload_digest = hex::encode(Sha256::digest(payload.as_bytes()));

    let mut inserted = 0;
    for hook in hooks {
        let row = WebhookDelivery {
            id: Uuid::new_v4(),
            webhook_id: hook.id,
            event_kind: event.event_kind,
            subject_id: event.subject_id,
            idempotency_key: idempotency_key(&hook.id, event.event_kind, &event.subject_id),
            payload: payload.clone(),
            payload_digest: payload_digest.clone(),
            attempt: 0,
            status: DeliveryStatus::Pending,
            last_attempt_at: None,
            next_attempt_at: None,
            response_code: None,
        };
        if delivery::enqueue_delivery(conn, &row)? {
            inserted += 1;
        }
    }
    Ok(inserted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::repository::webhook::insert_webhook;
    use crate::db::sqlite::open_memory_database;
    use crate::models::{Job, JobStage, Webhook};

    fn hook(events: Vec<EventKind>) -> Webhook {
        Webhook {
            id: Uuid::new_v4(),
            url: "https://example.test/hook".into(),
            secret: "whsec_1".into(),
            subscribed_events: events,
            is_active: true,
            owner_id: "owner-1".into(),
        }
    }

    fn completed_event() -> WebhookEvent {
        let mut job = Job::new(Uuid::new_v4());
        job.stage = JobStage::Complete;
        job.progress_percent = 100;
        WebhookEvent::for_job(EventKind::JobCompleted, &job)
    }

    #[test]
    fn fans_out_to_each_subscribed_hook() {
        let conn = open_memory_database().unwrap();
        insert_webhook(&conn, &hook(vec![EventKind::JobCompleted])).unwrap();
        insert_webhook(&conn, &hook(vec![EventKind::JobCompleted, EventKind::JobFailed])).unwrap();
        insert_webhook(&conn, &hook(vec![EventKind::JobFailed])).unwrap();

        let inserted = enqueue_event(&conn, &completed_event()).unwrap();
        assert_eq!(inserted, 2);
    }

    #[test]
    fn re_emitted_event_is_a_noop() {
        let conn = open_memory_database().unwrap();
        insert_webhook(&conn, &hook(vec![EventKind::JobCompleted])).unwrap();

        let event = completed_event();
        assert_eq!(enqueue_event(&conn, &event).unwrap(), 1);
        assert_eq!(enqueue_event(&conn, &event).unwrap(), 0);
    }

    #[test]
    fn payload_digest_matches_payload_bytes() {
        let conn = open_memory_database().unwrap();
        let h = hook(vec![EventKind::JobCompleted]);
        insert_webhook(&conn, &h).unwrap();
        enqueue_event(&conn, &completed_event()).unwrap();

        let rows = delivery::deliveries_for_webhook(&conn, &h.id).unwrap();
        assert_eq!(rows.len(), 1);
        let expected = hex::encode(Sha256::digest(rows[0].payload.as_bytes()));
        assert_eq!(rows[0].payload_digest, expected);
    }

    #[test]
    fn idempotency_key_is_derived_not_random() {
        let webhook_id = Uuid::new_v4();
        let subject = Uuid::new_v4();
        let a = idempotency_key(&webhook_id, EventKind::JobCompleted, &subject);
        let b = idempotency_key(&webhook_id, EventKind::JobCompleted, &subject);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);

        // Any component changing changes the key
        assert_ne!(a, idempotency_key(&webhook_id, EventKind::JobFailed, &subject));
        assert_ne!(a, idempotency_key(&Uuid::new_v4(), EventKind::JobCompleted, &subject));
        assert_ne!(
            a,
            idempotency_key(&webhook_id, EventKind::JobCompleted, &Uuid::new_v4())
        );
    }

    #[test]
    fn no_subscribers_enqueues_nothing() {
        let conn = open_memory_database().unwrap();
        assert_eq!(enqueue_event(&conn, &completed_event()).unwrap(), 0);
    }
}
