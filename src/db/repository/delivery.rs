use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use super::job::{parse_ts, parse_uuid};
use crate::db::DatabaseError;
use crate::models::{DeliveryStatus, EventKind, WebhookDelivery};

/// Insert a pending delivery row. Returns `false` when a row with the same
/// idempotency key already exists — re-enqueuing a re-emitted terminal
/// event is a no-op, not a duplicate notification.
pub fn enqueue_delivery(
    conn: &Connection,
    delivery: &WebhookDelivery,
) -> Result<bool, DatabaseError> {
    let affected = conn.execute(
        "INSERT INTO webhook_deliveries
         (id, webhook_id, event_kind, subject_id, idempotency_key, payload,
          payload_digest, attempt, status, last_attempt_at, next_attempt_at, response_code)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
         ON CONFLICT(idempotency_key) DO NOTHING",
        params![
            delivery.id.to_string(),
            delivery.webhook_id.to_string(),
            delivery.event_kind.as_str(),
            delivery.subject_id.to_string(),
            delivery.idempotency_key,
            delivery.payload,
            delivery.payload_digest,
            delivery.attempt,
            delivery.status.as_str(),
            delivery.last_attempt_at.map(|t| t.to_rfc3339()),
            delivery.next_attempt_at.map(|t| t.to_rfc3339()),
            delivery.response_code,
        ],
    )?;
    Ok(affected == 1)
}

/// Claim up to `limit` due pending rows for this worker.
///
/// A row is due when it is pending, its `next_attempt_at` has passed (or is
/// unset), and no other worker holds an unexpired claim. The claim itself is
/// a guarded single-row UPDATE, so two workers scanning concurrently cannot
/// both own the same row.
pub fn claim_due_deliveries(
    conn: &Connection,
    now: DateTime<Utc>,
    lease_until: DateTime<Utc>,
    limit: usize,
) -> Result<Vec<WebhookDelivery>, DatabaseError> {
    let now_str = now.to_rfc3339();

    let mut stmt = conn.prepare(
        "SELECT id FROM webhook_deliveries
         WHERE status = 'pending'
           AND (next_attempt_at IS NULL OR next_attempt_at <= ?1)
           AND (claimed_until IS NULL OR claimed_until < ?1)
         ORDER BY next_attempt_at ASC
         LIMIT ?2",
    )?;
    let candidate_ids: Vec<String> = stmt
        .query_map(params![now_str, limit as i64], |row| row.get(0))?
        .collect::<Result<_, _>>()?;

    let mut claimed = Vec::new();
    for id in candidate_ids {
        let affected = conn.execute(
            "UPDATE webhook_deliveries SET claimed_until = ?2
             WHERE id = ?1 AND status = 'pending'
               AND (claimed_until IS NULL OR claimed_until < ?3)",
            params![id, lease_until.to_rfc3339(), now_str],
        )?;
        if affected == 1 {
            if let Some(delivery) = get_delivery_by_str_id(conn, &id)? {
                claimed.push(delivery);
            }
        }
    }
    Ok(claimed)
}

/// Mark a delivery as delivered and release the claim.
pub fn record_delivery_success(
    conn: &Connection,
    id: &Uuid,
    response_code: u16,
    now: DateTime<Utc>,
) -> Result<(), DatabaseError> {
    conn.execute(
        "UPDATE webhook_deliveries
         SET status = 'delivered', attempt = attempt + 1, last_attempt_at = ?2,
             next_attempt_at = NULL, response_code = ?3, claimed_until = NULL
         WHERE id = ?1",
        params![id.to_string(), now.to_rfc3339(), response_code],
    )?;
    Ok(())
}

/// Record a failed attempt. With `next_attempt_at` set the row stays
/// pending for retry; without it the retries are exhausted and the row is
/// failed permanently.
pub fn record_delivery_failure(
    conn: &Connection,
    id: &Uuid,
    response_code: Option<u16>,
    now: DateTime<Utc>,
    next_attempt_at: Option<DateTime<Utc>>,
) -> Result<(), DatabaseError> {
    let status = if next_attempt_at.is_some() {
        DeliveryStatus::Pending
    } else {
        DeliveryStatus::Failed
    };
    conn.execute(
        "UPDATE webhook_deliveries
         SET status = ?2, attempt = attempt + 1, last_attempt_at = ?3,
             next_attempt_at = ?4, response_code = ?5, claimed_until = NULL
         WHERE id = ?1",
        params![
            id.to_string(),
            status.as_str(),
            now.to_rfc3339(),
            next_attempt_at.map(|t| t.to_rfc3339()),
            response_code,
        ],
    )?;
    Ok(())
}

pub fn get_delivery(conn: &Connection, id: &Uuid) -> Result<Option<WebhookDelivery>, DatabaseError> {
    get_delivery_by_str_id(conn, &id.to_string())
}

pub fn deliveries_for_webhook(
    conn: &Connection,
    webhook_id: &Uuid,
) -> Result<Vec<WebhookDelivery>, DatabaseError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {DELIVERY_COLUMNS} FROM webhook_deliveries WHERE webhook_id = ?1"
    ))?;
    let rows = stmt.query_map(params![webhook_id.to_string()], map_delivery_row)?;
    let mut deliveries = Vec::new();
    for row in rows {
        deliveries.push(row_to_delivery(row?)?);
    }
    Ok(deliveries)
}

const DELIVERY_COLUMNS: &str = "id, webhook_id, event_kind, subject_id, idempotency_key, payload,
     payload_digest, attempt, status, last_attempt_at, next_attempt_at, response_code";

fn get_delivery_by_str_id(
    conn: &Connection,
    id: &str,
) -> Result<Option<WebhookDelivery>, DatabaseError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {DELIVERY_COLUMNS} FROM webhook_deliveries WHERE id = ?1"
    ))?;
    let row = stmt.query_row(params![id], map_delivery_row).optional()?;
    row.map(row_to_delivery).transpose()
}

struct DeliveryRow {
    id: String,
    webhook_id: String,
    event_kind: String,
    subject_id: String,
    idempotency_key: String,
    payload: String,
    payload_digest: String,
    attempt: u32,
    status: String,
    last_attempt_at: Option<String>,
    next_attempt_at: Option<String>,
    response_code: Option<u16>,
}

fn map_delivery_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DeliveryRow> {
    Ok(DeliveryRow {
        id: row.get(0)?,
        webhook_id: row.get(1)?,
        event_kind: row.get(2)?,
        subject_id: row.get(3)?,
        idempotency_key: row.get(4)?,
        payload: row.get(5)?,
        payload_digest: row.get(6)?,
        attempt: row.get(7)?,
        status: row.get(8)?,
        last_attempt_at: row.get(9)?,
        next_attempt_at: row.get(10)?,
        response_code: row.get(11)?,
    })
}

fn row_to_delivery(row: DeliveryRow) -> Result<WebhookDelivery, DatabaseError> {
    Ok(WebhookDelivery {
        id: parse_uuid(&row.id)?,
        webhook_id: parse_uuid(&row.webhook_id)?,
        event_kind: EventKind::from_str(&row.event_kind)?,
        subject_id: parse_uuid(&row.subject_id)?,
        idempotency_key: row.idempotency_key,
        payload: row.payload,
        payload_digest: row.payload_digest,
        attempt: row.attempt,
        status: DeliveryStatus::from_str(&row.status)?,
        last_attempt_at: row.last_attempt_at.as_deref().map(parse_ts).transpose()?,
        next_attempt_at: row.next_attempt_at.as_deref().map(parse_ts).transpose()?,
        response_code: row.response_code,
    })
}
