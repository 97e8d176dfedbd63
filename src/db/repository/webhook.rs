use std::str::FromStr;

use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use super::job::parse_uuid;
use crate::db::DatabaseError;
use crate::models::{EventKind, Webhook};

pub fn insert_webhook(conn: &Connection, webhook: &Webhook) -> Result<(), DatabaseError> {
    let events: Vec<&str> = webhook.subscribed_events.iter().map(|e| e.as_str()).collect();
    let events_json = serde_json::to_string(&events)
        .map_err(|e| DatabaseError::ConstraintViolation(e.to_string()))?;

    conn.execute(
        "INSERT INTO webhooks (id, url, secret, subscribed_events, is_active, owner_id)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            webhook.id.to_string(),
            webhook.url,
            webhook.secret,
            events_json,
            webhook.is_active as i32,
            webhook.owner_id,
        ],
    )?;
    Ok(())
}

pub fn get_webhook(conn: &Connection, id: &Uuid) -> Result<Option<Webhook>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT id, url, secret, subscribed_events, is_active, owner_id
         FROM webhooks WHERE id = ?1",
    )?;
    let row = stmt
        .query_row(params![id.to_string()], map_webhook_row)
        .optional()?;
    row.map(row_to_webhook).transpose()
}

/// All active webhooks subscribed to the given event kind.
pub fn list_subscribed_webhooks(
    conn: &Connection,
    kind: EventKind,
) -> Result<Vec<Webhook>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT id, url, secret, subscribed_events, is_active, owner_id
         FROM webhooks WHERE is_active = 1",
    )?;

    let rows = stmt.query_map([], map_webhook_row)?;
    let mut hooks = Vec::new();
    for row in rows {
        let hook = row_to_webhook(row?)?;
        if hook.subscribed_events.contains(&kind) {
            hooks.push(hook);
        }
    }
    Ok(hooks)
}

struct WebhookRow {
    id: String,
    url: String,
    secret: String,
    subscribed_events: String,
    is_active: i32,
    owner_id: String,
}

fn map_webhook_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<WebhookRow> {
    Ok(WebhookRow {
        id: row.get(0)?,
        url: row.get(1)?,
        secret: row.get(2)?,
        subscribed_events: row.get(3)?,
        is_active: row.get(4)?,
        owner_id: row.get(5)?,
    })
}

fn row_to_webhook(row: WebhookRow) -> Result<Webhook, DatabaseError> {
    let names: Vec<String> = serde_json::from_str(&row.subscribed_events).map_err(|_| {
        DatabaseError::InvalidEnum {
            field: "subscribed_events".into(),
            value: row.subscribed_events.clone(),
        }
    })?;
    let mut events = Vec::with_capacity(names.len());
    for name in &names {
        events.push(EventKind::from_str(name)?);
    }

    Ok(Webhook {
        id: parse_uuid(&row.id)?,
        url: row.url,
        secret: row.secret,
        subscribed_events: events,
        is_active: row.is_active != 0,
        owner_id: row.owner_id,
    })
}
