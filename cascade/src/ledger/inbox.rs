//! Inbound webhook dedup table

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::clock::{from_millis, to_millis};
use crate::store::{opt_time, StoreResult};

/// A provider event as first received
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboxEvent {
    pub provider: String,
    pub provider_event_id: String,
    pub payload: String,
    pub received_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

/// Insert the event; false when it was already recorded
pub fn record(
    conn: &Connection,
    provider: &str,
    event_id: &str,
    payload: &str,
    now: DateTime<Utc>,
) -> StoreResult<bool> {
    let inserted = conn.execute(
        "INSERT INTO inbox_events (provider, provider_event_id, payload, received_at)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(provider, provider_event_id) DO NOTHING",
        params![provider, event_id, payload, to_millis(now)],
    )?;
    Ok(inserted == 1)
}

pub fn mark_processed(conn: &Connection, provider: &str, event_id: &str, now: DateTime<Utc>) -> StoreResult<()> {
    conn.execute(
        "UPDATE inbox_events SET processed_at = ?3, error = NULL
         WHERE provider = ?1 AND provider_event_id = ?2",
        params![provider, event_id, to_millis(now)],
    )?;
    Ok(())
}

pub fn mark_failed(
    conn: &Connection,
    provider: &str,
    event_id: &str,
    error: &str,
    now: DateTime<Utc>,
) -> StoreResult<()> {
    conn.execute(
        "UPDATE inbox_events SET processed_at = ?3, error = ?4
         WHERE provider = ?1 AND provider_event_id = ?2",
        params![provider, event_id, to_millis(now), error],
    )?;
    Ok(())
}

pub fn get(conn: &Connection, provider: &str, event_id: &str) -> StoreResult<Option<InboxEvent>> {
    Ok(conn
        .query_row(
            "SELECT provider, provider_event_id, payload, received_at, processed_at, error
             FROM inbox_events WHERE provider = ?1 AND provider_event_id = ?2",
            params![provider, event_id],
            |row| {
                Ok(InboxEvent {
                    provider: row.get(0)?,
                    provider_event_id: row.get(1)?,
                    payload: row.get(2)?,
                    received_at: from_millis(row.get(3)?),
                    processed_at: opt_time(row.get(4)?),
                    error: row.get(5)?,
                })
            },
        )
        .optional()?)
}
