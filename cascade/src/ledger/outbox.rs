//! Outbound side-effect dedup table
//!
//! A row is claimed before the provider is called and completed (or failed)
//! afterwards. `failed` rows and `pending` rows abandoned by a crashed
//! worker can be claimed again; `sent` rows never are.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};

use crate::clock::{from_millis, to_millis};
use crate::store::types::text_enum;
use crate::store::{Channel, StoreResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    Pending,
    Sent,
    Failed,
}

text_enum!(OutboxStatus, "outbox_messages.status", {
    Pending => "pending",
    Sent => "sent",
    Failed => "failed",
});

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxMessage {
    pub idempotency_key: String,
    pub channel: Channel,
    pub status: OutboxStatus,
    pub provider_message_id: Option<String>,
    pub error: Option<String>,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Result of claiming an idempotency key
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Claim {
    /// The caller owns the side effect and must complete or fail it
    Owned { attempts: u32 },
    /// Already delivered; carries the stored provider id
    Sent(Option<String>),
    /// Another worker holds a fresh claim
    InFlight,
}

pub fn get(conn: &Connection, key: &str) -> StoreResult<Option<OutboxMessage>> {
    let raw = conn
        .query_row(
            "SELECT idempotency_key, channel, status, provider_message_id, error, attempts, created_at, updated_at
             FROM outbox_messages WHERE idempotency_key = ?1",
            params![key],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, u32>(5)?,
                    row.get::<_, i64>(6)?,
                    row.get::<_, i64>(7)?,
                ))
            },
        )
        .optional()?;
    raw.map(|(key, channel, status, provider_id, error, attempts, created, updated)| {
        Ok(OutboxMessage {
            idempotency_key: key,
            channel: Channel::parse(&channel)?,
            status: OutboxStatus::parse(&status)?,
            provider_message_id: provider_id,
            error,
            attempts,
            created_at: from_millis(created),
            updated_at: from_millis(updated),
        })
    })
    .transpose()
}

/// Claim `key` for a side effect on `channel`
///
/// A `pending` row last touched before `stale_before` is treated as
/// abandoned and taken over.
pub fn claim(
    conn: &mut Connection,
    key: &str,
    channel: Channel,
    now: DateTime<Utc>,
    stale_before: DateTime<Utc>,
) -> StoreResult<Claim> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let inserted = tx.execute(
        "INSERT INTO outbox_messages (idempotency_key, channel, status, attempts, created_at, updated_at)
         VALUES (?1, ?2, 'pending', 1, ?3, ?3)
         ON CONFLICT(idempotency_key) DO NOTHING",
        params![key, channel.as_str(), to_millis(now)],
    )?;
    if inserted == 1 {
        tx.commit()?;
        return Ok(Claim::Owned { attempts: 1 });
    }

    let Some(existing) = get(&tx, key)? else {
        return Ok(Claim::InFlight);
    };
    let reclaim = match existing.status {
        OutboxStatus::Sent => return Ok(Claim::Sent(existing.provider_message_id)),
        OutboxStatus::Failed => true,
        OutboxStatus::Pending => existing.updated_at < stale_before,
    };
    if !reclaim {
        return Ok(Claim::InFlight);
    }

    tx.execute(
        "UPDATE outbox_messages SET status = 'pending', error = NULL, attempts = attempts + 1, updated_at = ?2
         WHERE idempotency_key = ?1",
        params![key, to_millis(now)],
    )?;
    tx.commit()?;
    Ok(Claim::Owned {
        attempts: existing.attempts + 1,
    })
}

pub fn complete(conn: &Connection, key: &str, provider_id: &str, now: DateTime<Utc>) -> StoreResult<()> {
    conn.execute(
        "UPDATE outbox_messages SET status = 'sent', provider_message_id = ?2, error = NULL, updated_at = ?3
         WHERE idempotency_key = ?1",
        params![key, provider_id, to_millis(now)],
    )?;
    Ok(())
}

pub fn fail(conn: &Connection, key: &str, error: &str, now: DateTime<Utc>) -> StoreResult<()> {
    conn.execute(
        "UPDATE outbox_messages SET status = 'failed', error = ?2, updated_at = ?3
         WHERE idempotency_key = ?1 AND status = 'pending'",
        params![key, error, to_millis(now)],
    )?;
    Ok(())
}
