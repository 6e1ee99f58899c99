//! Call attempt repository
//!
//! Attempts are append-only history. `result` is written once; an attempt is
//! *closed* when `ended_at` is stamped, and only the caller whose update
//! closed it runs the follow-up (retry or fail), which keeps a ring-timeout
//! fire and a late hangup webhook from both acting on the same attempt.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};

use super::types::{new_id, AlertStatus, CallAttempt, CallResult};
use super::{opt_time, StoreResult};
use crate::clock::{from_millis, to_millis};

const COLUMNS: &str = "id, alert_id, incident_id, attempt_no, destination, provider_call_id, \
                       result, digits, ring_sec, started_at, answered_at, ended_at";

/// Input for a new dial try
#[derive(Debug, Clone)]
pub struct NewAttempt {
    pub alert_id: String,
    pub incident_id: String,
    pub attempt_no: u32,
    pub destination: String,
    pub ring_sec: u32,
}

/// Outcome of [`begin`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BeginOutcome {
    /// Row inserted; the caller should dial
    Started(CallAttempt),
    /// This (alert, attempt_no) already exists
    Duplicate(CallAttempt),
    /// The incident-wide ring budget has no room for this attempt
    RingCapReached { used_sec: u32 },
    /// The incident is no longer active
    IncidentClosed,
    /// The alert was declined, acknowledged or failed in the meantime
    AlertClosed(AlertStatus),
}

fn from_row(row: &Row<'_>) -> rusqlite::Result<(CallAttempt, Option<String>)> {
    Ok((
        CallAttempt {
            id: row.get(0)?,
            alert_id: row.get(1)?,
            incident_id: row.get(2)?,
            attempt_no: row.get(3)?,
            destination: row.get(4)?,
            provider_call_id: row.get(5)?,
            result: None,
            digits: row.get(7)?,
            ring_sec: row.get(8)?,
            started_at: from_millis(row.get(9)?),
            answered_at: opt_time(row.get(10)?),
            ended_at: opt_time(row.get(11)?),
        },
        row.get(6)?,
    ))
}

fn finish((mut attempt, result): (CallAttempt, Option<String>)) -> StoreResult<CallAttempt> {
    attempt.result = result.as_deref().map(CallResult::parse).transpose()?;
    Ok(attempt)
}

fn query_one(conn: &Connection, sql: &str, params: impl rusqlite::Params) -> StoreResult<Option<CallAttempt>> {
    conn.query_row(sql, params, from_row)
        .optional()?
        .map(finish)
        .transpose()
}

fn query_all(conn: &Connection, sql: &str, params: impl rusqlite::Params) -> StoreResult<Vec<CallAttempt>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, from_row)?;
    rows.map(|r| finish(r?)).collect()
}

pub fn get(conn: &Connection, id: &str) -> StoreResult<Option<CallAttempt>> {
    query_one(conn, &format!("SELECT {COLUMNS} FROM call_attempts WHERE id = ?1"), params![id])
}

pub fn find(conn: &Connection, alert_id: &str, attempt_no: u32) -> StoreResult<Option<CallAttempt>> {
    query_one(
        conn,
        &format!("SELECT {COLUMNS} FROM call_attempts WHERE alert_id = ?1 AND attempt_no = ?2"),
        params![alert_id, attempt_no],
    )
}

pub fn find_by_call_id(conn: &Connection, provider_call_id: &str) -> StoreResult<Option<CallAttempt>> {
    query_one(
        conn,
        &format!("SELECT {COLUMNS} FROM call_attempts WHERE provider_call_id = ?1"),
        params![provider_call_id],
    )
}

pub fn list_for_alert(conn: &Connection, alert_id: &str) -> StoreResult<Vec<CallAttempt>> {
    query_all(
        conn,
        &format!("SELECT {COLUMNS} FROM call_attempts WHERE alert_id = ?1 ORDER BY attempt_no ASC"),
        params![alert_id],
    )
}

pub fn list_for_incident(conn: &Connection, incident_id: &str) -> StoreResult<Vec<CallAttempt>> {
    query_all(
        conn,
        &format!("SELECT {COLUMNS} FROM call_attempts WHERE incident_id = ?1 ORDER BY started_at ASC, attempt_no ASC"),
        params![incident_id],
    )
}

/// Attempts of an incident that have a live call at the provider
pub fn list_in_flight(conn: &Connection, incident_id: &str) -> StoreResult<Vec<CallAttempt>> {
    query_all(
        conn,
        &format!(
            "SELECT {COLUMNS} FROM call_attempts
             WHERE incident_id = ?1 AND ended_at IS NULL AND provider_call_id IS NOT NULL"
        ),
        params![incident_id],
    )
}

/// Ring seconds already charged against the incident
pub fn ring_used(conn: &Connection, incident_id: &str) -> StoreResult<u32> {
    Ok(conn.query_row(
        "SELECT COALESCE(SUM(ring_sec), 0) FROM call_attempts WHERE incident_id = ?1",
        params![incident_id],
        |row| row.get(0),
    )?)
}

/// Insert a dial try after checking incident state, alert state and the ring cap
///
/// Runs in an immediate transaction so the cap check and the insert cannot
/// interleave with another watcher's attempt.
pub fn begin(
    conn: &mut Connection,
    new: &NewAttempt,
    max_total_ring_sec: u32,
    now: DateTime<Utc>,
) -> StoreResult<BeginOutcome> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    if let Some(existing) = find(&tx, &new.alert_id, new.attempt_no)? {
        return Ok(BeginOutcome::Duplicate(existing));
    }

    let incident_active: bool = tx.query_row(
        "SELECT EXISTS (SELECT 1 FROM incidents WHERE id = ?1 AND status = 'active')",
        params![new.incident_id],
        |row| row.get(0),
    )?;
    if !incident_active {
        return Ok(BeginOutcome::IncidentClosed);
    }

    let alert_status: Option<String> = tx
        .query_row(
            "SELECT status FROM alerts WHERE id = ?1",
            params![new.alert_id],
            |row| row.get(0),
        )
        .optional()?;
    let alert_status = match alert_status {
        Some(s) => AlertStatus::parse(&s)?,
        None => return Ok(BeginOutcome::AlertClosed(AlertStatus::Failed)),
    };
    if !alert_status.is_open() {
        return Ok(BeginOutcome::AlertClosed(alert_status));
    }

    let used_sec = ring_used(&tx, &new.incident_id)?;
    if used_sec.saturating_add(new.ring_sec) > max_total_ring_sec {
        return Ok(BeginOutcome::RingCapReached { used_sec });
    }

    let id = new_id();
    tx.execute(
        "INSERT INTO call_attempts (id, alert_id, incident_id, attempt_no, destination, ring_sec, started_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            id,
            new.alert_id,
            new.incident_id,
            new.attempt_no,
            new.destination,
            new.ring_sec,
            to_millis(now)
        ],
    )?;
    tx.execute(
        "UPDATE alerts SET status = 'sent', attempts = attempts + 1, next_attempt_at = NULL, updated_at = ?2
         WHERE id = ?1",
        params![new.alert_id, to_millis(now)],
    )?;
    let attempt = get(&tx, &id)?
        .ok_or_else(|| super::StoreError::Serialization(format!("attempt {id} vanished after insert")))?;
    tx.commit()?;
    Ok(BeginOutcome::Started(attempt))
}

pub fn set_provider_call_id(conn: &Connection, id: &str, provider_call_id: &str) -> StoreResult<()> {
    conn.execute(
        "UPDATE call_attempts SET provider_call_id = ?2 WHERE id = ?1 AND provider_call_id IS NULL",
        params![id, provider_call_id],
    )?;
    Ok(())
}

/// Record that the callee picked up; true if this set the result
pub fn mark_answered(conn: &Connection, id: &str, now: DateTime<Utc>) -> StoreResult<bool> {
    let changed = conn.execute(
        "UPDATE call_attempts SET result = 'answered', answered_at = ?2
         WHERE id = ?1 AND result IS NULL AND ended_at IS NULL",
        params![id, to_millis(now)],
    )?;
    Ok(changed == 1)
}

pub fn record_digits(conn: &Connection, id: &str, digits: &str) -> StoreResult<()> {
    conn.execute(
        "UPDATE call_attempts SET digits = COALESCE(digits, '') || ?2 WHERE id = ?1",
        params![id, digits],
    )?;
    Ok(())
}

/// Close an attempt; `result` only applies if none was recorded yet
///
/// Returns the closed attempt if this call closed it, `None` if it was
/// already closed.
pub fn close(
    conn: &Connection,
    id: &str,
    result: CallResult,
    now: DateTime<Utc>,
) -> StoreResult<Option<CallAttempt>> {
    let changed = conn.execute(
        "UPDATE call_attempts SET result = COALESCE(result, ?2), ended_at = ?3
         WHERE id = ?1 AND ended_at IS NULL",
        params![id, result.as_str(), to_millis(now)],
    )?;
    if changed == 0 {
        return Ok(None);
    }
    get(conn, id)
}

/// Close an attempt that neither got answered nor hung up (ring timeout)
pub fn close_unanswered(
    conn: &Connection,
    id: &str,
    result: CallResult,
    now: DateTime<Utc>,
) -> StoreResult<Option<CallAttempt>> {
    let changed = conn.execute(
        "UPDATE call_attempts SET result = ?2, ended_at = ?3
         WHERE id = ?1 AND ended_at IS NULL AND result IS NULL",
        params![id, result.as_str(), to_millis(now)],
    )?;
    if changed == 0 {
        return Ok(None);
    }
    get(conn, id)
}
