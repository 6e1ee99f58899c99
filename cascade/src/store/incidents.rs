//! Incident repository
//!
//! Every transition is a conditional update guarded by the current status, so
//! concurrent writers race safely: exactly one update affects the row.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::types::{new_id, Incident, IncidentStatus};
use super::{is_unique_violation, opt_time, StoreError, StoreResult};
use crate::clock::{from_millis, to_millis};

const COLUMNS: &str = "id, subject_id, status, created_at, acknowledged_by, ack_at, \
                       canceled_at, canceled_by, exhausted_at";

/// Outcome of inserting an active incident
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    /// A new active incident was inserted
    Created(Incident),
    /// The subject already had an active incident
    Existing(Incident),
}

impl InsertOutcome {
    pub fn incident(&self) -> &Incident {
        match self {
            Self::Created(i) | Self::Existing(i) => i,
        }
    }

    pub fn into_parts(self) -> (Incident, bool) {
        match self {
            Self::Created(i) => (i, true),
            Self::Existing(i) => (i, false),
        }
    }
}

fn from_row(row: &Row<'_>) -> rusqlite::Result<(Incident, String)> {
    let status: String = row.get(2)?;
    Ok((
        Incident {
            id: row.get(0)?,
            subject_id: row.get(1)?,
            status: IncidentStatus::Active,
            created_at: from_millis(row.get(3)?),
            acknowledged_by: row.get(4)?,
            ack_at: opt_time(row.get(5)?),
            canceled_at: opt_time(row.get(6)?),
            canceled_by: row.get(7)?,
            exhausted_at: opt_time(row.get(8)?),
        },
        status,
    ))
}

fn finish((mut incident, status): (Incident, String)) -> StoreResult<Incident> {
    incident.status = IncidentStatus::parse(&status)?;
    Ok(incident)
}

/// Get an incident by id
pub fn get(conn: &Connection, id: &str) -> StoreResult<Option<Incident>> {
    conn.query_row(
        &format!("SELECT {COLUMNS} FROM incidents WHERE id = ?1"),
        params![id],
        from_row,
    )
    .optional()?
    .map(finish)
    .transpose()
}

/// The subject's active incident, if any
pub fn find_active_for_subject(conn: &Connection, subject_id: &str) -> StoreResult<Option<Incident>> {
    conn.query_row(
        &format!("SELECT {COLUMNS} FROM incidents WHERE subject_id = ?1 AND status = 'active'"),
        params![subject_id],
        from_row,
    )
    .optional()?
    .map(finish)
    .transpose()
}

/// All incidents of a subject, newest first
pub fn list_for_subject(conn: &Connection, subject_id: &str) -> StoreResult<Vec<Incident>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {COLUMNS} FROM incidents WHERE subject_id = ?1 ORDER BY created_at DESC"
    ))?;
    let rows = stmt.query_map(params![subject_id], from_row)?;
    rows.map(|r| finish(r?)).collect()
}

/// All active incidents, oldest first
pub fn list_active(conn: &Connection) -> StoreResult<Vec<Incident>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {COLUMNS} FROM incidents WHERE status = 'active' ORDER BY created_at ASC"
    ))?;
    let rows = stmt.query_map([], from_row)?;
    rows.map(|r| finish(r?)).collect()
}

/// Insert an active incident for the subject unless one already exists
///
/// The partial unique index is the arbiter: a concurrent insert that loses the
/// race re-reads and returns the winner.
pub fn insert_active(conn: &Connection, subject_id: &str, now: DateTime<Utc>) -> StoreResult<InsertOutcome> {
    if let Some(existing) = find_active_for_subject(conn, subject_id)? {
        return Ok(InsertOutcome::Existing(existing));
    }

    let id = new_id();
    let inserted = conn.execute(
        "INSERT INTO incidents (id, subject_id, status, created_at) VALUES (?1, ?2, 'active', ?3)",
        params![id, subject_id, to_millis(now)],
    );
    match inserted {
        Ok(_) => {
            let incident = get(conn, &id)?
                .ok_or_else(|| StoreError::Serialization(format!("incident {id} vanished after insert")))?;
            Ok(InsertOutcome::Created(incident))
        }
        Err(e) if is_unique_violation(&e) => {
            let existing = find_active_for_subject(conn, subject_id)?.ok_or(StoreError::Sqlite(e))?;
            Ok(InsertOutcome::Existing(existing))
        }
        Err(e) => Err(e.into()),
    }
}

/// `active → acknowledged`; true when this call made the transition
pub fn acknowledge(conn: &Connection, id: &str, watcher_id: &str, now: DateTime<Utc>) -> StoreResult<bool> {
    let changed = conn.execute(
        "UPDATE incidents SET status = 'acknowledged', acknowledged_by = ?2, ack_at = ?3
         WHERE id = ?1 AND status = 'active'",
        params![id, watcher_id, to_millis(now)],
    )?;
    Ok(changed == 1)
}

/// `active → canceled` (and `acknowledged → canceled` when allowed)
pub fn cancel(
    conn: &Connection,
    id: &str,
    by_whom: &str,
    now: DateTime<Utc>,
    allow_from_acknowledged: bool,
) -> StoreResult<bool> {
    let sql = if allow_from_acknowledged {
        "UPDATE incidents SET status = 'canceled', canceled_by = ?2, canceled_at = ?3
         WHERE id = ?1 AND status IN ('active', 'acknowledged')"
    } else {
        "UPDATE incidents SET status = 'canceled', canceled_by = ?2, canceled_at = ?3
         WHERE id = ?1 AND status = 'active'"
    };
    let changed = conn.execute(sql, params![id, by_whom, to_millis(now)])?;
    Ok(changed == 1)
}

/// `active → exhausted`
pub fn exhaust(conn: &Connection, id: &str, now: DateTime<Utc>) -> StoreResult<bool> {
    let changed = conn.execute(
        "UPDATE incidents SET status = 'exhausted', exhausted_at = ?2
         WHERE id = ?1 AND status = 'active'",
        params![id, to_millis(now)],
    )?;
    Ok(changed == 1)
}
