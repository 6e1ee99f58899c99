//! `scheduled_actions` repository

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use serde::{Deserialize, Serialize};

use super::action::{Job, JobState};
use crate::clock::{from_millis, to_millis};
use crate::store::StoreResult;

const COLUMNS: &str = "job_id, incident_id, alert_id, action_type, run_at, payload, state, error, \
                       created_at, updated_at";

/// Job counts per state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerStats {
    pub pending: u64,
    pub running: u64,
    pub done: u64,
    pub failed: u64,
    pub missed: u64,
    pub abandoned: u64,
}

/// Row to upsert
pub struct NewJob<'a> {
    pub job_id: &'a str,
    pub incident_id: &'a str,
    pub alert_id: Option<&'a str>,
    pub action_type: &'a str,
    pub run_at: DateTime<Utc>,
    pub payload: &'a str,
}

fn from_row(row: &Row<'_>) -> rusqlite::Result<(Job, String)> {
    Ok((
        Job {
            job_id: row.get(0)?,
            incident_id: row.get(1)?,
            alert_id: row.get(2)?,
            action_type: row.get(3)?,
            run_at: from_millis(row.get(4)?),
            payload: row.get(5)?,
            state: JobState::Pending,
            error: row.get(7)?,
            created_at: from_millis(row.get(8)?),
            updated_at: from_millis(row.get(9)?),
        },
        row.get(6)?,
    ))
}

fn finish((mut job, state): (Job, String)) -> StoreResult<Job> {
    job.state = JobState::parse(&state)?;
    Ok(job)
}

fn query_all(conn: &Connection, sql: &str, params: impl rusqlite::Params) -> StoreResult<Vec<Job>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, from_row)?;
    rows.map(|r| finish(r?)).collect()
}

/// Insert a pending job, or move an existing pending one
///
/// Only lands while the incident is active; a job that already started is
/// left untouched. Returns false when nothing was written.
pub fn upsert(conn: &Connection, job: &NewJob<'_>, now: DateTime<Utc>) -> StoreResult<bool> {
    let changed = conn.execute(
        "INSERT INTO scheduled_actions
           (job_id, incident_id, alert_id, action_type, run_at, payload, state, created_at, updated_at)
         SELECT ?1, ?2, ?3, ?4, ?5, ?6, 'pending', ?7, ?7
         WHERE EXISTS (SELECT 1 FROM incidents WHERE id = ?2 AND status = 'active')
         ON CONFLICT(job_id) DO UPDATE SET
           run_at = excluded.run_at,
           payload = excluded.payload,
           updated_at = excluded.updated_at
         WHERE scheduled_actions.state = 'pending'",
        params![
            job.job_id,
            job.incident_id,
            job.alert_id,
            job.action_type,
            to_millis(job.run_at),
            job.payload,
            to_millis(now)
        ],
    )?;
    Ok(changed == 1)
}

pub fn get(conn: &Connection, job_id: &str) -> StoreResult<Option<Job>> {
    conn.query_row(
        &format!("SELECT {COLUMNS} FROM scheduled_actions WHERE job_id = ?1"),
        params![job_id],
        from_row,
    )
    .optional()?
    .map(finish)
    .transpose()
}

pub fn list_for_incident(conn: &Connection, incident_id: &str) -> StoreResult<Vec<Job>> {
    query_all(
        conn,
        &format!("SELECT {COLUMNS} FROM scheduled_actions WHERE incident_id = ?1 ORDER BY run_at ASC, job_id ASC"),
        params![incident_id],
    )
}

pub fn pending_for_incident(conn: &Connection, incident_id: &str) -> StoreResult<Vec<Job>> {
    query_all(
        conn,
        &format!(
            "SELECT {COLUMNS} FROM scheduled_actions
             WHERE incident_id = ?1 AND state = 'pending' ORDER BY run_at ASC, job_id ASC"
        ),
        params![incident_id],
    )
}

pub fn has_pending(conn: &Connection, incident_id: &str, action_type: &str) -> StoreResult<bool> {
    Ok(conn.query_row(
        "SELECT EXISTS (SELECT 1 FROM scheduled_actions
                        WHERE incident_id = ?1 AND action_type = ?2 AND state = 'pending')",
        params![incident_id, action_type],
        |row| row.get(0),
    )?)
}

/// Delete every pending job of an incident
///
/// Runs inside the transaction that moves the incident out of `active`.
pub fn cancel_all(conn: &Connection, incident_id: &str) -> StoreResult<usize> {
    Ok(conn.execute(
        "DELETE FROM scheduled_actions WHERE incident_id = ?1 AND state = 'pending'",
        params![incident_id],
    )?)
}

pub fn delete_pending_for_alert(conn: &Connection, alert_id: &str) -> StoreResult<usize> {
    Ok(conn.execute(
        "DELETE FROM scheduled_actions WHERE alert_id = ?1 AND state = 'pending'",
        params![alert_id],
    )?)
}

/// Move up to `limit` due jobs from pending to running and return them
pub fn claim_due(conn: &mut Connection, now: DateTime<Utc>, limit: u32) -> StoreResult<Vec<Job>> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let mut due = query_all(
        &tx,
        &format!(
            "SELECT {COLUMNS} FROM scheduled_actions
             WHERE state = 'pending' AND run_at <= ?1
             ORDER BY run_at ASC, job_id ASC LIMIT ?2"
        ),
        params![to_millis(now), limit],
    )?;
    for job in &mut due {
        tx.execute(
            "UPDATE scheduled_actions SET state = 'running', updated_at = ?2
             WHERE job_id = ?1 AND state = 'pending'",
            params![job.job_id, to_millis(now)],
        )?;
        job.state = JobState::Running;
        job.updated_at = now;
    }
    tx.commit()?;
    Ok(due)
}

/// Record the outcome of a running job
pub fn finish_job(
    conn: &Connection,
    job_id: &str,
    state: JobState,
    error: Option<&str>,
    now: DateTime<Utc>,
) -> StoreResult<bool> {
    let changed = conn.execute(
        "UPDATE scheduled_actions SET state = ?2, error = ?3, updated_at = ?4
         WHERE job_id = ?1 AND state = 'running'",
        params![job_id, state.as_str(), error, to_millis(now)],
    )?;
    Ok(changed == 1)
}

/// Mark jobs a dead process left running as abandoned and return them
pub fn abandon_running(conn: &mut Connection, now: DateTime<Utc>) -> StoreResult<Vec<Job>> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let mut stranded = query_all(
        &tx,
        &format!("SELECT {COLUMNS} FROM scheduled_actions WHERE state = 'running' ORDER BY run_at ASC"),
        [],
    )?;
    tx.execute(
        "UPDATE scheduled_actions SET state = 'abandoned', error = 'interrupted by restart', updated_at = ?1
         WHERE state = 'running'",
        params![to_millis(now)],
    )?;
    tx.commit()?;
    for job in &mut stranded {
        job.state = JobState::Abandoned;
        job.error = Some("interrupted by restart".to_string());
        job.updated_at = now;
    }
    Ok(stranded)
}

/// Whether an alert still has a job waiting or executing
pub fn has_live_for_alert(conn: &Connection, alert_id: &str) -> StoreResult<bool> {
    Ok(conn.query_row(
        "SELECT EXISTS (SELECT 1 FROM scheduled_actions
                        WHERE alert_id = ?1 AND state IN ('pending', 'running'))",
        params![alert_id],
        |row| row.get(0),
    )?)
}

pub fn stats(conn: &Connection) -> StoreResult<SchedulerStats> {
    let mut stmt = conn.prepare("SELECT state, COUNT(*) FROM scheduled_actions GROUP BY state")?;
    let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, u64>(1)?)))?;
    let mut stats = SchedulerStats::default();
    for row in rows {
        let (state, count) = row?;
        match JobState::parse(&state)? {
            JobState::Pending => stats.pending = count,
            JobState::Running => stats.running = count,
            JobState::Done => stats.done = count,
            JobState::Failed => stats.failed = count,
            JobState::Missed => stats.missed = count,
            JobState::Abandoned => stats.abandoned = count,
        }
    }
    Ok(stats)
}
