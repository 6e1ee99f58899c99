//! Alert repository

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::types::{new_id, Alert, AlertStatus, Channel};
use super::{opt_time, StoreResult};
use crate::clock::{from_millis, to_millis};

const COLUMNS: &str = "id, incident_id, watcher_id, channel, status, attempts, \
                       next_attempt_at, created_at, updated_at";

type RawAlert = (Alert, String, String);

fn from_row(row: &Row<'_>) -> rusqlite::Result<RawAlert> {
    Ok((
        Alert {
            id: row.get(0)?,
            incident_id: row.get(1)?,
            watcher_id: row.get(2)?,
            channel: Channel::Chat,
            status: AlertStatus::Pending,
            attempts: row.get(5)?,
            next_attempt_at: opt_time(row.get(6)?),
            created_at: from_millis(row.get(7)?),
            updated_at: from_millis(row.get(8)?),
        },
        row.get(3)?,
        row.get(4)?,
    ))
}

fn finish((mut alert, channel, status): RawAlert) -> StoreResult<Alert> {
    alert.channel = Channel::parse(&channel)?;
    alert.status = AlertStatus::parse(&status)?;
    Ok(alert)
}

fn query_one(conn: &Connection, sql: &str, params: impl rusqlite::Params) -> StoreResult<Option<Alert>> {
    conn.query_row(sql, params, from_row)
        .optional()?
        .map(finish)
        .transpose()
}

fn query_all(conn: &Connection, sql: &str, params: impl rusqlite::Params) -> StoreResult<Vec<Alert>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, from_row)?;
    rows.map(|r| finish(r?)).collect()
}

/// Create the alert for (incident, watcher, channel), or return the existing one
pub fn insert_or_get(
    conn: &Connection,
    incident_id: &str,
    watcher_id: &str,
    channel: Channel,
    now: DateTime<Utc>,
) -> StoreResult<(Alert, bool)> {
    let inserted = conn.execute(
        "INSERT INTO alerts (id, incident_id, watcher_id, channel, status, attempts, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, 'pending', 0, ?5, ?5)
         ON CONFLICT(incident_id, watcher_id, channel) DO NOTHING",
        params![new_id(), incident_id, watcher_id, channel.as_str(), to_millis(now)],
    )?;
    let alert = find(conn, incident_id, watcher_id, channel)?.ok_or_else(|| {
        super::StoreError::Serialization(format!("alert for {incident_id}/{watcher_id} vanished"))
    })?;
    Ok((alert, inserted == 1))
}

pub fn get(conn: &Connection, id: &str) -> StoreResult<Option<Alert>> {
    query_one(conn, &format!("SELECT {COLUMNS} FROM alerts WHERE id = ?1"), params![id])
}

pub fn find(
    conn: &Connection,
    incident_id: &str,
    watcher_id: &str,
    channel: Channel,
) -> StoreResult<Option<Alert>> {
    query_one(
        conn,
        &format!(
            "SELECT {COLUMNS} FROM alerts WHERE incident_id = ?1 AND watcher_id = ?2 AND channel = ?3"
        ),
        params![incident_id, watcher_id, channel.as_str()],
    )
}

/// Alerts of an incident in creation order
pub fn list_for_incident(conn: &Connection, incident_id: &str) -> StoreResult<Vec<Alert>> {
    query_all(
        conn,
        &format!("SELECT {COLUMNS} FROM alerts WHERE incident_id = ?1 ORDER BY created_at ASC, rowid ASC"),
        params![incident_id],
    )
}

/// Alerts of a watcher that belong to currently active incidents, newest incident first
pub fn list_active_for_watcher(conn: &Connection, watcher_id: &str) -> StoreResult<Vec<Alert>> {
    query_all(
        conn,
        "SELECT a.id, a.incident_id, a.watcher_id, a.channel, a.status, a.attempts,
                a.next_attempt_at, a.created_at, a.updated_at
         FROM alerts a JOIN incidents i ON i.id = a.incident_id
         WHERE a.watcher_id = ?1 AND i.status = 'active'
         ORDER BY i.created_at DESC, a.rowid ASC",
        params![watcher_id],
    )
}

/// Move an alert to `to` only if it is currently in one of `from`
pub fn transition(
    conn: &Connection,
    id: &str,
    from: &[AlertStatus],
    to: AlertStatus,
    now: DateTime<Utc>,
) -> StoreResult<bool> {
    let allowed = from
        .iter()
        .map(|s| format!("'{}'", s.as_str()))
        .collect::<Vec<_>>()
        .join(", ");
    let changed = conn.execute(
        &format!(
            "UPDATE alerts SET status = ?2, next_attempt_at = NULL, updated_at = ?3
             WHERE id = ?1 AND status IN ({allowed})"
        ),
        params![id, to.as_str(), to_millis(now)],
    )?;
    Ok(changed == 1)
}

/// Mark every open alert of a watcher within an incident as acknowledged
pub fn acknowledge_for_watcher(
    conn: &Connection,
    incident_id: &str,
    watcher_id: &str,
    now: DateTime<Utc>,
) -> StoreResult<usize> {
    Ok(conn.execute(
        "UPDATE alerts SET status = 'acknowledged', next_attempt_at = NULL, updated_at = ?3
         WHERE incident_id = ?1 AND watcher_id = ?2 AND status IN ('pending', 'sent')",
        params![incident_id, watcher_id, to_millis(now)],
    )?)
}

/// Record when the next call attempt of an alert is due
pub fn set_next_attempt(
    conn: &Connection,
    id: &str,
    at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> StoreResult<()> {
    conn.execute(
        "UPDATE alerts SET next_attempt_at = ?2, updated_at = ?3 WHERE id = ?1",
        params![id, at.map(to_millis), to_millis(now)],
    )?;
    Ok(())
}

/// Alerts of an incident that can still lead to an acknowledgment
///
/// Call alerts count while pending or mid-cascade; chat alerts only while
/// not yet delivered.
pub fn count_open(conn: &Connection, incident_id: &str) -> StoreResult<u32> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM alerts
         WHERE incident_id = ?1
           AND ((channel = 'call' AND status IN ('pending', 'sent'))
             OR (channel = 'chat' AND status = 'pending'))",
        params![incident_id],
        |row| row.get(0),
    )?)
}

/// Chat alerts that a reminder round would still re-send
pub fn count_remindable(conn: &Connection, incident_id: &str) -> StoreResult<u32> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM alerts
         WHERE incident_id = ?1 AND channel = 'chat' AND status IN ('pending', 'sent', 'failed')",
        params![incident_id],
        |row| row.get(0),
    )?)
}

/// Open alerts of an incident that nothing is driving any more
///
/// A chat alert counts while never delivered; a call alert counts when it
/// has no live job and no answered call in progress. Only alerts whose
/// next attempt (or last change) is at or before `cutoff` are returned.
pub fn list_stalled(conn: &Connection, incident_id: &str, cutoff: DateTime<Utc>) -> StoreResult<Vec<Alert>> {
    query_all(
        conn,
        &format!(
            "SELECT {COLUMNS} FROM alerts a
             WHERE a.incident_id = ?1
               AND COALESCE(a.next_attempt_at, a.updated_at) <= ?2
               AND ((a.channel = 'chat' AND a.status = 'pending')
                 OR (a.channel = 'call' AND a.status IN ('pending', 'sent')
                     AND NOT EXISTS (SELECT 1 FROM scheduled_actions j
                                     WHERE j.alert_id = a.id AND j.state IN ('pending', 'running'))
                     AND NOT EXISTS (SELECT 1 FROM call_attempts c
                                     WHERE c.alert_id = a.id AND c.ended_at IS NULL AND c.result = 'answered')))
             ORDER BY a.rowid ASC"
        ),
        params![incident_id, to_millis(cutoff)],
    )
}

/// An open call alert of an active incident with no live job and no open attempt
pub fn call_is_stalled(conn: &Connection, alert_id: &str) -> StoreResult<bool> {
    Ok(conn.query_row(
        "SELECT EXISTS (
           SELECT 1 FROM alerts a JOIN incidents i ON i.id = a.incident_id
           WHERE a.id = ?1 AND i.status = 'active'
             AND a.channel = 'call' AND a.status IN ('pending', 'sent')
             AND NOT EXISTS (SELECT 1 FROM scheduled_actions j
                             WHERE j.alert_id = a.id AND j.state IN ('pending', 'running'))
             AND NOT EXISTS (SELECT 1 FROM call_attempts c
                             WHERE c.alert_id = a.id AND c.ended_at IS NULL))",
        params![alert_id],
        |row| row.get(0),
    )?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::scheduler::jobs;
    use crate::store::{incidents, schema};

    fn setup() -> (Connection, String, DateTime<Utc>) {
        let conn = Connection::open_in_memory().unwrap();
        schema::migrate(&conn).unwrap();
        let now = ManualClock::at_epoch().now();
        let (incident, _) = incidents::insert_active(&conn, "s", now).unwrap().into_parts();
        (conn, incident.id, now)
    }

    #[test]
    fn test_insert_or_get_is_unique_per_channel() {
        let (conn, incident_id, now) = setup();
        let (a1, created1) = insert_or_get(&conn, &incident_id, "w", Channel::Call, now).unwrap();
        let (a2, created2) = insert_or_get(&conn, &incident_id, "w", Channel::Call, now).unwrap();
        let (chat, _) = insert_or_get(&conn, &incident_id, "w", Channel::Chat, now).unwrap();

        assert!(created1);
        assert!(!created2);
        assert_eq!(a1.id, a2.id);
        assert_ne!(a1.id, chat.id);
        assert_eq!(list_for_incident(&conn, &incident_id).unwrap().len(), 2);
    }

    #[test]
    fn test_transition_respects_source_states() {
        let (conn, incident_id, now) = setup();
        let (alert, _) = insert_or_get(&conn, &incident_id, "w", Channel::Call, now).unwrap();

        assert!(transition(&conn, &alert.id, &[AlertStatus::Pending], AlertStatus::Declined, now).unwrap());
        assert!(!transition(
            &conn,
            &alert.id,
            &[AlertStatus::Pending, AlertStatus::Sent],
            AlertStatus::Failed,
            now
        )
        .unwrap());
        assert_eq!(get(&conn, &alert.id).unwrap().unwrap().status, AlertStatus::Declined);
    }

    #[test]
    fn test_count_open_ignores_delivered_chat() {
        let (conn, incident_id, now) = setup();
        let (call, _) = insert_or_get(&conn, &incident_id, "w", Channel::Call, now).unwrap();
        let (chat, _) = insert_or_get(&conn, &incident_id, "w", Channel::Chat, now).unwrap();
        assert_eq!(count_open(&conn, &incident_id).unwrap(), 2);

        transition(&conn, &chat.id, &[AlertStatus::Pending], AlertStatus::Sent, now).unwrap();
        assert_eq!(count_open(&conn, &incident_id).unwrap(), 1);

        transition(&conn, &call.id, &[AlertStatus::Pending], AlertStatus::Failed, now).unwrap();
        assert_eq!(count_open(&conn, &incident_id).unwrap(), 0);
        assert_eq!(count_remindable(&conn, &incident_id).unwrap(), 1);

        transition(&conn, &chat.id, &[AlertStatus::Sent], AlertStatus::Declined, now).unwrap();
        assert_eq!(count_remindable(&conn, &incident_id).unwrap(), 0);
    }

    #[test]
    fn test_active_alerts_for_watcher_skip_terminal_incidents() {
        let (conn, incident_id, now) = setup();
        insert_or_get(&conn, &incident_id, "w", Channel::Chat, now).unwrap();
        assert_eq!(list_active_for_watcher(&conn, "w").unwrap().len(), 1);

        incidents::exhaust(&conn, &incident_id, now).unwrap();
        assert!(list_active_for_watcher(&conn, "w").unwrap().is_empty());
    }

    #[test]
    fn test_call_alert_without_live_job_is_stalled() {
        let (conn, incident_id, now) = setup();
        let (call, _) = insert_or_get(&conn, &incident_id, "w", Channel::Call, now).unwrap();
        let (chat, _) = insert_or_get(&conn, &incident_id, "w", Channel::Chat, now).unwrap();
        transition(&conn, &chat.id, &[AlertStatus::Pending], AlertStatus::Sent, now).unwrap();

        assert!(call_is_stalled(&conn, &call.id).unwrap());
        let stalled: Vec<_> = list_stalled(&conn, &incident_id, now)
            .unwrap()
            .into_iter()
            .map(|a| a.id)
            .collect();
        assert_eq!(stalled, vec![call.id.clone()]);
        assert!(list_stalled(&conn, &incident_id, now - chrono::Duration::seconds(1))
            .unwrap()
            .is_empty());

        jobs::upsert(
            &conn,
            &jobs::NewJob {
                job_id: "ring_timeout:x:1",
                incident_id: &incident_id,
                alert_id: Some(&call.id),
                action_type: "ring_timeout",
                run_at: now,
                payload: "{}",
            },
            now,
        )
        .unwrap();
        assert!(!call_is_stalled(&conn, &call.id).unwrap());
        assert!(list_stalled(&conn, &incident_id, now).unwrap().is_empty());
    }

    #[test]
    fn test_retry_due_later_is_not_stalled_yet() {
        let (conn, incident_id, now) = setup();
        let (call, _) = insert_or_get(&conn, &incident_id, "w", Channel::Call, now).unwrap();
        let due = now + chrono::Duration::seconds(60);
        set_next_attempt(&conn, &call.id, Some(due), now).unwrap();

        assert!(list_stalled(&conn, &incident_id, now).unwrap().is_empty());
        assert_eq!(list_stalled(&conn, &incident_id, due).unwrap().len(), 1);
    }
}
