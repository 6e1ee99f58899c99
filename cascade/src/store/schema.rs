//! Table definitions for the SQLite cascade store
//!
//! The uniqueness constraints here are load-bearing: they are the
//! deduplication and mutual-exclusion signals used by the domain layer.
//!
//! - `idx_incidents_one_active`: at most one active incident per subject
//! - `alerts(incident_id, watcher_id, channel)`: one alert per channel
//! - `call_attempts(alert_id, attempt_no)`: one row per dial try
//! - `inbox_events(provider, provider_event_id)`: inbound dedup
//! - `outbox_messages(idempotency_key)`: outbound dedup
//! - `scheduled_actions(job_id)`: deterministic, replaceable jobs

use rusqlite::Connection;

use super::StoreResult;

/// Current schema version, recorded in `PRAGMA user_version`
pub const SCHEMA_VERSION: i64 = 1;

/// Table names
pub mod tables {
    pub const INCIDENTS: &str = "incidents";
    pub const WATCHERS: &str = "watchers";
    pub const WATCHER_LINKS: &str = "watcher_links";
    pub const ALERTS: &str = "alerts";
    pub const CALL_ATTEMPTS: &str = "call_attempts";
    pub const INBOX_EVENTS: &str = "inbox_events";
    pub const OUTBOX_MESSAGES: &str = "outbox_messages";
    pub const SCHEDULED_ACTIONS: &str = "scheduled_actions";

    /// All tables, in creation order
    pub const ALL: &[&str] = &[
        INCIDENTS,
        WATCHERS,
        WATCHER_LINKS,
        ALERTS,
        CALL_ATTEMPTS,
        INBOX_EVENTS,
        OUTBOX_MESSAGES,
        SCHEDULED_ACTIONS,
    ];
}

const SCHEMA_V1: &str = r#"
CREATE TABLE IF NOT EXISTS incidents (
  id TEXT PRIMARY KEY,
  subject_id TEXT NOT NULL,
  status TEXT NOT NULL,
  created_at INTEGER NOT NULL,
  acknowledged_by TEXT,
  ack_at INTEGER,
  canceled_at INTEGER,
  canceled_by TEXT,
  exhausted_at INTEGER
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_incidents_one_active
  ON incidents(subject_id) WHERE status = 'active';
CREATE INDEX IF NOT EXISTS idx_incidents_subject ON incidents(subject_id);

-- Contact cards and ranked links are owned by the registration subsystem
CREATE TABLE IF NOT EXISTS watchers (
  watcher_id TEXT PRIMARY KEY,
  chat_id TEXT,
  phone_number TEXT
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_watchers_chat ON watchers(chat_id);

CREATE TABLE IF NOT EXISTS watcher_links (
  subject_id TEXT NOT NULL,
  watcher_id TEXT NOT NULL,
  status TEXT NOT NULL,
  priority INTEGER NOT NULL,
  ring_timeout_sec INTEGER NOT NULL,
  max_retries INTEGER NOT NULL,
  retry_backoff_sec INTEGER NOT NULL,
  chat_enabled INTEGER NOT NULL,
  call_enabled INTEGER NOT NULL,
  PRIMARY KEY (subject_id, watcher_id)
);

CREATE TABLE IF NOT EXISTS alerts (
  id TEXT PRIMARY KEY,
  incident_id TEXT NOT NULL,
  watcher_id TEXT NOT NULL,
  channel TEXT NOT NULL,
  status TEXT NOT NULL,
  attempts INTEGER NOT NULL DEFAULT 0,
  next_attempt_at INTEGER,
  created_at INTEGER NOT NULL,
  updated_at INTEGER NOT NULL,
  UNIQUE (incident_id, watcher_id, channel)
);
CREATE INDEX IF NOT EXISTS idx_alerts_incident ON alerts(incident_id);
CREATE INDEX IF NOT EXISTS idx_alerts_watcher ON alerts(watcher_id);

-- Append-only: one row per dial try, result written once
CREATE TABLE IF NOT EXISTS call_attempts (
  id TEXT PRIMARY KEY,
  alert_id TEXT NOT NULL,
  incident_id TEXT NOT NULL,
  attempt_no INTEGER NOT NULL,
  destination TEXT NOT NULL,
  provider_call_id TEXT,
  result TEXT,
  digits TEXT,
  ring_sec INTEGER NOT NULL,
  started_at INTEGER NOT NULL,
  answered_at INTEGER,
  ended_at INTEGER,
  UNIQUE (alert_id, attempt_no)
);
CREATE INDEX IF NOT EXISTS idx_attempts_incident ON call_attempts(incident_id);
CREATE INDEX IF NOT EXISTS idx_attempts_call ON call_attempts(provider_call_id);

CREATE TABLE IF NOT EXISTS inbox_events (
  provider TEXT NOT NULL,
  provider_event_id TEXT NOT NULL,
  payload TEXT NOT NULL,
  received_at INTEGER NOT NULL,
  processed_at INTEGER,
  error TEXT,
  PRIMARY KEY (provider, provider_event_id)
);

CREATE TABLE IF NOT EXISTS outbox_messages (
  idempotency_key TEXT PRIMARY KEY,
  channel TEXT NOT NULL,
  status TEXT NOT NULL,
  provider_message_id TEXT,
  error TEXT,
  attempts INTEGER NOT NULL DEFAULT 1,
  created_at INTEGER NOT NULL,
  updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS scheduled_actions (
  job_id TEXT PRIMARY KEY,
  incident_id TEXT NOT NULL,
  alert_id TEXT,
  action_type TEXT NOT NULL,
  run_at INTEGER NOT NULL,
  payload TEXT NOT NULL,
  state TEXT NOT NULL,
  error TEXT,
  created_at INTEGER NOT NULL,
  updated_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_jobs_due ON scheduled_actions(state, run_at);
CREATE INDEX IF NOT EXISTS idx_jobs_incident ON scheduled_actions(incident_id);
CREATE INDEX IF NOT EXISTS idx_jobs_alert ON scheduled_actions(alert_id);
"#;

/// Bring a connection up to [`SCHEMA_VERSION`]
pub fn migrate(conn: &Connection) -> StoreResult<()> {
    let current: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    if current < 1 {
        conn.execute_batch(SCHEMA_V1)?;
        conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrate_creates_all_tables() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();

        for table in tables::ALL {
            let count: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
                    [table],
                    |row| row.get(0),
                )
                .unwrap();
            assert_eq!(count, 1, "missing table {table}");
        }
    }

    #[test]
    fn test_migrate_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        migrate(&conn).unwrap();

        let version: i64 = conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[test]
    fn test_one_active_incident_index_rejects_second_active_row() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        conn.execute(
            "INSERT INTO incidents (id, subject_id, status, created_at) VALUES ('a', 's', 'active', 0)",
            [],
        )
        .unwrap();
        let second = conn.execute(
            "INSERT INTO incidents (id, subject_id, status, created_at) VALUES ('b', 's', 'active', 0)",
            [],
        );
        assert!(second.is_err());

        // A terminal incident does not occupy the slot
        conn.execute(
            "INSERT INTO incidents (id, subject_id, status, created_at) VALUES ('c', 's', 'canceled', 0)",
            [],
        )
        .unwrap();
    }
}
