//! Watcher and watcher-link repository
//!
//! The registration subsystem owns these rows; the cascade only reads them.
//! The upsert helpers exist so that subsystem (and tests) can seed data.

use rusqlite::{params, Connection, OptionalExtension, Row};

use super::types::{LinkStatus, Watcher, WatcherLink};
use super::StoreResult;

const LINK_COLUMNS: &str = "subject_id, watcher_id, status, priority, ring_timeout_sec, \
                            max_retries, retry_backoff_sec, chat_enabled, call_enabled";

fn watcher_from_row(row: &Row<'_>) -> rusqlite::Result<Watcher> {
    Ok(Watcher {
        watcher_id: row.get(0)?,
        chat_id: row.get(1)?,
        phone_number: row.get(2)?,
    })
}

fn link_from_row(row: &Row<'_>) -> rusqlite::Result<(WatcherLink, String)> {
    let status: String = row.get(2)?;
    Ok((
        WatcherLink {
            subject_id: row.get(0)?,
            watcher_id: row.get(1)?,
            status: LinkStatus::Active,
            priority: row.get(3)?,
            ring_timeout_sec: row.get(4)?,
            max_retries: row.get(5)?,
            retry_backoff_sec: row.get(6)?,
            chat_enabled: row.get(7)?,
            call_enabled: row.get(8)?,
        },
        status,
    ))
}

fn finish_link((mut link, status): (WatcherLink, String)) -> StoreResult<WatcherLink> {
    link.status = LinkStatus::parse(&status)?;
    Ok(link)
}

/// Insert or replace a watcher contact card
pub fn upsert_watcher(conn: &Connection, watcher: &Watcher) -> StoreResult<()> {
    conn.execute(
        "INSERT INTO watchers (watcher_id, chat_id, phone_number) VALUES (?1, ?2, ?3)
         ON CONFLICT(watcher_id) DO UPDATE SET chat_id = excluded.chat_id,
                                               phone_number = excluded.phone_number",
        params![watcher.watcher_id, watcher.chat_id, watcher.phone_number],
    )?;
    Ok(())
}

pub fn get_watcher(conn: &Connection, watcher_id: &str) -> StoreResult<Option<Watcher>> {
    Ok(conn
        .query_row(
            "SELECT watcher_id, chat_id, phone_number FROM watchers WHERE watcher_id = ?1",
            params![watcher_id],
            watcher_from_row,
        )
        .optional()?)
}

/// Resolve the watcher behind a chat id (inbound chat replies)
pub fn find_watcher_by_chat(conn: &Connection, chat_id: &str) -> StoreResult<Option<Watcher>> {
    Ok(conn
        .query_row(
            "SELECT watcher_id, chat_id, phone_number FROM watchers WHERE chat_id = ?1",
            params![chat_id],
            watcher_from_row,
        )
        .optional()?)
}

/// Insert or replace a subject → watcher link
pub fn upsert_link(conn: &Connection, link: &WatcherLink) -> StoreResult<()> {
    conn.execute(
        &format!(
            "INSERT INTO watcher_links ({LINK_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(subject_id, watcher_id) DO UPDATE SET
               status = excluded.status,
               priority = excluded.priority,
               ring_timeout_sec = excluded.ring_timeout_sec,
               max_retries = excluded.max_retries,
               retry_backoff_sec = excluded.retry_backoff_sec,
               chat_enabled = excluded.chat_enabled,
               call_enabled = excluded.call_enabled"
        ),
        params![
            link.subject_id,
            link.watcher_id,
            link.status.as_str(),
            link.priority,
            link.ring_timeout_sec,
            link.max_retries,
            link.retry_backoff_sec,
            link.chat_enabled,
            link.call_enabled,
        ],
    )?;
    Ok(())
}

pub fn get_link(conn: &Connection, subject_id: &str, watcher_id: &str) -> StoreResult<Option<WatcherLink>> {
    conn.query_row(
        &format!("SELECT {LINK_COLUMNS} FROM watcher_links WHERE subject_id = ?1 AND watcher_id = ?2"),
        params![subject_id, watcher_id],
        link_from_row,
    )
    .optional()?
    .map(finish_link)
    .transpose()
}

/// Active links for a subject in escalation order (priority ascending)
pub fn active_links_for_subject(conn: &Connection, subject_id: &str) -> StoreResult<Vec<WatcherLink>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {LINK_COLUMNS} FROM watcher_links
         WHERE subject_id = ?1 AND status = 'active'
         ORDER BY priority ASC, watcher_id ASC"
    ))?;
    let rows = stmt.query_map(params![subject_id], link_from_row)?;
    rows.map(|r| finish_link(r?)).collect()
}
