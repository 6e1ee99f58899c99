//! SQLite persistence for the cascade engine
//!
//! A single `rusqlite::Connection` behind a mutex backs every component.
//! Repository modules expose plain functions over `&Connection`, so a domain
//! operation composes them inside one short transaction and runs the whole
//! closure on the blocking pool through [`Store::run`].
//!
//! # Usage
//!
//! ```ignore
//! use cascade::store::{incidents, Store};
//!
//! let store = Store::open("./cascade.sqlite")?.shared();
//! let incident = store
//!     .run(move |conn| incidents::get(conn, &incident_id))
//!     .await?;
//! ```

pub mod alerts;
pub mod attempts;
pub mod incidents;
pub mod links;
pub mod schema;
pub mod types;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use rusqlite::{Connection, ErrorCode};
use tracing::debug;

pub use types::*;

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid stored value for {column}: {value}")]
    InvalidValue { column: &'static str, value: String },

    #[error("Lock poisoned")]
    LockPoisoned,

    #[error("Blocking task failed: {0}")]
    Join(String),
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Shared reference to Store
pub type SharedStore = Arc<Store>;

/// SQLite-backed store for incidents, alerts, ledgers and scheduled actions
pub struct Store {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

impl Store {
    /// Open or create a store at the given path
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        let conn = Connection::open(&path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.busy_timeout(std::time::Duration::from_millis(5000))?;
        schema::migrate(&conn)?;
        debug!(path = %path.display(), "Cascade store opened");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: Some(path),
        })
    }

    /// Open a private in-memory store (tests, dry runs)
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        schema::migrate(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: None,
        })
    }

    /// Create a shared reference to this store
    pub fn shared(self) -> SharedStore {
        Arc::new(self)
    }

    /// Database path, `None` for in-memory stores
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Run `f` against the connection on the calling thread
    pub fn with_conn<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> StoreResult<T>,
    ) -> StoreResult<T> {
        let mut conn = self.conn.lock().map_err(|_| StoreError::LockPoisoned)?;
        f(&mut conn)
    }

    /// Run `f` against the connection on the blocking pool
    pub async fn run<T, F>(&self, f: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> StoreResult<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().map_err(|_| StoreError::LockPoisoned)?;
            f(&mut conn)
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))?
    }

    /// Verify the database answers queries
    pub async fn ping(&self) -> StoreResult<()> {
        self.run(|conn| {
            conn.query_row("SELECT COUNT(*) FROM scheduled_actions", [], |row| {
                row.get::<_, i64>(0)
            })?;
            Ok(())
        })
        .await
    }
}

/// Whether an error is a uniqueness/primary-key violation
pub fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation
    )
}

/// Convert an optional millisecond column into a timestamp
pub(crate) fn opt_time(ms: Option<i64>) -> Option<chrono::DateTime<chrono::Utc>> {
    ms.map(crate::clock::from_millis)
}
