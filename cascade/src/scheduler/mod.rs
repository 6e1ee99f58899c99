//! Durable one-shot scheduler
//!
//! Jobs live in `scheduled_actions` so ring timeouts, retries and reminders
//! survive a restart. [`Scheduler`] is the cheap, cloneable write side used
//! by the domain; [`SchedulerRunner`] owns the polling loop.
//!
//! ```text
//!  schedule(job) ──▶ pending ──claim──▶ running ──▶ done | failed
//!                      │                   │
//!                      │ incident closes   └── crash ──▶ abandoned (on restart)
//!                      ▼
//!                   deleted          too late ──▶ missed
//! ```
//!
//! A job that ends `failed`, `missed` or `abandoned` is handed back through
//! [`ActionHandler::on_skipped`] so the alert it was driving gets repaired.
//! The runner also calls [`ActionHandler::reconcile`] at startup and on a
//! fixed period to pick up escalations with nothing scheduled at all.

pub mod action;
pub mod jobs;
pub mod runner;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tracing::debug;

use crate::clock::SharedClock;
use crate::error::CascadeError;
use crate::store::{SharedStore, StoreError};

pub use action::{Job, JobState, ScheduledAction};
pub use jobs::SchedulerStats;
pub use runner::{SchedulerConfig, SchedulerHandle, SchedulerRunner, TickReport};

/// Error type for scheduler operations
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("Scheduler store error: {0}")]
    Store(#[from] StoreError),

    #[error("Failed to encode action: {0}")]
    Encode(String),

    #[error("Undecodable payload for job {job_id}: {message}")]
    Decode { job_id: String, message: String },

    /// The scheduler could not come up; the service must not start
    #[error("Scheduler startup failed: {0}")]
    Startup(String),
}

/// Result type for scheduler operations
pub type SchedulerResult<T> = Result<T, SchedulerError>;

/// Executes due actions
#[async_trait]
pub trait ActionHandler: Send + Sync {
    async fn handle(&self, incident_id: &str, action: &ScheduledAction) -> Result<(), CascadeError>;

    /// A job ended without its action taking effect (`missed`, `failed` or
    /// `abandoned`); repair whatever it was meant to drive
    async fn on_skipped(
        &self,
        _incident_id: &str,
        _action: &ScheduledAction,
        _state: JobState,
    ) -> Result<(), CascadeError> {
        Ok(())
    }

    /// Sweep for work that is overdue with nothing scheduled to drive it;
    /// returns how many incidents were repaired
    async fn reconcile(&self) -> Result<usize, CascadeError> {
        Ok(0)
    }
}

/// Write side of the scheduler
#[derive(Clone)]
pub struct Scheduler {
    store: SharedStore,
    clock: SharedClock,
    wake: Arc<Notify>,
}

impl Scheduler {
    pub fn new(store: SharedStore, clock: SharedClock) -> Self {
        Self {
            store,
            clock,
            wake: Arc::new(Notify::new()),
        }
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    pub(crate) fn wake_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.wake)
    }

    /// Schedule `action` for `incident_id` at `run_at`
    ///
    /// Returns the job id, or `None` when the incident is no longer active
    /// or the job already started.
    pub async fn schedule(
        &self,
        incident_id: &str,
        action: &ScheduledAction,
        run_at: DateTime<Utc>,
    ) -> SchedulerResult<Option<String>> {
        let job_id = action.job_id(incident_id);
        let payload = action.encode()?;
        let incident_id = incident_id.to_string();
        let alert_id = action.alert_id().map(str::to_string);
        let action_type = action.action_type();
        let now = self.clock.now();

        let written = {
            let job_id = job_id.clone();
            self.store
                .run(move |conn| {
                    jobs::upsert(
                        conn,
                        &jobs::NewJob {
                            job_id: &job_id,
                            incident_id: &incident_id,
                            alert_id: alert_id.as_deref(),
                            action_type,
                            run_at,
                            payload: &payload,
                        },
                        now,
                    )
                })
                .await?
        };

        if !written {
            debug!(job_id, "Job not scheduled (incident inactive or job already started)");
            return Ok(None);
        }
        debug!(job_id, run_at = %run_at, "Job scheduled");
        self.wake.notify_one();
        Ok(Some(job_id))
    }

    /// Delete pending jobs tied to one alert
    pub async fn cancel_for_alert(&self, alert_id: &str) -> SchedulerResult<usize> {
        let alert_id = alert_id.to_string();
        Ok(self
            .store
            .run(move |conn| jobs::delete_pending_for_alert(conn, &alert_id))
            .await?)
    }

    pub async fn pending_for_incident(&self, incident_id: &str) -> SchedulerResult<Vec<Job>> {
        let incident_id = incident_id.to_string();
        Ok(self
            .store
            .run(move |conn| jobs::pending_for_incident(conn, &incident_id))
            .await?)
    }

    pub async fn job(&self, job_id: &str) -> SchedulerResult<Option<Job>> {
        let job_id = job_id.to_string();
        Ok(self.store.run(move |conn| jobs::get(conn, &job_id)).await?)
    }

    pub async fn stats(&self) -> SchedulerResult<SchedulerStats> {
        Ok(self.store.run(|conn| jobs::stats(conn)).await?)
    }
}
