//! Scheduler polling loop

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::action::{Job, JobState, ScheduledAction};
use super::{jobs, ActionHandler, Scheduler, SchedulerError, SchedulerResult};
use crate::config::CascadeConfig;

/// Polling and misfire settings
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Upper bound between polls when nothing wakes the loop
    pub poll_interval: Duration,
    /// Due jobs older than this are marked missed instead of run
    pub misfire_grace: Duration,
    /// Jobs claimed per tick
    pub batch_size: u32,
    /// How often the loop sweeps for stalled work; `None` sweeps only at startup
    pub reconcile_interval: Option<Duration>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            misfire_grace: Duration::from_secs(120),
            batch_size: 32,
            reconcile_interval: Some(Duration::from_secs(60)),
        }
    }
}

impl From<&CascadeConfig> for SchedulerConfig {
    fn from(config: &CascadeConfig) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            misfire_grace: config.misfire_grace(),
            batch_size: config.scheduler_batch_size,
            reconcile_interval: config.reconcile_interval(),
        }
    }
}

/// What one tick did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub claimed: usize,
    pub done: usize,
    pub failed: usize,
    pub missed: usize,
}

/// Claims due jobs and dispatches them to an [`ActionHandler`]
pub struct SchedulerRunner {
    scheduler: Scheduler,
    handler: Arc<dyn ActionHandler>,
    config: SchedulerConfig,
}

impl SchedulerRunner {
    pub fn new(scheduler: Scheduler, handler: Arc<dyn ActionHandler>, config: SchedulerConfig) -> Self {
        Self {
            scheduler,
            handler,
            config,
        }
    }

    /// Mark jobs left `running` by a dead process as abandoned, repair what
    /// they were driving, then sweep for stalled escalations
    pub async fn recover(&self) -> SchedulerResult<usize> {
        let now = self.scheduler.clock.now();
        let abandoned = self
            .scheduler
            .store
            .run(move |conn| jobs::abandon_running(conn, now))
            .await?;
        if !abandoned.is_empty() {
            warn!(abandoned = abandoned.len(), "Abandoned jobs interrupted by a previous shutdown");
        }
        for job in &abandoned {
            self.repair(job).await;
        }
        self.reconcile().await;
        Ok(abandoned.len())
    }

    /// Ask the handler to pick up stalled work; failures are logged
    pub async fn reconcile(&self) -> usize {
        match self.handler.reconcile().await {
            Ok(0) => 0,
            Ok(repaired) => {
                info!(repaired, "Resumed stalled escalations");
                repaired
            }
            Err(e) => {
                error!(error = %e, "Stalled escalation sweep failed");
                0
            }
        }
    }

    async fn repair(&self, job: &Job) {
        let Ok(action) = ScheduledAction::decode(&job.job_id, &job.payload) else {
            return;
        };
        if let Err(e) = self.handler.on_skipped(&job.incident_id, &action, job.state).await {
            error!(job_id = %job.job_id, state = job.state.as_str(), error = %e, "Repair after skipped job failed");
        }
    }

    /// Run every job that is due now
    pub async fn tick(&self) -> SchedulerResult<TickReport> {
        let now = self.scheduler.clock.now();
        let limit = self.config.batch_size;
        let due = self
            .scheduler
            .store
            .run(move |conn| jobs::claim_due(conn, now, limit))
            .await?;

        let mut report = TickReport {
            claimed: due.len(),
            ..TickReport::default()
        };
        if due.is_empty() {
            return Ok(report);
        }
        debug!(claimed = due.len(), "Claimed due jobs");

        let grace = chrono::Duration::from_std(self.config.misfire_grace)
            .unwrap_or_else(|_| chrono::Duration::zero());
        let outcomes = join_all(due.into_iter().map(|job| {
            let late = now - job.run_at > grace;
            async move {
                if late {
                    warn!(job_id = %job.job_id, run_at = %job.run_at, "Job missed its grace window");
                    return (job, JobState::Missed, Some("misfire".to_string()));
                }
                let (state, error) = self.execute(&job).await;
                (job, state, error)
            }
        }))
        .await;

        for (mut job, state, error) in outcomes {
            match state {
                JobState::Done => report.done += 1,
                JobState::Missed => report.missed += 1,
                _ => report.failed += 1,
            }
            let finished_at = self.scheduler.clock.now();
            let job_id = job.job_id.clone();
            let recorded = self
                .scheduler
                .store
                .run(move |conn| jobs::finish_job(conn, &job_id, state, error.as_deref(), finished_at))
                .await?;
            if recorded && state != JobState::Done {
                job.state = state;
                self.repair(&job).await;
            }
        }
        Ok(report)
    }

    async fn execute(&self, job: &Job) -> (JobState, Option<String>) {
        let action = match ScheduledAction::decode(&job.job_id, &job.payload) {
            Ok(action) => action,
            Err(e) => {
                error!(job_id = %job.job_id, error = %e, "Rejecting undecodable job");
                return (JobState::Failed, Some(e.to_string()));
            }
        };
        match self.handler.handle(&job.incident_id, &action).await {
            Ok(()) => {
                debug!(job_id = %job.job_id, "Job done");
                (JobState::Done, None)
            }
            Err(e) => {
                error!(job_id = %job.job_id, incident_id = %job.incident_id, error = %e, "Job failed");
                (JobState::Failed, Some(e.to_string()))
            }
        }
    }

    /// Check the store, recover, and start the background loop
    ///
    /// Any failure here is fatal to the caller.
    pub async fn start(self) -> SchedulerResult<SchedulerHandle> {
        self.scheduler
            .store
            .ping()
            .await
            .map_err(|e| SchedulerError::Startup(e.to_string()))?;
        self.recover()
            .await
            .map_err(|e| SchedulerError::Startup(e.to_string()))?;

        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();
        let wake = self.scheduler.wake_handle();
        let loop_cancel = cancel.clone();
        let poll_interval = self.config.poll_interval;
        let reconcile_interval = self.config.reconcile_interval;

        tracker.spawn(async move {
            info!(poll_ms = poll_interval.as_millis() as u64, "Scheduler loop started");
            let mut last_sweep = tokio::time::Instant::now();
            loop {
                if loop_cancel.is_cancelled() {
                    break;
                }
                if let Err(e) = self.tick().await {
                    error!(error = %e, "Scheduler tick failed");
                }
                if reconcile_interval.is_some_and(|every| last_sweep.elapsed() >= every) {
                    self.reconcile().await;
                    last_sweep = tokio::time::Instant::now();
                }
                tokio::select! {
                    biased;
                    _ = loop_cancel.cancelled() => break,
                    _ = wake.notified() => {}
                    _ = tokio::time::sleep(poll_interval) => {}
                }
            }
            info!("Scheduler loop stopped");
        });
        tracker.close();

        Ok(SchedulerHandle { cancel, tracker })
    }
}

/// Lifecycle handle of a running scheduler loop
pub struct SchedulerHandle {
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl SchedulerHandle {
    /// Token that stops the loop when cancelled
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop polling and wait for in-flight dispatches to finish
    pub async fn shutdown(self) {
        self.cancel.cancel();
        self.tracker.wait().await;
    }
}
