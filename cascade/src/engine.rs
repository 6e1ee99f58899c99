//! The engine: one set of entry points for webhooks, the scheduler and the CLI
//!
//! ```text
//!   trigger ──▶ IncidentMachine::create ──▶ Planner::launch
//!                                              ├──▶ chat via Ledger
//!                                              └──▶ CallController::initiate (per watcher)
//!   webhooks ─▶ Ledger inbox ─▶ CallController / acknowledge / decline
//!   scheduler ─▶ ActionHandler ─▶ ring timeout | retry | reminder
//!             └─ skipped job / sweep ─▶ Planner::resume ─▶ CallController::resume
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::call::{CallController, SharedCallController};
use crate::clock::SharedClock;
use crate::config::CascadeConfig;
use crate::error::{CascadeError, CascadeResult};
use crate::events::{CascadeEvent, EventBus, SharedEventBus};
use crate::incident::{IncidentMachine, SharedIncidentMachine, TriggerOutcome};
use crate::ingress::{CallWebhook, ChatWebhook};
use crate::intent::AckIntent;
use crate::ledger::{Inbound, Ledger};
use crate::planner::{Planner, SharedPlanner};
use crate::providers::{SharedChatSender, SharedTelephony};
use crate::scheduler::{
    jobs, ActionHandler, Job, JobState, ScheduledAction, Scheduler, SchedulerConfig, SchedulerRunner,
};
use crate::store::{alerts, attempts, incidents, links, Alert, CallAttempt, Incident, SharedStore};

/// Provider names used as inbox namespaces
pub const TELEPHONY_PROVIDER: &str = "telephony";
pub const CHAT_PROVIDER: &str = "chat";

/// How a webhook was handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookOutcome {
    Processed,
    /// Seen before; no effect
    Duplicate,
    /// Authentic but refers to nothing we track
    Ignored,
    /// Handler failed; recorded on the inbox row
    Failed,
}

impl WebhookOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Processed => "processed",
            Self::Duplicate => "duplicate",
            Self::Ignored => "ignored",
            Self::Failed => "failed",
        }
    }
}

/// Point-in-time view of an incident
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncidentReport {
    pub incident: Incident,
    pub alerts: Vec<Alert>,
    pub attempts: Vec<CallAttempt>,
    pub pending_jobs: Vec<Job>,
    pub ring_used_sec: u32,
}

pub type SharedEngine = Arc<Engine>;

pub struct Engine {
    store: SharedStore,
    clock: SharedClock,
    config: Arc<CascadeConfig>,
    events: SharedEventBus,
    ledger: Ledger,
    scheduler: Scheduler,
    incidents: SharedIncidentMachine,
    calls: SharedCallController,
    planner: SharedPlanner,
}

impl Engine {
    pub fn new(
        store: SharedStore,
        clock: SharedClock,
        config: CascadeConfig,
        chat: SharedChatSender,
        telephony: SharedTelephony,
    ) -> Self {
        let config = Arc::new(config);
        let events = EventBus::new().shared();
        let ledger = Ledger::new(store.clone(), clock.clone())
            .with_stale_after(std::time::Duration::from_secs(u64::from(config.outbox_stale_after_sec)));
        let scheduler = Scheduler::new(store.clone(), clock.clone());
        let incidents = IncidentMachine::new(store.clone(), clock.clone(), events.clone(), &config).shared();
        let calls = CallController::new(
            store.clone(),
            clock.clone(),
            scheduler.clone(),
            ledger.clone(),
            telephony,
            incidents.clone(),
            events.clone(),
            config.clone(),
        )
        .shared();
        let planner = Planner::new(
            store.clone(),
            clock.clone(),
            ledger.clone(),
            scheduler.clone(),
            chat,
            calls.clone(),
            incidents.clone(),
            events.clone(),
            config.clone(),
        )
        .shared();

        Self {
            store,
            clock,
            config,
            events,
            ledger,
            scheduler,
            incidents,
            calls,
            planner,
        }
    }

    pub fn shared(self) -> SharedEngine {
        Arc::new(self)
    }

    pub fn events(&self) -> &SharedEventBus {
        &self.events
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn config(&self) -> &CascadeConfig {
        &self.config
    }

    /// Build a scheduler runner that dispatches into this engine
    pub fn scheduler_runner(self: &Arc<Self>) -> SchedulerRunner {
        SchedulerRunner::new(
            self.scheduler.clone(),
            Arc::clone(self) as Arc<dyn ActionHandler>,
            SchedulerConfig::from(self.config.as_ref()),
        )
    }

    // ── Synchronous API ──

    /// Panic trigger: open (or return) the subject's incident and escalate
    pub async fn trigger(&self, subject_id: &str) -> CascadeResult<TriggerOutcome> {
        let outcome = self.incidents.create(subject_id).await?;
        if outcome.created {
            self.planner.launch(&outcome.incident).await?;
        } else {
            self.planner.ensure_launched(&outcome.incident).await?;
        }
        Ok(outcome)
    }

    pub async fn acknowledge(&self, incident_id: &str, watcher_id: &str) -> CascadeResult<bool> {
        let acknowledged = self.incidents.acknowledge(incident_id, watcher_id).await?;
        if acknowledged && self.config.hangup_on_ack {
            let hung_up = self.calls.hangup_others(incident_id, "").await?;
            debug!(incident_id, hung_up, "Live calls hung up after acknowledgment");
        }
        Ok(acknowledged)
    }

    pub async fn cancel(&self, incident_id: &str, by_whom: &str) -> CascadeResult<bool> {
        self.incidents.cancel(incident_id, by_whom).await
    }

    /// Cancel the subject's active incident, if any
    pub async fn cancel_for_subject(&self, subject_id: &str) -> CascadeResult<bool> {
        match self.incidents.active_for_subject(subject_id).await? {
            Some(incident) => self.cancel(&incident.id, subject_id).await,
            None => Ok(false),
        }
    }

    pub async fn incident(&self, incident_id: &str) -> CascadeResult<Option<Incident>> {
        self.incidents.get(incident_id).await
    }

    pub async fn report(&self, incident_id: &str) -> CascadeResult<IncidentReport> {
        let id = incident_id.to_string();
        let report = self
            .store
            .run(move |conn| {
                let Some(incident) = incidents::get(conn, &id)? else {
                    return Ok(None);
                };
                Ok(Some(IncidentReport {
                    alerts: alerts::list_for_incident(conn, &id)?,
                    attempts: attempts::list_for_incident(conn, &id)?,
                    pending_jobs: jobs::pending_for_incident(conn, &id)?,
                    ring_used_sec: attempts::ring_used(conn, &id)?,
                    incident,
                }))
            })
            .await?;
        report.ok_or_else(|| CascadeError::not_found("incident", incident_id))
    }

    // ── Webhooks ──

    pub async fn handle_call_webhook(&self, hook: &CallWebhook) -> CascadeResult<WebhookOutcome> {
        if hook.event_id.trim().is_empty() {
            return Err(CascadeError::Validation("event_id must not be empty".into()));
        }
        if !self.accept_inbound(TELEPHONY_PROVIDER, &hook.event_id, hook).await? {
            return Ok(WebhookOutcome::Duplicate);
        }
        let result = self.process_call(hook).await;
        self.settle_inbound(TELEPHONY_PROVIDER, &hook.event_id, result).await
    }

    pub async fn handle_chat_webhook(&self, hook: &ChatWebhook) -> CascadeResult<WebhookOutcome> {
        if hook.event_id.trim().is_empty() {
            return Err(CascadeError::Validation("event_id must not be empty".into()));
        }
        if !self.accept_inbound(CHAT_PROVIDER, &hook.event_id, hook).await? {
            return Ok(WebhookOutcome::Duplicate);
        }
        let result = self.process_chat(hook).await;
        self.settle_inbound(CHAT_PROVIDER, &hook.event_id, result).await
    }

    /// Record the event in the inbox; false when it is a redelivery
    async fn accept_inbound<T: Serialize>(&self, provider: &str, event_id: &str, payload: &T) -> CascadeResult<bool> {
        let payload = serde_json::to_string(payload).map_err(|e| CascadeError::Validation(e.to_string()))?;
        match self.ledger.record_inbound(provider, event_id, &payload).await? {
            Inbound::New => Ok(true),
            Inbound::Duplicate => {
                debug!(provider, event_id, "Duplicate webhook ignored");
                self.events.publish(CascadeEvent::InboundDuplicate {
                    provider: provider.to_string(),
                    event_id: event_id.to_string(),
                    timestamp: self.clock.now(),
                });
                Ok(false)
            }
        }
    }

    async fn settle_inbound(
        &self,
        provider: &str,
        event_id: &str,
        result: CascadeResult<WebhookOutcome>,
    ) -> CascadeResult<WebhookOutcome> {
        match result {
            Ok(outcome) => {
                self.ledger.mark_processed(provider, event_id).await?;
                Ok(outcome)
            }
            Err(e) => {
                error!(provider, event_id, error = %e, "Webhook handler failed");
                self.ledger.mark_failed(provider, event_id, &e.to_string()).await?;
                Ok(WebhookOutcome::Failed)
            }
        }
    }

    async fn process_call(&self, hook: &CallWebhook) -> CascadeResult<WebhookOutcome> {
        let (attempt_id, call_id) = (hook.attempt_id.clone(), hook.call_id.clone());
        let attempt = self
            .store
            .run(move |conn| {
                let Some(attempt_id) = attempt_id else {
                    return attempts::find_by_call_id(conn, &call_id);
                };
                let Some(attempt) = attempts::get(conn, &attempt_id)? else {
                    return Ok(None);
                };
                match attempt.provider_call_id.as_deref() {
                    Some(known) if known != call_id => Ok(None),
                    Some(_) => Ok(Some(attempt)),
                    // The webhook can outrun the create-call response
                    None => {
                        attempts::set_provider_call_id(conn, &attempt.id, &call_id)?;
                        attempts::get(conn, &attempt.id)
                    }
                }
            })
            .await?;

        let Some(attempt) = attempt else {
            warn!(call_id = %hook.call_id, "Call webhook for an unknown attempt");
            return Ok(WebhookOutcome::Ignored);
        };
        self.calls.on_event(attempt, hook.event()).await?;
        Ok(WebhookOutcome::Processed)
    }

    async fn process_chat(&self, hook: &ChatWebhook) -> CascadeResult<WebhookOutcome> {
        let parsed = match (&hook.callback_data, &hook.text) {
            (Some(data), _) => AckIntent::from_callback(data).map(|(i, inc)| (i, inc.map(str::to_string))),
            (None, Some(text)) => AckIntent::parse(text).map(|i| (i, None)),
            (None, None) => None,
        };
        let Some((intent, incident_hint)) = parsed else {
            return Ok(WebhookOutcome::Ignored);
        };

        let chat_id = hook.chat_id.clone();
        let resolved = self
            .store
            .run(move |conn| {
                let Some(watcher) = links::find_watcher_by_chat(conn, &chat_id)? else {
                    return Ok(None);
                };
                let open = alerts::list_active_for_watcher(conn, &watcher.watcher_id)?;
                // Newest active incident first, unless the button named one
                let incident_id = match incident_hint {
                    Some(id) => open.iter().find(|a| a.incident_id == id).map(|a| a.incident_id.clone()),
                    None => open.first().map(|a| a.incident_id.clone()),
                };
                Ok(incident_id.map(|id| {
                    let mine = open.into_iter().filter(|a| a.incident_id == id).collect::<Vec<_>>();
                    (watcher.watcher_id, id, mine)
                }))
            })
            .await?;

        let Some((watcher_id, incident_id, mine)) = resolved else {
            debug!(chat_id = %hook.chat_id, "Chat reply matches no active incident");
            return Ok(WebhookOutcome::Ignored);
        };

        match intent {
            AckIntent::Acknowledge => {
                self.acknowledge(&incident_id, &watcher_id).await?;
            }
            AckIntent::Decline => {
                for alert in mine.iter().filter(|a| a.status.is_open()) {
                    self.calls.decline(alert).await?;
                }
            }
        }
        Ok(WebhookOutcome::Processed)
    }
}

#[async_trait]
impl ActionHandler for Engine {
    async fn handle(&self, incident_id: &str, action: &ScheduledAction) -> Result<(), CascadeError> {
        match action {
            ScheduledAction::RingTimeout { alert_id, attempt_no } => {
                self.calls.on_ring_timeout(alert_id, *attempt_no).await
            }
            ScheduledAction::RetryCall { alert_id, attempt_no } => {
                let outcome = self.calls.initiate(alert_id, *attempt_no).await?;
                info!(incident_id, alert_id = %alert_id, attempt_no, ?outcome, "Retry call");
                Ok(())
            }
            ScheduledAction::Reminder { round } => self.planner.remind(incident_id, *round).await.map(|_| ()),
        }
    }

    async fn on_skipped(
        &self,
        incident_id: &str,
        action: &ScheduledAction,
        state: JobState,
    ) -> Result<(), CascadeError> {
        match action {
            ScheduledAction::RingTimeout { alert_id, .. } | ScheduledAction::RetryCall { alert_id, .. } => {
                let resumed = self.calls.resume(alert_id, "scheduled call work was skipped").await?;
                debug!(incident_id, alert_id = %alert_id, state = state.as_str(), resumed, "Call alert repaired");
                Ok(())
            }
            ScheduledAction::Reminder { round } => self.planner.skip_reminder(incident_id, *round).await,
        }
    }

    async fn reconcile(&self) -> Result<usize, CascadeError> {
        let grace = chrono::Duration::from_std(self.config.misfire_grace())
            .unwrap_or_else(|_| chrono::Duration::zero());
        let cutoff = self.clock.now() - grace;
        let active = self.store.run(|conn| incidents::list_active(conn)).await?;
        let mut repaired = 0;
        // Younger incidents may still be mid-launch
        for incident in active.iter().filter(|i| i.created_at <= cutoff) {
            match self.planner.resume(incident, cutoff).await {
                Ok(true) => repaired += 1,
                Ok(false) => {}
                Err(e) => error!(incident_id = %incident.id, error = %e, "Resuming incident failed"),
            }
        }
        Ok(repaired)
    }
}
