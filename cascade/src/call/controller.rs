//! Voice call cascade for one watcher at a time
//!
//! Each call alert walks attempts `1..=max_retries`. An attempt is placed
//! through the outbox, guarded by a scheduled ring timeout, and closed by
//! whichever of {hangup webhook, ring timeout} arrives first. Only the
//! closer runs the follow-up, which either schedules the next attempt or
//! fails the alert.

use std::sync::Arc;

use chrono::Duration;
use rusqlite::Connection;
use tracing::{debug, info, warn};

use crate::call::hangup::classify_hangup;
use crate::clock::SharedClock;
use crate::config::CascadeConfig;
use crate::error::CascadeResult;
use crate::events::{CascadeEvent, SharedEventBus};
use crate::incident::SharedIncidentMachine;
use crate::intent::AckIntent;
use crate::ledger::{derive_key, DispatchOutcome, Ledger};
use crate::providers::{CallControl, SharedTelephony};
use crate::scheduler::{jobs, ScheduledAction, Scheduler};
use crate::store::attempts::{self, BeginOutcome, NewAttempt};
use crate::store::{
    alerts, incidents, links, Alert, AlertStatus, CallAttempt, CallResult, Channel, Incident, LinkStatus,
    SharedStore, StoreResult, Watcher, WatcherLink,
};

/// A normalised telephony event for a known attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallEvent {
    Answered,
    Digits(String),
    Hangup { cause: Option<String> },
}

/// Result of [`CallController::initiate`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InitiateOutcome {
    /// The call is placed (or was already placed) and a ring timeout is armed
    Placed { attempt_id: String, call_id: Option<String> },
    /// Another worker is placing this exact attempt
    InFlight,
    /// Nothing to do: incident or alert closed, or attempt already finished
    Skipped(&'static str),
    /// The alert could not proceed and was failed
    AlertFailed(String),
    /// The provider refused the call; the follow-up has run
    ProviderFailed(String),
}

/// What the digits of an answered call did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigitsOutcome {
    Acknowledged,
    /// Acknowledge lost the race (incident already terminal)
    AlreadyClosed,
    Declined,
    Ignored,
}

struct CallContext {
    incident: Incident,
    alert: Alert,
    link: Option<WatcherLink>,
    watcher: Option<Watcher>,
}

fn load_context(conn: &Connection, alert_id: &str) -> StoreResult<Option<CallContext>> {
    let Some(alert) = alerts::get(conn, alert_id)? else {
        return Ok(None);
    };
    let Some(incident) = incidents::get(conn, &alert.incident_id)? else {
        return Ok(None);
    };
    let link = links::get_link(conn, &incident.subject_id, &alert.watcher_id)?;
    let watcher = links::get_watcher(conn, &alert.watcher_id)?;
    Ok(Some(CallContext {
        incident,
        alert,
        link,
        watcher,
    }))
}

pub type SharedCallController = Arc<CallController>;

pub struct CallController {
    store: SharedStore,
    clock: SharedClock,
    scheduler: Scheduler,
    ledger: Ledger,
    telephony: SharedTelephony,
    incidents: SharedIncidentMachine,
    events: SharedEventBus,
    config: Arc<CascadeConfig>,
}

impl CallController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: SharedStore,
        clock: SharedClock,
        scheduler: Scheduler,
        ledger: Ledger,
        telephony: SharedTelephony,
        incidents: SharedIncidentMachine,
        events: SharedEventBus,
        config: Arc<CascadeConfig>,
    ) -> Self {
        Self {
            store,
            clock,
            scheduler,
            ledger,
            telephony,
            incidents,
            events,
            config,
        }
    }

    pub fn shared(self) -> SharedCallController {
        Arc::new(self)
    }

    async fn context(&self, alert_id: &str) -> CascadeResult<Option<CallContext>> {
        let alert_id = alert_id.to_string();
        Ok(self.store.run(move |conn| load_context(conn, &alert_id)).await?)
    }

    // ── Placing calls ──

    /// Place attempt `attempt_no` of a call alert
    pub async fn initiate(&self, alert_id: &str, attempt_no: u32) -> CascadeResult<InitiateOutcome> {
        let Some(ctx) = self.context(alert_id).await? else {
            warn!(alert_id, "Call alert not found");
            return Ok(InitiateOutcome::Skipped("alert not found"));
        };
        if !ctx.incident.is_active() {
            return Ok(InitiateOutcome::Skipped("incident closed"));
        }
        if !ctx.alert.status.is_open() {
            return Ok(InitiateOutcome::Skipped("alert closed"));
        }
        let link = match ctx.link {
            Some(link) if link.status == LinkStatus::Active && link.call_enabled => link,
            _ => return self.fail_alert(&ctx.alert, "watcher link no longer active").await,
        };
        let Some(phone) = ctx.watcher.and_then(|w| w.phone_number).filter(|p| !p.trim().is_empty()) else {
            return self.fail_alert(&ctx.alert, "watcher has no phone number").await;
        };

        let new = NewAttempt {
            alert_id: ctx.alert.id.clone(),
            incident_id: ctx.incident.id.clone(),
            attempt_no,
            destination: phone.clone(),
            ring_sec: link.ring_timeout_sec,
        };
        let cap = self.config.max_total_ring_sec;
        let now = self.clock.now();
        let begun = self
            .store
            .run(move |conn| attempts::begin(conn, &new, cap, now))
            .await?;

        let attempt = match begun {
            BeginOutcome::Started(attempt) => attempt,
            BeginOutcome::Duplicate(attempt) if attempt.is_closed() => {
                debug!(alert_id, attempt_no, "Attempt already finished");
                return Ok(InitiateOutcome::Skipped("attempt already finished"));
            }
            BeginOutcome::Duplicate(attempt) => attempt,
            BeginOutcome::RingCapReached { used_sec } => {
                info!(incident_id = %ctx.incident.id, used_sec, cap, "Incident ring budget exhausted");
                return self.fail_alert(&ctx.alert, "incident ring budget exhausted").await;
            }
            BeginOutcome::IncidentClosed => return Ok(InitiateOutcome::Skipped("incident closed")),
            BeginOutcome::AlertClosed(_) => return Ok(InitiateOutcome::Skipped("alert closed")),
        };

        let key = derive_key(
            Channel::Call,
            &[&ctx.incident.id, &ctx.alert.watcher_id, &attempt_no.to_string()],
        );
        let webhook_url = self.config.call_webhook_for(&attempt.id);
        let caller_id = self.config.caller_id.clone();
        let telephony = Arc::clone(&self.telephony);
        let outcome = self
            .ledger
            .dispatch(&key, Channel::Call, || {
                let key = key.clone();
                async move { telephony.create_call(&phone, &caller_id, &webhook_url, &key).await }
            })
            .await?;

        match &outcome {
            DispatchOutcome::Dispatched(_) | DispatchOutcome::AlreadySent(_) => {
                let call_id = outcome.provider_id().map(str::to_string);
                if let Some(ref call_id) = call_id {
                    let (attempt_id, call) = (attempt.id.clone(), call_id.clone());
                    self.store
                        .run(move |conn| attempts::set_provider_call_id(conn, &attempt_id, &call))
                        .await?;
                    self.events.publish(CascadeEvent::CallPlaced {
                        incident_id: ctx.incident.id.clone(),
                        alert_id: ctx.alert.id.clone(),
                        attempt_no,
                        provider_call_id: call_id.clone(),
                        timestamp: now,
                    });
                }
                let run_at = attempt.started_at + Duration::seconds(i64::from(link.ring_timeout_sec));
                self.scheduler
                    .schedule(
                        &ctx.incident.id,
                        &ScheduledAction::RingTimeout {
                            alert_id: ctx.alert.id.clone(),
                            attempt_no,
                        },
                        run_at,
                    )
                    .await?;
                info!(
                    incident_id = %ctx.incident.id,
                    watcher_id = %ctx.alert.watcher_id,
                    attempt_no,
                    "Call placed"
                );
                Ok(InitiateOutcome::Placed {
                    attempt_id: attempt.id,
                    call_id,
                })
            }
            DispatchOutcome::InFlight => Ok(InitiateOutcome::InFlight),
            DispatchOutcome::Failed(e) => {
                let attempt_id = attempt.id.clone();
                let closed = self
                    .store
                    .run(move |conn| attempts::close(conn, &attempt_id, CallResult::Failed, now))
                    .await?;
                if let Some(closed) = closed {
                    self.publish_ended(&closed);
                    self.follow_up(&closed, true).await?;
                }
                Ok(InitiateOutcome::ProviderFailed(e.to_string()))
            }
        }
    }

    // ── Provider events ──

    /// Apply a telephony event to an attempt
    pub async fn on_event(&self, attempt: CallAttempt, event: CallEvent) -> CascadeResult<()> {
        match event {
            CallEvent::Answered => self.on_answered(&attempt).await,
            CallEvent::Digits(digits) => self.on_digits(&attempt, &digits).await.map(|_| ()),
            CallEvent::Hangup { cause } => self.on_hangup(&attempt, cause.as_deref()).await,
        }
    }

    pub async fn on_answered(&self, attempt: &CallAttempt) -> CascadeResult<()> {
        let now = self.clock.now();
        let attempt_id = attempt.id.clone();
        let incident_id = attempt.incident_id.clone();
        let (answered, active) = self
            .store
            .run(move |conn| {
                let answered = attempts::mark_answered(conn, &attempt_id, now)?;
                let active = incidents::get(conn, &incident_id)?.is_some_and(|i| i.is_active());
                Ok((answered, active))
            })
            .await?;
        if !answered {
            debug!(attempt_id = %attempt.id, "Answer event for a settled attempt");
            return Ok(());
        }
        debug!(attempt_id = %attempt.id, "Call answered");

        let Some(call_id) = attempt.provider_call_id.as_deref() else {
            return Ok(());
        };
        if !active {
            self.hangup_best_effort(call_id).await;
            return Ok(());
        }
        let speak = CallControl::Speak {
            text: self.config.voice_prompt.clone(),
        };
        let gather = CallControl::GatherDigits {
            max_digits: 1,
            timeout_sec: self.config.gather_timeout_sec,
        };
        for command in [speak, gather] {
            if let Err(e) = self.telephony.control(call_id, &command).await {
                warn!(call_id, error = %e, "Call control failed");
                break;
            }
        }
        Ok(())
    }

    pub async fn on_digits(&self, attempt: &CallAttempt, digits: &str) -> CascadeResult<DigitsOutcome> {
        let attempt_id = attempt.id.clone();
        let pressed = digits.to_string();
        let alert_id = attempt.alert_id.clone();
        let alert = self
            .store
            .run(move |conn| {
                attempts::record_digits(conn, &attempt_id, &pressed)?;
                alerts::get(conn, &alert_id)
            })
            .await?;
        let Some(alert) = alert else {
            return Ok(DigitsOutcome::Ignored);
        };

        let outcome = match AckIntent::from_digits(digits) {
            Some(AckIntent::Acknowledge) => {
                if self.incidents.acknowledge(&alert.incident_id, &alert.watcher_id).await? {
                    if self.config.hangup_on_ack {
                        self.hangup_others(&alert.incident_id, &attempt.id).await?;
                    }
                    DigitsOutcome::Acknowledged
                } else {
                    DigitsOutcome::AlreadyClosed
                }
            }
            Some(AckIntent::Decline) => {
                self.decline(&alert).await?;
                DigitsOutcome::Declined
            }
            None => {
                debug!(attempt_id = %attempt.id, digits, "Digits carry no intent");
                return Ok(DigitsOutcome::Ignored);
            }
        };

        if let Some(call_id) = attempt.provider_call_id.as_deref() {
            self.hangup_best_effort(call_id).await;
        }
        Ok(outcome)
    }

    /// Mark a watcher's call alert declined and stop its retries
    pub async fn decline(&self, alert: &Alert) -> CascadeResult<bool> {
        let now = self.clock.now();
        let alert_id = alert.id.clone();
        let declined = self
            .store
            .run(move |conn| {
                alerts::transition(
                    conn,
                    &alert_id,
                    &[AlertStatus::Pending, AlertStatus::Sent],
                    AlertStatus::Declined,
                    now,
                )
            })
            .await?;
        if !declined {
            return Ok(false);
        }
        self.scheduler.cancel_for_alert(&alert.id).await?;
        info!(incident_id = %alert.incident_id, watcher_id = %alert.watcher_id, "Watcher declined");
        self.events.publish(CascadeEvent::AlertDeclined {
            incident_id: alert.incident_id.clone(),
            alert_id: alert.id.clone(),
            watcher_id: alert.watcher_id.clone(),
            timestamp: now,
        });
        self.incidents.exhaust_if_settled(&alert.incident_id).await?;
        Ok(true)
    }

    pub async fn on_hangup(&self, attempt: &CallAttempt, cause: Option<&str>) -> CascadeResult<()> {
        let now = self.clock.now();
        let attempt_id = attempt.id.clone();
        let cause = cause.map(str::to_string);
        let closed = self
            .store
            .run(move |conn| {
                let Some(current) = attempts::get(conn, &attempt_id)? else {
                    return Ok(None);
                };
                let answered = current.answered_at.is_some() || current.result == Some(CallResult::Answered);
                let result = classify_hangup(cause.as_deref(), answered);
                attempts::close(conn, &attempt_id, result, now)
            })
            .await?;

        let Some(closed) = closed else {
            debug!(attempt_id = %attempt.id, "Late hangup for a closed attempt");
            return Ok(());
        };
        self.publish_ended(&closed);
        let retryable = closed.result.is_some_and(CallResult::is_retryable);
        self.follow_up(&closed, retryable).await
    }

    /// A placed call rang for its full timeout
    pub async fn on_ring_timeout(&self, alert_id: &str, attempt_no: u32) -> CascadeResult<()> {
        let now = self.clock.now();
        let alert = alert_id.to_string();
        let closed = self
            .store
            .run(move |conn| {
                let Some(attempt) = attempts::find(conn, &alert, attempt_no)? else {
                    return Ok(None);
                };
                attempts::close_unanswered(conn, &attempt.id, CallResult::NoAnswer, now)
            })
            .await?;
        let Some(closed) = closed else {
            return Ok(());
        };

        debug!(alert_id, attempt_no, "Ring timeout closed attempt");
        if let Some(call_id) = closed.provider_call_id.as_deref() {
            self.hangup_best_effort(call_id).await;
        }
        self.publish_ended(&closed);
        self.follow_up(&closed, true).await
    }

    // ── Recovery ──

    /// Move a call alert on when no scheduled job is left to do it
    ///
    /// An open unanswered attempt is closed as if its ring timed out, a lost
    /// retry is placed now, and an alert with nothing left to try is failed
    /// with `reason`. Returns false when the alert needed nothing.
    pub async fn resume(&self, alert_id: &str, reason: &str) -> CascadeResult<bool> {
        let Some(ctx) = self.context(alert_id).await? else {
            return Ok(false);
        };
        if !ctx.incident.is_active() || !ctx.alert.status.is_open() || ctx.alert.channel != Channel::Call {
            return Ok(false);
        }
        let id = alert_id.to_string();
        let (live, last) = self
            .store
            .run(move |conn| {
                let live = jobs::has_live_for_alert(conn, &id)?;
                Ok((live, attempts::list_for_alert(conn, &id)?.pop()))
            })
            .await?;
        if live {
            return Ok(false);
        }

        let max_retries = ctx.link.as_ref().map_or(0, |l| l.max_retries);
        match last {
            None => {
                self.initiate(alert_id, 1).await?;
            }
            Some(attempt) if !attempt.is_closed() => {
                if attempt.answered_at.is_some() {
                    return Ok(false);
                }
                self.on_ring_timeout(alert_id, attempt.attempt_no).await?;
            }
            Some(attempt)
                if attempt.result.is_some_and(CallResult::is_retryable) && attempt.attempt_no < max_retries =>
            {
                self.initiate(alert_id, attempt.attempt_no + 1).await?;
            }
            Some(_) => {}
        }

        let id = alert_id.to_string();
        if self.store.run(move |conn| alerts::call_is_stalled(conn, &id)).await? {
            self.fail_alert(&ctx.alert, reason).await?;
        }
        info!(incident_id = %ctx.incident.id, alert_id, "Resumed stalled call alert");
        Ok(true)
    }

    // ── Follow-up ──

    /// Schedule the next attempt or fail the alert
    async fn follow_up(&self, attempt: &CallAttempt, retryable: bool) -> CascadeResult<()> {
        let Some(ctx) = self.context(&attempt.alert_id).await? else {
            return Ok(());
        };
        if !ctx.incident.is_active() || !ctx.alert.status.is_open() {
            return Ok(());
        }
        let Some(link) = ctx.link.filter(|l| l.status == LinkStatus::Active) else {
            self.fail_alert(&ctx.alert, "watcher link no longer active").await?;
            return Ok(());
        };

        let incident_id = ctx.incident.id.clone();
        let used = self
            .store
            .run(move |conn| attempts::ring_used(conn, &incident_id))
            .await?;
        let budget_left = used.saturating_add(link.ring_timeout_sec) <= self.config.max_total_ring_sec;

        if retryable && attempt.attempt_no < link.max_retries && budget_left {
            let delay = i64::from(link.retry_backoff_sec) * i64::from(attempt.attempt_no);
            let run_at = self.clock.now() + Duration::seconds(delay);
            let next = attempt.attempt_no + 1;
            let scheduled = self
                .scheduler
                .schedule(
                    &ctx.incident.id,
                    &ScheduledAction::RetryCall {
                        alert_id: ctx.alert.id.clone(),
                        attempt_no: next,
                    },
                    run_at,
                )
                .await?;
            if scheduled.is_some() {
                let (alert_id, now) = (ctx.alert.id.clone(), self.clock.now());
                self.store
                    .run(move |conn| alerts::set_next_attempt(conn, &alert_id, Some(run_at), now))
                    .await?;
                info!(incident_id = %ctx.incident.id, watcher_id = %ctx.alert.watcher_id, next, %run_at, "Retry scheduled");
                self.events.publish(CascadeEvent::RetryScheduled {
                    incident_id: ctx.incident.id.clone(),
                    alert_id: ctx.alert.id.clone(),
                    attempt_no: next,
                    run_at,
                });
            }
            return Ok(());
        }

        let reason = if !retryable {
            "call ended without acknowledgment"
        } else if !budget_left {
            "incident ring budget exhausted"
        } else {
            "retries exhausted"
        };
        self.fail_alert(&ctx.alert, reason).await?;
        Ok(())
    }

    async fn fail_alert(&self, alert: &Alert, reason: &str) -> CascadeResult<InitiateOutcome> {
        let now = self.clock.now();
        let alert_id = alert.id.clone();
        let failed = self
            .store
            .run(move |conn| {
                alerts::transition(
                    conn,
                    &alert_id,
                    &[AlertStatus::Pending, AlertStatus::Sent],
                    AlertStatus::Failed,
                    now,
                )
            })
            .await?;
        if failed {
            info!(incident_id = %alert.incident_id, watcher_id = %alert.watcher_id, reason, "Call alert failed");
            self.events.publish(CascadeEvent::AlertFailed {
                incident_id: alert.incident_id.clone(),
                alert_id: alert.id.clone(),
                watcher_id: alert.watcher_id.clone(),
                reason: reason.to_string(),
                timestamp: now,
            });
            self.incidents.exhaust_if_settled(&alert.incident_id).await?;
        }
        Ok(InitiateOutcome::AlertFailed(reason.to_string()))
    }

    fn publish_ended(&self, attempt: &CallAttempt) {
        if let Some(result) = attempt.result {
            self.events.publish(CascadeEvent::CallEnded {
                incident_id: attempt.incident_id.clone(),
                alert_id: attempt.alert_id.clone(),
                attempt_no: attempt.attempt_no,
                result,
                timestamp: attempt.ended_at.unwrap_or_else(|| self.clock.now()),
            });
        }
    }

    async fn hangup_best_effort(&self, call_id: &str) {
        if let Err(e) = self.telephony.control(call_id, &CallControl::Hangup).await {
            debug!(call_id, error = %e, "Hangup request failed");
        }
    }

    /// Hang up every live call of the incident except `keep_attempt_id`
    pub async fn hangup_others(&self, incident_id: &str, keep_attempt_id: &str) -> CascadeResult<usize> {
        let id = incident_id.to_string();
        let live = self.store.run(move |conn| attempts::list_in_flight(conn, &id)).await?;
        let mut count = 0;
        for attempt in live.iter().filter(|a| a.id != keep_attempt_id) {
            if let Some(call_id) = attempt.provider_call_id.as_deref() {
                self.hangup_best_effort(call_id).await;
                count += 1;
            }
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::events::EventBus;
    use crate::incident::IncidentMachine;
    use crate::providers::{MockTelephony, ProviderError};
    use crate::store::Store;

    struct Harness {
        controller: CallController,
        store: SharedStore,
        scheduler: Scheduler,
        clock: Arc<ManualClock>,
        incident_id: String,
        alert_id: String,
    }

    async fn harness(telephony: MockTelephony, link: WatcherLink) -> Harness {
        let clock = Arc::new(ManualClock::at_epoch());
        let shared_clock: SharedClock = clock.clone();
        let store = Store::open_in_memory().unwrap().shared();
        let events = EventBus::new().shared();
        let config = Arc::new(CascadeConfig::default());
        let scheduler = Scheduler::new(store.clone(), shared_clock.clone());
        let ledger = Ledger::new(store.clone(), shared_clock.clone());
        let machine = IncidentMachine::new(store.clone(), shared_clock.clone(), events.clone(), &config).shared();

        let incident_id = machine.create("s").await.unwrap().incident.id;
        let now = clock.now();
        let (iid, watcher_id) = (incident_id.clone(), link.watcher_id.clone());
        let alert_id = store
            .run(move |conn| {
                links::upsert_link(conn, &link)?;
                links::upsert_watcher(
                    conn,
                    &Watcher {
                        watcher_id: watcher_id.clone(),
                        chat_id: None,
                        phone_number: Some("+15550001".into()),
                    },
                )?;
                Ok(alerts::insert_or_get(conn, &iid, &watcher_id, Channel::Call, now)?.0.id)
            })
            .await
            .unwrap();

        let controller = CallController::new(
            store.clone(),
            shared_clock,
            scheduler.clone(),
            ledger,
            Arc::new(telephony),
            machine,
            events,
            config,
        );
        Harness {
            controller,
            store,
            scheduler,
            clock,
            incident_id,
            alert_id,
        }
    }

    #[tokio::test]
    async fn test_initiate_places_call_and_arms_ring_timeout() {
        let mut telephony = MockTelephony::new();
        telephony
            .expect_create_call()
            .times(1)
            .returning(|_, _, _, _| Ok("call-1".to_string()));
        let h = harness(telephony, WatcherLink::new("s", "w1", 1)).await;

        let outcome = h.controller.initiate(&h.alert_id, 1).await.unwrap();
        assert!(matches!(outcome, InitiateOutcome::Placed { call_id: Some(ref id), .. } if id == "call-1"));

        // Replaying the same attempt reuses the stored call id
        let again = h.controller.initiate(&h.alert_id, 1).await.unwrap();
        assert!(matches!(again, InitiateOutcome::Placed { call_id: Some(ref id), .. } if id == "call-1"));

        let pending = h.scheduler.pending_for_incident(&h.incident_id).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].job_id, format!("ring_timeout:{}:1", h.alert_id));
        assert_eq!(pending[0].run_at, h.clock.now() + Duration::seconds(25));
    }

    #[tokio::test]
    async fn test_provider_error_schedules_retry() {
        let mut telephony = MockTelephony::new();
        telephony
            .expect_create_call()
            .times(1)
            .returning(|_, _, _, _| Err(ProviderError::Request("connect refused".into())));
        let h = harness(telephony, WatcherLink::new("s", "w1", 1)).await;

        let outcome = h.controller.initiate(&h.alert_id, 1).await.unwrap();
        assert!(matches!(outcome, InitiateOutcome::ProviderFailed(_)));

        let pending = h.scheduler.pending_for_incident(&h.incident_id).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].job_id, format!("retry_call:{}:2", h.alert_id));
        assert_eq!(pending[0].run_at, h.clock.now() + Duration::seconds(60));
    }

    #[tokio::test]
    async fn test_ring_timeout_then_late_hangup_runs_follow_up_once() {
        let mut telephony = MockTelephony::new();
        telephony
            .expect_create_call()
            .returning(|_, _, _, _| Ok("call-1".to_string()));
        telephony.expect_control().returning(|_, _| Ok(()));
        let h = harness(telephony, WatcherLink::new("s", "w1", 1).with_call_policy(25, 1, 60)).await;

        h.controller.initiate(&h.alert_id, 1).await.unwrap();
        h.clock.advance_secs(25);
        h.controller.on_ring_timeout(&h.alert_id, 1).await.unwrap();

        let alert_id = h.alert_id.clone();
        let attempt = h
            .store
            .run(move |conn| attempts::find(conn, &alert_id, 1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(attempt.result, Some(CallResult::NoAnswer));

        // The late hangup finds the attempt closed and does nothing
        h.controller.on_hangup(&attempt, Some("busy")).await.unwrap();
        let alert_id = h.alert_id.clone();
        let alert = h.store.run(move |conn| alerts::get(conn, &alert_id)).await.unwrap().unwrap();
        assert_eq!(alert.status, AlertStatus::Failed);

        let id = h.incident_id.clone();
        let incident = h.store.run(move |conn| incidents::get(conn, &id)).await.unwrap().unwrap();
        assert_eq!(incident.status, crate::store::IncidentStatus::Exhausted);
    }

    #[tokio::test]
    async fn test_decline_digit_stops_watcher_only() {
        let mut telephony = MockTelephony::new();
        telephony
            .expect_create_call()
            .returning(|_, _, _, _| Ok("call-1".to_string()));
        telephony.expect_control().returning(|_, _| Ok(()));
        let h = harness(telephony, WatcherLink::new("s", "w1", 1)).await;

        h.controller.initiate(&h.alert_id, 1).await.unwrap();
        let alert_id = h.alert_id.clone();
        let attempt = h
            .store
            .run(move |conn| attempts::find(conn, &alert_id, 1))
            .await
            .unwrap()
            .unwrap();

        h.controller.on_answered(&attempt).await.unwrap();
        let outcome = h.controller.on_digits(&attempt, "9").await.unwrap();
        assert_eq!(outcome, DigitsOutcome::Declined);
        assert!(h.scheduler.pending_for_incident(&h.incident_id).await.unwrap().is_empty());

        // Hangup after decline closes the attempt but schedules nothing
        h.controller.on_hangup(&attempt, Some("normal_clearing")).await.unwrap();
        assert!(h.scheduler.pending_for_incident(&h.incident_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_phone_fails_alert() {
        let telephony = MockTelephony::new();
        let h = harness(telephony, WatcherLink::new("s", "w1", 1)).await;
        h.store
            .run(|conn| {
                links::upsert_watcher(
                    conn,
                    &Watcher {
                        watcher_id: "w1".into(),
                        chat_id: None,
                        phone_number: None,
                    },
                )
            })
            .await
            .unwrap();

        let outcome = h.controller.initiate(&h.alert_id, 1).await.unwrap();
        assert_eq!(outcome, InitiateOutcome::AlertFailed("watcher has no phone number".into()));
    }

    async fn skip_due_jobs(h: &Harness) {
        let now = h.clock.now();
        h.store
            .run(move |conn| {
                for job in jobs::claim_due(conn, now, 10)? {
                    jobs::finish_job(conn, &job.job_id, crate::scheduler::JobState::Missed, Some("misfire"), now)?;
                }
                Ok(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_resume_closes_attempt_whose_ring_timeout_was_skipped() {
        let mut telephony = MockTelephony::new();
        telephony
            .expect_create_call()
            .times(1)
            .returning(|_, _, _, _| Ok("call-1".to_string()));
        telephony.expect_control().returning(|_, _| Ok(()));
        let h = harness(telephony, WatcherLink::new("s", "w1", 1)).await;

        h.controller.initiate(&h.alert_id, 1).await.unwrap();
        // A live ring timeout means there is nothing to resume
        assert!(!h.controller.resume(&h.alert_id, "stalled").await.unwrap());

        h.clock.advance_secs(300);
        skip_due_jobs(&h).await;
        assert!(h.controller.resume(&h.alert_id, "stalled").await.unwrap());

        let alert_id = h.alert_id.clone();
        let attempt = h
            .store
            .run(move |conn| attempts::find(conn, &alert_id, 1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(attempt.result, Some(CallResult::NoAnswer));
        let pending = h.scheduler.pending_for_incident(&h.incident_id).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].job_id, format!("retry_call:{}:2", h.alert_id));
    }

    #[tokio::test]
    async fn test_resume_places_lost_retry_then_fails_when_spent() {
        let mut telephony = MockTelephony::new();
        telephony
            .expect_create_call()
            .times(2)
            .returning(|_, _, _, _| Ok("call-1".to_string()));
        telephony.expect_control().returning(|_, _| Ok(()));
        let h = harness(telephony, WatcherLink::new("s", "w1", 1).with_call_policy(25, 2, 60)).await;

        h.controller.initiate(&h.alert_id, 1).await.unwrap();
        h.clock.advance_secs(25);
        h.controller.on_ring_timeout(&h.alert_id, 1).await.unwrap();

        // The retry comes due long after its grace window
        h.clock.advance_secs(600);
        skip_due_jobs(&h).await;
        assert!(h.controller.resume(&h.alert_id, "stalled").await.unwrap());
        let pending = h.scheduler.pending_for_incident(&h.incident_id).await.unwrap();
        assert_eq!(pending[0].job_id, format!("ring_timeout:{}:2", h.alert_id));

        // The last attempt's ring timeout is skipped too; the alert has nothing left
        h.clock.advance_secs(600);
        skip_due_jobs(&h).await;
        assert!(h.controller.resume(&h.alert_id, "stalled").await.unwrap());

        let alert_id = h.alert_id.clone();
        let alert = h.store.run(move |conn| alerts::get(conn, &alert_id)).await.unwrap().unwrap();
        assert_eq!(alert.status, AlertStatus::Failed);
        let id = h.incident_id.clone();
        let incident = h.store.run(move |conn| incidents::get(conn, &id)).await.unwrap().unwrap();
        assert_eq!(incident.status, crate::store::IncidentStatus::Exhausted);
        assert!(!h.controller.resume(&h.alert_id, "stalled").await.unwrap());
    }
}
