//! Escalation planner
//!
//! Fans an incident out to every active watcher link: one alert per enabled
//! channel, chat messages sent right away, one call cascade per watcher
//! started concurrently, and a reminder round scheduled for chat.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use futures::future::join_all;
use tracing::{error, info, warn};

use crate::call::{InitiateOutcome, SharedCallController};
use crate::clock::SharedClock;
use crate::config::CascadeConfig;
use crate::error::CascadeResult;
use crate::events::{CascadeEvent, SharedEventBus};
use crate::incident::SharedIncidentMachine;
use crate::intent::AckIntent;
use crate::ledger::{derive_key, DispatchOutcome, Ledger};
use crate::providers::{ChatButton, SharedChatSender};
use crate::scheduler::{ScheduledAction, Scheduler};
use crate::store::{alerts, links, Alert, AlertStatus, Channel, Incident, SharedStore, Watcher};

/// What [`Planner::launch`] did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LaunchReport {
    pub watchers: usize,
    pub alerts: usize,
    pub chats_sent: usize,
    pub calls_placed: usize,
}

pub type SharedPlanner = Arc<Planner>;

pub struct Planner {
    store: SharedStore,
    clock: SharedClock,
    ledger: Ledger,
    scheduler: Scheduler,
    chat: SharedChatSender,
    calls: SharedCallController,
    incidents: SharedIncidentMachine,
    events: SharedEventBus,
    config: Arc<CascadeConfig>,
}

impl Planner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: SharedStore,
        clock: SharedClock,
        ledger: Ledger,
        scheduler: Scheduler,
        chat: SharedChatSender,
        calls: SharedCallController,
        incidents: SharedIncidentMachine,
        events: SharedEventBus,
        config: Arc<CascadeConfig>,
    ) -> Self {
        Self {
            store,
            clock,
            ledger,
            scheduler,
            chat,
            calls,
            incidents,
            events,
            config,
        }
    }

    pub fn shared(self) -> SharedPlanner {
        Arc::new(self)
    }

    /// Open alerts for every active watcher and start delivery
    ///
    /// Replaying a launch is harmless: alerts are insert-or-get, chat sends
    /// and call placements go through the outbox.
    pub async fn launch(&self, incident: &Incident) -> CascadeResult<LaunchReport> {
        let now = self.clock.now();
        let (incident_id, subject_id) = (incident.id.clone(), incident.subject_id.clone());
        let planned = self
            .store
            .run(move |conn| {
                let mut planned = Vec::new();
                let ranked = links::active_links_for_subject(conn, &subject_id)?;
                let watchers = ranked.len();
                for link in ranked {
                    let watcher = links::get_watcher(conn, &link.watcher_id)?;
                    let channels = [(link.chat_enabled, Channel::Chat), (link.call_enabled, Channel::Call)];
                    for (_, channel) in channels.into_iter().filter(|(enabled, _)| *enabled) {
                        let (alert, _) = alerts::insert_or_get(conn, &incident_id, &link.watcher_id, channel, now)?;
                        planned.push((alert, watcher.clone()));
                    }
                }
                Ok((watchers, planned))
            })
            .await?;
        let (watchers, planned) = planned;

        let mut report = LaunchReport {
            watchers,
            alerts: planned.len(),
            ..LaunchReport::default()
        };
        if planned.is_empty() {
            warn!(incident_id = %incident.id, subject_id = %incident.subject_id, "Subject has no reachable watchers");
            self.events.publish(CascadeEvent::NoWatchers {
                incident_id: incident.id.clone(),
                subject_id: incident.subject_id.clone(),
                timestamp: now,
            });
            if self.config.exhaust_when_no_watchers {
                self.incidents.exhaust(&incident.id).await?;
            }
            return Ok(report);
        }

        let has_chat = planned.iter().any(|(a, _)| a.channel == Channel::Chat);
        if has_chat && self.config.max_reminders > 0 {
            self.schedule_reminder(&incident.id, 1).await?;
        }

        let chats = planned
            .iter()
            .filter(|(a, _)| a.channel == Channel::Chat)
            .map(|(alert, watcher)| self.send_chat(incident, alert, watcher.as_ref(), 0));
        let calls = planned
            .iter()
            .filter(|(a, _)| a.channel == Channel::Call)
            .map(|(alert, _)| self.calls.initiate(&alert.id, 1));

        let (chat_results, call_results) = futures::join!(join_all(chats), join_all(calls));
        for result in chat_results {
            match result {
                Ok(true) => report.chats_sent += 1,
                Ok(false) => {}
                Err(e) => error!(incident_id = %incident.id, error = %e, "Chat alert dispatch failed"),
            }
        }
        for result in call_results {
            match result {
                Ok(InitiateOutcome::Placed { .. }) => report.calls_placed += 1,
                Ok(_) => {}
                Err(e) => error!(incident_id = %incident.id, error = %e, "Call cascade failed to start"),
            }
        }

        info!(
            incident_id = %incident.id,
            watchers = report.watchers,
            chats = report.chats_sent,
            calls = report.calls_placed,
            "Escalation launched"
        );
        Ok(report)
    }

    /// Run reminder round `round`
    pub async fn remind(&self, incident_id: &str, round: u32) -> CascadeResult<usize> {
        let Some(incident) = self.incidents.get(incident_id).await? else {
            return Ok(0);
        };
        if !incident.is_active() {
            return Ok(0);
        }

        let id = incident.id.clone();
        let targets = self
            .store
            .run(move |conn| {
                let mut targets = Vec::new();
                for alert in alerts::list_for_incident(conn, &id)? {
                    let resend = alert.channel == Channel::Chat
                        && matches!(alert.status, AlertStatus::Pending | AlertStatus::Sent | AlertStatus::Failed);
                    if resend {
                        let watcher = links::get_watcher(conn, &alert.watcher_id)?;
                        targets.push((alert, watcher));
                    }
                }
                Ok(targets)
            })
            .await?;

        let sends = targets
            .iter()
            .map(|(alert, watcher)| self.send_chat(&incident, alert, watcher.as_ref(), round));
        let sent = join_all(sends)
            .await
            .into_iter()
            .filter(|r| matches!(r, Ok(true)))
            .count();

        self.events.publish(CascadeEvent::ReminderSent {
            incident_id: incident.id.clone(),
            round,
            timestamp: self.clock.now(),
        });
        info!(incident_id = %incident.id, round, sent, "Reminder round sent");

        if round < self.config.max_reminders {
            self.schedule_reminder(&incident.id, round + 1).await?;
        } else {
            self.incidents.exhaust_if_settled(&incident.id).await?;
        }
        Ok(sent)
    }

    /// A reminder round came due outside its grace window and was dropped
    ///
    /// Later rounds still go out; after the last one the incident exhausts
    /// once nothing else is open.
    pub async fn skip_reminder(&self, incident_id: &str, round: u32) -> CascadeResult<()> {
        let Some(incident) = self.incidents.get(incident_id).await? else {
            return Ok(());
        };
        if !incident.is_active() {
            return Ok(());
        }
        warn!(incident_id, round, "Reminder round skipped");
        if round < self.config.max_reminders {
            self.schedule_reminder(incident_id, round + 1).await
        } else {
            self.incidents.exhaust_if_settled(incident_id).await.map(|_| ())
        }
    }

    /// Launch an active incident whose alerts were never opened
    ///
    /// Covers a process that died between creating the incident and
    /// launching it. Returns the launch report when a launch ran.
    pub async fn ensure_launched(&self, incident: &Incident) -> CascadeResult<Option<LaunchReport>> {
        if !incident.is_active() {
            return Ok(None);
        }
        let id = incident.id.clone();
        let existing = self.store.run(move |conn| alerts::list_for_incident(conn, &id)).await?;
        if !existing.is_empty() {
            return Ok(None);
        }
        warn!(incident_id = %incident.id, "Active incident has no alerts; launching");
        self.launch(incident).await.map(Some)
    }

    /// Pick up an active incident whose escalation stopped moving
    ///
    /// Alerts are considered once their next attempt (or last change) is at
    /// or before `cutoff`. Returns true when anything was done.
    pub async fn resume(&self, incident: &Incident, cutoff: DateTime<Utc>) -> CascadeResult<bool> {
        let (id, subject_id) = (incident.id.clone(), incident.subject_id.clone());
        let (unlaunched, stalled) = self
            .store
            .run(move |conn| {
                if alerts::list_for_incident(conn, &id)?.is_empty() {
                    // A subject without watchers has nothing to launch
                    let reachable = !links::active_links_for_subject(conn, &subject_id)?.is_empty();
                    return Ok((reachable, Vec::new()));
                }
                let mut stalled = Vec::new();
                for alert in alerts::list_stalled(conn, &id, cutoff)? {
                    let watcher = links::get_watcher(conn, &alert.watcher_id)?;
                    stalled.push((alert, watcher));
                }
                Ok((false, stalled))
            })
            .await?;
        if unlaunched {
            return Ok(self.ensure_launched(incident).await?.is_some());
        }

        let mut resumed = false;
        for (alert, watcher) in &stalled {
            match alert.channel {
                Channel::Chat => {
                    self.send_chat(incident, alert, watcher.as_ref(), 0).await?;
                    resumed = true;
                }
                Channel::Call => {
                    resumed |= self.calls.resume(&alert.id, "escalation stalled").await?;
                }
            }
        }
        if resumed {
            info!(incident_id = %incident.id, alerts = stalled.len(), "Stalled escalation resumed");
        }
        Ok(self.incidents.exhaust_if_settled(&incident.id).await? || resumed)
    }

    async fn schedule_reminder(&self, incident_id: &str, round: u32) -> CascadeResult<()> {
        let run_at = self.clock.now() + Duration::seconds(i64::from(self.config.reminder_interval_sec));
        self.scheduler
            .schedule(incident_id, &ScheduledAction::Reminder { round }, run_at)
            .await?;
        Ok(())
    }

    /// Send one chat alert; true when the provider accepted it (now or earlier)
    async fn send_chat(
        &self,
        incident: &Incident,
        alert: &Alert,
        watcher: Option<&Watcher>,
        round: u32,
    ) -> CascadeResult<bool> {
        let Some(chat_id) = watcher.and_then(|w| w.chat_id.clone()) else {
            if round == 0 {
                self.fail_chat(alert, "watcher has no chat id").await?;
            }
            return Ok(false);
        };

        let key = derive_key(
            Channel::Chat,
            &[&incident.id, &alert.watcher_id, "round", &round.to_string()],
        );
        let text = self.config.chat_text(&incident.subject_id);
        let buttons = vec![
            ChatButton::new("I'm on it", AckIntent::Acknowledge.callback_data(&incident.id)),
            ChatButton::new("Can't help", AckIntent::Decline.callback_data(&incident.id)),
        ];
        let chat = Arc::clone(&self.chat);
        let outcome = self
            .ledger
            .dispatch(&key, Channel::Chat, || async move { chat.send(&chat_id, &text, &buttons).await })
            .await?;

        match outcome {
            DispatchOutcome::Dispatched(_) | DispatchOutcome::AlreadySent(_) => {
                let (alert_id, now) = (alert.id.clone(), self.clock.now());
                let promoted = self
                    .store
                    .run(move |conn| {
                        alerts::transition(
                            conn,
                            &alert_id,
                            &[AlertStatus::Pending, AlertStatus::Failed],
                            AlertStatus::Sent,
                            now,
                        )
                    })
                    .await?;
                if promoted || round > 0 {
                    self.events.publish(CascadeEvent::AlertDispatched {
                        incident_id: incident.id.clone(),
                        alert_id: alert.id.clone(),
                        watcher_id: alert.watcher_id.clone(),
                        channel: Channel::Chat,
                        timestamp: now,
                    });
                }
                Ok(true)
            }
            DispatchOutcome::InFlight => Ok(false),
            DispatchOutcome::Failed(e) => {
                if round == 0 {
                    self.fail_chat(alert, &e.to_string()).await?;
                }
                Ok(false)
            }
        }
    }

    async fn fail_chat(&self, alert: &Alert, reason: &str) -> CascadeResult<()> {
        let (alert_id, now) = (alert.id.clone(), self.clock.now());
        let failed = self
            .store
            .run(move |conn| alerts::transition(conn, &alert_id, &[AlertStatus::Pending], AlertStatus::Failed, now))
            .await?;
        if failed {
            warn!(incident_id = %alert.incident_id, watcher_id = %alert.watcher_id, reason, "Chat alert failed");
            self.events.publish(CascadeEvent::AlertFailed {
                incident_id: alert.incident_id.clone(),
                alert_id: alert.id.clone(),
                watcher_id: alert.watcher_id.clone(),
                reason: reason.to_string(),
                timestamp: now,
            });
            self.incidents.exhaust_if_settled(&alert.incident_id).await?;
        }
        Ok(())
    }
}
