//! Incident lifecycle
//!
//! ```text
//!             ┌──▶ acknowledged ──(allow_cancel_after_ack)──┐
//!   active ───┼──▶ canceled  ◀───────────────────────────────┘
//!             └──▶ exhausted
//! ```
//!
//! Transitions are conditional updates in the store; the winner of a race is
//! whoever's update touched the row. Leaving `active` deletes every pending
//! scheduled action of the incident in the same transaction.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::TransactionBehavior;
use tracing::{debug, info};

use crate::clock::SharedClock;
use crate::config::CascadeConfig;
use crate::error::{CascadeError, CascadeResult};
use crate::events::{CascadeEvent, SharedEventBus};
use crate::scheduler::jobs;
use crate::store::{alerts, incidents, Incident, IncidentStatus, SharedStore};

/// Whether `from → to` is allowed
pub fn is_legal_transition(from: IncidentStatus, to: IncidentStatus, allow_cancel_after_ack: bool) -> bool {
    use IncidentStatus::*;

    matches!(
        (from, to),
        (Active, Acknowledged) | (Active, Canceled) | (Active, Exhausted)
    ) || (allow_cancel_after_ack && from == Acknowledged && to == Canceled)
}

/// Result of [`IncidentMachine::create`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerOutcome {
    pub incident: Incident,
    /// False when the subject already had an active incident
    pub created: bool,
}

pub type SharedIncidentMachine = Arc<IncidentMachine>;

pub struct IncidentMachine {
    store: SharedStore,
    clock: SharedClock,
    events: SharedEventBus,
    allow_cancel_after_ack: bool,
}

impl IncidentMachine {
    pub fn new(store: SharedStore, clock: SharedClock, events: SharedEventBus, config: &CascadeConfig) -> Self {
        Self {
            store,
            clock,
            events,
            allow_cancel_after_ack: config.allow_cancel_after_ack,
        }
    }

    pub fn shared(self) -> SharedIncidentMachine {
        Arc::new(self)
    }

    /// Open an incident for the subject, or return the one already active
    pub async fn create(&self, subject_id: &str) -> CascadeResult<TriggerOutcome> {
        let subject_id = subject_id.trim().to_string();
        if subject_id.is_empty() {
            return Err(CascadeError::Validation("subject_id must not be empty".into()));
        }
        let now = self.clock.now();
        let subject = subject_id.clone();
        let (incident, created) = self
            .store
            .run(move |conn| incidents::insert_active(conn, &subject, now))
            .await?
            .into_parts();

        if created {
            info!(incident_id = %incident.id, subject_id = %subject_id, "Incident created");
            self.events.publish(CascadeEvent::IncidentCreated {
                incident_id: incident.id.clone(),
                subject_id,
                timestamp: now,
            });
        } else {
            debug!(incident_id = %incident.id, "Subject already has an active incident");
        }
        Ok(TriggerOutcome { incident, created })
    }

    pub async fn get(&self, incident_id: &str) -> CascadeResult<Option<Incident>> {
        let id = incident_id.to_string();
        Ok(self.store.run(move |conn| incidents::get(conn, &id)).await?)
    }

    pub async fn active_for_subject(&self, subject_id: &str) -> CascadeResult<Option<Incident>> {
        let subject = subject_id.to_string();
        Ok(self
            .store
            .run(move |conn| incidents::find_active_for_subject(conn, &subject))
            .await?)
    }

    /// `active → acknowledged`; exactly one concurrent caller gets `true`
    pub async fn acknowledge(&self, incident_id: &str, watcher_id: &str) -> CascadeResult<bool> {
        let (id, watcher) = (incident_id.to_string(), watcher_id.to_string());
        let now = self.clock.now();
        let acknowledged = self
            .store
            .run(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                if !incidents::acknowledge(&tx, &id, &watcher, now)? {
                    return Ok(false);
                }
                alerts::acknowledge_for_watcher(&tx, &id, &watcher, now)?;
                let removed = jobs::cancel_all(&tx, &id)?;
                tx.commit()?;
                debug!(incident_id = %id, removed, "Pending actions removed on acknowledgment");
                Ok(true)
            })
            .await?;

        if acknowledged {
            info!(incident_id, watcher_id, "Incident acknowledged");
            self.events.publish(CascadeEvent::IncidentAcknowledged {
                incident_id: incident_id.to_string(),
                watcher_id: watcher_id.to_string(),
                timestamp: now,
            });
        } else {
            self.log_refused(incident_id, IncidentStatus::Acknowledged).await;
        }
        Ok(acknowledged)
    }

    /// `active → canceled` (or from `acknowledged` when configured)
    pub async fn cancel(&self, incident_id: &str, by_whom: &str) -> CascadeResult<bool> {
        let (id, by) = (incident_id.to_string(), by_whom.to_string());
        let now = self.clock.now();
        let from_ack = is_legal_transition(
            IncidentStatus::Acknowledged,
            IncidentStatus::Canceled,
            self.allow_cancel_after_ack,
        );
        let canceled = self
            .store
            .run(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                if !incidents::cancel(&tx, &id, &by, now, from_ack)? {
                    return Ok(false);
                }
                jobs::cancel_all(&tx, &id)?;
                tx.commit()?;
                Ok(true)
            })
            .await?;

        if canceled {
            info!(incident_id, by_whom, "Incident canceled");
            self.events.publish(CascadeEvent::IncidentCanceled {
                incident_id: incident_id.to_string(),
                by_whom: by_whom.to_string(),
                timestamp: now,
            });
        } else {
            self.log_refused(incident_id, IncidentStatus::Canceled).await;
        }
        Ok(canceled)
    }

    /// `active → exhausted`
    pub async fn exhaust(&self, incident_id: &str) -> CascadeResult<bool> {
        self.exhaust_where(incident_id, false).await
    }

    /// Exhaust the incident only if nothing can still reach a watcher
    ///
    /// Settled means no call alert is pending or mid-cascade, no chat alert is
    /// waiting to go out, and no reminder round is pending.
    pub async fn exhaust_if_settled(&self, incident_id: &str) -> CascadeResult<bool> {
        self.exhaust_where(incident_id, true).await
    }

    async fn exhaust_where(&self, incident_id: &str, only_if_settled: bool) -> CascadeResult<bool> {
        let id = incident_id.to_string();
        let now = self.clock.now();
        let exhausted = self
            .store
            .run(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                if only_if_settled {
                    let open = alerts::count_open(&tx, &id)?;
                    // A delivered chat can still be acknowledged until its last reminder
                    let reminder_due =
                        jobs::has_pending(&tx, &id, "reminder")? && alerts::count_remindable(&tx, &id)? > 0;
                    if open > 0 || reminder_due {
                        return Ok(false);
                    }
                }
                if !incidents::exhaust(&tx, &id, now)? {
                    return Ok(false);
                }
                jobs::cancel_all(&tx, &id)?;
                tx.commit()?;
                Ok(true)
            })
            .await?;

        if exhausted {
            info!(incident_id, "Incident exhausted");
            self.events.publish(CascadeEvent::IncidentExhausted {
                incident_id: incident_id.to_string(),
                timestamp: now,
            });
        }
        Ok(exhausted)
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    async fn log_refused(&self, incident_id: &str, to: IncidentStatus) {
        match self.get(incident_id).await {
            Ok(Some(current)) => debug!(
                incident_id,
                from = %current.status,
                to = %to,
                legal = is_legal_transition(current.status, to, self.allow_cancel_after_ack),
                "Transition not applied"
            ),
            Ok(None) => debug!(incident_id, to = %to, "Transition on unknown incident"),
            Err(e) => debug!(incident_id, error = %e, "Transition refused; lookup failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::events::EventBus;
    use crate::scheduler::{ScheduledAction, Scheduler};
    use crate::store::{Channel, Store};

    fn machine(allow_cancel_after_ack: bool) -> (IncidentMachine, Scheduler, SharedEventBus) {
        let clock: SharedClock = Arc::new(ManualClock::at_epoch());
        let store = Store::open_in_memory().unwrap().shared();
        let events = EventBus::new().shared();
        let mut config = CascadeConfig::default();
        config.allow_cancel_after_ack = allow_cancel_after_ack;
        let scheduler = Scheduler::new(store.clone(), clock.clone());
        (IncidentMachine::new(store, clock, events.clone(), &config), scheduler, events)
    }

    #[test]
    fn test_transition_table() {
        use IncidentStatus::*;
        assert!(is_legal_transition(Active, Acknowledged, false));
        assert!(is_legal_transition(Active, Exhausted, false));
        assert!(!is_legal_transition(Acknowledged, Canceled, false));
        assert!(is_legal_transition(Acknowledged, Canceled, true));
        assert!(!is_legal_transition(Exhausted, Active, true));
        assert!(!is_legal_transition(Canceled, Acknowledged, true));
    }

    #[tokio::test]
    async fn test_create_rejects_blank_subject() {
        let (machine, _, _) = machine(false);
        let err = machine.create("  ").await.unwrap_err();
        assert_eq!(err.status_code(), 400);
    }

    #[tokio::test]
    async fn test_acknowledge_cancels_pending_actions_and_marks_alerts() {
        let (machine, scheduler, events) = machine(false);
        let mut rx = events.subscribe();
        let outcome = machine.create("s").await.unwrap();
        let id = outcome.incident.id.clone();

        let now = machine.now();
        let alert_incident = id.clone();
        let (alert, _) = scheduler
            .store()
            .run(move |conn| alerts::insert_or_get(conn, &alert_incident, "w2", Channel::Call, now))
            .await
            .unwrap();
        scheduler
            .schedule(&id, &ScheduledAction::Reminder { round: 1 }, now)
            .await
            .unwrap();

        assert!(machine.acknowledge(&id, "w2").await.unwrap());
        assert!(!machine.acknowledge(&id, "w1").await.unwrap());
        assert!(scheduler.pending_for_incident(&id).await.unwrap().is_empty());

        let alert_id = alert.id.clone();
        let stored = scheduler
            .store()
            .run(move |conn| alerts::get(conn, &alert_id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, crate::store::AlertStatus::Acknowledged);

        assert_eq!(rx.recv().await.unwrap().event_type(), "incident_created");
        assert_eq!(rx.recv().await.unwrap().event_type(), "incident_acknowledged");
    }

    #[tokio::test]
    async fn test_cancel_after_ack_honours_flag() {
        let (strict, _, _) = machine(false);
        let id = strict.create("s").await.unwrap().incident.id;
        strict.acknowledge(&id, "w").await.unwrap();
        assert!(!strict.cancel(&id, "subject").await.unwrap());

        let (lenient, _, _) = machine(true);
        let id = lenient.create("s").await.unwrap().incident.id;
        lenient.acknowledge(&id, "w").await.unwrap();
        assert!(lenient.cancel(&id, "subject").await.unwrap());
        let incident = lenient.get(&id).await.unwrap().unwrap();
        assert_eq!(incident.status, IncidentStatus::Canceled);
    }

    #[tokio::test]
    async fn test_exhaust_if_settled_waits_for_open_alerts() {
        let (machine, scheduler, _) = machine(false);
        let id = machine.create("s").await.unwrap().incident.id;
        let now = machine.now();
        let incident = id.clone();
        let (alert, _) = scheduler
            .store()
            .run(move |conn| alerts::insert_or_get(conn, &incident, "w", Channel::Call, now))
            .await
            .unwrap();

        assert!(!machine.exhaust_if_settled(&id).await.unwrap());

        let alert_id = alert.id.clone();
        scheduler
            .store()
            .run(move |conn| {
                alerts::transition(conn, &alert_id, &[crate::store::AlertStatus::Pending], crate::store::AlertStatus::Failed, now)
            })
            .await
            .unwrap();
        assert!(machine.exhaust_if_settled(&id).await.unwrap());
        assert!(!machine.exhaust(&id).await.unwrap());
        assert!(machine.active_for_subject("s").await.unwrap().is_none());
    }
}
