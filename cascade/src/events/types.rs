//! Event types for the escalation cascade
//!
//! Every state transition of an incident, alert or call attempt is published
//! as a [`CascadeEvent`] so observers (and tests) can follow a cascade
//! without polling the store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::store::{AlertId, CallResult, Channel, IncidentId, SubjectId, WatcherId};

/// All cascade events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CascadeEvent {
    /// A subject triggered a new incident
    IncidentCreated {
        incident_id: IncidentId,
        subject_id: SubjectId,
        timestamp: DateTime<Utc>,
    },

    /// A chat message for an alert was handed to the provider
    AlertDispatched {
        incident_id: IncidentId,
        alert_id: AlertId,
        watcher_id: WatcherId,
        channel: Channel,
        timestamp: DateTime<Utc>,
    },

    /// A voice call was placed (or its placement deduplicated)
    CallPlaced {
        incident_id: IncidentId,
        alert_id: AlertId,
        attempt_no: u32,
        provider_call_id: String,
        timestamp: DateTime<Utc>,
    },

    /// A call attempt ended
    CallEnded {
        incident_id: IncidentId,
        alert_id: AlertId,
        attempt_no: u32,
        result: CallResult,
        timestamp: DateTime<Utc>,
    },

    /// The next call attempt of an alert was scheduled
    RetryScheduled {
        incident_id: IncidentId,
        alert_id: AlertId,
        attempt_no: u32,
        run_at: DateTime<Utc>,
    },

    /// An alert ran out of options
    AlertFailed {
        incident_id: IncidentId,
        alert_id: AlertId,
        watcher_id: WatcherId,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// A watcher explicitly declined
    AlertDeclined {
        incident_id: IncidentId,
        alert_id: AlertId,
        watcher_id: WatcherId,
        timestamp: DateTime<Utc>,
    },

    /// Chat alerts were re-sent
    ReminderSent {
        incident_id: IncidentId,
        round: u32,
        timestamp: DateTime<Utc>,
    },

    IncidentAcknowledged {
        incident_id: IncidentId,
        watcher_id: WatcherId,
        timestamp: DateTime<Utc>,
    },

    IncidentCanceled {
        incident_id: IncidentId,
        by_whom: String,
        timestamp: DateTime<Utc>,
    },

    IncidentExhausted {
        incident_id: IncidentId,
        timestamp: DateTime<Utc>,
    },

    /// The subject has no active watcher links
    NoWatchers {
        incident_id: IncidentId,
        subject_id: SubjectId,
        timestamp: DateTime<Utc>,
    },

    /// A provider webhook was delivered again and ignored
    InboundDuplicate {
        provider: String,
        event_id: String,
        timestamp: DateTime<Utc>,
    },
}

impl CascadeEvent {
    /// Get the event type as a string
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::IncidentCreated { .. } => "incident_created",
            Self::AlertDispatched { .. } => "alert_dispatched",
            Self::CallPlaced { .. } => "call_placed",
            Self::CallEnded { .. } => "call_ended",
            Self::RetryScheduled { .. } => "retry_scheduled",
            Self::AlertFailed { .. } => "alert_failed",
            Self::AlertDeclined { .. } => "alert_declined",
            Self::ReminderSent { .. } => "reminder_sent",
            Self::IncidentAcknowledged { .. } => "incident_acknowledged",
            Self::IncidentCanceled { .. } => "incident_canceled",
            Self::IncidentExhausted { .. } => "incident_exhausted",
            Self::NoWatchers { .. } => "no_watchers",
            Self::InboundDuplicate { .. } => "inbound_duplicate",
        }
    }

    /// Incident the event belongs to, if any
    pub fn incident_id(&self) -> Option<&str> {
        match self {
            Self::IncidentCreated { incident_id, .. }
            | Self::AlertDispatched { incident_id, .. }
            | Self::CallPlaced { incident_id, .. }
            | Self::CallEnded { incident_id, .. }
            | Self::RetryScheduled { incident_id, .. }
            | Self::AlertFailed { incident_id, .. }
            | Self::AlertDeclined { incident_id, .. }
            | Self::ReminderSent { incident_id, .. }
            | Self::IncidentAcknowledged { incident_id, .. }
            | Self::IncidentCanceled { incident_id, .. }
            | Self::IncidentExhausted { incident_id, .. }
            | Self::NoWatchers { incident_id, .. } => Some(incident_id),
            Self::InboundDuplicate { .. } => None,
        }
    }

    /// Whether the event ends the incident
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::IncidentAcknowledged { .. } | Self::IncidentCanceled { .. } | Self::IncidentExhausted { .. }
        )
    }
}
