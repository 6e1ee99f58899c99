//! Entity types persisted by the cascade store
//!
//! Entities reference each other only by opaque string ids; relationships are
//! resolved through repository lookups, never through embedded references.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Unique identifier for incidents
pub type IncidentId = String;

/// Unique identifier for alerts
pub type AlertId = String;

/// Unique identifier for call attempts
pub type AttemptId = String;

/// Identifier of a subject (the person who triggers a panic)
pub type SubjectId = String;

/// Identifier of a watcher (a ranked contact)
pub type WatcherId = String;

/// Generate a new random entity id
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Implements `as_str`/`parse` and `Display` for a snake_case status enum
macro_rules! text_enum {
    ($name:ident, $column:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }

            pub fn parse(value: &str) -> Result<Self, $crate::store::StoreError> {
                match value {
                    $($text => Ok(Self::$variant),)+
                    other => Err($crate::store::StoreError::InvalidValue {
                        column: $column,
                        value: other.to_string(),
                    }),
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

pub(crate) use text_enum;

// ============================================================================
// Incident
// ============================================================================

/// Lifecycle state of an incident
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentStatus {
    /// Escalation in progress
    Active,
    /// A watcher acknowledged (terminal)
    Acknowledged,
    /// The subject (or an operator) called it off (terminal)
    Canceled,
    /// Every channel of every watcher failed (terminal)
    Exhausted,
}

text_enum!(IncidentStatus, "incidents.status", {
    Active => "active",
    Acknowledged => "acknowledged",
    Canceled => "canceled",
    Exhausted => "exhausted",
});

impl IncidentStatus {
    /// Whether this is a terminal state
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Active)
    }
}

/// One panic episode for a subject
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Incident {
    pub id: IncidentId,
    pub subject_id: SubjectId,
    pub status: IncidentStatus,
    pub created_at: DateTime<Utc>,
    pub acknowledged_by: Option<WatcherId>,
    pub ack_at: Option<DateTime<Utc>>,
    pub canceled_at: Option<DateTime<Utc>>,
    pub canceled_by: Option<String>,
    pub exhausted_at: Option<DateTime<Utc>>,
}

impl Incident {
    pub fn is_active(&self) -> bool {
        self.status == IncidentStatus::Active
    }
}

// ============================================================================
// Watchers
// ============================================================================

/// Whether a watcher link participates in escalation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkStatus {
    Active,
    Inactive,
}

text_enum!(LinkStatus, "watcher_links.status", {
    Active => "active",
    Inactive => "inactive",
});

/// Contact card of a watcher
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Watcher {
    pub watcher_id: WatcherId,
    /// Chat destination (chat/channel id at the chat provider)
    pub chat_id: Option<String>,
    /// Dial-out address for voice calls
    pub phone_number: Option<String>,
}

/// Ranked relationship between a subject and one of its watchers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatcherLink {
    pub subject_id: SubjectId,
    pub watcher_id: WatcherId,
    pub status: LinkStatus,
    /// Lower is contacted first
    pub priority: i64,
    /// Seconds a single call is allowed to ring
    pub ring_timeout_sec: u32,
    /// Total call attempts allowed for this watcher per incident
    pub max_retries: u32,
    /// Linear backoff unit between attempts, in seconds
    pub retry_backoff_sec: u32,
    pub chat_enabled: bool,
    pub call_enabled: bool,
}

impl WatcherLink {
    /// Create an active link with the default call policy (25s ring, 2 attempts, 60s backoff)
    pub fn new(subject_id: impl Into<String>, watcher_id: impl Into<String>, priority: i64) -> Self {
        Self {
            subject_id: subject_id.into(),
            watcher_id: watcher_id.into(),
            status: LinkStatus::Active,
            priority,
            ring_timeout_sec: 25,
            max_retries: 2,
            retry_backoff_sec: 60,
            chat_enabled: true,
            call_enabled: true,
        }
    }

    pub fn with_call_policy(mut self, ring_timeout_sec: u32, max_retries: u32, retry_backoff_sec: u32) -> Self {
        self.ring_timeout_sec = ring_timeout_sec;
        self.max_retries = max_retries;
        self.retry_backoff_sec = retry_backoff_sec;
        self
    }

    pub fn with_channels(mut self, chat_enabled: bool, call_enabled: bool) -> Self {
        self.chat_enabled = chat_enabled;
        self.call_enabled = call_enabled;
        self
    }

    pub fn inactive(mut self) -> Self {
        self.status = LinkStatus::Inactive;
        self
    }
}

// ============================================================================
// Alerts and call attempts
// ============================================================================

/// Notification channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Chat,
    Call,
}

text_enum!(Channel, "alerts.channel", {
    Chat => "chat",
    Call => "call",
});

/// Delivery state of an alert
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertStatus {
    /// Created, nothing dispatched yet
    Pending,
    /// Chat delivered, or call cascade in progress
    Sent,
    /// Channel terminally failed for this watcher
    Failed,
    /// Watcher explicitly declined; no further retries
    Declined,
    /// Watcher acknowledged the incident through this alert
    Acknowledged,
}

text_enum!(AlertStatus, "alerts.status", {
    Pending => "pending",
    Sent => "sent",
    Failed => "failed",
    Declined => "declined",
    Acknowledged => "acknowledged",
});

impl AlertStatus {
    /// Whether the alert may still produce call attempts
    pub fn is_open(self) -> bool {
        matches!(self, Self::Pending | Self::Sent)
    }
}

/// A per-channel, per-watcher notification record within an incident
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alert {
    pub id: AlertId,
    pub incident_id: IncidentId,
    pub watcher_id: WatcherId,
    pub channel: Channel,
    pub status: AlertStatus,
    pub attempts: u32,
    /// When the next call attempt is due, if one is scheduled
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Terminal outcome of a call attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallResult {
    Answered,
    Busy,
    NoAnswer,
    Failed,
}

text_enum!(CallResult, "call_attempts.result", {
    Answered => "answered",
    Busy => "busy",
    NoAnswer => "no_answer",
    Failed => "failed",
});

impl CallResult {
    /// Busy and unanswered calls are worth another try
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Busy | Self::NoAnswer)
    }
}

/// One dial try within a watcher's retry sequence
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallAttempt {
    pub id: AttemptId,
    pub alert_id: AlertId,
    pub incident_id: IncidentId,
    pub attempt_no: u32,
    pub destination: String,
    pub provider_call_id: Option<String>,
    pub result: Option<CallResult>,
    pub digits: Option<String>,
    /// Ring time charged against the incident-wide cap
    pub ring_sec: u32,
    pub started_at: DateTime<Utc>,
    pub answered_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl CallAttempt {
    pub fn is_closed(&self) -> bool {
        self.ended_at.is_some()
    }
}
