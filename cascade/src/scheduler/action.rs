//! Scheduled action payloads and job rows

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::SchedulerError;
use crate::store::types::text_enum;
use crate::store::{AlertId, IncidentId};

/// The closed set of deferred work the cascade schedules
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScheduledAction {
    /// A placed call has rung for its full timeout
    RingTimeout { alert_id: AlertId, attempt_no: u32 },
    /// Place the next call attempt of an alert
    RetryCall { alert_id: AlertId, attempt_no: u32 },
    /// Re-send chat alerts
    Reminder { round: u32 },
}

impl ScheduledAction {
    pub fn action_type(&self) -> &'static str {
        match self {
            Self::RingTimeout { .. } => "ring_timeout",
            Self::RetryCall { .. } => "retry_call",
            Self::Reminder { .. } => "reminder",
        }
    }

    /// Deterministic job id; the same action always maps to the same row
    pub fn job_id(&self, incident_id: &str) -> String {
        match self {
            Self::RingTimeout { alert_id, attempt_no } => format!("ring_timeout:{alert_id}:{attempt_no}"),
            Self::RetryCall { alert_id, attempt_no } => format!("retry_call:{alert_id}:{attempt_no}"),
            Self::Reminder { round } => format!("reminder:{incident_id}:{round}"),
        }
    }

    pub fn alert_id(&self) -> Option<&str> {
        match self {
            Self::RingTimeout { alert_id, .. } | Self::RetryCall { alert_id, .. } => Some(alert_id),
            Self::Reminder { .. } => None,
        }
    }

    pub fn encode(&self) -> Result<String, SchedulerError> {
        serde_json::to_string(self).map_err(|e| SchedulerError::Encode(e.to_string()))
    }

    pub fn decode(job_id: &str, payload: &str) -> Result<Self, SchedulerError> {
        serde_json::from_str(payload).map_err(|e| SchedulerError::Decode {
            job_id: job_id.to_string(),
            message: e.to_string(),
        })
    }
}

/// Lifecycle of a job row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Running,
    Done,
    Failed,
    /// Came due outside the misfire grace window and was skipped
    Missed,
    /// Was running when the process died; never re-run
    Abandoned,
}

text_enum!(JobState, "scheduled_actions.state", {
    Pending => "pending",
    Running => "running",
    Done => "done",
    Failed => "failed",
    Missed => "missed",
    Abandoned => "abandoned",
});

/// A persisted scheduled action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub job_id: String,
    pub incident_id: IncidentId,
    pub alert_id: Option<AlertId>,
    pub action_type: String,
    pub run_at: DateTime<Utc>,
    pub payload: String,
    pub state: JobState,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_ids_are_deterministic() {
        let timeout = ScheduledAction::RingTimeout {
            alert_id: "a1".into(),
            attempt_no: 2,
        };
        assert_eq!(timeout.job_id("inc"), "ring_timeout:a1:2");
        assert_eq!(ScheduledAction::Reminder { round: 3 }.job_id("inc"), "reminder:inc:3");
        assert_eq!(ScheduledAction::Reminder { round: 3 }.alert_id(), None);
    }

    #[test]
    fn test_payload_is_tagged_json() {
        let retry = ScheduledAction::RetryCall {
            alert_id: "a1".into(),
            attempt_no: 2,
        };
        let payload = retry.encode().unwrap();
        assert!(payload.contains("\"type\":\"retry_call\""));
        assert_eq!(ScheduledAction::decode("j", &payload).unwrap(), retry);
    }

    #[test]
    fn test_unknown_action_is_rejected() {
        let err = ScheduledAction::decode("j", r#"{"type":"page_everyone"}"#).unwrap_err();
        assert!(matches!(err, SchedulerError::Decode { .. }));
    }
}
