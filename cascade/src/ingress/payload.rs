//! Normalised webhook payloads
//!
//! Provider adapters translate their native callbacks into these shapes
//! before posting them to the engine.

use serde::{Deserialize, Serialize};

use crate::call::CallEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallEventKind {
    Answered,
    Digits,
    Hangup,
}

/// Telephony callback
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallWebhook {
    /// Provider's unique id for this delivery
    pub event_id: String,
    pub call_id: String,
    /// Attempt id echoed from the per-attempt webhook URL
    #[serde(default)]
    pub attempt_id: Option<String>,
    pub kind: CallEventKind,
    #[serde(default)]
    pub digits: Option<String>,
    #[serde(default)]
    pub cause: Option<String>,
}

impl CallWebhook {
    pub fn event(&self) -> CallEvent {
        match self.kind {
            CallEventKind::Answered => CallEvent::Answered,
            CallEventKind::Digits => CallEvent::Digits(self.digits.clone().unwrap_or_default()),
            CallEventKind::Hangup => CallEvent::Hangup {
                cause: self.cause.clone(),
            },
        }
    }
}

/// Chat reply or button press
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatWebhook {
    pub event_id: String,
    pub chat_id: String,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub callback_data: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_webhook_defaults() {
        let hook: CallWebhook =
            serde_json::from_str(r#"{"event_id":"e1","call_id":"c1","kind":"hangup","cause":"busy"}"#).unwrap();
        assert_eq!(hook.attempt_id, None);
        assert_eq!(
            hook.event(),
            CallEvent::Hangup {
                cause: Some("busy".into())
            }
        );
    }

    #[test]
    fn test_unknown_kind_is_rejected() {
        let parsed = serde_json::from_str::<CallWebhook>(r#"{"event_id":"e1","call_id":"c1","kind":"ringing"}"#);
        assert!(parsed.is_err());
    }
}
