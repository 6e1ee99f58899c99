//! Acknowledgment intent parsing
//!
//! One mapping serves both paths: keypad digits from a call and text or
//! button replies from chat.

use serde::{Deserialize, Serialize};

/// What a watcher meant by a reply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckIntent {
    /// "I'm on it": acknowledges the incident
    Acknowledge,
    /// "I can't": declines for this watcher only
    Decline,
}

const ACK_WORDS: &[&str] = &["1", "yes", "ok", "help"];
const DECLINE_WORDS: &[&str] = &["9", "no", "false", "alarm"];

impl AckIntent {
    /// Parse a reply; trimmed and case-insensitive
    pub fn parse(input: &str) -> Option<Self> {
        let normalized = input.trim().to_lowercase();
        if ACK_WORDS.contains(&normalized.as_str()) {
            Some(Self::Acknowledge)
        } else if DECLINE_WORDS.contains(&normalized.as_str()) {
            Some(Self::Decline)
        } else {
            None
        }
    }

    /// Parse keypad input, acting on the first key that means something
    pub fn from_digits(digits: &str) -> Option<Self> {
        digits
            .chars()
            .filter(|c| c.is_ascii_digit())
            .find_map(|c| Self::parse(&c.to_string()))
    }

    /// Parse chat button callback data of the form `ack:<incident>` / `decline:<incident>`
    pub fn from_callback(data: &str) -> Option<(Self, Option<&str>)> {
        let (verb, incident) = match data.split_once(':') {
            Some((verb, rest)) => (verb, Some(rest).filter(|r| !r.is_empty())),
            None => (data, None),
        };
        let intent = match verb {
            "ack" => Self::Acknowledge,
            "decline" => Self::Decline,
            _ => return None,
        };
        Some((intent, incident))
    }

    /// Callback data encoding this intent for an incident
    pub fn callback_data(self, incident_id: &str) -> String {
        match self {
            Self::Acknowledge => format!("ack:{incident_id}"),
            Self::Decline => format!("decline:{incident_id}"),
        }
    }
}
