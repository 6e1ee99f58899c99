//! Engine configuration
//!
//! Defaults come from the environment so a bare deployment can be tuned
//! without a file; a TOML file (see [`CascadeConfig::load`]) overrides them
//! field by field.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Errors raised while loading configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

fn env_flag(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) => matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

/// Tunables of the cascade engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CascadeConfig {
    /// Incident-wide ring budget across all watchers and attempts
    pub max_total_ring_sec: u32,
    /// Delay before each chat reminder round
    pub reminder_interval_sec: u32,
    /// Reminder rounds per incident (0 disables reminders)
    pub max_reminders: u32,
    /// Base URL the telephony provider posts call events to
    pub call_webhook_url: String,
    /// Caller id presented on outbound calls
    pub caller_id: String,
    /// Prompt spoken when a watcher answers
    pub voice_prompt: String,
    /// Chat alert body; `{subject}` is replaced with the subject id
    pub chat_template: String,
    /// How long the provider waits for keypad input
    pub gather_timeout_sec: u32,
    /// A pending outbox claim older than this may be taken over
    pub outbox_stale_after_sec: u32,
    /// Hang up other watchers' live calls once someone acknowledges
    pub hangup_on_ack: bool,
    /// Allow `acknowledged → canceled`
    pub allow_cancel_after_ack: bool,
    /// Exhaust an incident whose subject has no active watchers
    pub exhaust_when_no_watchers: bool,
    pub scheduler_poll_interval_ms: u64,
    /// Due jobs older than this are recorded as missed instead of run
    pub scheduler_misfire_grace_sec: u64,
    pub scheduler_batch_size: u32,
    /// Period of the stalled-escalation sweep (0 runs it only at startup)
    pub scheduler_reconcile_interval_sec: u64,
}

impl Default for CascadeConfig {
    fn default() -> Self {
        Self {
            max_total_ring_sec: env_or("INCIDENT_MAX_TOTAL_RING_SEC", 180),
            reminder_interval_sec: env_or("CASCADE_REMINDER_INTERVAL_SEC", 120),
            max_reminders: env_or("CASCADE_MAX_REMINDERS", 2),
            call_webhook_url: std::env::var("CASCADE_CALL_WEBHOOK_URL")
                .unwrap_or_else(|_| "http://localhost:8080/webhooks/call".into()),
            caller_id: std::env::var("CASCADE_CALLER_ID").unwrap_or_else(|_| "+10000000000".into()),
            voice_prompt: std::env::var("CASCADE_VOICE_PROMPT").unwrap_or_else(|_| {
                "This is an emergency alert. Press 1 to respond, or 9 to decline.".into()
            }),
            chat_template: std::env::var("CASCADE_CHAT_TEMPLATE")
                .unwrap_or_else(|_| "Emergency alert from {subject}. Can you respond?".into()),
            gather_timeout_sec: env_or("CASCADE_GATHER_TIMEOUT_SEC", 10),
            outbox_stale_after_sec: env_or("CASCADE_OUTBOX_STALE_AFTER_SEC", 300),
            hangup_on_ack: env_flag("CASCADE_HANGUP_ON_ACK", false),
            allow_cancel_after_ack: env_flag("CASCADE_ALLOW_CANCEL_AFTER_ACK", false),
            exhaust_when_no_watchers: env_flag("CASCADE_EXHAUST_WHEN_NO_WATCHERS", true),
            scheduler_poll_interval_ms: env_or("SCHEDULER_POLL_INTERVAL_MS", 1000),
            scheduler_misfire_grace_sec: env_or("SCHEDULER_MISFIRE_GRACE_SEC", 120),
            scheduler_batch_size: env_or("SCHEDULER_BATCH_SIZE", 32),
            scheduler_reconcile_interval_sec: env_or("SCHEDULER_RECONCILE_INTERVAL_SEC", 60),
        }
    }
}

impl CascadeConfig {
    /// Parse a TOML document; missing keys keep their defaults
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from an optional TOML file, falling back to defaults
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::from_toml_str(&std::fs::read_to_string(path)?),
            None => {
                let config = Self::default();
                config.validate()?;
                Ok(config)
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_total_ring_sec == 0 {
            return Err(ConfigError::Invalid("max_total_ring_sec must be positive".into()));
        }
        if self.scheduler_poll_interval_ms == 0 {
            return Err(ConfigError::Invalid("scheduler_poll_interval_ms must be positive".into()));
        }
        if self.scheduler_batch_size == 0 {
            return Err(ConfigError::Invalid("scheduler_batch_size must be positive".into()));
        }
        if self.call_webhook_url.trim().is_empty() {
            return Err(ConfigError::Invalid("call_webhook_url is empty".into()));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.scheduler_poll_interval_ms)
    }

    pub fn misfire_grace(&self) -> Duration {
        Duration::from_secs(self.scheduler_misfire_grace_sec)
    }

    pub fn reconcile_interval(&self) -> Option<Duration> {
        let secs = self.scheduler_reconcile_interval_sec;
        (secs > 0).then(|| Duration::from_secs(secs))
    }

    /// Chat alert body for a subject
    pub fn chat_text(&self, subject_id: &str) -> String {
        self.chat_template.replace("{subject}", subject_id)
    }

    /// Webhook URL for one call attempt
    pub fn call_webhook_for(&self, attempt_id: &str) -> String {
        let sep = if self.call_webhook_url.contains('?') { '&' } else { '?' };
        format!("{}{}attempt={}", self.call_webhook_url, sep, attempt_id)
    }
}
