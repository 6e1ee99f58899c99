//! Outbound provider boundaries
//!
//! The engine never speaks a provider wire format. It talks to these two
//! traits; the service crate supplies HTTP implementations and tests supply
//! recording fakes.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Errors returned by chat/telephony providers
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    /// Transport failure (connect, timeout, TLS)
    #[error("Request failed: {0}")]
    Request(String),

    /// The provider answered with a non-success status
    #[error("Provider rejected request ({status}): {body}")]
    Rejected { status: u16, body: String },

    /// No provider configured for this channel
    #[error("Provider not configured: {0}")]
    NotConfigured(String),
}

/// Inline button attached to a chat alert
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatButton {
    pub label: String,
    /// Opaque data echoed back in the callback
    pub data: String,
}

impl ChatButton {
    pub fn new(label: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            data: data.into(),
        }
    }
}

/// Commands sent to a live call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CallControl {
    Speak { text: String },
    GatherDigits { max_digits: u32, timeout_sec: u32 },
    Hangup,
}

/// Sends chat messages
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChatSender: Send + Sync {
    /// Deliver `text` to `chat_id`, returning the provider message id
    async fn send(&self, chat_id: &str, text: &str, buttons: &[ChatButton]) -> Result<String, ProviderError>;
}

/// Places and steers voice calls
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Telephony: Send + Sync {
    /// Place a call, returning the provider call id
    async fn create_call(
        &self,
        to: &str,
        from: &str,
        webhook_url: &str,
        idempotency_key: &str,
    ) -> Result<String, ProviderError>;

    async fn control(&self, call_id: &str, command: &CallControl) -> Result<(), ProviderError>;
}

pub type SharedChatSender = Arc<dyn ChatSender>;
pub type SharedTelephony = Arc<dyn Telephony>;
