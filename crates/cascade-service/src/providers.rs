//! HTTP clients for the chat and telephony providers
//!
//! Both speak a small JSON dialect:
//!
//! ```text
//!   POST {chat}/messages                 {chat_id, text, buttons} -> {message_id}
//!   POST {telephony}/calls               {to, from, webhook_url}  -> {call_id}
//!        Idempotency-Key: <outbox key>
//!   POST {telephony}/calls/{id}/control  CallControl              -> 2xx
//! ```
//!
//! A provider adapter (or the provider itself) translates these to its own
//! API. Status codes map onto [`ProviderError`] so the cascade can decide
//! whether to retry.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cascade::providers::{SharedChatSender, SharedTelephony};
use cascade::{CallControl, ChatButton, ChatSender, ProviderError, Telephony};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::ProviderEndpoint;

pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

#[derive(Serialize)]
struct SendMessage<'a> {
    chat_id: &'a str,
    text: &'a str,
    buttons: &'a [ChatButton],
}

#[derive(Deserialize)]
struct MessageCreated {
    message_id: String,
}

#[derive(Serialize)]
struct CreateCall<'a> {
    to: &'a str,
    from: &'a str,
    webhook_url: &'a str,
}

#[derive(Deserialize)]
struct CallCreated {
    call_id: String,
}

/// Shared plumbing for both clients
#[derive(Clone)]
struct ProviderClient {
    http: reqwest::Client,
    endpoint: ProviderEndpoint,
}

impl ProviderClient {
    fn new(endpoint: ProviderEndpoint, timeout: Duration) -> Result<Self, ProviderError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProviderError::Request(e.to_string()))?;
        Ok(Self { http, endpoint })
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        let request = self.http.post(format!("{}{}", self.endpoint.url, path));
        match &self.endpoint.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response, ProviderError> {
        let response = request
            .send()
            .await
            .map_err(|e| ProviderError::Request(e.to_string()))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(rejected(status.as_u16(), body))
    }
}

/// Error for a non-success response, with the body trimmed for logs
pub fn rejected(status: u16, body: String) -> ProviderError {
    const MAX_BODY: usize = 512;
    let body = match body.char_indices().nth(MAX_BODY) {
        Some((cut, _)) => format!("{}…", &body[..cut]),
        None => body,
    };
    ProviderError::Rejected { status, body }
}

pub struct HttpChatSender {
    client: ProviderClient,
}

impl HttpChatSender {
    pub fn new(endpoint: ProviderEndpoint, timeout: Duration) -> Result<Self, ProviderError> {
        Ok(Self {
            client: ProviderClient::new(endpoint, timeout)?,
        })
    }
}

#[async_trait]
impl ChatSender for HttpChatSender {
    async fn send(&self, chat_id: &str, text: &str, buttons: &[ChatButton]) -> Result<String, ProviderError> {
        let request = self.client.post("/messages").json(&SendMessage { chat_id, text, buttons });
        let created: MessageCreated = self
            .client
            .send(request)
            .await?
            .json()
            .await
            .map_err(|e| ProviderError::Request(format!("bad message response: {e}")))?;
        debug!(chat_id, message_id = %created.message_id, "Chat message sent");
        Ok(created.message_id)
    }
}

pub struct HttpTelephony {
    client: ProviderClient,
}

impl HttpTelephony {
    pub fn new(endpoint: ProviderEndpoint, timeout: Duration) -> Result<Self, ProviderError> {
        Ok(Self {
            client: ProviderClient::new(endpoint, timeout)?,
        })
    }
}

#[async_trait]
impl Telephony for HttpTelephony {
    async fn create_call(
        &self,
        to: &str,
        from: &str,
        webhook_url: &str,
        idempotency_key: &str,
    ) -> Result<String, ProviderError> {
        let request = self
            .client
            .post("/calls")
            .header(IDEMPOTENCY_HEADER, idempotency_key)
            .json(&CreateCall { to, from, webhook_url });
        let created: CallCreated = self
            .client
            .send(request)
            .await?
            .json()
            .await
            .map_err(|e| ProviderError::Request(format!("bad call response: {e}")))?;
        debug!(call_id = %created.call_id, "Call created");
        Ok(created.call_id)
    }

    async fn control(&self, call_id: &str, command: &CallControl) -> Result<(), ProviderError> {
        let request = self.client.post(&format!("/calls/{call_id}/control")).json(command);
        self.client.send(request).await?;
        Ok(())
    }
}

/// Stand-in for a channel with no configured provider
pub struct Unconfigured(pub &'static str);

#[async_trait]
impl ChatSender for Unconfigured {
    async fn send(&self, _: &str, _: &str, _: &[ChatButton]) -> Result<String, ProviderError> {
        Err(ProviderError::NotConfigured(self.0.to_string()))
    }
}

#[async_trait]
impl Telephony for Unconfigured {
    async fn create_call(&self, _: &str, _: &str, _: &str, _: &str) -> Result<String, ProviderError> {
        Err(ProviderError::NotConfigured(self.0.to_string()))
    }

    async fn control(&self, _: &str, _: &CallControl) -> Result<(), ProviderError> {
        Err(ProviderError::NotConfigured(self.0.to_string()))
    }
}

pub fn chat_sender(endpoint: Option<&ProviderEndpoint>, timeout: Duration) -> Result<SharedChatSender, ProviderError> {
    Ok(match endpoint {
        Some(endpoint) => Arc::new(HttpChatSender::new(endpoint.clone(), timeout)?),
        None => Arc::new(Unconfigured("chat")),
    })
}

pub fn telephony(endpoint: Option<&ProviderEndpoint>, timeout: Duration) -> Result<SharedTelephony, ProviderError> {
    Ok(match endpoint {
        Some(endpoint) => Arc::new(HttpTelephony::new(endpoint.clone(), timeout)?),
        None => Arc::new(Unconfigured("telephony")),
    })
}
