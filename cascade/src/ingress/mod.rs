//! Webhook ingress
//!
//! Verify, decode, hand to the engine, and always answer with a
//! success-shaped reply once the request is authentic. Providers retry
//! non-2xx responses; the inbox makes those retries harmless, so a 2xx only
//! ever means "received".

pub mod payload;
pub mod verify;

use std::sync::Arc;

use serde::Serialize;
use serde_json::json;
use tracing::{error, warn};

use crate::engine::{SharedEngine, WebhookOutcome};

pub use payload::{CallEventKind, CallWebhook, ChatWebhook};
pub use verify::{sign, HmacVerifier, SharedSecretVerifier, VerifyError, WebhookRequest, WebhookVerifier};

/// Status and JSON body to return to the provider
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WebhookReply {
    pub status: u16,
    pub body: serde_json::Value,
}

impl WebhookReply {
    fn ok(outcome: &str) -> Self {
        Self {
            status: 200,
            body: json!({ "ok": true, "outcome": outcome }),
        }
    }

    fn unauthorized(error: &VerifyError) -> Self {
        Self {
            status: 401,
            body: json!({ "ok": false, "error": error.to_string() }),
        }
    }
}

pub struct Ingress {
    engine: SharedEngine,
    call_verifier: Arc<dyn WebhookVerifier>,
    chat_verifier: Arc<dyn WebhookVerifier>,
}

impl Ingress {
    pub fn new(
        engine: SharedEngine,
        call_verifier: Arc<dyn WebhookVerifier>,
        chat_verifier: Arc<dyn WebhookVerifier>,
    ) -> Self {
        Self {
            engine,
            call_verifier,
            chat_verifier,
        }
    }

    pub async fn call_webhook(&self, request: &WebhookRequest) -> WebhookReply {
        if let Err(e) = self.call_verifier.verify(request) {
            warn!(error = %e, "Rejected unverified call webhook");
            return WebhookReply::unauthorized(&e);
        }
        let hook: CallWebhook = match serde_json::from_slice(&request.body) {
            Ok(hook) => hook,
            Err(e) => {
                warn!(error = %e, "Undecodable call webhook");
                return WebhookReply::ok("undecodable");
            }
        };
        Self::reply(self.engine.handle_call_webhook(&hook).await)
    }

    pub async fn chat_webhook(&self, request: &WebhookRequest) -> WebhookReply {
        if let Err(e) = self.chat_verifier.verify(request) {
            warn!(error = %e, "Rejected unverified chat webhook");
            return WebhookReply::unauthorized(&e);
        }
        let hook: ChatWebhook = match serde_json::from_slice(&request.body) {
            Ok(hook) => hook,
            Err(e) => {
                warn!(error = %e, "Undecodable chat webhook");
                return WebhookReply::ok("undecodable");
            }
        };
        Self::reply(self.engine.handle_chat_webhook(&hook).await)
    }

    fn reply(result: crate::error::CascadeResult<WebhookOutcome>) -> WebhookReply {
        match result {
            Ok(outcome) => WebhookReply::ok(outcome.as_str()),
            Err(e) => {
                error!(error = %e, "Webhook handling failed");
                WebhookReply::ok("error")
            }
        }
    }
}
