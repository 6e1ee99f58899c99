//! Process wiring: store, providers, engine, webhook ingress, scheduler

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use cascade::ingress::{HmacVerifier, SharedSecretVerifier, VerifyError, WebhookVerifier};
use cascade::providers::{SharedChatSender, SharedTelephony};
use cascade::{Engine, EventFilter, Ingress, SchedulerHandle, SharedClock, SharedEngine, SharedStore, Store, SystemClock};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ServiceConfig;
use crate::providers;

/// Verifier used when no secret is configured: every request is refused
struct RejectAll(&'static str);

impl WebhookVerifier for RejectAll {
    fn verify(&self, _: &cascade::WebhookRequest) -> Result<(), VerifyError> {
        Err(VerifyError::Config(format!("no {} webhook secret configured", self.0)))
    }
}

/// A wired engine plus its webhook front door
pub struct Runtime {
    engine: SharedEngine,
    ingress: Ingress,
}

impl Runtime {
    /// Open the database and build real provider clients
    pub fn build(config: &ServiceConfig) -> Result<Self> {
        let store = Store::open(&config.database_path)
            .with_context(|| format!("Failed to open store at {}", config.database_path.display()))?
            .shared();
        let timeout = Duration::from_secs(config.request_timeout_secs);
        let chat = providers::chat_sender(config.chat.as_ref(), timeout).context("Failed to build chat client")?;
        let telephony =
            providers::telephony(config.telephony.as_ref(), timeout).context("Failed to build telephony client")?;
        Self::assemble(config, store, Arc::new(SystemClock), chat, telephony)
    }

    /// Wire an engine over explicit parts
    pub fn assemble(
        config: &ServiceConfig,
        store: SharedStore,
        clock: SharedClock,
        chat: SharedChatSender,
        telephony: SharedTelephony,
    ) -> Result<Self> {
        if config.chat.is_none() {
            warn!("No chat provider configured; chat alerts will fail");
        }
        if config.telephony.is_none() {
            warn!("No telephony provider configured; call alerts will fail");
        }

        let call_verifier: Arc<dyn WebhookVerifier> = match &config.call_webhook_secret {
            Some(secret) => Arc::new(HmacVerifier::new(secret, clock.clone()).context("Invalid call webhook secret")?),
            None => {
                warn!("No call webhook secret configured; call webhooks will be refused");
                Arc::new(RejectAll("call"))
            }
        };
        let chat_verifier: Arc<dyn WebhookVerifier> = match &config.chat_webhook_secret {
            Some(secret) => Arc::new(
                SharedSecretVerifier::new(config.chat_secret_header.clone(), secret)
                    .context("Invalid chat webhook secret")?,
            ),
            None => {
                warn!("No chat webhook secret configured; chat webhooks will be refused");
                Arc::new(RejectAll("chat"))
            }
        };

        let engine = Engine::new(store, clock, config.cascade.clone(), chat, telephony).shared();
        let ingress = Ingress::new(engine.clone(), call_verifier, chat_verifier);
        Ok(Self { engine, ingress })
    }

    pub fn engine(&self) -> &SharedEngine {
        &self.engine
    }

    pub fn ingress(&self) -> &Ingress {
        &self.ingress
    }

    /// Start the durable scheduler; failure means the process is not ready
    pub async fn start_scheduler(&self) -> Result<SchedulerHandle> {
        let handle = self
            .engine
            .scheduler_runner()
            .start()
            .await
            .context("Scheduler failed to start")?;
        info!("Scheduler ready");
        Ok(handle)
    }

    /// Mirror matching engine events into the log until `stop` fires or the bus closes
    pub fn spawn_event_log(&self, filter: EventFilter, stop: CancellationToken) -> JoinHandle<()> {
        let mut events = self.engine.events().subscribe_filtered(filter);
        tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    _ = stop.cancelled() => break,
                    next = events.recv() => next,
                };
                match next {
                    Ok(event) => {
                        let incident_id = event.incident_id().unwrap_or("-").to_string();
                        info!(event = event.event_type(), incident_id = %incident_id, "Cascade event");
                    }
                    Err(RecvError::Lagged(skipped)) => warn!(skipped, "Event log lagged"),
                    Err(RecvError::Closed) => break,
                }
            }
            debug!("Event log stopped");
        })
    }
}
