//! Shared fixtures for the cascade integration tests
//!
//! Recording fakes stand in for the chat and telephony providers; a manual
//! clock plus an explicit `tick` replaces the background scheduler loop.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use cascade::engine::{IncidentReport, WebhookOutcome};
use cascade::ingress::{CallEventKind, CallWebhook, ChatWebhook};
use cascade::providers::{CallControl, ChatButton, ChatSender, ProviderError, Telephony};
use cascade::scheduler::{SchedulerRunner, TickReport};
use cascade::store::{links, CallAttempt, SharedStore, Store, Watcher, WatcherLink};
use cascade::{CascadeConfig, Clock, Engine, ManualClock, SharedEngine};

// ── Fakes ──

#[derive(Debug, Clone)]
pub struct SentChat {
    pub chat_id: String,
    pub text: String,
    pub buttons: Vec<ChatButton>,
}

#[derive(Default)]
pub struct RecordingChat {
    sent: Mutex<Vec<SentChat>>,
}

impl RecordingChat {
    pub fn sent(&self) -> Vec<SentChat> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_to(&self, chat_id: &str) -> usize {
        self.sent().iter().filter(|m| m.chat_id == chat_id).count()
    }
}

#[async_trait]
impl ChatSender for RecordingChat {
    async fn send(&self, chat_id: &str, text: &str, buttons: &[ChatButton]) -> Result<String, ProviderError> {
        let mut sent = self.sent.lock().unwrap();
        sent.push(SentChat {
            chat_id: chat_id.to_string(),
            text: text.to_string(),
            buttons: buttons.to_vec(),
        });
        Ok(format!("msg-{}", sent.len()))
    }
}

#[derive(Debug, Clone)]
pub struct PlacedCall {
    pub to: String,
    pub webhook_url: String,
    pub idempotency_key: String,
    pub call_id: String,
}

/// Telephony fake that honours idempotency keys like a real provider
#[derive(Default)]
pub struct RecordingTelephony {
    placed: Mutex<Vec<PlacedCall>>,
    by_key: Mutex<HashMap<String, String>>,
    controls: Mutex<Vec<(String, CallControl)>>,
    failures_left: AtomicU32,
}

impl RecordingTelephony {
    /// Make the next `n` create-call requests fail
    pub fn fail_next(&self, n: u32) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    pub fn placed(&self) -> Vec<PlacedCall> {
        self.placed.lock().unwrap().clone()
    }

    pub fn placed_to(&self, number: &str) -> usize {
        self.placed().iter().filter(|c| c.to == number).count()
    }

    pub fn hangups(&self) -> Vec<String> {
        self.controls
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, c)| *c == CallControl::Hangup)
            .map(|(id, _)| id.clone())
            .collect()
    }
}

#[async_trait]
impl Telephony for RecordingTelephony {
    async fn create_call(
        &self,
        to: &str,
        _from: &str,
        webhook_url: &str,
        idempotency_key: &str,
    ) -> Result<String, ProviderError> {
        let left = self.failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.failures_left.store(left - 1, Ordering::SeqCst);
            return Err(ProviderError::Request("connection reset".into()));
        }

        // Let concurrent callers interleave before the provider answers
        tokio::task::yield_now().await;
        let mut by_key = self.by_key.lock().unwrap();
        if let Some(existing) = by_key.get(idempotency_key) {
            return Ok(existing.clone());
        }
        let mut placed = self.placed.lock().unwrap();
        let call_id = format!("call-{}", placed.len() + 1);
        by_key.insert(idempotency_key.to_string(), call_id.clone());
        placed.push(PlacedCall {
            to: to.to_string(),
            webhook_url: webhook_url.to_string(),
            idempotency_key: idempotency_key.to_string(),
            call_id: call_id.clone(),
        });
        Ok(call_id)
    }

    async fn control(&self, call_id: &str, command: &CallControl) -> Result<(), ProviderError> {
        self.controls
            .lock()
            .unwrap()
            .push((call_id.to_string(), command.clone()));
        Ok(())
    }
}

// ── Harness ──

pub struct Harness {
    pub clock: Arc<ManualClock>,
    pub store: SharedStore,
    pub engine: SharedEngine,
    pub runner: SchedulerRunner,
    pub chat: Arc<RecordingChat>,
    pub telephony: Arc<RecordingTelephony>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(CascadeConfig::default())
    }

    pub fn with_config(config: CascadeConfig) -> Self {
        let store = Store::open_in_memory().unwrap().shared();
        Self::build(store, Arc::new(ManualClock::at_epoch()), config)
    }

    /// Harness over an on-disk database, for restart scenarios
    pub fn on_disk(path: &Path, clock: Arc<ManualClock>) -> Self {
        let store = Store::open(path).unwrap().shared();
        Self::build(store, clock, CascadeConfig::default())
    }

    fn build(store: SharedStore, clock: Arc<ManualClock>, config: CascadeConfig) -> Self {
        let chat = Arc::new(RecordingChat::default());
        let telephony = Arc::new(RecordingTelephony::default());
        let engine = Engine::new(store.clone(), clock.clone(), config, chat.clone(), telephony.clone()).shared();
        let runner = engine.scheduler_runner();
        Self {
            clock,
            store,
            engine,
            runner,
            chat,
            telephony,
        }
    }

    /// Register a watcher with a chat id and phone number derived from its id
    pub fn seed(&self, link: WatcherLink) {
        let watcher = Watcher {
            watcher_id: link.watcher_id.clone(),
            chat_id: Some(chat_of(&link.watcher_id)),
            phone_number: Some(phone_of(&link.watcher_id)),
        };
        self.store
            .with_conn(|conn| {
                links::upsert_watcher(conn, &watcher)?;
                links::upsert_link(conn, &link)
            })
            .unwrap();
    }

    /// Move time forward and run whatever became due
    pub async fn advance(&self, secs: i64) -> TickReport {
        self.clock.advance_secs(secs);
        self.runner.tick().await.unwrap()
    }

    pub async fn report(&self, incident_id: &str) -> IncidentReport {
        self.engine.report(incident_id).await.unwrap()
    }

    /// Attempts of one watcher's call alert, oldest first
    pub async fn attempts_of(&self, incident_id: &str, watcher_id: &str) -> Vec<CallAttempt> {
        let report = self.report(incident_id).await;
        let alert_ids: Vec<_> = report
            .alerts
            .iter()
            .filter(|a| a.watcher_id == watcher_id)
            .map(|a| a.id.clone())
            .collect();
        let mut attempts: Vec<_> = report
            .attempts
            .into_iter()
            .filter(|a| alert_ids.contains(&a.alert_id))
            .collect();
        attempts.sort_by_key(|a| a.attempt_no);
        attempts
    }

    pub async fn call_event(
        &self,
        event_id: &str,
        attempt: &CallAttempt,
        kind: CallEventKind,
        digits: Option<&str>,
        cause: Option<&str>,
    ) -> WebhookOutcome {
        let hook = CallWebhook {
            event_id: event_id.to_string(),
            call_id: attempt.provider_call_id.clone().unwrap_or_default(),
            attempt_id: Some(attempt.id.clone()),
            kind,
            digits: digits.map(str::to_string),
            cause: cause.map(str::to_string),
        };
        self.engine.handle_call_webhook(&hook).await.unwrap()
    }

    pub async fn chat_reply(&self, event_id: &str, watcher_id: &str, text: &str) -> WebhookOutcome {
        let hook = ChatWebhook {
            event_id: event_id.to_string(),
            chat_id: chat_of(watcher_id),
            text: Some(text.to_string()),
            callback_data: None,
        };
        self.engine.handle_chat_webhook(&hook).await.unwrap()
    }

    pub fn now(&self) -> chrono::DateTime<chrono::Utc> {
        self.clock.now()
    }
}

pub fn chat_of(watcher_id: &str) -> String {
    format!("chat-{watcher_id}")
}

pub fn phone_of(watcher_id: &str) -> String {
    format!("+1555{watcher_id}")
}

/// Call-only link with an explicit retry policy
pub fn call_link(subject: &str, watcher: &str, priority: i64, max_retries: u32, backoff: u32) -> WatcherLink {
    WatcherLink::new(subject, watcher, priority)
        .with_call_policy(25, max_retries, backoff)
        .with_channels(false, true)
}
