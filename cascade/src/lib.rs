//! Incident escalation and notification cascade
//!
//! A subject raises a panic trigger; the engine opens an incident, fans out
//! chat messages and voice calls to the subject's linked watchers, and keeps
//! calling until someone acknowledges, the subject cancels, or every avenue
//! is used up.
//!
//! ```text
//!  trigger ─▶ incident ─▶ planner ─┬─▶ chat (outbox) ─────────────┐
//!                                  └─▶ call cascade ─▶ telephony  │
//!                                          ▲    │                 │
//!                        scheduler ────────┘    ▼                 ▼
//!                     (ring timeouts,      webhooks ─▶ inbox ─▶ ack / decline
//!                      retries, reminders)
//! ```
//!
//! # Modules
//!
//! - [`incident`]: the incident state machine and its transition table
//! - [`planner`]: ranks watchers and launches chat and call alerts
//! - [`call`]: per-attempt call control, retries and the incident ring cap
//! - [`scheduler`]: durable timers that survive restarts
//! - [`ledger`]: inbox/outbox idempotency for webhooks and provider sends
//! - [`ingress`]: webhook verification and decoding
//! - [`engine`]: wires the components together
//!
//! # Usage
//!
//! ```ignore
//! use std::sync::Arc;
//! use cascade::{CascadeConfig, Engine, Store, SystemClock};
//!
//! let store = Store::open("./cascade.sqlite")?.shared();
//! let engine = Engine::new(store, Arc::new(SystemClock), CascadeConfig::load(None)?, chat, telephony).shared();
//! let scheduler = engine.scheduler_runner().start().await?;
//! let outcome = engine.trigger("subject-42").await?;
//! ```

pub mod call;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod incident;
pub mod ingress;
pub mod intent;
pub mod ledger;
pub mod planner;
pub mod providers;
pub mod scheduler;
pub mod store;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::{CascadeConfig, ConfigError};
pub use engine::{Engine, IncidentReport, SharedEngine, WebhookOutcome};
pub use error::{CascadeError, CascadeResult};
pub use events::{CascadeEvent, EventBus, EventFilter};
pub use incident::TriggerOutcome;
pub use ingress::{Ingress, WebhookReply, WebhookRequest};
pub use providers::{CallControl, ChatButton, ChatSender, ProviderError, Telephony};
pub use scheduler::{SchedulerHandle, SchedulerRunner};
pub use store::{SharedStore, Store};
