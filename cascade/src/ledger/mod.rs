//! Idempotency ledger
//!
//! Inbound provider events and outbound side effects both pass through a
//! table keyed by a stable identity, so a webhook retry or a replayed
//! scheduler job produces exactly one effect.
//!
//! ```text
//!  webhook ──▶ record_inbound ──▶ New ──▶ handler ──▶ mark_processed
//!                          └────▶ Duplicate (200, no effect)
//!
//!  send ──▶ claim(key) ──▶ Owned ──▶ provider ──▶ complete / fail
//!                   ├───▶ Sent(id)  (reuse id, no provider call)
//!                   └───▶ InFlight  (another worker owns it)
//! ```

pub mod inbox;
pub mod outbox;

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::clock::SharedClock;
use crate::providers::ProviderError;
use crate::store::{Channel, SharedStore, StoreResult};

pub use inbox::InboxEvent;
pub use outbox::{Claim, OutboxMessage, OutboxStatus};

const KEY_CONTEXT: &str = "cascade outbox idempotency key v1";

/// Outcome of recording an inbound event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inbound {
    New,
    Duplicate,
}

/// Outcome of [`Ledger::dispatch`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The provider was called and accepted the request
    Dispatched(String),
    /// An earlier dispatch already succeeded
    AlreadySent(Option<String>),
    /// Another worker is dispatching this key right now
    InFlight,
    /// The provider was called and failed; the row is re-claimable
    Failed(ProviderError),
}

impl DispatchOutcome {
    /// Provider id of a successful (or previously successful) dispatch
    pub fn provider_id(&self) -> Option<&str> {
        match self {
            Self::Dispatched(id) => Some(id),
            Self::AlreadySent(id) => id.as_deref(),
            Self::InFlight | Self::Failed(_) => None,
        }
    }
}

/// Stable idempotency key for an outbound side effect
///
/// Built only from semantic parts (ids, attempt numbers, rounds); never from
/// wall-clock time, so a replay derives the same key.
pub fn derive_key(channel: Channel, parts: &[&str]) -> String {
    let mut hasher = blake3::Hasher::new_derive_key(KEY_CONTEXT);
    hasher.update(channel.as_str().as_bytes());
    for part in parts {
        hasher.update(&(part.len() as u64).to_le_bytes());
        hasher.update(part.as_bytes());
    }
    format!("{}:{}", channel, hasher.finalize().to_hex())
}

/// Inbox/outbox over the shared store
#[derive(Clone)]
pub struct Ledger {
    store: SharedStore,
    clock: SharedClock,
    stale_after: Duration,
}

impl Ledger {
    pub fn new(store: SharedStore, clock: SharedClock) -> Self {
        Self {
            store,
            clock,
            stale_after: Duration::from_secs(300),
        }
    }

    /// Age after which a `pending` outbox claim counts as abandoned
    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    // ── Inbound ──

    pub async fn record_inbound(&self, provider: &str, event_id: &str, payload: &str) -> StoreResult<Inbound> {
        let (provider, event_id, payload) = (provider.to_string(), event_id.to_string(), payload.to_string());
        let now = self.clock.now();
        let inserted = self
            .store
            .run(move |conn| inbox::record(conn, &provider, &event_id, &payload, now))
            .await?;
        Ok(if inserted { Inbound::New } else { Inbound::Duplicate })
    }

    pub async fn mark_processed(&self, provider: &str, event_id: &str) -> StoreResult<()> {
        let (provider, event_id) = (provider.to_string(), event_id.to_string());
        let now = self.clock.now();
        self.store
            .run(move |conn| inbox::mark_processed(conn, &provider, &event_id, now))
            .await
    }

    pub async fn mark_failed(&self, provider: &str, event_id: &str, error: &str) -> StoreResult<()> {
        let (provider, event_id, error) = (provider.to_string(), event_id.to_string(), error.to_string());
        let now = self.clock.now();
        self.store
            .run(move |conn| inbox::mark_failed(conn, &provider, &event_id, &error, now))
            .await
    }

    pub async fn inbound(&self, provider: &str, event_id: &str) -> StoreResult<Option<InboxEvent>> {
        let (provider, event_id) = (provider.to_string(), event_id.to_string());
        self.store.run(move |conn| inbox::get(conn, &provider, &event_id)).await
    }

    // ── Outbound ──

    pub async fn claim(&self, key: &str, channel: Channel) -> StoreResult<Claim> {
        let key = key.to_string();
        let now = self.clock.now();
        let stale_before = now - chrono::Duration::from_std(self.stale_after).unwrap_or_else(|_| chrono::Duration::zero());
        self.store
            .run(move |conn| outbox::claim(conn, &key, channel, now, stale_before))
            .await
    }

    pub async fn complete(&self, key: &str, provider_id: &str) -> StoreResult<()> {
        let (key, provider_id) = (key.to_string(), provider_id.to_string());
        let now = self.clock.now();
        self.store
            .run(move |conn| outbox::complete(conn, &key, &provider_id, now))
            .await
    }

    pub async fn fail(&self, key: &str, error: &str) -> StoreResult<()> {
        let (key, error) = (key.to_string(), error.to_string());
        let now = self.clock.now();
        self.store.run(move |conn| outbox::fail(conn, &key, &error, now)).await
    }

    pub async fn outbound(&self, key: &str) -> StoreResult<Option<OutboxMessage>> {
        let key = key.to_string();
        self.store.run(move |conn| outbox::get(conn, &key)).await
    }

    /// Run `send` at most once per successful delivery of `key`
    ///
    /// Store errors abort; provider errors are recorded on the row and
    /// returned as [`DispatchOutcome::Failed`].
    pub async fn dispatch<F, Fut>(&self, key: &str, channel: Channel, send: F) -> StoreResult<DispatchOutcome>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<String, ProviderError>>,
    {
        match self.claim(key, channel).await? {
            Claim::Sent(id) => {
                debug!(key, "Outbox hit, side effect already delivered");
                return Ok(DispatchOutcome::AlreadySent(id));
            }
            Claim::InFlight => {
                debug!(key, "Outbox key claimed by another worker");
                return Ok(DispatchOutcome::InFlight);
            }
            Claim::Owned { attempts } => {
                debug!(key, attempts, %channel, "Outbox claim owned");
            }
        }

        match send().await {
            Ok(provider_id) => {
                self.complete(key, &provider_id).await?;
                Ok(DispatchOutcome::Dispatched(provider_id))
            }
            Err(e) => {
                warn!(key, %channel, error = %e, "Provider dispatch failed");
                self.fail(key, &e.to_string()).await?;
                Ok(DispatchOutcome::Failed(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::store::Store;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn ledger() -> (Ledger, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::at_epoch());
        let store = Store::open_in_memory().unwrap().shared();
        (Ledger::new(store, clock.clone()), clock)
    }

    #[test]
    fn test_derive_key_is_stable_and_part_sensitive() {
        let a = derive_key(Channel::Call, &["inc", "w1", "1"]);
        assert_eq!(a, derive_key(Channel::Call, &["inc", "w1", "1"]));
        assert_ne!(a, derive_key(Channel::Call, &["inc", "w1", "2"]));
        assert_ne!(a, derive_key(Channel::Chat, &["inc", "w1", "1"]));
        // Length prefixes keep part boundaries significant
        assert_ne!(
            derive_key(Channel::Call, &["ab", "c"]),
            derive_key(Channel::Call, &["a", "bc"])
        );
        assert!(a.starts_with("call:"));
    }

    #[tokio::test]
    async fn test_inbound_duplicate_detection() {
        let (ledger, _) = ledger();
        assert_eq!(ledger.record_inbound("tel", "ev-1", "{}").await.unwrap(), Inbound::New);
        assert_eq!(ledger.record_inbound("tel", "ev-1", "{}").await.unwrap(), Inbound::Duplicate);
        assert_eq!(ledger.record_inbound("chat", "ev-1", "{}").await.unwrap(), Inbound::New);

        ledger.mark_failed("tel", "ev-1", "boom").await.unwrap();
        let row = ledger.inbound("tel", "ev-1").await.unwrap().unwrap();
        assert_eq!(row.error.as_deref(), Some("boom"));
        assert!(row.processed_at.is_some());
    }

    #[tokio::test]
    async fn test_dispatch_calls_provider_once() {
        let (ledger, _) = ledger();
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let send = move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, ProviderError>("msg-1".to_string())
        };

        let first = ledger.dispatch("k", Channel::Chat, send).await.unwrap();
        let second = ledger.dispatch("k", Channel::Chat, send).await.unwrap();

        assert_eq!(first, DispatchOutcome::Dispatched("msg-1".into()));
        assert_eq!(second, DispatchOutcome::AlreadySent(Some("msg-1".into())));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_dispatch_is_reclaimable() {
        let (ledger, _) = ledger();
        let failed = ledger
            .dispatch("k", Channel::Call, || async {
                Err(ProviderError::Request("timeout".into()))
            })
            .await
            .unwrap();
        assert!(matches!(failed, DispatchOutcome::Failed(_)));

        let row = ledger.outbound("k").await.unwrap().unwrap();
        assert_eq!(row.status, OutboxStatus::Failed);

        assert_eq!(ledger.claim("k", Channel::Call).await.unwrap(), Claim::Owned { attempts: 2 });
    }

    #[tokio::test]
    async fn test_fresh_pending_claim_is_in_flight_until_stale() {
        let (ledger, clock) = ledger();
        let ledger = ledger.with_stale_after(Duration::from_secs(60));
        assert!(matches!(ledger.claim("k", Channel::Chat).await.unwrap(), Claim::Owned { .. }));
        assert_eq!(ledger.claim("k", Channel::Chat).await.unwrap(), Claim::InFlight);

        clock.advance_secs(61);
        assert_eq!(ledger.claim("k", Channel::Chat).await.unwrap(), Claim::Owned { attempts: 2 });
        let row = ledger.outbound("k").await.unwrap().unwrap();
        assert_eq!(row.updated_at, clock.now());
    }
}
