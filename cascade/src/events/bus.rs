//! Event bus for cascade observers
//!
//! Tokio broadcast pub/sub. Publishing never fails: a cascade keeps running
//! whether or not anyone is listening.

use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

use super::types::CascadeEvent;

/// Events buffered per receiver before it starts lagging
const DEFAULT_CAPACITY: usize = 256;

/// Bus handle shared by the engine components
pub type SharedEventBus = Arc<EventBus>;

/// Broadcast bus for [`CascadeEvent`]s
pub struct EventBus {
    sender: broadcast::Sender<CascadeEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a bus that buffers up to `capacity` events per lagging receiver
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Wrap the bus in an `Arc`
    pub fn shared(self) -> SharedEventBus {
        Arc::new(self)
    }

    /// Fan `event` out to every live receiver
    pub fn publish(&self, event: CascadeEvent) {
        let kind = event.event_type();
        let receivers = self.sender.send(event).unwrap_or(0);
        debug!(event_type = kind, receivers, "Cascade event published");
    }

    /// Raw receiver for every event
    pub fn subscribe(&self) -> broadcast::Receiver<CascadeEvent> {
        self.sender.subscribe()
    }

    /// Subscribe to events matching a filter
    pub fn subscribe_filtered(&self, filter: EventFilter) -> FilteredReceiver {
        FilteredReceiver {
            receiver: self.subscribe(),
            filter,
        }
    }

    /// Live receivers right now
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Narrows a subscription to one incident and/or a set of event types
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub incident_id: Option<String>,
    pub kinds: Option<Vec<String>>,
}

impl EventFilter {
    /// Filter that lets everything through
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incident(mut self, incident_id: &str) -> Self {
        self.incident_id = Some(incident_id.to_string());
        self
    }

    /// Only pass events whose `event_type()` is one of `kinds`
    pub fn types<'a>(mut self, kinds: impl IntoIterator<Item = &'a str>) -> Self {
        self.kinds = Some(kinds.into_iter().map(str::to_owned).collect());
        self
    }

    pub fn matches(&self, event: &CascadeEvent) -> bool {
        let incident_ok = self
            .incident_id
            .as_deref()
            .map_or(true, |id| event.incident_id() == Some(id));
        let kind_ok = self
            .kinds
            .as_ref()
            .map_or(true, |kinds| kinds.iter().any(|k| k == event.event_type()));
        incident_ok && kind_ok
    }
}

/// Receiver that only yields events matching its filter
pub struct FilteredReceiver {
    receiver: broadcast::Receiver<CascadeEvent>,
    filter: EventFilter,
}

impl FilteredReceiver {
    /// Wait for the next event that passes the filter
    pub async fn recv(&mut self) -> Result<CascadeEvent, broadcast::error::RecvError> {
        loop {
            let next = self.receiver.recv().await?;
            if self.filter.matches(&next) {
                return Ok(next);
            }
        }
    }
}
