//! Cascade event stream
//!
//! ```text
//! ┌──────────────┐     ┌──────────────┐     ┌──────────────┐
//! │  Machine /   │────▶│  Event Bus   │────▶│  Subscribers │
//! │  Controller  │     │  (broadcast) │     │   (recv)     │
//! └──────────────┘     └──────────────┘     └──────────────┘
//! ```

pub mod bus;
pub mod types;

pub use bus::{EventBus, EventFilter, FilteredReceiver, SharedEventBus};
pub use types::CascadeEvent;
