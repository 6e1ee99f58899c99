//! Service shell around the cascade engine
//!
//! - [`config`]: `ServiceConfig` (database, provider endpoints, webhook secrets)
//! - [`providers`]: reqwest clients implementing the engine's provider traits
//! - [`runtime`]: wiring and scheduler lifecycle
//! - [`telemetry`]: tracing subscriber setup

pub mod config;
pub mod providers;
pub mod runtime;
pub mod telemetry;

pub use config::{ProviderEndpoint, ServiceConfig};
pub use runtime::Runtime;
