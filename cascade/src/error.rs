//! Domain error type
//!
//! Absence and duplicates are not errors: domain operations report them as
//! `bool`/`Option`/outcome enums. `CascadeError` covers what is left.

use thiserror::Error;

use crate::providers::ProviderError;
use crate::scheduler::SchedulerError;
use crate::store::StoreError;

/// Result type alias for cascade operations
pub type CascadeResult<T> = Result<T, CascadeError>;

#[derive(Debug, Error)]
pub enum CascadeError {
    /// Bad input from a synchronous caller
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Lookup failed at an API boundary
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Persistence error: {0}")]
    Persistence(#[from] StoreError),

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),
}

impl CascadeError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound { kind, id: id.into() }
    }

    /// HTTP-style status for boundary callers
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Validation(_) => 400,
            Self::NotFound { .. } => 404,
            Self::Provider(_) => 502,
            Self::Persistence(_) | Self::Scheduler(_) => 500,
        }
    }
}
