//! Error types for the Coachflow domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error variant.

use thiserror::Error;

/// The top-level error type for all Coachflow operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Store errors ---
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    // --- Sender errors ---
    #[error("Send error: {0}")]
    Send(#[from] SendError),

    // --- Configuration errors (one bad sequence/rule, never the whole run) ---
    #[error("Configuration error in {entity}: {reason}")]
    Configuration { entity: String, reason: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Sequence is inactive: {0}")]
    SequenceInactive(String),

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Shorthand for a configuration error on a named entity.
    pub fn configuration(entity: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::Configuration {
            entity: entity.into(),
            reason: reason.into(),
        }
    }
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Query failed: {0}")]
    QueryFailed(String),

    #[error("Migration failed: {0}")]
    MigrationFailed(String),
}

/// Failure reported by a [`crate::MessageSender`].
#[derive(Debug, Clone, Error)]
pub enum SendError {
    /// Network or provider outage. Never advances state; retried next tick.
    #[error("Transient send failure: {0}")]
    Transient(String),

    /// Bad recipient, missing template. Recorded as terminal, never retried.
    #[error("Permanent send failure: {0}")]
    Permanent(String),

    #[error("Send timed out after {secs}s")]
    Timeout { secs: u64 },
}

impl SendError {
    pub fn is_transient(&self) -> bool {
        matches!(self, SendError::Transient(_) | SendError::Timeout { .. })
    }
}
