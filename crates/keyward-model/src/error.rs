//! Error types for keyward-model

use thiserror::Error;

use crate::bootstrap::BootstrapStatus;

/// Errors raised by domain-level validation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModelError {
    /// Bootstrap session status change not permitted by the transition table
    #[error("invalid bootstrap transition from {from} to {to}")]
    InvalidTransition {
        /// Current status
        from: BootstrapStatus,
        /// Attempted target status
        to: BootstrapStatus,
    },

    /// Secret material is not valid UTF-8
    #[error("secret is not valid UTF-8")]
    SecretNotUtf8,

    /// Authorized key line could not be parsed
    #[error("invalid authorized key line: {0}")]
    InvalidKeyLine(String),
}

/// Errors returned by the persistence ports
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    /// Account does not exist
    #[error("account not found: {0}")]
    AccountNotFound(String),

    /// Bootstrap session does not exist
    #[error("bootstrap session not found: {0}")]
    SessionNotFound(String),

    /// Unique constraint violated
    #[error("already exists: {0}")]
    Conflict(String),

    /// Backend failure (connection lost, constraint, I/O)
    #[error("storage backend error: {0}")]
    Backend(String),

    /// Domain validation failed while persisting
    #[error(transparent)]
    Model(#[from] ModelError),
}
