//! Core error types for keyward-core

use std::time::Duration;

use keyward_deploy::DeployError;
use keyward_model::{BootstrapStatus, ModelError, SessionId, StoreError};
use keyward_transport::{FailureKind, TransportError};
use thiserror::Error;

/// Errors that can occur in reconciliation workflows
#[derive(Error, Debug, Clone)]
pub enum CoreError {
    /// Remote file differs from what storage says it should be
    #[error("drift detected on {account}: expected {expected_hash}, found {actual_hash}")]
    Drift {
        account: String,
        expected_hash: String,
        actual_hash: String,
    },

    /// Serial-mode drift: the stamped serial has no system key
    #[error("drift detected on {account}: {reason}")]
    SerialDrift { account: String, reason: String },

    /// Account has never been deployed
    #[error("account {0} has not been deployed")]
    NotDeployed(String),

    /// Bootstrap session ran past its expiry
    #[error("bootstrap session {0} has expired")]
    SessionExpired(SessionId),

    /// Bootstrap session is not in a state that allows the request
    #[error("bootstrap session {id} is {status}")]
    SessionNotActive {
        id: SessionId,
        status: BootstrapStatus,
    },

    /// A different host key is already stored
    #[error("host {host} already has a different stored key ({stored}); presented {presented}")]
    HostKeyConflict {
        host: String,
        stored: String,
        presented: String,
    },

    /// Per-task deadline elapsed
    #[error("operation on {account} timed out after {after:?}")]
    Timeout { account: String, after: Duration },

    /// Spawned task panicked or was cancelled
    #[error("task for {account} failed: {reason}")]
    TaskFailed { account: String, reason: String },

    /// Actor communication error
    #[error("actor communication error: {0}")]
    Actor(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Deploy(#[from] DeployError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Model(#[from] ModelError),
}

impl CoreError {
    /// Transport failure category, including timeouts raised by the fleet runner
    #[must_use]
    pub fn kind(&self) -> Option<FailureKind> {
        match self {
            Self::Timeout { .. } => Some(FailureKind::Timeout),
            Self::Transport(e) => Some(e.kind()),
            Self::Deploy(e) => e.transport().map(TransportError::kind),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_drift(&self) -> bool {
        matches!(self, Self::Drift { .. } | Self::SerialDrift { .. })
    }

    #[must_use]
    pub fn is_timeout(&self) -> bool {
        self.kind() == Some(FailureKind::Timeout)
    }

    /// Whether the host could not be reached at all
    #[must_use]
    pub fn is_unreachable(&self) -> bool {
        match self {
            Self::Timeout { .. } => true,
            Self::Transport(e) => e.is_unreachable(),
            Self::Deploy(e) => e.transport().is_some_and(TransportError::is_unreachable),
            _ => false,
        }
    }

    /// Operator hint shown next to the error
    #[must_use]
    pub fn remediation_hint(&self) -> Option<&'static str> {
        match self {
            Self::Drift { .. } | Self::SerialDrift { .. } => {
                Some("redeploy the account to restore the intended keys")
            }
            Self::NotDeployed(_) => Some("deploy the account first"),
            Self::SessionExpired(_) => Some("start a new bootstrap"),
            Self::HostKeyConflict { .. } => {
                Some("verify the host out of band, then replace the stored key explicitly")
            }
            Self::Timeout { .. } => Some("check that the host is up, or raise the fleet deadline"),
            Self::Transport(e) => e.remediation_hint(),
            Self::Deploy(e) => e.remediation_hint(),
            _ => None,
        }
    }
}
