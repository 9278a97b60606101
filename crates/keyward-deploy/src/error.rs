//! Error types for keyward-deploy

use keyward_model::StoreError;
use keyward_transport::TransportError;
use thiserror::Error;

/// Errors that can occur while rendering or deploying authorized keys
#[derive(Error, Debug, Clone)]
pub enum DeployError {
    /// No system key is active, so no managed block can be produced
    #[error("no active system key")]
    NoActiveSystemKey,

    /// Remote file holds bytes that are not UTF-8 and cannot be spliced
    #[error("remote file {0} is not valid UTF-8")]
    NotUtf8(String),

    /// Final rename failed and the previous file could not be put back
    #[error("deploy to {path} failed ({deploy}) and restoring the backup also failed ({restore})")]
    RestoreFailed {
        path: String,
        deploy: TransportError,
        restore: TransportError,
    },

    /// Remote operation failed
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Key lookup failed
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl DeployError {
    /// The underlying transport failure, if any
    #[must_use]
    pub fn transport(&self) -> Option<&TransportError> {
        match self {
            Self::Transport(e) | Self::RestoreFailed { deploy: e, .. } => Some(e),
            _ => None,
        }
    }

    /// Operator hint shown next to the error
    #[must_use]
    pub fn remediation_hint(&self) -> Option<&'static str> {
        match self {
            Self::NoActiveSystemKey => Some("generate or activate a system key first"),
            Self::RestoreFailed { .. } => {
                Some("inspect authorized_keys.keyward-bak on the host and restore it by hand")
            }
            _ => self.transport().and_then(TransportError::remediation_hint),
        }
    }
}
