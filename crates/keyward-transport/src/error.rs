//! Error types and failure classification for keyward-transport

use std::fmt;
use std::io;
use std::time::Duration;

use keyward_model::StoreError;
use thiserror::Error;

use crate::trust::HostKeyVerdict;

/// Coarse category of a transport failure
///
/// Drives remediation hints only; callers never change control flow on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    Timeout,
    ConnectionRefused,
    AuthenticationFailure,
    HostKeyUnknown,
    HostKeyMismatch,
    Other,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Timeout => "timeout",
            Self::ConnectionRefused => "connection refused",
            Self::AuthenticationFailure => "authentication failure",
            Self::HostKeyUnknown => "host key unknown",
            Self::HostKeyMismatch => "host key mismatch",
            Self::Other => "other",
        };
        f.write_str(s)
    }
}

/// Errors that can occur while reaching a host or touching its files
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    /// Connection could not be established in time
    #[error("connection to {host} timed out after {timeout:?}")]
    Timeout { host: String, timeout: Duration },

    /// Remote port closed or host actively refused
    #[error("connection to {host} refused: {reason}")]
    ConnectionRefused { host: String, reason: String },

    /// Connection failed for another network reason
    #[error("connection to {host} failed: {reason}")]
    ConnectionFailed { host: String, reason: String },

    /// Authentication failed
    #[error("authentication to {host} failed: {reason}")]
    AuthenticationFailed { host: String, reason: String },

    /// Host presented a key while none is stored for it
    #[error("host key for {host} is not known ({fingerprint})")]
    HostKeyUnknown { host: String, fingerprint: String },

    /// Host presented a key different from the stored or pinned one
    #[error("host key for {host} does not match: expected {expected}, presented {presented}")]
    HostKeyMismatch {
        host: String,
        expected: String,
        presented: String,
    },

    /// SFTP subsystem could not be started
    #[error("failed to open SFTP channel: {0}")]
    SftpChannel(String),

    /// Remote file does not exist
    #[error("remote file missing: {0}")]
    RemoteFileMissing(String),

    /// SFTP operation failed
    #[error("SFTP {op} on {path} failed: {reason}")]
    Sftp {
        op: &'static str,
        path: String,
        reason: String,
    },

    /// SFTP operation exceeded the operation timeout
    #[error("SFTP {op} timed out after {timeout:?}")]
    OperationTimeout { op: &'static str, timeout: Duration },

    /// Private key is encrypted and no passphrase is available
    #[error("passphrase required to unlock {0}")]
    PassphraseRequired(String),

    /// Private key material could not be decoded or generated
    #[error("invalid key material: {0}")]
    InvalidKey(String),

    /// Stored state refers to data that does not exist
    #[error("database inconsistency: {0}")]
    DatabaseInconsistency(String),

    /// Persistence port failure
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl TransportError {
    /// Failure category for reporting
    #[must_use]
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Timeout { .. } | Self::OperationTimeout { .. } => FailureKind::Timeout,
            Self::ConnectionRefused { .. } => FailureKind::ConnectionRefused,
            Self::AuthenticationFailed { .. } | Self::PassphraseRequired(_) => {
                FailureKind::AuthenticationFailure
            }
            Self::HostKeyUnknown { .. } => FailureKind::HostKeyUnknown,
            Self::HostKeyMismatch { .. } => FailureKind::HostKeyMismatch,
            _ => FailureKind::Other,
        }
    }

    /// Operator hint shown next to the error
    #[must_use]
    pub fn remediation_hint(&self) -> Option<&'static str> {
        match self {
            Self::HostKeyUnknown { .. } => Some("run trust-host to record the host key"),
            Self::HostKeyMismatch { .. } => Some(
                "the host key changed; verify the host out of band before replacing the stored key",
            ),
            Self::Timeout { .. } | Self::OperationTimeout { .. } => {
                Some("check that the host is up and reachable, or raise the timeout")
            }
            Self::ConnectionRefused { .. } => Some("check that sshd is running and the port is correct"),
            Self::AuthenticationFailed { .. } => {
                Some("the host no longer trusts the system key; re-bootstrap the account")
            }
            Self::PassphraseRequired(_) => Some("unlock the system key before deploying"),
            Self::DatabaseInconsistency(_) => {
                Some("restore the missing system key or reset the account serial")
            }
            _ => None,
        }
    }

    /// Check if error is retryable
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. }
                | Self::OperationTimeout { .. }
                | Self::ConnectionRefused { .. }
                | Self::ConnectionFailed { .. }
        )
    }

    /// Whether the host could not be reached at all
    #[must_use]
    pub fn is_unreachable(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::ConnectionRefused { .. } | Self::ConnectionFailed { .. }
        )
    }

    /// Typed error for a host key the trust policy refused; `None` if accepted
    #[must_use]
    pub fn from_verdict(host: &str, verdict: &HostKeyVerdict) -> Option<Self> {
        match verdict {
            HostKeyVerdict::Trusted { .. } | HostKeyVerdict::TrustedNew { .. } => None,
            HostKeyVerdict::Unknown { presented } => Some(Self::HostKeyUnknown {
                host: host.to_string(),
                fingerprint: crate::trust::fingerprint(presented),
            }),
            HostKeyVerdict::Mismatch {
                expected,
                presented,
            } => Some(Self::HostKeyMismatch {
                host: host.to_string(),
                expected: crate::trust::fingerprint(expected),
                presented: crate::trust::fingerprint(presented),
            }),
        }
    }

    /// Build the typed error for a failed connection attempt
    pub(crate) fn from_connect(
        host: &str,
        err: &russh::Error,
        verdict: Option<&HostKeyVerdict>,
        timeout: Duration,
    ) -> Self {
        let host = host.to_string();
        match (classify(err, verdict), verdict) {
            (FailureKind::HostKeyMismatch, Some(HostKeyVerdict::Mismatch { expected, presented })) => {
                Self::HostKeyMismatch {
                    host,
                    expected: crate::trust::fingerprint(expected),
                    presented: crate::trust::fingerprint(presented),
                }
            }
            (FailureKind::HostKeyUnknown, verdict) => Self::HostKeyUnknown {
                host,
                fingerprint: verdict
                    .map(|v| crate::trust::fingerprint(v.presented()))
                    .unwrap_or_else(|| "unavailable".to_string()),
            },
            (FailureKind::HostKeyMismatch, _) => Self::HostKeyMismatch {
                host,
                expected: "unavailable".to_string(),
                presented: "unavailable".to_string(),
            },
            (FailureKind::Timeout, _) => Self::Timeout { host, timeout },
            (FailureKind::ConnectionRefused, _) => Self::ConnectionRefused {
                host,
                reason: err.to_string(),
            },
            (FailureKind::AuthenticationFailure, _) => Self::AuthenticationFailed {
                host,
                reason: err.to_string(),
            },
            (FailureKind::Other, _) => Self::ConnectionFailed {
                host,
                reason: err.to_string(),
            },
        }
    }
}

/// Classify an underlying transport error
///
/// A host-key verdict recorded during the handshake takes precedence, since
/// russh only reports a generic rejection when the handler refuses a key.
#[must_use]
pub fn classify(err: &russh::Error, verdict: Option<&HostKeyVerdict>) -> FailureKind {
    match verdict {
        Some(HostKeyVerdict::Unknown { .. }) => return FailureKind::HostKeyUnknown,
        Some(HostKeyVerdict::Mismatch { .. }) => return FailureKind::HostKeyMismatch,
        _ => {}
    }

    match err {
        russh::Error::ConnectionTimeout
        | russh::Error::KeepaliveTimeout
        | russh::Error::InactivityTimeout => FailureKind::Timeout,
        russh::Error::UnknownKey => FailureKind::HostKeyUnknown,
        russh::Error::NotAuthenticated | russh::Error::NoAuthMethod => {
            FailureKind::AuthenticationFailure
        }
        russh::Error::IO(e) => classify_io(e.kind()),
        _ => FailureKind::Other,
    }
}

/// Classify a socket-level error
#[must_use]
pub fn classify_io(kind: io::ErrorKind) -> FailureKind {
    match kind {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => FailureKind::Timeout,
        io::ErrorKind::ConnectionRefused | io::ErrorKind::ConnectionReset => {
            FailureKind::ConnectionRefused
        }
        _ => FailureKind::Other,
    }
}
