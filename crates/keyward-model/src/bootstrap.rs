//! Bootstrap session state machine

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::account::NewAccount;
use crate::error::ModelError;
use crate::secret::SecretBytes;

/// Bootstrap session identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub Uuid);

impl SessionId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// States of an in-flight bootstrap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BootstrapStatus {
    /// Temporary key issued, waiting for the host to be reached
    Active,
    /// Managed block deployed, temporary key being removed
    Committing,
    /// Abandoned; waiting for the reaper
    Orphaned,
}

impl BootstrapStatus {
    /// Transition table
    ///
    /// `Active -> Committing -> (deleted)`, with `Orphaned` reachable from
    /// both live states. `Orphaned` is terminal.
    #[must_use]
    pub fn can_transition_to(self, to: BootstrapStatus) -> bool {
        matches!(
            (self, to),
            (Self::Active, Self::Committing)
                | (Self::Active, Self::Orphaned)
                | (Self::Committing, Self::Orphaned)
        )
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Committing => "committing",
            Self::Orphaned => "orphaned",
        }
    }
}

impl fmt::Display for BootstrapStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Account fields held until the bootstrap commits
pub type PendingAccount = NewAccount;

/// Persisted onboarding state for one new host
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BootstrapSession {
    pub id: SessionId,
    pub pending: PendingAccount,
    /// OpenSSH public key line of the single-use keypair
    pub temp_public_key: String,
    /// OpenSSH PEM private key of the single-use keypair
    pub temp_private_key: SecretBytes,
    status: BootstrapStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// When `status` last changed
    pub status_changed_at: DateTime<Utc>,
}

impl BootstrapSession {
    /// Create an `Active` session expiring `ttl` after `now`
    #[must_use]
    pub fn new(
        pending: PendingAccount,
        temp_public_key: String,
        temp_private_key: SecretBytes,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Self {
        Self {
            id: SessionId::new(),
            pending,
            temp_public_key,
            temp_private_key,
            status: BootstrapStatus::Active,
            created_at: now,
            expires_at: now + ttl,
            status_changed_at: now,
        }
    }

    #[must_use]
    pub fn status(&self) -> BootstrapStatus {
        self.status
    }

    /// Guarded status setter
    ///
    /// # Errors
    /// Returns `ModelError::InvalidTransition` if the table forbids the move
    pub fn transition(&mut self, to: BootstrapStatus, now: DateTime<Utc>) -> Result<(), ModelError> {
        if !self.status.can_transition_to(to) {
            return Err(ModelError::InvalidTransition {
                from: self.status,
                to,
            });
        }
        self.status = to;
        self.status_changed_at = now;
        Ok(())
    }

    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Whether the reaper should collect this session
    ///
    /// Expired sessions, orphaned sessions and sessions stuck in
    /// `Committing` for longer than `committing_grace` are reapable.
    #[must_use]
    pub fn is_reapable(&self, now: DateTime<Utc>, committing_grace: Duration) -> bool {
        match self.status {
            BootstrapStatus::Orphaned => true,
            BootstrapStatus::Committing => {
                self.is_expired(now) || self.status_changed_at + committing_grace <= now
            }
            BootstrapStatus::Active => self.is_expired(now),
        }
    }

    /// `user@host` of the pending account
    #[must_use]
    pub fn target(&self) -> String {
        format!("{}@{}", self.pending.username, self.pending.hostname)
    }

    /// Key for the known-hosts table
    #[must_use]
    pub fn host_address(&self) -> String {
        format!("{}:{}", self.pending.hostname, self.pending.port)
    }
}
