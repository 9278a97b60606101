//! Audit log entries

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::account::AccountId;

/// Kinds of audit events the engine records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditAction {
    /// Strict audit found remote content diverging from the rendered content
    AuditDrift,
    /// Bootstrap committed and the account was created
    BootstrapCompleted,
    /// Bootstrap failed, expired or was reaped
    BootstrapFailed,
    /// Decommission ran in dry-run mode
    DecommissionDryRun,
    /// Remote cleanup failed and blocked deletion
    DecommissionFailed,
    /// Account deleted (possibly after a forced remote failure)
    DecommissionSuccess,
    /// Host key stored through an explicit trust operation
    HostTrusted,
}

impl AuditAction {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AuditDrift => "AUDIT_DRIFT",
            Self::BootstrapCompleted => "BOOTSTRAP_COMPLETED",
            Self::BootstrapFailed => "BOOTSTRAP_FAILED",
            Self::DecommissionDryRun => "DECOMMISSION_DRY_RUN",
            Self::DecommissionFailed => "DECOMMISSION_FAILED",
            Self::DecommissionSuccess => "DECOMMISSION_SUCCESS",
            Self::HostTrusted => "HOST_TRUSTED",
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One append-only audit row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub action: AuditAction,
    pub account_id: Option<AccountId>,
    pub details: String,
    pub created_at: DateTime<Utc>,
}

impl AuditEntry {
    /// Create an entry timestamped now
    pub fn new(action: AuditAction, details: impl Into<String>) -> Self {
        Self {
            action,
            account_id: None,
            details: details.into(),
            created_at: Utc::now(),
        }
    }

    /// Attach the account the event concerns
    #[must_use]
    pub fn for_account(mut self, id: AccountId) -> Self {
        self.account_id = Some(id);
        self
    }
}
