//! Per-account outcomes, batch counts and progress reporting

use std::fmt;

use keyward_model::{Account, AccountId};
use serde::Serialize;
use tracing::{info, warn};

use crate::error::CoreError;

/// Account an outcome belongs to
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccountRef {
    pub id: AccountId,
    /// `user@host`
    pub target: String,
}

impl From<&Account> for AccountRef {
    fn from(account: &Account) -> Self {
        Self {
            id: account.id,
            target: account.target(),
        }
    }
}

impl fmt::Display for AccountRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (#{})", self.target, self.id)
    }
}

/// Coarse outcome used for counting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutcomeStatus {
    Succeeded,
    Failed,
    Skipped,
}

/// Common view over the per-account result types
pub trait Outcome: Send + 'static {
    fn account(&self) -> &AccountRef;

    fn error(&self) -> Option<&CoreError>;

    fn skipped(&self) -> bool;

    fn status(&self) -> OutcomeStatus {
        if self.error().is_some() {
            OutcomeStatus::Failed
        } else if self.skipped() {
            OutcomeStatus::Skipped
        } else {
            OutcomeStatus::Succeeded
        }
    }

    /// Result for an account whose task never produced one
    fn from_failure(account: &Account, error: CoreError) -> Self
    where
        Self: Sized;
}

/// Outcome of deploying one account
#[derive(Debug, Clone)]
pub struct DeployResult {
    pub account: AccountRef,
    /// Serial stamped on the account after success
    pub serial: Option<u64>,
    pub key_hash: Option<String>,
    pub skipped: bool,
    pub error: Option<CoreError>,
}

impl DeployResult {
    #[must_use]
    pub fn deployed(account: &Account, serial: u64, key_hash: String) -> Self {
        Self {
            account: account.into(),
            serial: Some(serial),
            key_hash: Some(key_hash),
            skipped: false,
            error: None,
        }
    }

    #[must_use]
    pub fn skip(account: &Account) -> Self {
        Self {
            account: account.into(),
            serial: None,
            key_hash: None,
            skipped: true,
            error: None,
        }
    }

    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

impl Outcome for DeployResult {
    fn account(&self) -> &AccountRef {
        &self.account
    }

    fn error(&self) -> Option<&CoreError> {
        self.error.as_ref()
    }

    fn skipped(&self) -> bool {
        self.skipped
    }

    fn from_failure(account: &Account, error: CoreError) -> Self {
        Self {
            account: account.into(),
            serial: None,
            key_hash: None,
            skipped: false,
            error: Some(error),
        }
    }
}

/// Audit strength
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditMode {
    /// Compare the whole remote file by content hash
    Strict,
    /// Compare only the stamped serial; no host contact
    Serial,
}

impl fmt::Display for AuditMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Strict => f.write_str("strict"),
            Self::Serial => f.write_str("serial"),
        }
    }
}

/// Outcome of auditing one account
#[derive(Debug, Clone)]
pub struct AuditResult {
    pub account: AccountRef,
    pub mode: AuditMode,
    /// Account was never deployed; reported as skipped, never as drift
    pub not_deployed: bool,
    pub error: Option<CoreError>,
}

impl AuditResult {
    #[must_use]
    pub fn in_sync(account: &Account, mode: AuditMode) -> Self {
        Self {
            account: account.into(),
            mode,
            not_deployed: false,
            error: None,
        }
    }

    #[must_use]
    pub fn not_deployed(account: &Account, mode: AuditMode) -> Self {
        Self {
            not_deployed: true,
            ..Self::in_sync(account, mode)
        }
    }

    #[must_use]
    pub fn failed(account: &Account, mode: AuditMode, error: CoreError) -> Self {
        Self {
            error: Some(error),
            ..Self::in_sync(account, mode)
        }
    }

    #[must_use]
    pub fn is_drift(&self) -> bool {
        self.error.as_ref().is_some_and(CoreError::is_drift)
    }
}

impl Outcome for AuditResult {
    fn account(&self) -> &AccountRef {
        &self.account
    }

    fn error(&self) -> Option<&CoreError> {
        self.error.as_ref()
    }

    fn skipped(&self) -> bool {
        self.not_deployed
    }

    /// Reported as strict; `AuditEngine::audit_fleet` supplies its own mode instead
    fn from_failure(account: &Account, error: CoreError) -> Self {
        Self::failed(account, AuditMode::Strict, error)
    }
}

/// Outcome of decommissioning one account
#[derive(Debug, Clone)]
pub struct DecommissionResult {
    pub account: AccountRef,
    /// Dry run; nothing was changed
    pub skipped: bool,
    pub remote_cleanup_done: bool,
    pub database_delete_done: bool,
    /// Set when the record was deleted despite a failed remote cleanup
    pub partial_note: Option<String>,
    pub error: Option<CoreError>,
}

impl DecommissionResult {
    #[must_use]
    pub fn new(account: &Account) -> Self {
        Self {
            account: account.into(),
            skipped: false,
            remote_cleanup_done: false,
            database_delete_done: false,
            partial_note: None,
            error: None,
        }
    }
}

impl Outcome for DecommissionResult {
    fn account(&self) -> &AccountRef {
        &self.account
    }

    fn error(&self) -> Option<&CoreError> {
        self.error.as_ref()
    }

    fn skipped(&self) -> bool {
        self.skipped
    }

    fn from_failure(account: &Account, error: CoreError) -> Self {
        Self {
            error: Some(error),
            ..Self::new(account)
        }
    }
}

/// Aggregate counts for a batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl BatchSummary {
    #[must_use]
    pub fn from_results<R: Outcome>(results: &[R]) -> Self {
        results.iter().fold(
            Self {
                total: results.len(),
                ..Self::default()
            },
            |mut summary, result| {
                match result.status() {
                    OutcomeStatus::Succeeded => summary.succeeded += 1,
                    OutcomeStatus::Failed => summary.failed += 1,
                    OutcomeStatus::Skipped => summary.skipped += 1,
                }
                summary
            },
        )
    }

    #[must_use]
    pub fn all_succeeded(&self) -> bool {
        self.failed == 0
    }
}

impl fmt::Display for BatchSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} total: {} ok, {} failed, {} skipped",
            self.total, self.succeeded, self.failed, self.skipped
        )
    }
}

/// Sink for progress lines
pub trait Reporter: Send + Sync {
    /// One account finished
    fn account_done(
        &self,
        operation: &str,
        account: &AccountRef,
        status: OutcomeStatus,
        error: Option<&CoreError>,
    );

    /// The whole batch finished
    fn batch_done(&self, operation: &str, summary: &BatchSummary);
}

/// Reporter that writes progress to `tracing`
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingReporter;

impl Reporter for TracingReporter {
    fn account_done(
        &self,
        operation: &str,
        account: &AccountRef,
        status: OutcomeStatus,
        error: Option<&CoreError>,
    ) {
        match error {
            Some(e) => warn!(
                operation,
                account = %account,
                error = %e,
                hint = e.remediation_hint().unwrap_or_default(),
                "account failed"
            ),
            None => info!(operation, account = %account, status = ?status, "account done"),
        }
    }

    fn batch_done(&self, operation: &str, summary: &BatchSummary) {
        info!(
            operation,
            total = summary.total,
            succeeded = summary.succeeded,
            failed = summary.failed,
            skipped = summary.skipped,
            "batch finished"
        );
    }
}

/// Report every result, then the summary
pub fn report_batch<R: Outcome>(
    reporter: &dyn Reporter,
    operation: &str,
    results: &[R],
) -> BatchSummary {
    for result in results {
        reporter.account_done(operation, result.account(), result.status(), result.error());
    }
    let summary = BatchSummary::from_results(results);
    reporter.batch_done(operation, &summary);
    summary
}
