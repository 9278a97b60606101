//! Decommission workflow: revoke access, then forget the account

use std::sync::Arc;

use chrono::Utc;
use keyward_deploy::{AtomicFileDeployer, DeployPaths, SelectiveOutcome};
use keyward_model::{Account, AuditAction, AuditEntry, Store, StoreError};
use keyward_transport::TransportFactory;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn};

use crate::connect::{close_quietly, open_verified};
use crate::error::CoreError;
use crate::fleet::FleetRunner;
use crate::results::DecommissionResult;

/// How to decommission
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecommissionOptions {
    /// Log what would happen and change nothing
    pub dry_run: bool,
    /// Delete the record even if remote cleanup fails
    pub force: bool,
    /// Leave the host alone, only delete the record
    pub skip_remote_cleanup: bool,
    /// Strip only the managed block instead of retiring the whole file
    pub keep_other_content: bool,
}

/// Removes an account from its host and from storage
#[derive(Clone)]
pub struct DecommissionWorkflow {
    store: Arc<dyn Store>,
    transport: Arc<dyn TransportFactory>,
    deployer: AtomicFileDeployer,
    fleet: FleetRunner,
}

impl std::fmt::Debug for DecommissionWorkflow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecommissionWorkflow")
            .field("deployer", &self.deployer)
            .finish_non_exhaustive()
    }
}

impl DecommissionWorkflow {
    pub fn new(
        store: Arc<dyn Store>,
        transport: Arc<dyn TransportFactory>,
        paths: DeployPaths,
        fleet: FleetRunner,
    ) -> Self {
        Self {
            store,
            transport,
            deployer: AtomicFileDeployer::new(paths),
            fleet,
        }
    }

    /// Decommission one account
    ///
    /// The record is deleted only after remote cleanup succeeded, was
    /// skipped, or failed under `force`. Exactly one audit entry is written.
    #[instrument(skip(self, account), fields(account = %account.target()))]
    pub async fn decommission(
        &self,
        account: &Account,
        options: DecommissionOptions,
    ) -> DecommissionResult {
        let mut result = DecommissionResult::new(account);

        if options.dry_run {
            info!(
                account = %account.target(),
                remote = !options.skip_remote_cleanup,
                keep_other_content = options.keep_other_content,
                "dry run: would decommission account"
            );
            result.skipped = true;
            self.record(
                account,
                AuditAction::DecommissionDryRun,
                format!("{}: {}", account.target(), plan(options)),
            )
            .await;
            return result;
        }

        let mut remote_note = "remote cleanup skipped".to_string();
        if !options.skip_remote_cleanup {
            match self.clean_remote(account, options.keep_other_content).await {
                Ok(note) => {
                    result.remote_cleanup_done = true;
                    remote_note = note;
                }
                Err(e) if options.force => {
                    warn!(account = %account.target(), error = %e, "remote cleanup failed, forcing record deletion");
                    result.partial_note = Some(format!("remote cleanup failed: {e}"));
                    remote_note = "remote cleanup failed (forced)".to_string();
                }
                Err(e) => {
                    warn!(account = %account.target(), error = %e, "remote cleanup failed");
                    self.record(
                        account,
                        AuditAction::DecommissionFailed,
                        format!("{}: remote cleanup failed: {e}", account.target()),
                    )
                    .await;
                    result.error = Some(e);
                    return result;
                }
            }
        }

        let record_note = match self.store.delete_account(account.id).await {
            Ok(()) => "record deleted",
            Err(StoreError::AccountNotFound(_)) => {
                debug!(account = %account.target(), "account record already gone");
                "record already absent"
            }
            Err(e) => {
                error!(account = %account.target(), error = %e, "could not delete account record");
                self.record(
                    account,
                    AuditAction::DecommissionFailed,
                    format!("{}: {remote_note}; record delete failed: {e}", account.target()),
                )
                .await;
                result.error = Some(e.into());
                return result;
            }
        };
        result.database_delete_done = true;

        let mut details = format!("{}: {remote_note}; {record_note}", account.target());
        if let Some(note) = &result.partial_note {
            details.push_str("; partial: ");
            details.push_str(note);
        }
        self.record(account, AuditAction::DecommissionSuccess, details)
            .await;

        info!(account = %account.target(), partial = result.partial_note.is_some(), "account decommissioned");
        result
    }

    /// Decommission every account concurrently with the same options
    pub async fn decommission_fleet(
        &self,
        accounts: Vec<Account>,
        options: DecommissionOptions,
    ) -> Vec<DecommissionResult> {
        let workflow = self.clone();
        self.fleet
            .run(accounts, move |account| {
                let workflow = workflow.clone();
                async move { workflow.decommission(&account, options).await }
            })
            .await
    }

    async fn clean_remote(
        &self,
        account: &Account,
        keep_other_content: bool,
    ) -> Result<String, CoreError> {
        let session = open_verified(self.store.as_ref(), self.transport.as_ref(), account).await?;

        let cleaned = if keep_other_content {
            self.deployer
                .deploy_selective(session.as_ref(), "")
                .await
                .map(|outcome| match outcome {
                    SelectiveOutcome::Rewritten => "managed block removed".to_string(),
                    SelectiveOutcome::Unchanged => "no managed block present".to_string(),
                    SelectiveOutcome::Missing => "authorized_keys already absent".to_string(),
                })
        } else {
            self.deployer
                .retire(session.as_ref(), Utc::now())
                .await
                .map(|moved| match moved {
                    Some(path) => format!("authorized_keys moved to {path}"),
                    None => "authorized_keys already absent".to_string(),
                })
        };

        close_quietly(session).await;
        Ok(cleaned?)
    }

    async fn record(&self, account: &Account, action: AuditAction, details: String) {
        let entry = AuditEntry::new(action, details).for_account(account.id);
        if let Err(e) = self.store.append(entry).await {
            error!(account = %account.target(), action = action.as_str(), error = %e, "could not write audit entry");
        }
    }
}

fn plan(options: DecommissionOptions) -> &'static str {
    match (options.skip_remote_cleanup, options.keep_other_content) {
        (true, _) => "would delete the record only",
        (false, true) => "would strip the managed block and delete the record",
        (false, false) => "would retire authorized_keys and delete the record",
    }
}
