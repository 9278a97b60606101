//! Drift audit
//!
//! Audits never write to a host and never change an account's serial. The
//! only mutations are an `AUDIT_DRIFT` entry and a best-effort dirty flag.

use std::collections::HashSet;
use std::sync::Arc;

use keyward_deploy::{AtomicFileDeployer, ContentRenderer, DeployPaths, content_hash};
use keyward_model::{Account, AuditAction, AuditEntry, Store};
use keyward_transport::TransportFactory;
use tracing::{debug, instrument, warn};

use crate::connect::{close_quietly, open_verified};
use crate::error::CoreError;
use crate::fleet::FleetRunner;
use crate::results::{AuditMode, AuditResult};

/// Compares deployed state with intended state
#[derive(Clone)]
pub struct AuditEngine {
    store: Arc<dyn Store>,
    transport: Arc<dyn TransportFactory>,
    renderer: ContentRenderer,
    deployer: AtomicFileDeployer,
    fleet: FleetRunner,
}

impl std::fmt::Debug for AuditEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditEngine").finish_non_exhaustive()
    }
}

impl AuditEngine {
    pub fn new(
        store: Arc<dyn Store>,
        transport: Arc<dyn TransportFactory>,
        paths: DeployPaths,
        fleet: FleetRunner,
    ) -> Self {
        Self {
            renderer: ContentRenderer::from_store(store.clone()),
            store,
            transport,
            deployer: AtomicFileDeployer::new(paths),
            fleet,
        }
    }

    /// Audit one account
    #[instrument(skip(self, account), fields(account = %account.target(), mode = %mode))]
    pub async fn audit(&self, account: &Account, mode: AuditMode) -> AuditResult {
        if !account.is_deployed() {
            debug!(account = %account.target(), "account never deployed");
            return AuditResult::not_deployed(account, mode);
        }

        let checked = match mode {
            AuditMode::Serial => self.check_serial(account).await,
            AuditMode::Strict => self.check_strict(account).await,
        };

        match checked {
            Ok(()) => AuditResult::in_sync(account, mode),
            Err(e) => {
                if e.is_drift() {
                    self.record_drift(account, &e).await;
                } else {
                    warn!(account = %account.target(), error = %e, "audit failed");
                }
                AuditResult::failed(account, mode, e)
            }
        }
    }

    /// Audit every account concurrently in one mode
    pub async fn audit_fleet(&self, accounts: Vec<Account>, mode: AuditMode) -> Vec<AuditResult> {
        let engine = self.clone();
        self.fleet
            .run_with(
                accounts,
                move |account| {
                    let engine = engine.clone();
                    async move { engine.audit(&account, mode).await }
                },
                move |account, error| AuditResult::failed(account, mode, error),
            )
            .await
    }

    async fn check_serial(&self, account: &Account) -> Result<(), CoreError> {
        if self.store.system_key_by_serial(account.serial).await?.is_none() {
            return Err(CoreError::SerialDrift {
                account: account.target(),
                reason: format!("no system key with serial {}", account.serial),
            });
        }
        Ok(())
    }

    async fn check_strict(&self, account: &Account) -> Result<(), CoreError> {
        let session = open_verified(self.store.as_ref(), self.transport.as_ref(), account).await?;
        let fetched = self.deployer.fetch_current(session.as_ref()).await;
        close_quietly(session).await;

        let actual = fetched?
            .map(|data| String::from_utf8_lossy(&data).into_owned())
            .unwrap_or_default();
        let expected = self
            .renderer
            .render(account.id, &HashSet::new(), true)
            .await?;

        let expected_hash = content_hash(&expected);
        let actual_hash = content_hash(&actual);
        if expected_hash == actual_hash {
            debug!(account = %account.target(), hash = %expected_hash, "no drift");
            return Ok(());
        }

        Err(CoreError::Drift {
            account: account.target(),
            expected_hash,
            actual_hash,
        })
    }

    async fn record_drift(&self, account: &Account, drift: &CoreError) {
        warn!(account = %account.target(), error = %drift, "drift detected");

        let details = match drift {
            CoreError::Drift {
                expected_hash,
                actual_hash,
                ..
            } => format!(
                "{}: expected_hash={expected_hash} actual_hash={actual_hash}",
                account.target()
            ),
            other => format!("{}: {other}", account.target()),
        };
        let entry = AuditEntry::new(AuditAction::AuditDrift, details).for_account(account.id);
        if let Err(e) = self.store.append(entry).await {
            warn!(account = %account.target(), error = %e, "could not record drift");
        }

        if let Err(e) = self.store.set_dirty(account.id, true).await {
            warn!(account = %account.target(), error = %e, "could not mark account dirty");
        }
    }
}
