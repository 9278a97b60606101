//! Deploy workflow: push rendered keys to accounts

use std::collections::HashSet;
use std::sync::Arc;

use keyward_deploy::{
    AtomicFileDeployer, ContentRenderer, DeployError, DeployPaths, content_hash, managed_serial,
};
use keyward_model::{Account, KeyId, Store};
use keyward_transport::{TransportFactory, TransportSession};
use tracing::{info, instrument, warn};

use crate::connect::{close_quietly, open_verified};
use crate::error::CoreError;
use crate::fleet::FleetRunner;
use crate::results::{DeployResult, Outcome};

/// Renders and deploys `authorized_keys` under the active system key
#[derive(Clone)]
pub struct DeployWorkflow {
    store: Arc<dyn Store>,
    transport: Arc<dyn TransportFactory>,
    renderer: ContentRenderer,
    deployer: AtomicFileDeployer,
    fleet: FleetRunner,
}

impl std::fmt::Debug for DeployWorkflow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeployWorkflow")
            .field("deployer", &self.deployer)
            .field("fleet", &self.fleet)
            .finish_non_exhaustive()
    }
}

impl DeployWorkflow {
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

    /// Deploy one account
    ///
    /// Inactive accounts are skipped. On success the account is stamped with
    /// the active serial and the content hash, which clears its dirty flag.
    #[instrument(skip(self, account), fields(account = %account.target()))]
    pub async fn deploy(&self, account: &Account) -> DeployResult {
        if !account.is_active {
            info!(account = %account.target(), "account inactive, skipping deploy");
            return DeployResult::skip(account);
        }

        match self.try_deploy(account, &HashSet::new(), false).await {
            Ok((serial, hash)) => DeployResult::deployed(account, serial, hash),
            Err(e) => {
                warn!(account = %account.target(), error = %e, "deploy failed");
                DeployResult::from_failure(account, e)
            }
        }
    }

    /// Deploy every account concurrently
    pub async fn deploy_fleet(&self, accounts: Vec<Account>) -> Vec<DeployResult> {
        let workflow = self.clone();
        self.fleet
            .run(accounts, move |account| {
                let workflow = workflow.clone();
                async move { workflow.deploy(&account).await }
            })
            .await
    }

    /// Rewrite only the managed block without the given keys
    ///
    /// Content outside the block is kept as is.
    #[instrument(skip(self, account, excluded), fields(account = %account.target(), excluded = excluded.len()))]
    pub async fn remove_keys(&self, account: &Account, excluded: &HashSet<KeyId>) -> DeployResult {
        match self.try_deploy(account, excluded, true).await {
            Ok((serial, hash)) => DeployResult::deployed(account, serial, hash),
            Err(e) => {
                warn!(account = %account.target(), error = %e, "key removal failed");
                DeployResult::from_failure(account, e)
            }
        }
    }

    async fn try_deploy(
        &self,
        account: &Account,
        excluded: &HashSet<KeyId>,
        selective: bool,
    ) -> Result<(u64, String), CoreError> {
        let content = self.renderer.render(account.id, excluded, true).await?;
        let serial = managed_serial(&content).ok_or(DeployError::NoActiveSystemKey)?;

        let session = open_verified(self.store.as_ref(), self.transport.as_ref(), account).await?;
        let pushed = self.push(session.as_ref(), &content, selective).await;
        close_quietly(session).await;
        pushed?;

        let hash = content_hash(&content);
        self.store.update_serial(account.id, serial, &hash).await?;

        info!(account = %account.target(), serial, "account deployed");
        Ok((serial, hash))
    }

    async fn push(
        &self,
        session: &dyn TransportSession,
        content: &str,
        selective: bool,
    ) -> Result<(), CoreError> {
        if selective {
            self.deployer.deploy_selective(session, content).await?;
        } else {
            self.deployer.deploy_full(session, content).await?;
        }
        Ok(())
    }
}
