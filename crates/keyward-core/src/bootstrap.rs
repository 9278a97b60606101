//! Bootstrap workflow: onboard a host with a single-use key
//!
//! `begin` issues the temporary key the operator installs by hand;
//! `complete` connects with it, installs the managed block under the active
//! system key, removes the temporary key again and creates the account.
//! Sessions move `active -> committing -> deleted`; any failure tries to
//! remove the temporary key and either deletes the session or leaves it
//! `orphaned` for the reaper.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use keyward_deploy::{
    AtomicFileDeployer, ContentRenderer, DeployError, DeployPaths, content_hash, managed_serial,
};
use keyward_model::{
    Account, AuditAction, AuditEntry, BootstrapSession, BootstrapStatus, PendingAccount,
    SessionId, Store, StoreError,
};
use keyward_transport::{
    ConnectTarget, Credential, FailureKind, TransportFactory, TransportSession, TrustPolicy,
    generate_ephemeral_keypair,
};
use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

use crate::config::BootstrapConfig;
use crate::connect::{close_quietly, open_with};
use crate::error::CoreError;

/// What the operator needs to prepare a host
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BootstrapTicket {
    pub session_id: SessionId,
    /// `user@host`
    pub target: String,
    /// Line to append to the account's `authorized_keys`
    pub public_key: String,
    pub expires_at: DateTime<Utc>,
}

/// Removes a session's temporary key from its host
#[derive(Clone)]
pub(crate) struct TempKeyCleaner {
    store: Arc<dyn Store>,
    transport: Arc<dyn TransportFactory>,
    deployer: AtomicFileDeployer,
}

impl TempKeyCleaner {
    pub(crate) fn new(
        store: Arc<dyn Store>,
        transport: Arc<dyn TransportFactory>,
        deployer: AtomicFileDeployer,
    ) -> Self {
        Self {
            store,
            transport,
            deployer,
        }
    }

    /// Connect with the temporary key, or the active system key once the
    /// temporary key is no longer accepted, and strip the temporary key line
    ///
    /// Returns whether a line was removed.
    pub(crate) async fn remove(
        &self,
        session: &BootstrapSession,
        policy: &TrustPolicy,
    ) -> Result<bool, CoreError> {
        let target = ConnectTarget::from_session(session);
        let temp = Credential::ephemeral(session.id.to_string(), session.temp_private_key.clone());

        let conn = match open_with(self.transport.as_ref(), &target, &temp, policy).await {
            Ok(conn) => conn,
            Err(e) if e.kind() == Some(FailureKind::AuthenticationFailure) => {
                let Some(system) = self.store.active_system_key().await? else {
                    return Err(e);
                };
                debug!(target = %session.target(), "temporary key rejected, retrying with system key");
                let credential = Credential::from_system_key(&system);
                open_with(self.transport.as_ref(), &target, &credential, policy).await?
            }
            Err(e) => return Err(e),
        };

        let removed = self
            .deployer
            .remove_key(conn.as_ref(), &session.temp_public_key)
            .await;
        close_quietly(conn).await;
        Ok(removed?)
    }
}

/// Two-phase onboarding of a new account
#[derive(Clone)]
pub struct BootstrapWorkflow {
    store: Arc<dyn Store>,
    transport: Arc<dyn TransportFactory>,
    renderer: ContentRenderer,
    deployer: AtomicFileDeployer,
    cleaner: TempKeyCleaner,
    config: BootstrapConfig,
}

impl std::fmt::Debug for BootstrapWorkflow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BootstrapWorkflow")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl BootstrapWorkflow {
    pub fn new(
        store: Arc<dyn Store>,
        transport: Arc<dyn TransportFactory>,
        paths: DeployPaths,
        config: BootstrapConfig,
    ) -> Self {
        let deployer = AtomicFileDeployer::new(paths);
        Self {
            renderer: ContentRenderer::from_store(store.clone()),
            cleaner: TempKeyCleaner::new(store.clone(), transport.clone(), deployer.clone()),
            store,
            transport,
            deployer,
            config,
        }
    }

    /// Issue a single-use keypair and persist an `active` session
    ///
    /// # Errors
    /// Returns a store conflict if the account is already managed
    #[instrument(skip(self, pending), fields(target = %format!("{}@{}", pending.username, pending.hostname)))]
    pub async fn begin(&self, pending: PendingAccount) -> Result<BootstrapTicket, CoreError> {
        let accounts = self.store.list_accounts().await?;
        if accounts.iter().any(|account| pending.same_login(account)) {
            return Err(
                StoreError::Conflict(format!("account {} already exists", pending.login())).into(),
            );
        }

        let comment = format!("keyward-bootstrap-{}@{}", pending.username, pending.hostname);
        let pair = generate_ephemeral_keypair(&comment)?;
        let session = BootstrapSession::new(
            pending,
            pair.public_key,
            pair.private_key,
            Utc::now(),
            self.config.session_ttl(),
        );
        self.store.insert_session(&session).await?;

        info!(
            session = %session.id,
            target = %session.target(),
            expires_at = %session.expires_at,
            "bootstrap session started"
        );

        Ok(BootstrapTicket {
            session_id: session.id,
            target: session.target(),
            public_key: session.temp_public_key.clone(),
            expires_at: session.expires_at,
        })
    }

    /// Finish onboarding once the temporary key is installed
    ///
    /// `policy` is normally `Tofu` or `Pinned`; `Verify` works for a host
    /// whose key was recorded beforehand.
    ///
    /// # Errors
    /// Returns `CoreError::SessionExpired` or `CoreError::SessionNotActive`
    /// for unusable sessions, otherwise the failure that aborted the run
    #[instrument(skip(self, policy), fields(session = %id, policy = policy.name()))]
    pub async fn complete(&self, id: SessionId, policy: TrustPolicy) -> Result<Account, CoreError> {
        let mut session = self
            .store
            .get_session(id)
            .await?
            .ok_or_else(|| StoreError::SessionNotFound(id.to_string()))?;

        if session.status() != BootstrapStatus::Active {
            return Err(CoreError::SessionNotActive {
                id,
                status: session.status(),
            });
        }
        if session.is_expired(Utc::now()) {
            warn!(session = %id, "bootstrap session expired before completion");
            return Err(CoreError::SessionExpired(id));
        }

        match self.run(&mut session, &policy).await {
            Ok(account) => {
                self.finish(&session, &account).await;
                Ok(account)
            }
            Err(e) => {
                self.abort(session, &policy, &e).await;
                Err(e)
            }
        }
    }

    async fn run(
        &self,
        session: &mut BootstrapSession,
        policy: &TrustPolicy,
    ) -> Result<Account, CoreError> {
        let block = self.renderer.render_new_account(Utc::now()).await?;
        let serial = managed_serial(&block).ok_or(DeployError::NoActiveSystemKey)?;

        let target = ConnectTarget::from_session(session);
        let credential =
            Credential::ephemeral(session.id.to_string(), session.temp_private_key.clone());
        let conn = open_with(self.transport.as_ref(), &target, &credential, policy).await?;
        let edited = self.edit_host(conn.as_ref(), session, &block).await;
        close_quietly(conn).await;
        edited?;

        let mut pending = session.pending.clone();
        pending.serial = serial;
        pending.key_hash = content_hash(&block);
        Ok(self.store.create_account(pending).await?)
    }

    async fn edit_host(
        &self,
        conn: &dyn TransportSession,
        session: &mut BootstrapSession,
        block: &str,
    ) -> Result<(), CoreError> {
        // The whole file becomes the managed block, so the first strict audit
        // hashes exactly what was rendered here
        self.deployer.deploy_full(conn, block).await?;

        session.transition(BootstrapStatus::Committing, Utc::now())?;
        self.store.update_session(session).await?;
        debug!(session = %session.id, "managed block installed, committing");

        let removed = self
            .deployer
            .remove_key(conn, &session.temp_public_key)
            .await?;
        debug!(session = %session.id, removed, "temporary key line checked");
        Ok(())
    }

    async fn finish(&self, session: &BootstrapSession, account: &Account) {
        if let Err(e) = self.store.delete_session(session.id).await {
            error!(session = %session.id, error = %e, "could not delete completed session");
        }

        let entry = AuditEntry::new(
            AuditAction::BootstrapCompleted,
            format!("{}: serial {}", account.target(), account.serial),
        )
        .for_account(account.id);
        if let Err(e) = self.store.append(entry).await {
            error!(account = %account.target(), error = %e, "could not record bootstrap completion");
        }

        info!(account = %account.target(), serial = account.serial, "bootstrap completed");
    }

    async fn abort(&self, mut session: BootstrapSession, policy: &TrustPolicy, cause: &CoreError) {
        warn!(session = %session.id, target = %session.target(), error = %cause, "bootstrap failed");

        let cleanup = self.cleaner.remove(&session, policy).await;
        let details = match &cleanup {
            Ok(_) => format!("{}: {cause}; temporary key removed", session.target()),
            Err(e) => format!("{}: {cause}; cleanup failed: {e}", session.target()),
        };
        if let Err(e) = self
            .store
            .append(AuditEntry::new(AuditAction::BootstrapFailed, details))
            .await
        {
            error!(session = %session.id, error = %e, "could not record bootstrap failure");
        }

        if cleanup.is_ok() {
            if let Err(e) = self.store.delete_session(session.id).await {
                error!(session = %session.id, error = %e, "could not delete failed session");
            }
            return;
        }

        let orphaned = session
            .transition(BootstrapStatus::Orphaned, Utc::now())
            .map_err(CoreError::from);
        let saved = match orphaned {
            Ok(()) => self.store.update_session(&session).await.map_err(CoreError::from),
            Err(e) => Err(e),
        };
        match saved {
            Ok(()) => warn!(session = %session.id, "session left orphaned for the reaper"),
            Err(e) => error!(session = %session.id, error = %e, "could not orphan session"),
        }
    }
}
