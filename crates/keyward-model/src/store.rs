//! Persistence ports
//!
//! The engine never talks to the database directly. Each workflow is handed
//! the narrow traits it needs; [`Store`] bundles all of them for callers that
//! hold one backend.

use async_trait::async_trait;

use crate::account::{Account, AccountId, NewAccount};
use crate::audit::AuditEntry;
use crate::bootstrap::{BootstrapSession, SessionId};
use crate::error::StoreError;
use crate::keys::{PublicKey, SystemKey};

/// Read access to system keys and the public key catalogue
#[async_trait]
pub trait KeyReader: Send + Sync {
    /// The single active system key, if one was ever created
    async fn active_system_key(&self) -> Result<Option<SystemKey>, StoreError>;

    async fn system_key_by_serial(&self, serial: u64) -> Result<Option<SystemKey>, StoreError>;

    async fn all_public_keys(&self) -> Result<Vec<PublicKey>, StoreError>;
}

/// Key selection for rendering
#[async_trait]
pub trait KeyLister: Send + Sync {
    async fn global_keys(&self) -> Result<Vec<PublicKey>, StoreError>;

    /// Keys explicitly assigned to the account
    async fn keys_for_account(&self, account: AccountId) -> Result<Vec<PublicKey>, StoreError>;
}

#[async_trait]
pub trait AccountSerialUpdater: Send + Sync {
    /// Record a successful deployment and clear the dirty flag
    async fn update_serial(
        &self,
        account: AccountId,
        serial: u64,
        key_hash: &str,
    ) -> Result<(), StoreError>;
}

#[async_trait]
pub trait AuditWriter: Send + Sync {
    async fn append(&self, entry: AuditEntry) -> Result<(), StoreError>;
}

#[async_trait]
pub trait AccountStore: Send + Sync {
    async fn get_account(&self, id: AccountId) -> Result<Option<Account>, StoreError>;

    async fn list_accounts(&self) -> Result<Vec<Account>, StoreError>;

    async fn create_account(&self, account: NewAccount) -> Result<Account, StoreError>;

    /// Delete the account and its key assignments
    async fn delete_account(&self, id: AccountId) -> Result<(), StoreError>;

    async fn set_dirty(&self, id: AccountId, dirty: bool) -> Result<(), StoreError>;
}

#[async_trait]
pub trait KnownHostStore: Send + Sync {
    /// Stored OpenSSH key line for `host:port`
    async fn known_host_key(&self, host: &str) -> Result<Option<String>, StoreError>;

    async fn save_known_host(&self, host: &str, key: &str) -> Result<(), StoreError>;
}

#[async_trait]
pub trait BootstrapSessionStore: Send + Sync {
    async fn insert_session(&self, session: &BootstrapSession) -> Result<(), StoreError>;

    /// Persist the session's current status and timestamps
    async fn update_session(&self, session: &BootstrapSession) -> Result<(), StoreError>;

    async fn get_session(&self, id: SessionId) -> Result<Option<BootstrapSession>, StoreError>;

    async fn list_sessions(&self) -> Result<Vec<BootstrapSession>, StoreError>;

    async fn delete_session(&self, id: SessionId) -> Result<(), StoreError>;
}

/// Every port implemented by one backend
pub trait Store:
    KeyReader
    + KeyLister
    + AccountSerialUpdater
    + AuditWriter
    + AccountStore
    + KnownHostStore
    + BootstrapSessionStore
{
}

impl<T> Store for T where
    T: KeyReader
        + KeyLister
        + AccountSerialUpdater
        + AuditWriter
        + AccountStore
        + KnownHostStore
        + BootstrapSessionStore
{
}
