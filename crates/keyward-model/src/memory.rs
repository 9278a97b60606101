//! In-memory implementation of every store port
//!
//! Used by the test suites and by embedders that keep state elsewhere and
//! only need a scratch backend. Writes are individually atomic; nothing is
//! persisted across process restarts.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use tracing::debug;

use crate::account::{Account, AccountId, NewAccount};
use crate::audit::AuditEntry;
use crate::bootstrap::{BootstrapSession, SessionId};
use crate::error::StoreError;
use crate::keys::{KeyId, PublicKey, SystemKey};
use crate::secret::SecretBytes;
use crate::store::{
    AccountSerialUpdater, AccountStore, AuditWriter, BootstrapSessionStore, KeyLister, KeyReader,
    KnownHostStore,
};

#[derive(Debug, Default)]
struct Inner {
    accounts: BTreeMap<AccountId, Account>,
    next_account_id: i64,
    system_keys: BTreeMap<u64, SystemKey>,
    public_keys: BTreeMap<KeyId, PublicKey>,
    assignments: BTreeMap<AccountId, BTreeSet<KeyId>>,
    known_hosts: HashMap<String, String>,
    sessions: HashMap<SessionId, BootstrapSession>,
    audit: Vec<AuditEntry>,
}

/// Thread-safe in-memory store
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
    /// Makes `set_dirty` fail, for exercising best-effort paths
    fail_dirty_updates: AtomicBool,
    /// Makes `delete_account` fail
    fail_account_deletes: AtomicBool,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Inner>, StoreError> {
        self.inner
            .read()
            .map_err(|_| StoreError::Backend("memory store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Inner>, StoreError> {
        self.inner
            .write()
            .map_err(|_| StoreError::Backend("memory store lock poisoned".to_string()))
    }

    /// Add a system key; an active key deactivates every other one
    ///
    /// # Errors
    /// Returns `StoreError::Conflict` if the serial already exists
    pub fn add_system_key(
        &self,
        serial: u64,
        public_key: impl Into<String>,
        private_key: SecretBytes,
        active: bool,
    ) -> Result<(), StoreError> {
        let mut inner = self.write()?;
        if inner.system_keys.contains_key(&serial) {
            return Err(StoreError::Conflict(format!("system key serial {serial}")));
        }
        if active {
            for key in inner.system_keys.values_mut() {
                key.is_active = false;
            }
        }
        inner.system_keys.insert(
            serial,
            SystemKey {
                serial,
                public_key: public_key.into(),
                private_key,
                passphrase: None,
                is_active: active,
            },
        );
        Ok(())
    }

    /// Insert an account with a caller-chosen id
    ///
    /// # Errors
    /// Returns `StoreError::Conflict` if the id is taken
    pub fn insert_account(&self, account: Account) -> Result<(), StoreError> {
        let mut inner = self.write()?;
        if inner.accounts.contains_key(&account.id) {
            return Err(StoreError::Conflict(format!("account {}", account.id)));
        }
        inner.next_account_id = inner.next_account_id.max(account.id.0);
        inner.accounts.insert(account.id, account);
        Ok(())
    }

    /// # Errors
    /// Returns `StoreError::Conflict` if the key id is taken
    pub fn add_public_key(&self, key: PublicKey) -> Result<(), StoreError> {
        let mut inner = self.write()?;
        if inner.public_keys.contains_key(&key.id) {
            return Err(StoreError::Conflict(format!("public key {}", key.id)));
        }
        inner.public_keys.insert(key.id, key);
        Ok(())
    }

    /// # Errors
    /// Returns `StoreError::AccountNotFound` for unknown accounts
    pub fn assign_key(&self, account: AccountId, key: KeyId) -> Result<(), StoreError> {
        let mut inner = self.write()?;
        if !inner.accounts.contains_key(&account) {
            return Err(StoreError::AccountNotFound(account.to_string()));
        }
        inner.assignments.entry(account).or_default().insert(key);
        Ok(())
    }

    /// Snapshot of the audit log
    #[must_use]
    pub fn audit_entries(&self) -> Vec<AuditEntry> {
        self.read().map(|i| i.audit.clone()).unwrap_or_default()
    }

    /// Snapshot of one account
    #[must_use]
    pub fn account(&self, id: AccountId) -> Option<Account> {
        self.read().ok().and_then(|i| i.accounts.get(&id).cloned())
    }

    /// Number of key assignments held for an account
    #[must_use]
    pub fn assignment_count(&self, id: AccountId) -> usize {
        self.read()
            .map(|i| i.assignments.get(&id).map_or(0, BTreeSet::len))
            .unwrap_or(0)
    }

    pub fn set_fail_dirty_updates(&self, fail: bool) {
        self.fail_dirty_updates.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_account_deletes(&self, fail: bool) {
        self.fail_account_deletes.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl KeyReader for MemoryStore {
    async fn active_system_key(&self) -> Result<Option<SystemKey>, StoreError> {
        Ok(self
            .read()?
            .system_keys
            .values()
            .find(|k| k.is_active)
            .cloned())
    }

    async fn system_key_by_serial(&self, serial: u64) -> Result<Option<SystemKey>, StoreError> {
        Ok(self.read()?.system_keys.get(&serial).cloned())
    }

    async fn all_public_keys(&self) -> Result<Vec<PublicKey>, StoreError> {
        Ok(self.read()?.public_keys.values().cloned().collect())
    }
}

#[async_trait]
impl KeyLister for MemoryStore {
    async fn global_keys(&self) -> Result<Vec<PublicKey>, StoreError> {
        Ok(self
            .read()?
            .public_keys
            .values()
            .filter(|k| k.is_global)
            .cloned()
            .collect())
    }

    async fn keys_for_account(&self, account: AccountId) -> Result<Vec<PublicKey>, StoreError> {
        let inner = self.read()?;
        let Some(ids) = inner.assignments.get(&account) else {
            return Ok(Vec::new());
        };
        Ok(ids
            .iter()
            .filter_map(|id| inner.public_keys.get(id))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl AccountSerialUpdater for MemoryStore {
    async fn update_serial(
        &self,
        account: AccountId,
        serial: u64,
        key_hash: &str,
    ) -> Result<(), StoreError> {
        let mut inner = self.write()?;
        let row = inner
            .accounts
            .get_mut(&account)
            .ok_or_else(|| StoreError::AccountNotFound(account.to_string()))?;
        row.serial = serial;
        row.key_hash = key_hash.to_string();
        row.is_dirty = false;
        debug!(account = %account, serial, "memory store: serial updated");
        Ok(())
    }
}

#[async_trait]
impl AuditWriter for MemoryStore {
    async fn append(&self, entry: AuditEntry) -> Result<(), StoreError> {
        self.write()?.audit.push(entry);
        Ok(())
    }
}

#[async_trait]
impl AccountStore for MemoryStore {
    async fn get_account(&self, id: AccountId) -> Result<Option<Account>, StoreError> {
        Ok(self.read()?.accounts.get(&id).cloned())
    }

    async fn list_accounts(&self) -> Result<Vec<Account>, StoreError> {
        Ok(self.read()?.accounts.values().cloned().collect())
    }

    async fn create_account(&self, account: NewAccount) -> Result<Account, StoreError> {
        let mut inner = self.write()?;
        if inner.accounts.values().any(|a| account.same_login(a)) {
            return Err(StoreError::Conflict(account.login()));
        }
        inner.next_account_id += 1;
        let id = AccountId(inner.next_account_id);
        let account = account.into_account(id);
        inner.accounts.insert(id, account.clone());
        Ok(account)
    }

    async fn delete_account(&self, id: AccountId) -> Result<(), StoreError> {
        if self.fail_account_deletes.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("delete rejected".to_string()));
        }
        let mut inner = self.write()?;
        if inner.accounts.remove(&id).is_none() {
            return Err(StoreError::AccountNotFound(id.to_string()));
        }
        inner.assignments.remove(&id);
        Ok(())
    }

    async fn set_dirty(&self, id: AccountId, dirty: bool) -> Result<(), StoreError> {
        if self.fail_dirty_updates.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("dirty flag update rejected".to_string()));
        }
        let mut inner = self.write()?;
        let row = inner
            .accounts
            .get_mut(&id)
            .ok_or_else(|| StoreError::AccountNotFound(id.to_string()))?;
        row.is_dirty = dirty;
        Ok(())
    }
}

#[async_trait]
impl KnownHostStore for MemoryStore {
    async fn known_host_key(&self, host: &str) -> Result<Option<String>, StoreError> {
        Ok(self.read()?.known_hosts.get(host).cloned())
    }

    async fn save_known_host(&self, host: &str, key: &str) -> Result<(), StoreError> {
        self.write()?
            .known_hosts
            .insert(host.to_string(), key.to_string());
        Ok(())
    }
}

#[async_trait]
impl BootstrapSessionStore for MemoryStore {
    async fn insert_session(&self, session: &BootstrapSession) -> Result<(), StoreError> {
        let mut inner = self.write()?;
        if inner.sessions.contains_key(&session.id) {
            return Err(StoreError::Conflict(format!("session {}", session.id)));
        }
        inner.sessions.insert(session.id, session.clone());
        Ok(())
    }

    async fn update_session(&self, session: &BootstrapSession) -> Result<(), StoreError> {
        let mut inner = self.write()?;
        let row = inner
            .sessions
            .get_mut(&session.id)
            .ok_or_else(|| StoreError::SessionNotFound(session.id.to_string()))?;
        *row = session.clone();
        Ok(())
    }

    async fn get_session(&self, id: SessionId) -> Result<Option<BootstrapSession>, StoreError> {
        Ok(self.read()?.sessions.get(&id).cloned())
    }

    async fn list_sessions(&self) -> Result<Vec<BootstrapSession>, StoreError> {
        Ok(self.read()?.sessions.values().cloned().collect())
    }

    async fn delete_session(&self, id: SessionId) -> Result<(), StoreError> {
        self.write()?
            .sessions
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| StoreError::SessionNotFound(id.to_string()))
    }
}
