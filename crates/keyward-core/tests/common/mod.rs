#![allow(dead_code)]

use std::sync::Arc;

use keyward_core::FleetRunner;
use keyward_model::{
    Account, AccountId, AuditAction, KeyId, KnownHostStore, MemoryStore, NewAccount, PublicKey,
};
use keyward_transport::{GeneratedKeypair, MemoryHost, MemoryTransport, generate_ephemeral_keypair};

pub const USER: &str = "deploy";

/// In-memory store and hosts with one active system key
pub struct Fixture {
    pub store: Arc<MemoryStore>,
    pub transport: Arc<MemoryTransport>,
    pub system: GeneratedKeypair,
    pub serial: u64,
}

impl Fixture {
    /// Active system key with serial 3
    pub fn new() -> Self {
        let store = Arc::new(MemoryStore::new());
        let system = generate_ephemeral_keypair("keyward-system-3").unwrap();
        store
            .add_system_key(3, system.public_key.clone(), system.private_key.clone(), true)
            .unwrap();
        let transport = Arc::new(MemoryTransport::new(store.clone()));
        Self {
            store,
            transport,
            system,
            serial: 3,
        }
    }

    /// Rotate to a new active system key, keeping the old one stored
    pub fn rotate(&mut self, serial: u64) -> GeneratedKeypair {
        let pair = generate_ephemeral_keypair(&format!("keyward-system-{serial}")).unwrap();
        self.store
            .add_system_key(serial, pair.public_key.clone(), pair.private_key.clone(), true)
            .unwrap();
        let previous = std::mem::replace(&mut self.system, pair.clone());
        self.serial = serial;
        previous
    }

    /// Reachable host whose key is already trusted
    pub async fn trusted_host(&self, hostname: &str) -> MemoryHost {
        let host = self.transport.add_host(hostname, 22).unwrap();
        self.store
            .save_known_host(host.address(), &host.host_key())
            .await
            .unwrap();
        host
    }

    /// Host the system key can already log into
    pub async fn reachable_host(&self, hostname: &str) -> MemoryHost {
        let host = self.trusted_host(hostname).await;
        host.set_authorized_keys(USER, &format!("{}\n", self.system.public_key));
        host
    }

    /// Stored account on `hostname`, stamped with `serial`
    pub fn account(&self, id: i64, hostname: &str, serial: u64) -> Account {
        let mut account = NewAccount::new(USER, hostname).into_account(AccountId(id));
        account.serial = serial;
        self.store.insert_account(account.clone()).unwrap();
        account
    }

    /// Stored user key assigned to `account`
    pub fn assigned_key(&self, id: i64, account: AccountId) -> PublicKey {
        let key = self.public_key(id, false);
        self.store.assign_key(account, key.id).unwrap();
        key
    }

    /// Stored user key, optionally global
    pub fn public_key(&self, id: i64, global: bool) -> PublicKey {
        let pair = generate_ephemeral_keypair(&format!("user{id}@laptop")).unwrap();
        let mut key = PublicKey::parse_line(KeyId(id), &pair.public_key).unwrap();
        if global {
            key = key.global();
        }
        self.store.add_public_key(key.clone()).unwrap();
        key
    }

    pub fn count(&self, action: AuditAction) -> usize {
        self.store
            .audit_entries()
            .iter()
            .filter(|entry| entry.action == action)
            .count()
    }

    pub fn fleet(&self) -> FleetRunner {
        FleetRunner::default()
    }
}
