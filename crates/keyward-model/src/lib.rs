//! keyward-model: Domain types and persistence ports
//!
//! Accounts, system keys, authorized public keys, bootstrap sessions and the
//! narrow store traits the reconciliation engine consumes. The relational
//! storage engine itself lives outside this workspace; [`memory::MemoryStore`]
//! implements every port in memory for tests and embedders.

pub mod account;
pub mod audit;
pub mod bootstrap;
pub mod error;
pub mod keys;
pub mod memory;
pub mod secret;
pub mod store;

pub use account::{Account, AccountId, NewAccount};
pub use audit::{AuditAction, AuditEntry};
pub use bootstrap::{BootstrapSession, BootstrapStatus, PendingAccount, SessionId};
pub use error::{ModelError, StoreError};
pub use keys::{KeyId, KnownHost, PublicKey, SystemKey};
pub use memory::MemoryStore;
pub use secret::SecretBytes;
pub use store::{
    AccountSerialUpdater, AccountStore, AuditWriter, BootstrapSessionStore, KeyLister, KeyReader,
    KnownHostStore, Store,
};
