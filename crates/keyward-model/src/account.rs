//! Managed host accounts

use std::fmt;

use serde::{Deserialize, Serialize};

/// Primary key of an account row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(pub i64);

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

fn default_port() -> u16 {
    22
}

/// One `username@hostname` the engine manages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub username: String,
    pub hostname: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Serial of the system key last deployed successfully; 0 = never deployed
    #[serde(default)]
    pub serial: u64,
    pub is_active: bool,
    /// Set by audit when the host drifted from the intended state
    #[serde(default)]
    pub is_dirty: bool,
    /// SHA-256 of the normalized content deployed last
    #[serde(default)]
    pub key_hash: String,
}

impl Account {
    /// Whether any deployment ever succeeded for this account
    #[must_use]
    pub fn is_deployed(&self) -> bool {
        self.serial != 0
    }

    /// `user@host` form used in logs and reports
    #[must_use]
    pub fn target(&self) -> String {
        format!("{}@{}", self.username, self.hostname)
    }

    /// Key for the known-hosts table
    #[must_use]
    pub fn host_address(&self) -> String {
        format!("{}:{}", self.hostname, self.port)
    }
}

impl fmt::Display for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.label.is_empty() {
            write!(f, "{}@{}", self.username, self.hostname)
        } else {
            write!(f, "{} ({}@{})", self.label, self.username, self.hostname)
        }
    }
}

/// Fields needed to create an account row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewAccount {
    pub username: String,
    pub hostname: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub serial: u64,
    #[serde(default)]
    pub key_hash: String,
}

impl NewAccount {
    /// Create with the default SSH port and no label
    pub fn new(username: impl Into<String>, hostname: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            hostname: hostname.into(),
            port: default_port(),
            label: String::new(),
            tags: Vec::new(),
            serial: 0,
            key_hash: String::new(),
        }
    }

    /// Set a human label
    #[must_use]
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Set custom port
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set tags
    #[must_use]
    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    /// Whether `account` is the same login: username, hostname and port
    #[must_use]
    pub fn same_login(&self, account: &Account) -> bool {
        self.username == account.username
            && self.hostname == account.hostname
            && self.port == account.port
    }

    /// `user@host:port`, the uniqueness key for accounts
    #[must_use]
    pub fn login(&self) -> String {
        format!("{}@{}:{}", self.username, self.hostname, self.port)
    }

    /// Materialize into a stored account
    #[must_use]
    pub fn into_account(self, id: AccountId) -> Account {
        Account {
            id,
            username: self.username,
            hostname: self.hostname,
            port: self.port,
            label: self.label,
            tags: self.tags,
            serial: self.serial,
            is_active: true,
            is_dirty: false,
            key_hash: self.key_hash,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_account_defaults() {
        let account = NewAccount::new("deploy", "web-1.internal").into_account(AccountId(7));

        assert_eq!(account.port, 22);
        assert!(!account.is_deployed());
        assert!(account.is_active);
        assert_eq!(account.target(), "deploy@web-1.internal");
        assert_eq!(account.host_address(), "web-1.internal:22");
    }

    #[test]
    fn test_display_prefers_label() {
        let account = NewAccount::new("root", "db")
            .with_label("primary database")
            .into_account(AccountId(1));

        assert_eq!(account.to_string(), "primary database (root@db)");
    }
}
