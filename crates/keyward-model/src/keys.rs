//! System keys, authorized public keys and known host keys

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ModelError;
use crate::secret::SecretBytes;

/// Primary key of a public key row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyId(pub i64);

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Keypair the engine itself uses to connect to managed hosts
///
/// Exactly one system key is active at a time; older serials are kept so that
/// accounts still trusting them remain reachable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SystemKey {
    pub serial: u64,
    /// OpenSSH public key line (`ssh-ed25519 AAAA... comment`)
    pub public_key: String,
    /// OpenSSH PEM private key
    pub private_key: SecretBytes,
    /// Passphrase for an encrypted private key
    pub passphrase: Option<SecretBytes>,
    pub is_active: bool,
}

/// End-user key to be installed into `authorized_keys`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKey {
    pub id: KeyId,
    pub algorithm: String,
    pub key_data: String,
    #[serde(default)]
    pub comment: String,
    /// Global keys apply to every account
    #[serde(default)]
    pub is_global: bool,
    /// Keys past this instant are never rendered
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl PublicKey {
    /// Parse an `algorithm keydata [comment]` line
    ///
    /// # Errors
    /// Returns `ModelError::InvalidKeyLine` if the algorithm or key data is missing
    pub fn parse_line(id: KeyId, line: &str) -> Result<Self, ModelError> {
        let mut parts = line.trim().splitn(3, char::is_whitespace);
        let algorithm = parts.next().filter(|s| !s.is_empty());
        let key_data = parts.next().filter(|s| !s.is_empty());

        match (algorithm, key_data) {
            (Some(algorithm), Some(key_data)) => Ok(Self {
                id,
                algorithm: algorithm.to_string(),
                key_data: key_data.to_string(),
                comment: parts.next().unwrap_or_default().trim().to_string(),
                is_global: false,
                expires_at: None,
            }),
            _ => Err(ModelError::InvalidKeyLine(line.to_string())),
        }
    }

    /// Mark as global
    #[must_use]
    pub fn global(mut self) -> Self {
        self.is_global = true;
        self
    }

    /// Set expiry
    #[must_use]
    pub fn expiring_at(mut self, at: DateTime<Utc>) -> Self {
        self.expires_at = Some(at);
        self
    }

    /// Expired keys are excluded from rendering but kept in storage
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    /// The line written into `authorized_keys`
    #[must_use]
    pub fn authorized_line(&self) -> String {
        if self.comment.is_empty() {
            format!("{} {}", self.algorithm, self.key_data)
        } else {
            format!("{} {} {}", self.algorithm, self.key_data, self.comment)
        }
    }
}

/// Host key pinned for a `host:port`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnownHost {
    pub host: String,
    /// OpenSSH public key line
    pub key: String,
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    #[test]
    fn test_parse_line() {
        let key = PublicKey::parse_line(
            KeyId(4),
            "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIHk alice@laptop  ",
        )
        .unwrap();

        assert_eq!(key.algorithm, "ssh-ed25519");
        assert_eq!(key.key_data, "AAAAC3NzaC1lZDI1NTE5AAAAIHk");
        assert_eq!(key.comment, "alice@laptop");
        assert_eq!(key.authorized_line(), "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIHk alice@laptop");
    }

    #[test]
    fn test_parse_line_rejects_missing_data() {
        assert!(PublicKey::parse_line(KeyId(1), "ssh-rsa").is_err());
        assert!(PublicKey::parse_line(KeyId(1), "   ").is_err());
    }

    #[test]
    fn test_expiry() {
        let now = Utc::now();
        let key = PublicKey::parse_line(KeyId(1), "ssh-ed25519 AAAA").unwrap();

        assert!(!key.is_expired(now));
        assert!(key.clone().expiring_at(now - Duration::minutes(1)).is_expired(now));
        assert!(!key.expiring_at(now + Duration::minutes(1)).is_expired(now));
    }

    #[test]
    fn test_authorized_line_without_comment() {
        let key = PublicKey::parse_line(KeyId(2), "ssh-rsa AAAAB3").unwrap();
        assert_eq!(key.authorized_line(), "ssh-rsa AAAAB3");
    }
}
