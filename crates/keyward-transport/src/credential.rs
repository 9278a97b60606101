//! Credential resolution and single-use key generation

use keyward_model::{Account, KeyReader, SecretBytes, SystemKey};
use rand::RngCore;
use russh::keys::ssh_key::private::{Ed25519Keypair, KeypairData};
use russh::keys::ssh_key::{LineEnding, PrivateKey};
use russh::keys::decode_secret_key;
use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::error::TransportError;

/// What the client authenticates with
#[derive(Debug, Clone)]
pub enum Credential {
    /// A stored system key
    SystemKey {
        serial: u64,
        private_key: SecretBytes,
        passphrase: Option<SecretBytes>,
    },
    /// A single-use bootstrap key
    Ephemeral {
        label: String,
        private_key: SecretBytes,
    },
    /// Whatever identities the local SSH agent offers
    Agent,
}

impl Credential {
    #[must_use]
    pub fn from_system_key(key: &SystemKey) -> Self {
        Self::SystemKey {
            serial: key.serial,
            private_key: key.private_key.clone(),
            passphrase: key.passphrase.clone(),
        }
    }

    pub fn ephemeral(label: impl Into<String>, private_key: SecretBytes) -> Self {
        Self::Ephemeral {
            label: label.into(),
            private_key,
        }
    }

    /// Whether to use SSH agent
    #[must_use]
    pub fn use_agent(&self) -> bool {
        matches!(self, Self::Agent)
    }

    /// Serial of the system key, if this is one
    #[must_use]
    pub fn serial(&self) -> Option<u64> {
        match self {
            Self::SystemKey { serial, .. } => Some(*serial),
            _ => None,
        }
    }

    /// Short description for logs
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::SystemKey { serial, .. } => format!("system key serial {serial}"),
            Self::Ephemeral { label, .. } => format!("bootstrap key {label}"),
            Self::Agent => "ssh agent".to_string(),
        }
    }

    /// Decode the private key; `None` for agent authentication
    ///
    /// The decoded key wipes itself on drop.
    ///
    /// # Errors
    /// Returns `TransportError::PassphraseRequired` for a locked key and
    /// `TransportError::InvalidKey` for undecodable material
    pub fn decode(&self) -> Result<Option<PrivateKey>, TransportError> {
        let (pem, passphrase) = match self {
            Self::SystemKey {
                private_key,
                passphrase,
                ..
            } => (private_key, passphrase.as_ref()),
            Self::Ephemeral { private_key, .. } => (private_key, None),
            Self::Agent => return Ok(None),
        };

        let pem = pem
            .expose_str()
            .map_err(|e| TransportError::InvalidKey(e.to_string()))?;
        let passphrase = passphrase
            .map(SecretBytes::expose_str)
            .transpose()
            .map_err(|e| TransportError::InvalidKey(e.to_string()))?;

        match decode_secret_key(pem, passphrase) {
            Ok(key) => Ok(Some(key)),
            Err(russh::keys::Error::KeyIsEncrypted) => {
                Err(TransportError::PassphraseRequired(self.describe()))
            }
            Err(e) => Err(TransportError::InvalidKey(e.to_string())),
        }
    }

    /// OpenSSH public key line of the credential; `None` for agent authentication
    ///
    /// # Errors
    /// Propagates decoding failures
    pub fn public_key_line(&self) -> Result<Option<String>, TransportError> {
        let Some(key) = self.decode()? else {
            return Ok(None);
        };
        key.public_key()
            .to_openssh()
            .map(Some)
            .map_err(|e| TransportError::InvalidKey(e.to_string()))
    }
}

/// Pick the credential a host currently trusts
///
/// A never-deployed account is reached with the active system key, or the
/// SSH agent when no system key exists yet. A deployed account only trusts
/// the key of the serial it was last deployed with.
///
/// # Errors
/// Returns `TransportError::DatabaseInconsistency` when the account's serial
/// has no matching system key
pub async fn resolve_credential(
    account: &Account,
    keys: &dyn KeyReader,
) -> Result<Credential, TransportError> {
    if !account.is_deployed() {
        return match keys.active_system_key().await? {
            Some(key) => {
                debug!(account = %account.target(), serial = key.serial, "using active system key");
                Ok(Credential::from_system_key(&key))
            }
            None => {
                warn!(account = %account.target(), "no system key exists, falling back to ssh agent");
                Ok(Credential::Agent)
            }
        };
    }

    match keys.system_key_by_serial(account.serial).await? {
        Some(key) => Ok(Credential::from_system_key(&key)),
        None => Err(TransportError::DatabaseInconsistency(format!(
            "account {} was deployed with serial {} but no such system key exists",
            account.target(),
            account.serial
        ))),
    }
}

/// Freshly generated keypair
#[derive(Debug, Clone)]
pub struct GeneratedKeypair {
    /// OpenSSH public key line
    pub public_key: String,
    /// OpenSSH PEM private key
    pub private_key: SecretBytes,
}

/// Generate a single-use Ed25519 keypair
///
/// # Errors
/// Returns `TransportError::InvalidKey` if encoding fails
pub fn generate_ephemeral_keypair(comment: &str) -> Result<GeneratedKeypair, TransportError> {
    let mut seed = Zeroizing::new([0u8; 32]);
    rand::rng().fill_bytes(&mut seed[..]);

    let keypair = Ed25519Keypair::from_seed(&seed);
    let private = PrivateKey::new(KeypairData::Ed25519(keypair), comment)
        .map_err(|e| TransportError::InvalidKey(e.to_string()))?;

    let pem = private
        .to_openssh(LineEnding::LF)
        .map_err(|e| TransportError::InvalidKey(e.to_string()))?;
    let public_key = private
        .public_key()
        .to_openssh()
        .map_err(|e| TransportError::InvalidKey(e.to_string()))?;

    Ok(GeneratedKeypair {
        public_key,
        private_key: SecretBytes::from(pem),
    })
}
