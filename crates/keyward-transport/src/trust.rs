//! Host-key trust policies
//!
//! The decision is a pure function of the policy, the key stored for the
//! host (if any) and the key the host presented. A mismatch against a stored
//! key is rejected under every policy.

use russh::keys::ssh_key::{self, HashAlg};

/// How a presented host key is judged
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrustPolicy {
    /// Accept an unknown host and persist its key (bootstrap only)
    Tofu,
    /// Require a stored key that matches
    Verify,
    /// Accept exactly this OpenSSH key line, verified out of band
    Pinned(String),
}

impl TrustPolicy {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Tofu => "tofu",
            Self::Verify => "verify",
            Self::Pinned(_) => "pinned",
        }
    }
}

/// Outcome of a host-key check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostKeyVerdict {
    /// Presented key matches the stored key
    Trusted { presented: String },
    /// Accepted a host with no stored key; the key must be persisted
    TrustedNew { presented: String },
    /// No stored key and the policy requires one
    Unknown { presented: String },
    /// Presented key differs from the stored or pinned key
    Mismatch { expected: String, presented: String },
}

impl HostKeyVerdict {
    #[must_use]
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Trusted { .. } | Self::TrustedNew { .. })
    }

    /// The key line the host presented
    #[must_use]
    pub fn presented(&self) -> &str {
        match self {
            Self::Trusted { presented }
            | Self::TrustedNew { presented }
            | Self::Unknown { presented }
            | Self::Mismatch { presented, .. } => presented,
        }
    }
}

/// Judge a presented key
#[must_use]
pub fn evaluate(policy: &TrustPolicy, stored: Option<&str>, presented: &str) -> HostKeyVerdict {
    let presented_owned = presented.to_string();

    if let TrustPolicy::Pinned(pinned) = policy
        && !same_key(pinned, presented)
    {
        return HostKeyVerdict::Mismatch {
            expected: pinned.clone(),
            presented: presented_owned,
        };
    }

    match stored {
        Some(stored) if same_key(stored, presented) => HostKeyVerdict::Trusted {
            presented: presented_owned,
        },
        Some(stored) => HostKeyVerdict::Mismatch {
            expected: stored.to_string(),
            presented: presented_owned,
        },
        None => match policy {
            TrustPolicy::Verify => HostKeyVerdict::Unknown {
                presented: presented_owned,
            },
            TrustPolicy::Tofu | TrustPolicy::Pinned(_) => HostKeyVerdict::TrustedNew {
                presented: presented_owned,
            },
        },
    }
}

/// Compare two OpenSSH key lines by algorithm and key material, ignoring comments
#[must_use]
pub fn same_key(a: &str, b: &str) -> bool {
    let mut a = a.split_whitespace();
    let mut b = b.split_whitespace();
    match (a.next(), a.next(), b.next(), b.next()) {
        (Some(a_alg), Some(a_data), Some(b_alg), Some(b_data)) => {
            a_alg == b_alg && a_data == b_data
        }
        _ => false,
    }
}

/// SHA-256 fingerprint of an OpenSSH key line for display
#[must_use]
pub fn fingerprint(line: &str) -> String {
    match ssh_key::PublicKey::from_openssh(line.trim()) {
        Ok(key) => key.fingerprint(HashAlg::Sha256).to_string(),
        Err(_) => {
            let data = line.split_whitespace().nth(1).unwrap_or(line);
            let start = data.char_indices().rev().nth(11).map_or(0, |(i, _)| i);
            format!("...{}", &data[start..])
        }
    }
}
