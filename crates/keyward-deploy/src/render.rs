//! Authorized-keys content rendering

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use keyward_model::{AccountId, KeyId, KeyLister, KeyReader, PublicKey, Store, SystemKey};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::block::{FOOTER, header_line};
use crate::error::DeployError;

/// Options prepended to the system key line
pub const SYSTEM_KEY_OPTIONS: &str =
    "no-port-forwarding,no-X11-forwarding,no-agent-forwarding,no-pty";

/// Builds the exact `authorized_keys` text for an account
#[derive(Clone)]
pub struct ContentRenderer {
    keys: Arc<dyn KeyReader>,
    lister: Arc<dyn KeyLister>,
}

impl std::fmt::Debug for ContentRenderer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentRenderer").finish_non_exhaustive()
    }
}

impl ContentRenderer {
    pub fn new(keys: Arc<dyn KeyReader>, lister: Arc<dyn KeyLister>) -> Self {
        Self { keys, lister }
    }

    #[must_use]
    pub fn from_store(store: Arc<dyn Store>) -> Self {
        Self::new(store.clone(), store)
    }

    /// Render with the current time
    ///
    /// # Errors
    /// Returns `DeployError::NoActiveSystemKey` when the header is requested
    /// and no system key is active, or a store error
    pub async fn render(
        &self,
        account: AccountId,
        excluded: &HashSet<KeyId>,
        include_system_header: bool,
    ) -> Result<String, DeployError> {
        self.render_at(Some(account), excluded, include_system_header, Utc::now())
            .await
    }

    /// Render for an account that does not exist yet; only global keys apply
    ///
    /// # Errors
    /// Same as [`Self::render`]
    pub async fn render_new_account(&self, now: DateTime<Utc>) -> Result<String, DeployError> {
        self.render_at(None, &HashSet::new(), true, now).await
    }

    /// Render against an explicit clock
    ///
    /// Deterministic for the same stored keys and `now`.
    ///
    /// # Errors
    /// Same as [`Self::render`]
    pub async fn render_at(
        &self,
        account: Option<AccountId>,
        excluded: &HashSet<KeyId>,
        include_system_header: bool,
        now: DateTime<Utc>,
    ) -> Result<String, DeployError> {
        let system = if include_system_header {
            Some(
                self.keys
                    .active_system_key()
                    .await?
                    .ok_or(DeployError::NoActiveSystemKey)?,
            )
        } else {
            None
        };

        let mut keys = self.lister.global_keys().await?;
        if let Some(account) = account {
            keys.extend(self.lister.keys_for_account(account).await?);
        }

        let content = render_keys(system.as_ref(), keys, excluded, now);
        debug!(
            account = ?account.map(|id| id.0),
            serial = system.as_ref().map(|key| key.serial),
            bytes = content.len(),
            "rendered authorized keys"
        );
        Ok(content)
    }
}

/// Pure rendering step
#[must_use]
pub fn render_keys(
    system: Option<&SystemKey>,
    keys: Vec<PublicKey>,
    excluded: &HashSet<KeyId>,
    now: DateTime<Utc>,
) -> String {
    let mut by_id: BTreeMap<KeyId, PublicKey> = BTreeMap::new();
    for key in keys {
        if key.is_expired(now) || excluded.contains(&key.id) {
            continue;
        }
        by_id.entry(key.id).or_insert(key);
    }

    let mut out = String::new();
    if let Some(system) = system {
        out.push_str(&header_line(system.serial));
        out.push('\n');
        out.push_str(SYSTEM_KEY_OPTIONS);
        out.push(' ');
        out.push_str(system.public_key.trim());
        out.push('\n');
    }

    let mut seen = HashSet::new();
    for key in by_id.values() {
        let line = key.authorized_line();
        if seen.insert(line.clone()) {
            out.push_str(&line);
            out.push('\n');
        }
    }

    if system.is_some() {
        out.push_str(FOOTER);
        out.push('\n');
    }
    out
}

/// Canonical form for comparison: LF line endings, outer whitespace trimmed
#[must_use]
pub fn normalize(content: &str) -> String {
    content.replace("\r\n", "\n").trim().to_string()
}

/// Hex SHA-256 of the normalized content
#[must_use]
pub fn content_hash(content: &str) -> String {
    hex::encode(Sha256::digest(normalize(content).as_bytes()))
}
