//! Atomic `authorized_keys` deployment over SFTP
//!
//! A full deploy never leaves the target half written: content goes to a
//! temp file in the same directory, the current file is parked as a backup,
//! and the temp file is renamed into place. If the final rename fails the
//! backup is renamed back, so the host keeps exactly what it had.

use chrono::{DateTime, Utc};
use keyward_transport::{TransportError, TransportSession};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::block::{remove_key_line, replace_managed};
use crate::error::DeployError;

/// Remote locations and permissions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeployPaths {
    /// Directory relative to the account's home
    pub directory: String,
    pub file_name: String,
    pub directory_mode: u32,
    pub file_mode: u32,
}

impl Default for DeployPaths {
    fn default() -> Self {
        Self {
            directory: ".ssh".to_string(),
            file_name: "authorized_keys".to_string(),
            directory_mode: 0o700,
            file_mode: 0o600,
        }
    }
}

impl DeployPaths {
    #[must_use]
    pub fn target(&self) -> String {
        format!("{}/{}", self.directory, self.file_name)
    }

    #[must_use]
    pub fn backup(&self) -> String {
        format!("{}.keyward-bak", self.target())
    }

    fn temp(&self) -> String {
        format!("{}.keyward-tmp-{}", self.target(), Uuid::new_v4().simple())
    }

    fn decommissioned(&self, at: DateTime<Utc>) -> String {
        format!(
            "{}.keyward-decommissioned-{}",
            self.target(),
            at.format("%Y%m%d%H%M%S")
        )
    }
}

/// What a selective deploy did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectiveOutcome {
    /// Content changed and was redeployed
    Rewritten,
    /// Content already matched; nothing written
    Unchanged,
    /// No remote file and nothing to put there
    Missing,
}

/// Writes `authorized_keys` with all-or-nothing semantics
#[derive(Debug, Clone, Default)]
pub struct AtomicFileDeployer {
    paths: DeployPaths,
}

impl AtomicFileDeployer {
    #[must_use]
    pub fn new(paths: DeployPaths) -> Self {
        Self { paths }
    }

    #[must_use]
    pub fn paths(&self) -> &DeployPaths {
        &self.paths
    }

    /// Current file contents; `None` if the file does not exist
    ///
    /// # Errors
    /// Propagates transport failures other than a missing file
    pub async fn fetch_current(
        &self,
        session: &dyn TransportSession,
    ) -> Result<Option<Vec<u8>>, DeployError> {
        match session.read(&self.paths.target()).await {
            Ok(data) => Ok(Some(data)),
            Err(TransportError::RemoteFileMissing(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn fetch_text(&self, session: &dyn TransportSession) -> Result<Option<String>, DeployError> {
        self.fetch_current(session)
            .await?
            .map(|data| String::from_utf8(data).map_err(|_| DeployError::NotUtf8(self.paths.target())))
            .transpose()
    }

    /// Replace the whole file
    ///
    /// # Errors
    /// Returns the first transport failure; `DeployError::RestoreFailed` if
    /// the previous file could not be put back after a failed rename
    #[instrument(skip(self, session, content), fields(host = %session.host(), bytes = content.len()))]
    pub async fn deploy_full(
        &self,
        session: &dyn TransportSession,
        content: &str,
    ) -> Result<(), DeployError> {
        self.ensure_directory(session).await?;

        let temp = self.paths.temp();
        if let Err(e) = self.write_temp(session, &temp, content).await {
            self.discard(session, &temp).await;
            return Err(e.into());
        }

        let result = self.swap_into_place(session, &temp).await;
        self.discard(session, &temp).await;
        result?;

        if let Err(e) = session.remove(&self.paths.backup()).await
            && !matches!(e, TransportError::RemoteFileMissing(_))
        {
            warn!(host = %session.host(), error = %e, "could not remove backup after deploy");
        }

        info!(host = %session.host(), path = %self.paths.target(), "deployed authorized keys");
        Ok(())
    }

    async fn ensure_directory(&self, session: &dyn TransportSession) -> Result<(), TransportError> {
        if session.exists(&self.paths.directory).await? {
            return Ok(());
        }
        debug!(host = %session.host(), dir = %self.paths.directory, "creating directory");
        session.create_dir(&self.paths.directory).await?;
        session
            .chmod(&self.paths.directory, self.paths.directory_mode)
            .await
    }

    async fn write_temp(
        &self,
        session: &dyn TransportSession,
        temp: &str,
        content: &str,
    ) -> Result<(), TransportError> {
        session.write(temp, content.as_bytes()).await?;
        session.chmod(temp, self.paths.file_mode).await
    }

    async fn swap_into_place(
        &self,
        session: &dyn TransportSession,
        temp: &str,
    ) -> Result<(), DeployError> {
        let target = self.paths.target();
        let backup = self.paths.backup();

        match session.remove(&backup).await {
            Ok(()) => debug!(host = %session.host(), "removed stale backup"),
            Err(TransportError::RemoteFileMissing(_)) => {}
            Err(e) => return Err(e.into()),
        }

        let had_original = match session.rename(&target, &backup).await {
            Ok(()) => true,
            Err(TransportError::RemoteFileMissing(_)) => false,
            Err(e) => {
                if session.exists(&target).await? {
                    return Err(e.into());
                }
                debug!(host = %session.host(), error = %e, "no current file to back up");
                false
            }
        };

        let Err(deploy) = session.rename(temp, &target).await else {
            return Ok(());
        };

        if !had_original {
            return Err(deploy.into());
        }

        warn!(host = %session.host(), error = %deploy, "final rename failed, restoring backup");
        match session.rename(&backup, &target).await {
            Ok(()) => Err(deploy.into()),
            Err(restore) => Err(DeployError::RestoreFailed {
                path: target,
                deploy,
                restore,
            }),
        }
    }

    async fn discard(&self, session: &dyn TransportSession, temp: &str) {
        match session.remove(temp).await {
            Ok(()) | Err(TransportError::RemoteFileMissing(_)) => {}
            Err(e) => warn!(host = %session.host(), path = %temp, error = %e, "could not remove temp file"),
        }
    }

    /// Rewrite only the managed block, keeping everything around it
    ///
    /// An empty `new_block` strips the block. A missing file with nothing
    /// to write is not an error.
    ///
    /// # Errors
    /// Returns `DeployError::NotUtf8` for unreadable content, or any
    /// [`Self::deploy_full`] failure
    #[instrument(skip(self, session, new_block), fields(host = %session.host()))]
    pub async fn deploy_selective(
        &self,
        session: &dyn TransportSession,
        new_block: &str,
    ) -> Result<SelectiveOutcome, DeployError> {
        let Some(current) = self.fetch_text(session).await? else {
            if new_block.is_empty() {
                debug!(host = %session.host(), "no authorized keys file, nothing to remove");
                return Ok(SelectiveOutcome::Missing);
            }
            self.deploy_full(session, new_block).await?;
            return Ok(SelectiveOutcome::Rewritten);
        };

        let updated = replace_managed(&current, new_block);
        if updated == current {
            debug!(host = %session.host(), "managed block already up to date");
            return Ok(SelectiveOutcome::Unchanged);
        }

        self.deploy_full(session, &updated).await?;
        Ok(SelectiveOutcome::Rewritten)
    }

    /// Remove every line carrying the given key; `false` if none was present
    ///
    /// # Errors
    /// Same as [`Self::deploy_selective`]
    #[instrument(skip(self, session, public_line), fields(host = %session.host()))]
    pub async fn remove_key(
        &self,
        session: &dyn TransportSession,
        public_line: &str,
    ) -> Result<bool, DeployError> {
        let Some(current) = self.fetch_text(session).await? else {
            return Ok(false);
        };
        let Some(updated) = remove_key_line(&current, public_line) else {
            return Ok(false);
        };
        self.deploy_full(session, &updated).await?;
        Ok(true)
    }

    /// Move the whole file aside to a timestamped backup
    ///
    /// Returns the backup path, or `None` if there was no file.
    ///
    /// # Errors
    /// Propagates transport failures other than a missing file
    #[instrument(skip(self, session), fields(host = %session.host()))]
    pub async fn retire(
        &self,
        session: &dyn TransportSession,
        at: DateTime<Utc>,
    ) -> Result<Option<String>, DeployError> {
        let backup = self.paths.decommissioned(at);
        match session.rename(&self.paths.target(), &backup).await {
            Ok(()) => {
                info!(host = %session.host(), backup = %backup, "moved authorized keys aside");
                Ok(Some(backup))
            }
            Err(TransportError::RemoteFileMissing(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
