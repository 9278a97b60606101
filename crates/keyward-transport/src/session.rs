//! Open session trait

use async_trait::async_trait;

use crate::error::TransportError;

/// One authenticated connection with an SFTP channel
///
/// Paths are relative to the remote user's home directory unless absolute.
#[async_trait]
pub trait TransportSession: Send + Sync {
    /// `host:port` this session is connected to
    fn host(&self) -> &str;

    /// Read a whole file
    ///
    /// Returns `TransportError::RemoteFileMissing` if it does not exist.
    async fn read(&self, path: &str) -> Result<Vec<u8>, TransportError>;

    /// Create or truncate a file and write `data`
    async fn write(&self, path: &str, data: &[u8]) -> Result<(), TransportError>;

    /// Rename; fails if `to` already exists
    async fn rename(&self, from: &str, to: &str) -> Result<(), TransportError>;

    async fn remove(&self, path: &str) -> Result<(), TransportError>;

    async fn create_dir(&self, path: &str) -> Result<(), TransportError>;

    async fn chmod(&self, path: &str, mode: u32) -> Result<(), TransportError>;

    async fn exists(&self, path: &str) -> Result<bool, TransportError>;

    /// Close the SFTP channel and disconnect
    async fn close(&self) -> Result<(), TransportError>;
}
