//! Transport factory seam
//!
//! Workflows receive an `Arc<dyn TransportFactory>` at construction; tests
//! hand them a [`crate::memory::MemoryTransport`] instead of real SSH.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use keyward_model::{Account, BootstrapSession, KnownHostStore};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::credential::Credential;
use crate::error::TransportError;
use crate::session::TransportSession;
use crate::ssh;
use crate::trust::TrustPolicy;

/// Where to connect and as whom
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectTarget {
    pub hostname: String,
    pub port: u16,
    pub username: String,
}

impl ConnectTarget {
    pub fn new(hostname: impl Into<String>, port: u16, username: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            port,
            username: username.into(),
        }
    }

    #[must_use]
    pub fn from_account(account: &Account) -> Self {
        Self::new(&account.hostname, account.port, &account.username)
    }

    #[must_use]
    pub fn from_session(session: &BootstrapSession) -> Self {
        Self::new(
            &session.pending.hostname,
            session.pending.port,
            &session.pending.username,
        )
    }

    /// Key for the known-hosts table
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.hostname, self.port)
    }
}

/// Per-operation deadlines
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportTimeouts {
    /// Bound on TCP connect + SSH handshake + authentication
    pub connect: Duration,
    /// Bound on each SFTP operation
    pub operation: Duration,
}

impl Default for TransportTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(10),
            operation: Duration::from_secs(30),
        }
    }
}

/// Opens sessions to hosts
#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Connect, verify the host key under `policy`, authenticate and open SFTP
    async fn open(
        &self,
        target: &ConnectTarget,
        credential: &Credential,
        policy: &TrustPolicy,
    ) -> Result<Box<dyn TransportSession>, TransportError>;

    /// Fetch the key a host presents, without authenticating or storing it
    async fn scan_host_key(&self, target: &ConnectTarget) -> Result<String, TransportError>;
}

/// russh-backed factory
pub struct SshTransportFactory {
    known_hosts: Arc<dyn KnownHostStore>,
    timeouts: TransportTimeouts,
}

impl SshTransportFactory {
    pub fn new(known_hosts: Arc<dyn KnownHostStore>, timeouts: TransportTimeouts) -> Self {
        Self {
            known_hosts,
            timeouts,
        }
    }
}

impl std::fmt::Debug for SshTransportFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshTransportFactory")
            .field("timeouts", &self.timeouts)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl TransportFactory for SshTransportFactory {
    #[instrument(skip(self, credential), fields(host = %target.address(), policy = policy.name()))]
    async fn open(
        &self,
        target: &ConnectTarget,
        credential: &Credential,
        policy: &TrustPolicy,
    ) -> Result<Box<dyn TransportSession>, TransportError> {
        let address = target.address();
        let stored = self.known_hosts.known_host_key(&address).await?;

        let (session, verdict) =
            ssh::SshSession::connect(target, credential, policy, stored, self.timeouts).await?;

        if let crate::trust::HostKeyVerdict::TrustedNew { presented } = &verdict {
            self.known_hosts.save_known_host(&address, presented).await?;
            info!(
                host = %address,
                fingerprint = %crate::trust::fingerprint(presented),
                "recorded new host key"
            );
        }

        Ok(Box::new(session))
    }

    async fn scan_host_key(&self, target: &ConnectTarget) -> Result<String, TransportError> {
        ssh::scan_host_key(target, self.timeouts.connect).await
    }
}
