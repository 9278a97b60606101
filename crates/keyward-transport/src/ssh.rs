//! SSH + SFTP session using the russh crates

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use russh::client;
use russh::keys::agent::client::AgentClient;
use russh::keys::ssh_key;
use russh::keys::PrivateKeyWithHashAlg;
use russh::Disconnect;
use russh_sftp::client::SftpSession;
use russh_sftp::client::error::Error as SftpError;
use russh_sftp::protocol::{FileAttributes, StatusCode};
use tokio::io::AsyncWriteExt;
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};

use crate::credential::Credential;
use crate::error::TransportError;
use crate::factory::{ConnectTarget, TransportTimeouts};
use crate::session::TransportSession;
use crate::trust::{self, HostKeyVerdict, TrustPolicy};

type VerdictSlot = Arc<Mutex<Option<HostKeyVerdict>>>;

/// russh client handler applying a trust policy
///
/// The verdict is written to a shared slot so the caller can tell an unknown
/// host from a changed key after russh reports a rejected handshake.
struct TrustHandler {
    policy: TrustPolicy,
    stored: Option<String>,
    verdict: VerdictSlot,
}

impl client::Handler for TrustHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &ssh_key::PublicKey,
    ) -> Result<bool, Self::Error> {
        let Ok(presented) = server_public_key.to_openssh() else {
            warn!("host presented a key that cannot be encoded");
            return Ok(false);
        };

        let verdict = trust::evaluate(&self.policy, self.stored.as_deref(), &presented);
        let accepted = verdict.is_accepted();

        debug!(
            policy = self.policy.name(),
            fingerprint = %trust::fingerprint(&presented),
            accepted,
            "checked host key"
        );

        if let Ok(mut slot) = self.verdict.lock() {
            *slot = Some(verdict);
        }
        Ok(accepted)
    }
}

fn take_verdict(slot: &VerdictSlot) -> Option<HostKeyVerdict> {
    slot.lock().ok().and_then(|mut v| v.take())
}

/// Connect and run the host-key check, without authenticating
async fn handshake(
    target: &ConnectTarget,
    policy: &TrustPolicy,
    stored: Option<String>,
    connect_timeout: Duration,
) -> Result<(client::Handle<TrustHandler>, HostKeyVerdict), TransportError> {
    let address = target.address();
    let verdict_slot: VerdictSlot = Arc::new(Mutex::new(None));
    let handler = TrustHandler {
        policy: policy.clone(),
        stored,
        verdict: verdict_slot.clone(),
    };

    let config = Arc::new(client::Config::default());
    let connect = client::connect(config, (target.hostname.as_str(), target.port), handler);

    let handle = match timeout(connect_timeout, connect).await {
        Ok(Ok(handle)) => handle,
        Ok(Err(e)) => {
            let verdict = take_verdict(&verdict_slot);
            return Err(TransportError::from_connect(
                &address,
                &e,
                verdict.as_ref(),
                connect_timeout,
            ));
        }
        Err(_) => {
            return Err(TransportError::Timeout {
                host: address,
                timeout: connect_timeout,
            });
        }
    };

    let verdict = take_verdict(&verdict_slot).ok_or_else(|| TransportError::ConnectionFailed {
        host: address.clone(),
        reason: "handshake completed without a host key check".to_string(),
    })?;

    Ok((handle, verdict))
}

/// Connect to a host only to read the key it presents
pub(crate) async fn scan_host_key(
    target: &ConnectTarget,
    connect_timeout: Duration,
) -> Result<String, TransportError> {
    let (handle, verdict) = handshake(target, &TrustPolicy::Tofu, None, connect_timeout).await?;
    let presented = verdict.presented().to_string();

    if let Err(e) = handle
        .disconnect(Disconnect::ByApplication, "", "English")
        .await
    {
        debug!(host = %target.address(), error = %e, "disconnect after key scan failed");
    }

    Ok(presented)
}

/// Authenticated SSH connection with one SFTP channel
pub struct SshSession {
    host: String,
    handle: client::Handle<TrustHandler>,
    sftp: SftpSession,
    operation_timeout: Duration,
}

impl std::fmt::Debug for SshSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshSession")
            .field("host", &self.host)
            .field("operation_timeout", &self.operation_timeout)
            .finish_non_exhaustive()
    }
}

impl SshSession {
    /// Connect, verify, authenticate and start SFTP
    ///
    /// Returns the host-key verdict so the caller can persist a newly
    /// trusted key once the whole session is up.
    #[instrument(skip(credential, stored, timeouts), fields(host = %target.address(), user = %target.username))]
    pub(crate) async fn connect(
        target: &ConnectTarget,
        credential: &Credential,
        policy: &TrustPolicy,
        stored: Option<String>,
        timeouts: TransportTimeouts,
    ) -> Result<(Self, HostKeyVerdict), TransportError> {
        let address = target.address();

        info!(
            host = %address,
            user = %target.username,
            credential = %credential.describe(),
            "connecting to SSH"
        );

        let (mut handle, verdict) = handshake(target, policy, stored, timeouts.connect).await?;

        let auth = authenticate(&mut handle, &target.username, credential);
        match timeout(timeouts.connect, auth).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e.with_host(&address)),
            Err(_) => {
                return Err(TransportError::Timeout {
                    host: address,
                    timeout: timeouts.connect,
                });
            }
        }

        let sftp = timeout(timeouts.operation, open_sftp(&handle))
            .await
            .map_err(|_| TransportError::OperationTimeout {
                op: "subsystem",
                timeout: timeouts.operation,
            })??;

        info!(host = %address, "SSH connected and SFTP channel open");

        Ok((
            Self {
                host: address,
                handle,
                sftp,
                operation_timeout: timeouts.operation,
            },
            verdict,
        ))
    }

    async fn bounded<T, F>(&self, op: &'static str, fut: F) -> Result<T, TransportError>
    where
        F: Future<Output = Result<T, TransportError>>,
    {
        timeout(self.operation_timeout, fut)
            .await
            .map_err(|_| TransportError::OperationTimeout {
                op,
                timeout: self.operation_timeout,
            })?
    }
}

async fn open_sftp(handle: &client::Handle<TrustHandler>) -> Result<SftpSession, TransportError> {
    let channel = handle
        .channel_open_session()
        .await
        .map_err(|e| TransportError::SftpChannel(e.to_string()))?;
    channel
        .request_subsystem(true, "sftp")
        .await
        .map_err(|e| TransportError::SftpChannel(e.to_string()))?;
    SftpSession::new(channel.into_stream())
        .await
        .map_err(|e| TransportError::SftpChannel(e.to_string()))
}

async fn authenticate(
    handle: &mut client::Handle<TrustHandler>,
    user: &str,
    credential: &Credential,
) -> Result<(), TransportError> {
    let Some(key) = credential.decode()? else {
        return authenticate_with_agent(handle, user).await;
    };

    let hash_alg = handle
        .best_supported_rsa_hash()
        .await
        .ok()
        .flatten()
        .flatten();
    let result = handle
        .authenticate_publickey(user, PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg))
        .await
        .map_err(|e| auth_failed(e.to_string()))?;

    if result.success() {
        Ok(())
    } else {
        Err(auth_failed(format!(
            "{} was rejected",
            credential.describe()
        )))
    }
}

async fn authenticate_with_agent(
    handle: &mut client::Handle<TrustHandler>,
    user: &str,
) -> Result<(), TransportError> {
    let mut agent = AgentClient::connect_env()
        .await
        .map_err(|e| auth_failed(format!("ssh agent unavailable: {e}")))?;
    let identities = agent
        .request_identities()
        .await
        .map_err(|e| auth_failed(format!("ssh agent identities: {e}")))?;

    if identities.is_empty() {
        return Err(auth_failed("ssh agent holds no identities".to_string()));
    }

    let hash_alg = handle
        .best_supported_rsa_hash()
        .await
        .ok()
        .flatten()
        .flatten();

    for identity in identities {
        match handle
            .authenticate_publickey_with(user, identity, hash_alg, &mut agent)
            .await
        {
            Ok(result) if result.success() => return Ok(()),
            Ok(_) => debug!("agent identity rejected, trying next"),
            Err(e) => debug!(error = %e, "agent signing failed, trying next"),
        }
    }

    Err(auth_failed("no agent identity was accepted".to_string()))
}

fn auth_failed(reason: String) -> TransportError {
    TransportError::AuthenticationFailed {
        host: String::new(),
        reason,
    }
}

impl TransportError {
    /// Fill in the host of an authentication error raised before it was known
    fn with_host(self, host: &str) -> Self {
        match self {
            Self::AuthenticationFailed { host: h, reason } if h.is_empty() => {
                Self::AuthenticationFailed {
                    host: host.to_string(),
                    reason,
                }
            }
            other => other,
        }
    }
}

fn is_missing(e: &SftpError) -> bool {
    matches!(e, SftpError::Status(status) if status.status_code == StatusCode::NoSuchFile)
}

fn sftp_error(op: &'static str, path: &str, e: &SftpError) -> TransportError {
    if is_missing(e) {
        TransportError::RemoteFileMissing(path.to_string())
    } else {
        TransportError::Sftp {
            op,
            path: path.to_string(),
            reason: e.to_string(),
        }
    }
}

#[async_trait]
impl TransportSession for SshSession {
    fn host(&self) -> &str {
        &self.host
    }

    #[instrument(skip(self), fields(host = %self.host))]
    async fn read(&self, path: &str) -> Result<Vec<u8>, TransportError> {
        self.bounded("read", async {
            self.sftp.read(path).await.map_err(|e| sftp_error("read", path, &e))
        })
        .await
    }

    #[instrument(skip(self, data), fields(host = %self.host, bytes = data.len()))]
    async fn write(&self, path: &str, data: &[u8]) -> Result<(), TransportError> {
        self.bounded("write", async {
            let mut file = self
                .sftp
                .create(path)
                .await
                .map_err(|e| sftp_error("create", path, &e))?;
            file.write_all(data).await.map_err(|e| TransportError::Sftp {
                op: "write",
                path: path.to_string(),
                reason: e.to_string(),
            })?;
            file.shutdown().await.map_err(|e| TransportError::Sftp {
                op: "close",
                path: path.to_string(),
                reason: e.to_string(),
            })
        })
        .await
    }

    #[instrument(skip(self), fields(host = %self.host))]
    async fn rename(&self, from: &str, to: &str) -> Result<(), TransportError> {
        self.bounded("rename", async {
            self.sftp
                .rename(from, to)
                .await
                .map_err(|e| sftp_error("rename", from, &e))
        })
        .await
    }

    #[instrument(skip(self), fields(host = %self.host))]
    async fn remove(&self, path: &str) -> Result<(), TransportError> {
        self.bounded("remove", async {
            self.sftp
                .remove_file(path)
                .await
                .map_err(|e| sftp_error("remove", path, &e))
        })
        .await
    }

    #[instrument(skip(self), fields(host = %self.host))]
    async fn create_dir(&self, path: &str) -> Result<(), TransportError> {
        self.bounded("mkdir", async {
            self.sftp
                .create_dir(path)
                .await
                .map_err(|e| sftp_error("mkdir", path, &e))
        })
        .await
    }

    #[instrument(skip(self), fields(host = %self.host))]
    async fn chmod(&self, path: &str, mode: u32) -> Result<(), TransportError> {
        self.bounded("chmod", async {
            let attrs = FileAttributes {
                permissions: Some(mode),
                ..FileAttributes::default()
            };
            self.sftp
                .set_metadata(path, attrs)
                .await
                .map_err(|e| sftp_error("chmod", path, &e))
        })
        .await
    }

    async fn exists(&self, path: &str) -> Result<bool, TransportError> {
        self.bounded("stat", async {
            self.sftp
                .try_exists(path)
                .await
                .map_err(|e| sftp_error("stat", path, &e))
        })
        .await
    }

    async fn close(&self) -> Result<(), TransportError> {
        if let Err(e) = self.sftp.close().await {
            debug!(host = %self.host, error = %e, "closing SFTP channel failed");
        }
        self.handle
            .disconnect(Disconnect::ByApplication, "", "English")
            .await
            .map_err(|e| TransportError::ConnectionFailed {
                host: self.host.clone(),
                reason: e.to_string(),
            })?;
        info!(host = %self.host, "SSH disconnected");
        Ok(())
    }
}
