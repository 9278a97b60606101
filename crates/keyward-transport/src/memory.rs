//! In-memory hosts for tests and dry runs
//!
//! A [`MemoryTransport`] owns a set of [`MemoryHost`]s addressed by
//! `host:port`. Authentication is simulated the way sshd does it: the
//! credential's public key must appear in the user's
//! `~/.ssh/authorized_keys`. Host keys go through the same trust evaluation
//! and known-hosts store as the SSH factory.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use keyward_model::KnownHostStore;
use tracing::{debug, info};

use crate::credential::{Credential, generate_ephemeral_keypair};
use crate::error::{FailureKind, TransportError};
use crate::factory::{ConnectTarget, TransportFactory, TransportTimeouts};
use crate::session::TransportSession;
use crate::trust::{self, HostKeyVerdict, TrustPolicy};

const AUTHORIZED_KEYS: &str = ".ssh/authorized_keys";

#[derive(Debug, Default)]
struct HostState {
    host_key: String,
    files: BTreeMap<String, Vec<u8>>,
    dirs: BTreeSet<String>,
    modes: BTreeMap<String, u32>,
    fail_connect: Option<FailureKind>,
    connect_delay: Option<Duration>,
    rename_failures: Option<(String, usize)>,
    rename_delay: Option<(String, Duration)>,
    accept_agent: bool,
}

fn home(user: &str) -> String {
    if user == "root" {
        "/root".to_string()
    } else {
        format!("/home/{user}")
    }
}

fn resolve(user: &str, path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("{}/{}", home(user), path.trim_start_matches("./"))
    }
}

fn parent(path: &str) -> &str {
    path.rsplit_once('/').map_or("/", |(dir, _)| dir)
}

impl HostState {
    fn dir_exists(&self, user: &str, path: &str) -> bool {
        path == home(user) || path == "/" || self.dirs.contains(path)
    }

    /// Whether `line` authenticates `user` on this host
    fn authorizes(&self, user: &str, public_line: &str) -> bool {
        let Some(key_data) = public_line.split_whitespace().nth(1) else {
            return false;
        };
        let Some(content) = self.files.get(&resolve(user, AUTHORIZED_KEYS)) else {
            return false;
        };
        String::from_utf8_lossy(content)
            .lines()
            .filter(|line| !line.trim_start().starts_with('#'))
            .any(|line| line.split_whitespace().any(|token| token == key_data))
    }
}

/// Handle to one simulated host
#[derive(Debug, Clone)]
pub struct MemoryHost {
    address: String,
    state: Arc<Mutex<HostState>>,
    connections: Arc<AtomicUsize>,
    open_sessions: Arc<AtomicUsize>,
}

impl MemoryHost {
    fn state(&self) -> MutexGuard<'_, HostState> {
        // A panicking test thread must not hide the filesystem from the rest
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// `host:port`
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    /// The key line the host presents
    #[must_use]
    pub fn host_key(&self) -> String {
        self.state().host_key.clone()
    }

    /// Replace the host key, as a reinstalled or spoofed host would
    ///
    /// # Errors
    /// Returns `TransportError::InvalidKey` if key generation fails
    pub fn rotate_host_key(&self) -> Result<String, TransportError> {
        let key = generate_ephemeral_keypair(&self.address)?.public_key;
        self.state().host_key.clone_from(&key);
        Ok(key)
    }

    /// Contents of a file, relative to the user's home unless absolute
    #[must_use]
    pub fn file(&self, user: &str, path: &str) -> Option<String> {
        self.state()
            .files
            .get(&resolve(user, path))
            .map(|data| String::from_utf8_lossy(data).into_owned())
    }

    /// Permission bits of a file or directory
    #[must_use]
    pub fn mode(&self, user: &str, path: &str) -> Option<u32> {
        self.state().modes.get(&resolve(user, path)).copied()
    }

    /// Every file path on the host
    #[must_use]
    pub fn paths(&self) -> Vec<String> {
        self.state().files.keys().cloned().collect()
    }

    #[must_use]
    pub fn authorized_keys(&self, user: &str) -> Option<String> {
        self.file(user, AUTHORIZED_KEYS)
    }

    /// Seed `~/.ssh/authorized_keys`, creating `~/.ssh`
    pub fn set_authorized_keys(&self, user: &str, content: &str) {
        let mut state = self.state();
        let dir = resolve(user, ".ssh");
        state.modes.entry(dir.clone()).or_insert(0o700);
        state.dirs.insert(dir);
        let path = resolve(user, AUTHORIZED_KEYS);
        state.modes.entry(path.clone()).or_insert(0o600);
        state.files.insert(path, content.as_bytes().to_vec());
    }

    /// Make every connection attempt fail with this kind
    pub fn set_fail_connect(&self, kind: Option<FailureKind>) {
        self.state().fail_connect = kind;
    }

    /// Delay before the host answers a connection
    pub fn set_connect_delay(&self, delay: Option<Duration>) {
        self.state().connect_delay = delay;
    }

    /// Fail the next `times` renames onto `target` (relative to the user's home)
    pub fn set_rename_failures(&self, user: &str, target: &str, times: usize) {
        self.state().rename_failures = Some((resolve(user, target), times));
    }

    /// Stall every rename onto `target` (relative to the user's home) before it happens
    pub fn set_rename_delay(&self, user: &str, target: &str, delay: Option<Duration>) {
        self.state().rename_delay = delay.map(|delay| (resolve(user, target), delay));
    }

    /// Whether agent authentication succeeds
    pub fn set_accept_agent(&self, accept: bool) {
        self.state().accept_agent = accept;
    }

    /// Successful connections so far
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Sessions opened and not yet closed or dropped
    #[must_use]
    pub fn open_sessions(&self) -> usize {
        self.open_sessions.load(Ordering::SeqCst)
    }
}

/// Factory over simulated hosts
pub struct MemoryTransport {
    known_hosts: Arc<dyn KnownHostStore>,
    hosts: RwLock<HashMap<String, MemoryHost>>,
    timeouts: TransportTimeouts,
}

impl std::fmt::Debug for MemoryTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTransport")
            .field("timeouts", &self.timeouts)
            .finish_non_exhaustive()
    }
}

impl MemoryTransport {
    pub fn new(known_hosts: Arc<dyn KnownHostStore>) -> Self {
        Self {
            known_hosts,
            hosts: RwLock::new(HashMap::new()),
            timeouts: TransportTimeouts::default(),
        }
    }

    #[must_use]
    pub fn with_timeouts(mut self, timeouts: TransportTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Add a reachable host with a fresh host key
    ///
    /// # Errors
    /// Returns `TransportError::InvalidKey` if key generation fails
    pub fn add_host(&self, hostname: &str, port: u16) -> Result<MemoryHost, TransportError> {
        let address = format!("{hostname}:{port}");
        let host_key = generate_ephemeral_keypair(&address)?.public_key;
        let host = MemoryHost {
            address: address.clone(),
            state: Arc::new(Mutex::new(HostState {
                host_key,
                ..HostState::default()
            })),
            connections: Arc::new(AtomicUsize::new(0)),
            open_sessions: Arc::new(AtomicUsize::new(0)),
        };
        self.hosts
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(address, host.clone());
        Ok(host)
    }

    #[must_use]
    pub fn host(&self, hostname: &str, port: u16) -> Option<MemoryHost> {
        self.hosts
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(&format!("{hostname}:{port}"))
            .cloned()
    }

    async fn reach(&self, target: &ConnectTarget) -> Result<MemoryHost, TransportError> {
        let address = target.address();
        let Some(host) = self.host(&target.hostname, target.port) else {
            return Err(TransportError::ConnectionRefused {
                host: address,
                reason: "no such host".to_string(),
            });
        };

        let (delay, fail) = {
            let state = host.state();
            (state.connect_delay, state.fail_connect)
        };

        if let Some(delay) = delay {
            if delay >= self.timeouts.connect {
                tokio::time::sleep(self.timeouts.connect).await;
                return Err(TransportError::Timeout {
                    host: address,
                    timeout: self.timeouts.connect,
                });
            }
            tokio::time::sleep(delay).await;
        }

        match fail {
            None => Ok(host),
            Some(FailureKind::Timeout) => Err(TransportError::Timeout {
                host: address,
                timeout: self.timeouts.connect,
            }),
            Some(FailureKind::ConnectionRefused) => Err(TransportError::ConnectionRefused {
                host: address,
                reason: "connection refused".to_string(),
            }),
            Some(FailureKind::AuthenticationFailure) => Err(TransportError::AuthenticationFailed {
                host: address,
                reason: "permission denied".to_string(),
            }),
            Some(kind) => Err(TransportError::ConnectionFailed {
                host: address,
                reason: kind.to_string(),
            }),
        }
    }
}

#[async_trait]
impl TransportFactory for MemoryTransport {
    async fn open(
        &self,
        target: &ConnectTarget,
        credential: &Credential,
        policy: &TrustPolicy,
    ) -> Result<Box<dyn TransportSession>, TransportError> {
        let address = target.address();
        let host = self.reach(target).await?;

        let presented = host.host_key();
        let stored = self.known_hosts.known_host_key(&address).await?;
        let verdict = trust::evaluate(policy, stored.as_deref(), &presented);
        if let Some(err) = TransportError::from_verdict(&address, &verdict) {
            return Err(err);
        }

        let authorized = match credential.public_key_line()? {
            Some(line) => host.state().authorizes(&target.username, &line),
            None => host.state().accept_agent,
        };
        if !authorized {
            return Err(TransportError::AuthenticationFailed {
                host: address,
                reason: format!("{} was rejected", credential.describe()),
            });
        }

        if let HostKeyVerdict::TrustedNew { presented } = &verdict {
            self.known_hosts.save_known_host(&address, presented).await?;
            info!(host = %address, "recorded new host key");
        }

        host.connections.fetch_add(1, Ordering::SeqCst);
        host.open_sessions.fetch_add(1, Ordering::SeqCst);
        debug!(host = %address, user = %target.username, "memory session opened");

        Ok(Box::new(MemorySession {
            host,
            user: target.username.clone(),
            closed: AtomicBool::new(false),
        }))
    }

    async fn scan_host_key(&self, target: &ConnectTarget) -> Result<String, TransportError> {
        let host = self.reach(target).await?;
        Ok(host.host_key())
    }
}

struct MemorySession {
    host: MemoryHost,
    user: String,
    closed: AtomicBool,
}

impl MemorySession {
    fn release(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.host.open_sessions.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn check_open(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::SftpChannel("session closed".to_string()));
        }
        Ok(())
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        self.release();
    }
}

fn sftp_failure(op: &'static str, path: &str, reason: &str) -> TransportError {
    TransportError::Sftp {
        op,
        path: path.to_string(),
        reason: reason.to_string(),
    }
}

#[async_trait]
impl TransportSession for MemorySession {
    fn host(&self) -> &str {
        self.host.address()
    }

    async fn read(&self, path: &str) -> Result<Vec<u8>, TransportError> {
        self.check_open()?;
        self.host
            .state()
            .files
            .get(&resolve(&self.user, path))
            .cloned()
            .ok_or_else(|| TransportError::RemoteFileMissing(path.to_string()))
    }

    async fn write(&self, path: &str, data: &[u8]) -> Result<(), TransportError> {
        self.check_open()?;
        let full = resolve(&self.user, path);
        let mut state = self.host.state();
        if !state.dir_exists(&self.user, parent(&full)) {
            return Err(TransportError::RemoteFileMissing(parent(&full).to_string()));
        }
        state.modes.entry(full.clone()).or_insert(0o644);
        state.files.insert(full, data.to_vec());
        Ok(())
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), TransportError> {
        self.check_open()?;
        let from_full = resolve(&self.user, from);
        let to_full = resolve(&self.user, to);

        let delay = self
            .host
            .state()
            .rename_delay
            .as_ref()
            .filter(|(target, _)| *target == to_full)
            .map(|(_, delay)| *delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.host.state();
        if let Some((target, remaining)) = state.rename_failures.as_mut()
            && *target == to_full
            && *remaining > 0
        {
            *remaining -= 1;
            return Err(sftp_failure("rename", from, "injected failure"));
        }

        if !state.files.contains_key(&from_full) {
            return Err(TransportError::RemoteFileMissing(from.to_string()));
        }
        if state.files.contains_key(&to_full) || state.dirs.contains(&to_full) {
            return Err(sftp_failure("rename", from, "target exists"));
        }
        let Some(data) = state.files.remove(&from_full) else {
            return Err(TransportError::RemoteFileMissing(from.to_string()));
        };
        let mode = state.modes.remove(&from_full).unwrap_or(0o644);
        state.files.insert(to_full.clone(), data);
        state.modes.insert(to_full, mode);
        Ok(())
    }

    async fn remove(&self, path: &str) -> Result<(), TransportError> {
        self.check_open()?;
        let full = resolve(&self.user, path);
        let mut state = self.host.state();
        if state.files.remove(&full).is_none() {
            return Err(TransportError::RemoteFileMissing(path.to_string()));
        }
        state.modes.remove(&full);
        Ok(())
    }

    async fn create_dir(&self, path: &str) -> Result<(), TransportError> {
        self.check_open()?;
        let full = resolve(&self.user, path);
        let mut state = self.host.state();
        if state.dir_exists(&self.user, &full) || state.files.contains_key(&full) {
            return Err(sftp_failure("mkdir", path, "already exists"));
        }
        state.modes.insert(full.clone(), 0o755);
        state.dirs.insert(full);
        Ok(())
    }

    async fn chmod(&self, path: &str, mode: u32) -> Result<(), TransportError> {
        self.check_open()?;
        let full = resolve(&self.user, path);
        let mut state = self.host.state();
        if !state.files.contains_key(&full) && !state.dirs.contains(&full) {
            return Err(TransportError::RemoteFileMissing(path.to_string()));
        }
        state.modes.insert(full, mode & 0o7777);
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool, TransportError> {
        self.check_open()?;
        let full = resolve(&self.user, path);
        let state = self.host.state();
        Ok(state.files.contains_key(&full) || state.dir_exists(&self.user, &full))
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.release();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use keyward_model::MemoryStore;

    use super::*;

    fn transport() -> (Arc<MemoryStore>, MemoryTransport) {
        let store = Arc::new(MemoryStore::new());
        let transport = MemoryTransport::new(store.clone());
        (store, transport)
    }

    fn credential_for(host: &MemoryHost, user: &str) -> Credential {
        let pair = generate_ephemeral_keypair("test").unwrap();
        host.set_authorized_keys(user, &format!("{}\n", pair.public_key));
        Credential::ephemeral("test", pair.private_key)
    }

    #[tokio::test]
    async fn test_tofu_records_host_key() {
        let (store, transport) = transport();
        let host = transport.add_host("web", 22).unwrap();
        let credential = credential_for(&host, "deploy");
        let target = ConnectTarget::new("web", 22, "deploy");

        let session = transport
            .open(&target, &credential, &TrustPolicy::Tofu)
            .await
            .unwrap();
        session.close().await.unwrap();

        assert_eq!(
            store.known_host_key("web:22").await.unwrap(),
            Some(host.host_key())
        );
        assert_eq!(host.open_sessions(), 0);
    }

    #[tokio::test]
    async fn test_verify_rejects_unknown_host() {
        let (_store, transport) = transport();
        let host = transport.add_host("web", 22).unwrap();
        let credential = credential_for(&host, "deploy");
        let target = ConnectTarget::new("web", 22, "deploy");

        let err = transport
            .open(&target, &credential, &TrustPolicy::Verify)
            .await
            .err()
            .unwrap();

        assert_eq!(err.kind(), FailureKind::HostKeyUnknown);
        assert_eq!(host.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_changed_host_key_is_mismatch() {
        let (store, transport) = transport();
        let host = transport.add_host("web", 22).unwrap();
        store
            .save_known_host("web:22", &host.host_key())
            .await
            .unwrap();
        host.rotate_host_key().unwrap();
        let credential = credential_for(&host, "deploy");

        let err = transport
            .open(
                &ConnectTarget::new("web", 22, "deploy"),
                &credential,
                &TrustPolicy::Tofu,
            )
            .await
            .err()
            .unwrap();

        assert_eq!(err.kind(), FailureKind::HostKeyMismatch);
    }

    #[tokio::test]
    async fn test_unauthorized_key_is_rejected() {
        let (_store, transport) = transport();
        let host = transport.add_host("web", 22).unwrap();
        credential_for(&host, "deploy");
        let stranger = generate_ephemeral_keypair("stranger").unwrap();

        let err = transport
            .open(
                &ConnectTarget::new("web", 22, "deploy"),
                &Credential::ephemeral("stranger", stranger.private_key),
                &TrustPolicy::Tofu,
            )
            .await
            .err()
            .unwrap();

        assert_eq!(err.kind(), FailureKind::AuthenticationFailure);
    }

    #[tokio::test]
    async fn test_rename_refuses_existing_target() {
        let (_store, transport) = transport();
        let host = transport.add_host("web", 22).unwrap();
        let credential = credential_for(&host, "deploy");
        let session = transport
            .open(
                &ConnectTarget::new("web", 22, "deploy"),
                &credential,
                &TrustPolicy::Tofu,
            )
            .await
            .unwrap();

        session.write(".ssh/new", b"x").await.unwrap();
        assert!(session.rename(".ssh/new", ".ssh/authorized_keys").await.is_err());

        session.remove(".ssh/authorized_keys").await.unwrap();
        session.rename(".ssh/new", ".ssh/authorized_keys").await.unwrap();
        assert_eq!(host.authorized_keys("deploy").as_deref(), Some("x"));
    }

    #[tokio::test]
    async fn test_write_needs_parent_directory() {
        let (_store, transport) = transport();
        let host = transport.add_host("web", 22).unwrap();
        host.set_accept_agent(true);
        let session = transport
            .open(
                &ConnectTarget::new("web", 22, "deploy"),
                &Credential::Agent,
                &TrustPolicy::Tofu,
            )
            .await
            .unwrap();

        assert!(session.write(".ssh/authorized_keys", b"x").await.is_err());
        session.create_dir(".ssh").await.unwrap();
        session.write(".ssh/authorized_keys", b"x").await.unwrap();
        assert!(session.exists(".ssh/authorized_keys").await.unwrap());
    }

    #[tokio::test]
    async fn test_injected_connect_failure() {
        let (_store, transport) = transport();
        let host = transport.add_host("web", 22).unwrap();
        host.set_fail_connect(Some(FailureKind::ConnectionRefused));

        let err = transport
            .scan_host_key(&ConnectTarget::new("web", 22, "deploy"))
            .await
            .unwrap_err();

        assert!(err.is_unreachable());
    }

    #[tokio::test]
    async fn test_dropped_session_is_released() {
        let (_store, transport) = transport();
        let host = transport.add_host("web", 22).unwrap();
        let credential = credential_for(&host, "deploy");

        let session = transport
            .open(
                &ConnectTarget::new("web", 22, "deploy"),
                &credential,
                &TrustPolicy::Tofu,
            )
            .await
            .unwrap();
        assert_eq!(host.open_sessions(), 1);
        drop(session);

        assert_eq!(host.open_sessions(), 0);
    }
}
