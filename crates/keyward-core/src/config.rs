//! Engine configuration loading and types

use std::path::{Path, PathBuf};
use std::time::Duration;

use keyward_deploy::DeployPaths;
use keyward_model::PendingAccount;
use keyward_transport::TransportTimeouts;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Top-level configuration for the reconciliation engine
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub transport: TransportConfig,
    /// Remote file locations and modes
    #[serde(default)]
    pub deploy: DeployPaths,
    #[serde(default)]
    pub bootstrap: BootstrapConfig,
    #[serde(default)]
    pub fleet: FleetConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// SSH connection settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Port used when an account does not name one
    #[serde(default = "default_port")]
    pub default_port: u16,
    /// TCP connect + handshake + authentication, in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Each SFTP operation, in seconds
    #[serde(default = "default_operation_timeout")]
    pub operation_timeout_secs: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            default_port: default_port(),
            connect_timeout_secs: default_connect_timeout(),
            operation_timeout_secs: default_operation_timeout(),
        }
    }
}

impl TransportConfig {
    /// Pending account on `default_port`
    #[must_use]
    pub fn new_account(
        &self,
        username: impl Into<String>,
        hostname: impl Into<String>,
    ) -> PendingAccount {
        PendingAccount::new(username, hostname).with_port(self.default_port)
    }

    #[must_use]
    pub fn timeouts(&self) -> TransportTimeouts {
        TransportTimeouts {
            connect: Duration::from_secs(self.connect_timeout_secs),
            operation: Duration::from_secs(self.operation_timeout_secs),
        }
    }
}

fn default_port() -> u16 {
    22
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_operation_timeout() -> u64 {
    30
}

/// Bootstrap session lifetimes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootstrapConfig {
    /// How long an operator has to install the temporary key
    #[serde(default = "default_session_ttl")]
    pub session_ttl_secs: u64,
    /// How long a session may sit in `committing` before it is reaped
    #[serde(default = "default_committing_grace")]
    pub committing_grace_secs: u64,
    /// Reaper scan period
    #[serde(default = "default_reap_interval")]
    pub reap_interval_secs: u64,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            session_ttl_secs: default_session_ttl(),
            committing_grace_secs: default_committing_grace(),
            reap_interval_secs: default_reap_interval(),
        }
    }
}

impl BootstrapConfig {
    #[must_use]
    pub fn session_ttl(&self) -> chrono::Duration {
        lifetime(self.session_ttl_secs)
    }

    #[must_use]
    pub fn committing_grace(&self) -> chrono::Duration {
        lifetime(self.committing_grace_secs)
    }

    #[must_use]
    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs.max(1))
    }
}

/// Session lifetimes are capped at a year so expiry arithmetic cannot overflow
const MAX_LIFETIME_SECS: u64 = 365 * 24 * 60 * 60;

fn lifetime(secs: u64) -> chrono::Duration {
    let capped = i64::try_from(secs.min(MAX_LIFETIME_SECS)).unwrap_or_default();
    chrono::Duration::seconds(capped)
}

fn default_session_ttl() -> u64 {
    15 * 60
}

fn default_committing_grace() -> u64 {
    5 * 60
}

fn default_reap_interval() -> u64 {
    60
}

/// Fleet fan-out settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FleetConfig {
    /// Per-account deadline in seconds; unset means unbounded
    #[serde(default)]
    pub task_deadline_secs: Option<u64>,
}

impl FleetConfig {
    #[must_use]
    pub fn task_deadline(&self) -> Option<Duration> {
        self.task_deadline_secs.map(Duration::from_secs)
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Plain,
    Json,
}

/// Logging settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter (trace, debug, info, warn, error); `RUST_LOG` wins
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl EngineConfig {
    /// Load configuration from file
    ///
    /// # Errors
    /// Returns `CoreError::Config` if the file cannot be read or parsed
    pub fn load(path: &Path) -> Result<Self, CoreError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| CoreError::Config(format!("{}: {e}", path.display())))?;
        toml::from_str(&content).map_err(|e| CoreError::Config(format!("{}: {e}", path.display())))
    }

    /// Load from `KEYWARD_CONFIG` or the default paths, or use defaults
    ///
    /// # Errors
    /// Returns `CoreError::Config` if a file exists but cannot be parsed
    pub fn load_default() -> Result<Self, CoreError> {
        if let Ok(path) = std::env::var("KEYWARD_CONFIG") {
            return Self::load(Path::new(&path));
        }

        let paths = [
            Some(PathBuf::from("keyward.toml")),
            Some(PathBuf::from("/etc/keyward/keyward.toml")),
            dirs::config_dir().map(|p| p.join("keyward/keyward.toml")),
        ];

        for path in paths.into_iter().flatten() {
            if path.exists() {
                return Self::load(&path);
            }
        }

        tracing::warn!("no config file found, using defaults");
        Ok(Self::default())
    }
}
