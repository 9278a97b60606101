//! Recording host keys out of band

use std::sync::Arc;

use keyward_model::{AuditAction, AuditEntry, Store};
use keyward_transport::trust::{fingerprint, same_key};
use keyward_transport::{ConnectTarget, TransportFactory};
use tracing::{info, instrument, warn};

use crate::error::CoreError;

/// What `trust_host` did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrustOutcome {
    /// Stored key already matched
    AlreadyTrusted { fingerprint: String },
    /// No key was stored; the presented one now is
    Recorded { fingerprint: String },
    /// A different stored key was overwritten on request
    Replaced { previous: String, fingerprint: String },
}

/// Scans a host's key and stores it for strict verification
#[derive(Clone)]
pub struct HostTrust {
    store: Arc<dyn Store>,
    transport: Arc<dyn TransportFactory>,
}

impl std::fmt::Debug for HostTrust {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostTrust").finish_non_exhaustive()
    }
}

impl HostTrust {
    pub fn new(store: Arc<dyn Store>, transport: Arc<dyn TransportFactory>) -> Self {
        Self { store, transport }
    }

    /// Store the key a host presents
    ///
    /// A differing stored key is only replaced when `replace` is set.
    ///
    /// # Errors
    /// Returns `CoreError::HostKeyConflict` for a changed key without
    /// `replace`, or the transport/store failure
    #[instrument(skip(self, target), fields(host = %target.address()))]
    pub async fn trust_host(
        &self,
        target: &ConnectTarget,
        replace: bool,
    ) -> Result<TrustOutcome, CoreError> {
        let address = target.address();
        let presented = self.transport.scan_host_key(target).await?;
        let presented_fp = fingerprint(&presented);

        let outcome = match self.store.known_host_key(&address).await? {
            Some(stored) if same_key(&stored, &presented) => {
                info!(host = %address, fingerprint = %presented_fp, "host key already trusted");
                return Ok(TrustOutcome::AlreadyTrusted {
                    fingerprint: presented_fp,
                });
            }
            Some(stored) if !replace => {
                warn!(host = %address, presented = %presented_fp, "refusing to replace stored host key");
                return Err(CoreError::HostKeyConflict {
                    host: address,
                    stored: fingerprint(&stored),
                    presented: presented_fp,
                });
            }
            Some(stored) => TrustOutcome::Replaced {
                previous: fingerprint(&stored),
                fingerprint: presented_fp.clone(),
            },
            None => TrustOutcome::Recorded {
                fingerprint: presented_fp.clone(),
            },
        };

        self.store.save_known_host(&address, &presented).await?;
        let details = match &outcome {
            TrustOutcome::Replaced { previous, .. } => {
                format!("{address}: {presented_fp} (replaced {previous})")
            }
            _ => format!("{address}: {presented_fp}"),
        };
        self.store
            .append(AuditEntry::new(AuditAction::HostTrusted, details))
            .await?;

        info!(host = %address, fingerprint = %presented_fp, "host key trusted");
        Ok(outcome)
    }
}
