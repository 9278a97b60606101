//! keyward-transport: SSH/SFTP sessions under explicit host-key trust
//!
//! Opens one authenticated SSH connection plus one SFTP channel per host,
//! decides host-key trust through [`trust::TrustPolicy`] and classifies
//! connection failures into [`error::FailureKind`].

pub mod credential;
pub mod error;
pub mod factory;
pub mod memory;
pub mod session;
pub mod ssh;
pub mod trust;

pub use credential::{Credential, GeneratedKeypair, generate_ephemeral_keypair, resolve_credential};
pub use error::{FailureKind, TransportError, classify};
pub use factory::{ConnectTarget, SshTransportFactory, TransportFactory, TransportTimeouts};
pub use memory::{MemoryHost, MemoryTransport};
pub use session::TransportSession;
pub use trust::{HostKeyVerdict, TrustPolicy};
