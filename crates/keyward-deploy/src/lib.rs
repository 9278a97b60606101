//! keyward-deploy: authorized-keys rendering and atomic deployment
//!
//! [`render::ContentRenderer`] turns stored keys into the exact text of an
//! account's `authorized_keys`; [`deployer::AtomicFileDeployer`] pushes that
//! text over an open session without ever leaving a half-written file, and
//! can rewrite only the managed block while preserving everything else.

pub mod block;
pub mod deployer;
pub mod error;
pub mod render;

pub use block::{
    FOOTER, HEADER_PREFIX, ManagedBlock, SplitContent, header_line, managed_serial,
    remove_key_line, replace_managed, split_managed,
};
pub use deployer::{AtomicFileDeployer, DeployPaths, SelectiveOutcome};
pub use error::DeployError;
pub use render::{ContentRenderer, SYSTEM_KEY_OPTIONS, content_hash, normalize, render_keys};
