//! Opaque secret buffer
//!
//! Private key bytes and passphrases are held in [`SecretBytes`]. The buffer
//! is wiped when dropped or explicitly released, never prints its content and
//! serializes as a fixed placeholder.

use std::fmt;

use serde::{Serialize, Serializer};
use zeroize::{Zeroize, Zeroizing};

use crate::error::ModelError;

const REDACTED: &str = "[REDACTED]";

/// Zeroizing byte buffer with redacted formatting
#[derive(Clone, Default)]
pub struct SecretBytes(Zeroizing<Vec<u8>>);

impl SecretBytes {
    /// Take ownership of `bytes`; the allocation is moved, not copied
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(Zeroizing::new(bytes))
    }

    /// Copy a borrowed slice into a fresh secret buffer
    #[must_use]
    pub fn copy_from(bytes: &[u8]) -> Self {
        Self(Zeroizing::new(bytes.to_vec()))
    }

    /// Borrow the raw bytes
    #[must_use]
    pub fn expose(&self) -> &[u8] {
        &self.0
    }

    /// Borrow the bytes as UTF-8 (PEM encoded keys, passphrases)
    ///
    /// # Errors
    /// Returns `ModelError::SecretNotUtf8` if the content is not UTF-8
    pub fn expose_str(&self) -> Result<&str, ModelError> {
        std::str::from_utf8(&self.0).map_err(|_| ModelError::SecretNotUtf8)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Wipe the buffer now instead of waiting for drop
    pub fn release(mut self) {
        self.0.zeroize();
    }
}

impl From<String> for SecretBytes {
    fn from(value: String) -> Self {
        Self::new(value.into_bytes())
    }
}

impl From<Zeroizing<String>> for SecretBytes {
    fn from(value: Zeroizing<String>) -> Self {
        Self::copy_from(value.as_bytes())
    }
}

impl fmt::Debug for SecretBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretBytes({REDACTED}, {} bytes)", self.0.len())
    }
}

impl Serialize for SecretBytes {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(REDACTED)
    }
}

impl PartialEq for SecretBytes {
    fn eq(&self, other: &Self) -> bool {
        self.0.as_slice() == other.0.as_slice()
    }
}

impl Eq for SecretBytes {}
