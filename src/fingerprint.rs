// src/fingerprint.rs

//! Image fingerprints: the single identity of an image.
//!
//! A fingerprint is the hex SHA-256 over the canonical concatenation of the
//! metadata tarball and (for split images) the rootfs blob. API paths may
//! carry a unique prefix instead of the full hash; resolution happens in the
//! metadata store.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::io::{self, Read, Write};
use std::str::FromStr;

/// Length of a full fingerprint in hex characters
pub const FINGERPRINT_HEX_LEN: usize = 64;

/// A validated, lowercase hex SHA-256 fingerprint
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Validate and normalise a full fingerprint string
    pub fn new(value: impl Into<String>) -> Result<Self> {
        let value: String = value.into();

        if value.len() != FINGERPRINT_HEX_LEN {
            return Err(Error::Validation(format!(
                "Invalid fingerprint length: expected {}, got {}",
                FINGERPRINT_HEX_LEN,
                value.len()
            )));
        }

        if !value.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(Error::Validation(format!(
                "Invalid fingerprint: {}",
                value
            )));
        }

        Ok(Self(value.to_lowercase()))
    }

    /// Validate a fingerprint prefix (at least 12 hex chars, used in URLs)
    pub fn validate_prefix(prefix: &str) -> Result<()> {
        if prefix.is_empty() || prefix.len() > FINGERPRINT_HEX_LEN {
            return Err(Error::Validation(format!(
                "Invalid fingerprint prefix: {}",
                prefix
            )));
        }

        if !prefix.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(Error::Validation(format!(
                "Invalid fingerprint prefix: {}",
                prefix
            )));
        }

        Ok(())
    }

    /// The hex string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this fingerprint starts with the given prefix
    pub fn matches_prefix(&self, prefix: &str) -> bool {
        self.0.starts_with(&prefix.to_lowercase())
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Fingerprint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

/// Incremental fingerprint computation over the canonical byte order
pub struct FingerprintHasher {
    state: Sha256,
}

impl FingerprintHasher {
    pub fn new() -> Self {
        Self {
            state: Sha256::new(),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.state.update(data);
    }

    pub fn finalize(self) -> Fingerprint {
        Fingerprint(format!("{:x}", self.state.finalize()))
    }
}

impl Default for FingerprintHasher {
    fn default() -> Self {
        Self::new()
    }
}

/// Writer adapter that feeds every byte into a fingerprint hasher
///
/// Used to tee uploads: data flows to the inner writer while the hash is
/// computed in the same pass.
pub struct HashingWriter<W: Write> {
    inner: W,
    hasher: Sha256,
    written: u64,
}

impl<W: Write> HashingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            written: 0,
        }
    }

    /// Total bytes written through this adapter
    pub fn bytes_written(&self) -> u64 {
        self.written
    }

    /// Finish, returning the inner writer and the fingerprint
    pub fn finalize(self) -> (W, Fingerprint) {
        (self.inner, Fingerprint(format!("{:x}", self.hasher.finalize())))
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Compute a fingerprint over a byte slice
pub fn fingerprint_bytes(data: &[u8]) -> Fingerprint {
    let mut hasher = FingerprintHasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// Compute a fingerprint by streaming a reader to completion
pub fn fingerprint_reader<R: Read>(reader: &mut R) -> io::Result<Fingerprint> {
    let mut hasher = FingerprintHasher::new();
    let mut buffer = [0u8; 8192];

    loop {
        let n = reader.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(hasher.finalize())
}
