// src/hash.rs

//! Spec identity hashing
//!
//! Concrete DAG nodes are identified by the SHA-256 of their canonical form.
//! The hash is the cache key everywhere: install database rows, store
//! prefixes, binary-cache lookups, and registry entries. Any non-empty
//! leading substring works as a lookup prefix; ambiguity is the caller's
//! problem to surface.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// Hex length of a full spec hash (SHA-256)
pub const FULL_HEX_LEN: usize = 64;

/// Length of the abbreviated form used in prefixes and display
pub const SHORT_HEX_LEN: usize = 7;

/// A full-width spec identity hash, stored as lowercase hex
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SpecHash(String);

impl SpecHash {
    /// Validate and wrap a hex string
    pub fn new(value: impl Into<String>) -> Result<Self> {
        let value: String = value.into();
        if value.len() != FULL_HEX_LEN {
            return Err(Error::ParseError(format!(
                "Invalid hash length: expected {}, got {}",
                FULL_HEX_LEN,
                value.len()
            )));
        }
        if !value.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(Error::ParseError(format!("Invalid hex in hash: {}", value)));
        }
        Ok(Self(value.to_lowercase()))
    }

    /// Hash raw canonical bytes
    pub fn of_bytes(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The abbreviated form used in store paths and human output
    pub fn short(&self) -> &str {
        &self.0[..SHORT_HEX_LEN]
    }

    /// Does this hash start with the given (non-empty) prefix?
    pub fn matches_prefix(&self, prefix: &str) -> bool {
        !prefix.is_empty() && self.0.starts_with(&prefix.to_lowercase())
    }
}

impl fmt::Display for SpecHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SpecHash {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

/// Incremental hasher for streaming canonical bytes
pub struct SpecHasher {
    state: Sha256,
}

impl SpecHasher {
    pub fn new() -> Self {
        Self {
            state: Sha256::new(),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.state.update(data);
    }

    pub fn finalize(self) -> SpecHash {
        SpecHash(hex::encode(self.state.finalize()))
    }
}

impl Default for SpecHasher {
    fn default() -> Self {
        Self::new()
    }
}

/// Verify raw bytes against an expected hex digest; used by staging to check
/// source archives before unpack
pub fn verify_bytes(data: &[u8], expected: &str) -> Result<()> {
    let actual = SpecHash::of_bytes(data);
    if actual.as_str() == expected.to_lowercase() {
        Ok(())
    } else {
        Err(Error::ChecksumMismatch {
            expected: expected.to_string(),
            actual: actual.0,
        })
    }
}

/// Verify a file against an expected hex digest, streaming its content
pub fn verify_file(path: &std::path::Path, expected: &str) -> Result<()> {
    use std::io::Read;

    let mut file = std::fs::File::open(path)?;
    let mut hasher = SpecHasher::new();
    let mut buffer = [0u8; 8192];
    loop {
        let n = file.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    let actual = hasher.finalize();
    if actual.as_str() == expected.to_lowercase() {
        Ok(())
    } else {
        Err(Error::ChecksumMismatch {
            expected: expected.to_string(),
            actual: actual.0,
        })
    }
}
