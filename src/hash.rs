// src/hash.rs

//! Payload integrity hashing
//!
//! Payloads may declare a hash as `"<algorithm>:<hex>"`. Two algorithms are
//! supported:
//! - **SHA-256** for payloads published by third parties
//! - **XXH128** for fast verification of payloads the bundle author controls
//!
//! Unprefixed hashes are treated as SHA-256.

use crate::error::{Error, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::str::FromStr;
use xxhash_rust::xxh3::Xxh3;

/// Hash algorithm selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum HashAlgorithm {
    #[default]
    Sha256,
    Xxh128,
}

impl HashAlgorithm {
    /// Hex digest length
    #[inline]
    pub const fn hex_len(&self) -> usize {
        match self {
            Self::Sha256 => 64,
            Self::Xxh128 => 32,
        }
    }

    #[inline]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Sha256 => "sha256",
            Self::Xxh128 => "xxh128",
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for HashAlgorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "sha256" | "sha-256" => Ok(Self::Sha256),
            "xxh128" | "xxh3" => Ok(Self::Xxh128),
            _ => Err(Error::ConfigError(format!("unknown hash algorithm: {}", s))),
        }
    }
}

/// A declared or computed payload hash
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PayloadHash {
    pub algorithm: HashAlgorithm,
    /// Lowercase hex digest
    pub value: String,
}

impl PayloadHash {
    pub fn new(algorithm: HashAlgorithm, value: impl Into<String>) -> Result<Self> {
        let value = value.into();
        if value.len() != algorithm.hex_len() || !value.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(Error::ConfigError(format!(
                "invalid {} digest '{}'",
                algorithm, value
            )));
        }
        Ok(Self {
            algorithm,
            value: value.to_lowercase(),
        })
    }

    /// Parse `"sha256:abc..."`, `"xxh128:abc..."`, or a bare SHA-256 digest
    pub fn parse_prefixed(s: &str) -> Result<Self> {
        match s.split_once(':') {
            Some((algo, digest)) => Self::new(algo.parse()?, digest),
            None => Self::new(HashAlgorithm::Sha256, s),
        }
    }

    pub fn to_prefixed_string(&self) -> String {
        format!("{}:{}", self.algorithm, self.value)
    }
}

impl fmt::Display for PayloadHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_prefixed_string())
    }
}

impl Serialize for PayloadHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_prefixed_string())
    }
}

impl<'de> Deserialize<'de> for PayloadHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse_prefixed(&s).map_err(serde::de::Error::custom)
    }
}

/// Incremental hasher over either algorithm
pub struct Hasher {
    state: HasherState,
}

enum HasherState {
    Sha256(Sha256),
    Xxh128(Box<Xxh3>),
}

impl Hasher {
    pub fn new(algorithm: HashAlgorithm) -> Self {
        let state = match algorithm {
            HashAlgorithm::Sha256 => HasherState::Sha256(Sha256::new()),
            HashAlgorithm::Xxh128 => HasherState::Xxh128(Box::new(Xxh3::new())),
        };
        Self { state }
    }

    pub fn update(&mut self, data: &[u8]) {
        match &mut self.state {
            HasherState::Sha256(h) => h.update(data),
            HasherState::Xxh128(h) => h.update(data),
        }
    }

    pub fn finalize(self) -> PayloadHash {
        match self.state {
            HasherState::Sha256(h) => PayloadHash {
                algorithm: HashAlgorithm::Sha256,
                value: hex::encode(h.finalize()),
            },
            HasherState::Xxh128(h) => PayloadHash {
                algorithm: HashAlgorithm::Xxh128,
                value: hex::encode(h.digest128().to_be_bytes()),
            },
        }
    }
}

/// Hash a byte slice
pub fn hash_bytes(algorithm: HashAlgorithm, data: &[u8]) -> PayloadHash {
    let mut hasher = Hasher::new(algorithm);
    hasher.update(data);
    hasher.finalize()
}

/// Hash a file, streaming in 8KB chunks
pub fn hash_file(algorithm: HashAlgorithm, path: &Path) -> Result<PayloadHash> {
    let mut file = File::open(path)?;
    let mut hasher = Hasher::new(algorithm);
    let mut buffer = [0u8; 8192];

    loop {
        let n = file.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(hasher.finalize())
}

/// Check a file against its declared hash
pub fn verify_file(path: &Path, expected: &PayloadHash) -> Result<()> {
    let actual = hash_file(expected.algorithm, path)?;
    if actual.value == expected.value {
        Ok(())
    } else {
        Err(Error::ChecksumMismatch {
            path: path.display().to_string(),
            expected: expected.to_prefixed_string(),
            actual: actual.to_prefixed_string(),
        })
    }
}
