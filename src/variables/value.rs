// src/variables/value.rs

//! Typed variable values

use crate::version::Version;
use serde::{Deserialize, Serialize};
use std::fmt;
use strum_macros::{Display, EnumIter, EnumString};

/// Variable namespaces; a name is unique within its namespace
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, EnumIter,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case", ascii_case_insensitive)]
pub enum Namespace {
    String,
    Numeric,
    Version,
    SecureString,
}

impl Namespace {
    /// Lookup order used when a name is resolved without a namespace
    pub const SEARCH_ORDER: [Namespace; 4] = [
        Namespace::String,
        Namespace::Numeric,
        Namespace::Version,
        Namespace::SecureString,
    ];

    pub(crate) fn index(self) -> usize {
        match self {
            Self::String => 0,
            Self::Numeric => 1,
            Self::Version => 2,
            Self::SecureString => 3,
        }
    }
}

/// A string whose content must never reach logs or persisted reports
#[derive(Clone, PartialEq, Eq, Default)]
pub struct SecretString(String);

/// Mask printed in place of secret content
pub const REDACTED: &str = "*****";

impl SecretString {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Access the plaintext; callers are responsible for not logging it
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretString({})", REDACTED)
    }
}

impl fmt::Display for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(REDACTED)
    }
}

/// A value stored in one of the typed namespaces
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    String(String),
    Numeric(i64),
    Version(Version),
    SecureString(SecretString),
}

impl Value {
    /// Namespace this value belongs to
    pub fn namespace(&self) -> Namespace {
        match self {
            Self::String(_) => Namespace::String,
            Self::Numeric(_) => Namespace::Numeric,
            Self::Version(_) => Namespace::Version,
            Self::SecureString(_) => Namespace::SecureString,
        }
    }

    /// Parse a textual value into the given namespace
    pub fn parse(namespace: Namespace, text: &str) -> crate::Result<Self> {
        Ok(match namespace {
            Namespace::String => Self::String(text.to_string()),
            Namespace::Numeric => Self::Numeric(text.trim().parse().map_err(|_| {
                crate::Error::ConfigError(format!("'{}' is not a numeric value", text))
            })?),
            Namespace::Version => Self::Version(Version::parse(text)?),
            Namespace::SecureString => Self::SecureString(SecretString::new(text)),
        })
    }

    /// Render for substitution into command lines and paths
    pub(crate) fn render(&self) -> String {
        match self {
            Self::String(s) => s.clone(),
            Self::Numeric(n) => n.to_string(),
            Self::Version(v) => v.to_string(),
            Self::SecureString(s) => s.expose().to_string(),
        }
    }
}

/// Display never reveals secure content
impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(s) => f.write_str(s),
            Self::Numeric(n) => write!(f, "{}", n),
            Self::Version(v) => write!(f, "{}", v),
            Self::SecureString(s) => write!(f, "{}", s),
        }
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Self::Numeric(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Self::Numeric(i64::from(n))
    }
}

impl From<Version> for Value {
    fn from(v: Version) -> Self {
        Self::Version(v)
    }
}

impl From<SecretString> for Value {
    fn from(s: SecretString) -> Self {
        Self::SecureString(s)
    }
}
