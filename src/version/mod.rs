// src/version/mod.rs

//! Bundle and package version handling
//!
//! Installer versions are dotted numeric sequences of arbitrary arity
//! (`1.2`, `1.2.3.4`) with an optional leading `v` and an optional
//! `-prerelease` label. Missing components compare as zero, so `1.2` equals
//! `1.2.0.0`. Prerelease labels sort before the release they precede and
//! are ordered among themselves by semver prerelease rules.

use crate::error::{Error, Result};
use semver::Prerelease;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

/// A parsed installer version
#[derive(Debug, Clone)]
pub struct Version {
    components: Vec<u64>,
    prerelease: Option<Prerelease>,
}

impl Version {
    /// Build a version from numeric components
    pub fn new(components: impl Into<Vec<u64>>) -> Self {
        let mut components = components.into();
        if components.is_empty() {
            components.push(0);
        }
        Self {
            components,
            prerelease: None,
        }
    }

    /// Parse a version string
    ///
    /// Accepted forms:
    /// - "1.2.3" → [1, 2, 3]
    /// - "v2.0" → [2, 0]
    /// - "1.0.0-beta.2" → [1, 0, 0] with prerelease "beta.2"
    pub fn parse(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        let body = trimmed
            .strip_prefix('v')
            .or_else(|| trimmed.strip_prefix('V'))
            .unwrap_or(trimmed);

        if body.is_empty() {
            return Err(Error::InvalidVersion(s.to_string()));
        }

        // Build metadata never participates in ordering
        let body = body.split_once('+').map_or(body, |(v, _)| v);

        let (numbers, label) = match body.split_once('-') {
            Some((n, l)) => (n, Some(l)),
            None => (body, None),
        };

        let components = numbers
            .split('.')
            .map(|part| part.parse::<u64>())
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|_| Error::InvalidVersion(s.to_string()))?;

        let prerelease = match label {
            Some(l) => Some(
                Prerelease::new(l).map_err(|_| Error::InvalidVersion(s.to_string()))?,
            ),
            None => None,
        };

        if prerelease.as_ref().is_some_and(|p| p.is_empty()) {
            return Err(Error::InvalidVersion(s.to_string()));
        }

        Ok(Self {
            components,
            prerelease,
        })
    }

    /// Numeric components as declared
    pub fn components(&self) -> &[u64] {
        &self.components
    }

    /// Major component
    pub fn major(&self) -> u64 {
        self.components[0]
    }

    /// Prerelease label, if any
    pub fn prerelease(&self) -> Option<&str> {
        self.prerelease.as_ref().map(|p| p.as_str())
    }

    /// Whether this version carries a prerelease label
    pub fn is_prerelease(&self) -> bool {
        self.prerelease.is_some()
    }

    /// Components with trailing zeros removed, used for equality and hashing
    fn significant(&self) -> &[u64] {
        let end = self
            .components
            .iter()
            .rposition(|c| *c != 0)
            .map_or(0, |i| i + 1);
        &self.components[..end]
    }

    /// Compare two versions
    pub fn compare(&self, other: &Version) -> Ordering {
        let len = self.components.len().max(other.components.len());
        for i in 0..len {
            let a = self.components.get(i).copied().unwrap_or(0);
            let b = other.components.get(i).copied().unwrap_or(0);
            match a.cmp(&b) {
                Ordering::Equal => {}
                ord => return ord,
            }
        }

        match (&self.prerelease, &other.prerelease) {
            (None, None) => Ordering::Equal,
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (Some(a), Some(b)) => a.cmp(b),
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for c in &self.components {
            if !first {
                write!(f, ".")?;
            }
            write!(f, "{}", c)?;
            first = false;
        }
        if let Some(ref pre) = self.prerelease {
            write!(f, "-{}", pre)?;
        }
        Ok(())
    }
}

impl FromStr for Version {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.compare(other) == Ordering::Equal
    }
}

impl Eq for Version {}

impl Hash for Version {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.significant().hash(state);
        self.prerelease().hash(state);
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        self.compare(other)
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Serialize for Version {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Version::parse(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple() {
        let v = Version::parse("1.2.3").unwrap();
        assert_eq!(v.components(), &[1, 2, 3]);
        assert_eq!(v.prerelease(), None);
    }

    #[test]
    fn test_parse_leading_v_and_four_parts() {
        let v = Version::parse("v10.0.19041.1").unwrap();
        assert_eq!(v.components(), &[10, 0, 19041, 1]);
        assert_eq!(v.major(), 10);
    }

    #[test]
    fn test_parse_prerelease_and_build() {
        let v = Version::parse("2.0.0-beta.2+build7").unwrap();
        assert_eq!(v.components(), &[2, 0, 0]);
        assert_eq!(v.prerelease(), Some("beta.2"));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(Version::parse("").is_err());
        assert!(Version::parse("v").is_err());
        assert!(Version::parse("1..2").is_err());
        assert!(Version::parse("one.two").is_err());
        assert!(Version::parse("1.0-").is_err());
    }

    #[test]
    fn test_missing_components_are_zero() {
        let a = Version::parse("1.2").unwrap();
        let b = Version::parse("1.2.0.0").unwrap();
        assert_eq!(a, b);
        assert!(Version::parse("1.2.0.1").unwrap() > a);
    }

    #[test]
    fn test_numeric_not_lexicographic() {
        let a = Version::parse("1.10").unwrap();
        let b = Version::parse("1.9").unwrap();
        assert!(a > b);
    }

    #[test]
    fn test_prerelease_sorts_before_release() {
        let pre = Version::parse("2.0-rc.1").unwrap();
        let rel = Version::parse("2.0").unwrap();
        assert!(pre < rel);
        assert!(Version::parse("2.0-alpha").unwrap() < pre);
        assert!(Version::parse("1.9").unwrap() < pre);
    }

    #[test]
    fn test_display_roundtrips_input_shape() {
        assert_eq!(Version::parse("v1.5").unwrap().to_string(), "1.5");
        assert_eq!(
            Version::parse("3.1.4-rc.1").unwrap().to_string(),
            "3.1.4-rc.1"
        );
    }

    #[test]
    fn test_hash_consistent_with_eq() {
        use std::collections::HashSet;
        let mut set = HashSet::new();
        set.insert(Version::parse("1.0").unwrap());
        assert!(set.contains(&Version::parse("1.0.0").unwrap()));
    }
}
