//! Version utilities.
//!
//! Manifests declare their own version and the minimum host version they
//! require; both use plain `major.minor.patch` triplets.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Version information.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Version {
    /// Major version.
    pub major: u32,

    /// Minor version.
    pub minor: u32,

    /// Patch version.
    pub patch: u32,
}

impl Version {
    /// Create a new version.
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Check if this version is compatible with another version.
    ///
    /// Compatibility is defined as having the same major version.
    pub fn is_compatible_with(&self, other: &Self) -> bool {
        self.major == other.major
    }

    /// Returns true when a host at `self` can run something requiring `minimum`.
    pub fn satisfies(&self, minimum: &Self) -> bool {
        self.is_compatible_with(minimum) && self >= minimum
    }
}

/// Version of this host, taken from the crate version.
pub fn host_version() -> Version {
    Version::new(
        env!("CARGO_PKG_VERSION_MAJOR").parse().unwrap_or(0),
        env!("CARGO_PKG_VERSION_MINOR").parse().unwrap_or(0),
        env!("CARGO_PKG_VERSION_PATCH").parse().unwrap_or(0),
    )
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for Version {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split('.').collect();
        if parts.len() != 3 {
            return Err(VersionError(s.to_string()));
        }

        let mut numbers = [0u32; 3];
        for (slot, part) in numbers.iter_mut().zip(&parts) {
            if part.is_empty() || !part.chars().all(|c| c.is_ascii_digit()) {
                return Err(VersionError(s.to_string()));
            }
            *slot = part.parse().map_err(|_| VersionError(s.to_string()))?;
        }

        Ok(Self::new(numbers[0], numbers[1], numbers[2]))
    }
}

impl TryFrom<String> for Version {
    type Error = VersionError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Version> for String {
    fn from(version: Version) -> Self {
        version.to_string()
    }
}

/// A version string that is not a `major.minor.patch` triplet.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid version {0:?} (expected major.minor.patch)")]
pub struct VersionError(pub String);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        let version: Version = "1.2.3".parse().unwrap();
        assert_eq!(version, Version::new(1, 2, 3));
        assert_eq!(version.to_string(), "1.2.3");
    }

    #[test]
    fn test_rejects_malformed() {
        assert!("1.2".parse::<Version>().is_err());
        assert!("v1.2.3".parse::<Version>().is_err());
        assert!("1..3".parse::<Version>().is_err());
        assert!("1.2.3.4".parse::<Version>().is_err());
    }

    #[test]
    fn test_satisfies() {
        let host = Version::new(1, 4, 0);
        assert!(host.satisfies(&Version::new(1, 0, 0)));
        assert!(host.satisfies(&Version::new(1, 4, 0)));
        assert!(!host.satisfies(&Version::new(1, 5, 0)));
        assert!(!host.satisfies(&Version::new(0, 9, 0)));
    }
}
