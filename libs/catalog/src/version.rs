//! Semantic version keys for catalog maps.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::CatalogError;

/// A version string ordered numerically (`1.2.0 < 1.10.0 < 2.0.0`).
///
/// The original spelling is kept for display and serialization so that
/// catalog keys round-trip unchanged. Equality and ordering only look at
/// the parsed number, so `1.8` and `1.8.0` are the same key.
#[derive(Debug, Clone)]
pub struct Version {
    parsed: semver::Version,
    raw: String,
}

impl Version {
    /// Parse a version, accepting a leading `v` and a missing patch number.
    pub fn parse(s: &str) -> Result<Self, CatalogError> {
        let trimmed = s.trim();
        let bare = trimmed.strip_prefix('v').unwrap_or(trimmed);
        if bare.is_empty() {
            return Err(CatalogError::InvalidVersion(s.to_string()));
        }

        let parsed = match semver::Version::parse(bare) {
            Ok(v) => v,
            Err(_) if bare.split('.').count() == 2 => semver::Version::parse(&format!("{bare}.0"))
                .map_err(|_| CatalogError::InvalidVersion(s.to_string()))?,
            Err(_) => return Err(CatalogError::InvalidVersion(s.to_string())),
        };

        Ok(Self {
            parsed,
            raw: trimmed.to_string(),
        })
    }

    /// The version as originally written.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Numeric comparison against a plain `major.minor.patch` triple.
    pub fn is_older_than(&self, major: u64, minor: u64, patch: u64) -> bool {
        (self.parsed.major, self.parsed.minor, self.parsed.patch) < (major, minor, patch)
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.parsed == other.parsed
    }
}

impl Eq for Version {}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        self.parsed.cmp(&other.parsed)
    }
}

impl Hash for Version {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.parsed.hash(state);
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl FromStr for Version {
    type Err = CatalogError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for Version {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.raw)
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}
