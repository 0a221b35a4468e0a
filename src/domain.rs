use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::LoadAtomsError;

/// Version of this package, compared against a dataset's minimum version.
pub const PACKAGE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Case-sensitive catalog identifier, e.g. `QM7` or `C-GAP-17`.
///
/// Doubles as the cache directory name, so it is restricted to characters
/// that are safe as a single path component.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DatasetId(String);

impl DatasetId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DatasetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for DatasetId {
    type Err = LoadAtomsError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        let is_valid = !trimmed.is_empty()
            && trimmed.len() <= 128
            && !trimmed.starts_with('.')
            && trimmed
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.'));
        if !is_valid {
            return Err(LoadAtomsError::InvalidIdentifier(value.to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }
}

/// Dotted numeric version. Missing trailing components compare as zero, so
/// `0.2` == `0.2.0`. Pre-release suffixes (`0.3.0-beta`) are ignored.
#[derive(Debug, Clone, Eq)]
pub struct Version {
    parts: Vec<u64>,
    raw: String,
}

impl Version {
    pub fn current() -> Self {
        // CARGO_PKG_VERSION is always a valid semver triple
        PACKAGE_VERSION
            .parse()
            .unwrap_or_else(|_| Version {
                parts: vec![0],
                raw: PACKAGE_VERSION.to_string(),
            })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    fn component(&self, index: usize) -> u64 {
        self.parts.get(index).copied().unwrap_or(0)
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.parts.len().max(other.parts.len());
        (0..len)
            .map(|i| self.component(i).cmp(&other.component(i)))
            .find(|ord| *ord != Ordering::Equal)
            .unwrap_or(Ordering::Equal)
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.raw)
    }
}

impl FromStr for Version {
    type Err = LoadAtomsError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let raw = value.trim();
        let core = raw
            .trim_start_matches('v')
            .split(['-', '+'])
            .next()
            .unwrap_or_default();
        let parts = core
            .split('.')
            .map(|part| part.parse::<u64>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| LoadAtomsError::Schema {
                source_name: "version".to_string(),
                message: format!("invalid version string: {value}"),
            })?;
        if parts.is_empty() {
            return Err(LoadAtomsError::Schema {
                source_name: "version".to_string(),
                message: format!("invalid version string: {value}"),
            });
        }
        Ok(Self {
            parts,
            raw: raw.to_string(),
        })
    }
}
