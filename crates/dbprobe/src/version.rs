//! Comparable engine versions
//!
//! Versions are dot-separated integer sequences compared component-wise,
//! so `9.6 < 10` and `121 < 180` hold where string comparison would fail.

use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// A comparable engine or statement-file version (`16.2`, `121`, `15.0`)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version(Vec<u64>);

impl Version {
    /// Create a version from its components
    pub fn new(components: impl Into<Vec<u64>>) -> Self {
        Self(components.into())
    }

    /// Version components, most significant first
    pub fn components(&self) -> &[u64] {
        &self.0
    }

    /// Whether `s` has the shape of a dotted integer version
    pub fn is_version_string(s: &str) -> bool {
        !s.is_empty()
            && s.split('.')
                .all(|part| !part.is_empty() && part.bytes().all(|b| b.is_ascii_digit()))
    }

    /// Concatenate the first two components of a dotted version
    /// (`10.3.38` → `103`), as used by mysql and oracle statement files
    pub fn major_minor_concat(s: &str, max_digits: Option<usize>) -> Result<Self> {
        let mut digits: String = s.split('.').take(2).collect();
        if let Some(max) = max_digits {
            digits.truncate(max);
        }
        digits.parse()
    }
}

impl FromStr for Version {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if !Self::is_version_string(s) {
            return Err(Error::version(format!("invalid version string '{s}'")));
        }
        s.split('.')
            .map(|part| {
                part.parse::<u64>()
                    .map_err(|e| Error::version(format!("invalid version component '{part}': {e}")))
            })
            .collect::<Result<Vec<_>>>()
            .map(Self)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(u64::to_string).collect();
        f.write_str(&parts.join("."))
    }
}
