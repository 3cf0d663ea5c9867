//! Version-aware statement file resolution
//!
//! A statement directory holds files named `<statement>_<version>.sql` and
//! optionally an unversioned `<statement>.sql`. For a target engine version
//! the resolver picks the file with the largest version not exceeding the
//! target, falling back to the unversioned file.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{Error, Result};
use crate::version::Version;

const SQL_EXTENSION: &str = ".sql";

/// Resolves statement names to SQL text for one backend
#[derive(Debug, Clone)]
pub struct StatementResolver {
    dir: PathBuf,
}

impl StatementResolver {
    /// Create a resolver over a statement directory
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// The directory statements are read from
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Versioned files available for `statement`, unordered
    pub fn versions(&self, statement: &str) -> Result<Vec<(Version, PathBuf)>> {
        let prefix = format!("{statement}_");
        let mut versions = Vec::new();

        for entry in fs::read_dir(&self.dir)? {
            let name = entry?.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            let candidate = name
                .strip_prefix(&prefix)
                .and_then(|rest| rest.strip_suffix(SQL_EXTENSION));
            if let Some(version) = candidate.and_then(|v| v.parse::<Version>().ok()) {
                versions.push((version, self.dir.join(name)));
            }
        }
        Ok(versions)
    }

    /// Path of the file to use for `statement` at engine version `target`
    pub fn locate(&self, statement: &str, target: &Version) -> Result<PathBuf> {
        let best = self
            .versions(statement)?
            .into_iter()
            .filter(|(v, _)| v <= target)
            .max_by(|(a, _), (b, _)| a.cmp(b));

        if let Some((_, path)) = best {
            return Ok(path);
        }

        debug!(
            "No versioned file for statement {} at version {}",
            statement, target
        );
        let fallback = self.dir.join(format!("{statement}{SQL_EXTENSION}"));
        if fallback.is_file() {
            Ok(fallback)
        } else {
            Err(Error::statement_not_found(statement, target))
        }
    }

    /// SQL text for `statement` at engine version `target`, with trailing
    /// newlines and statement terminators removed
    pub fn resolve(&self, statement: &str, target: &Version) -> Result<String> {
        let path = self.locate(statement, target)?;
        debug!("Reading statement {} from {}", statement, path.display());
        let text = fs::read_to_string(&path)?;
        Ok(strip_terminator(&text).to_string())
    }
}

fn strip_terminator(sql: &str) -> &str {
    sql.trim_end_matches('\n').trim_end_matches(';')
}
