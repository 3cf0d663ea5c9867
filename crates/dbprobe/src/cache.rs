//! Disk-backed, age-bounded result cache
//!
//! One JSON file per cache key holds the exact [`ResultSet`] a statement
//! produced. The file modification time is the "as of" timestamp; entries
//! older than the caller's TTL are misses but are never deleted. Every
//! failure here is reported to the caller as a miss or logged and ignored.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::types::ResultSet;

const CACHE_EXTENSION: &str = "json";

/// Deterministic, filesystem-safe cache key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    /// Build the key for one statement on one connection.
    ///
    /// Descriptor-style connection strings (`(DESCRIPTION=...)`) are replaced
    /// by their SHA-256 digest; plain database names are used verbatim.
    pub fn new(host: &str, connection_string: &str, statement: &str) -> Self {
        let cstr = if connection_string.starts_with('(') {
            let digest = Sha256::digest(connection_string.as_bytes());
            format!("dsn_{digest:x}")
        } else {
            connection_string.to_string()
        };
        Self(format!("{host}_{cstr}_{statement}"))
    }

    /// The key as a string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A fresh cache entry
#[derive(Debug, Clone, PartialEq)]
pub struct CacheHit {
    /// File modification time, whole seconds since the epoch
    pub as_of: u64,
    /// The stored row-groups
    pub data: ResultSet,
}

/// Cache directory handle
#[derive(Debug, Clone)]
pub struct CacheStore {
    dir: PathBuf,
}

impl CacheStore {
    /// Open (and create if needed) a cache directory
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .map_err(|e| Error::cache(format!("cannot create {}: {e}", dir.display())))?;
        Ok(Self { dir })
    }

    /// The cache directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &CacheKey) -> PathBuf {
        self.dir.join(format!("{}.{CACHE_EXTENSION}", key.as_str()))
    }

    /// Look up `key`, treating entries aged `max_age` or more as a miss
    pub fn lookup(&self, key: &CacheKey, max_age: Duration) -> Option<CacheHit> {
        match self.try_lookup(key, max_age, SystemTime::now()) {
            Ok(hit) => hit,
            Err(e) => {
                warn!("Ignoring unreadable cache entry {}: {}", key, e);
                None
            }
        }
    }

    fn try_lookup(
        &self,
        key: &CacheKey,
        max_age: Duration,
        now: SystemTime,
    ) -> Result<Option<CacheHit>> {
        let path = self.path_for(key);
        let metadata = match fs::metadata(&path) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let as_of = metadata
            .modified()?
            .duration_since(UNIX_EPOCH)
            .map_err(|e| Error::cache(e.to_string()))?
            .as_secs();
        let now = now
            .duration_since(UNIX_EPOCH)
            .map_err(|e| Error::cache(e.to_string()))?
            .as_secs();

        if now.saturating_sub(as_of) >= max_age.as_secs() {
            debug!("Cache entry {} is stale", key);
            return Ok(None);
        }

        let data: ResultSet = serde_json::from_slice(&fs::read(&path)?)?;
        Ok(Some(CacheHit { as_of, data }))
    }

    /// Replace the entry for `key` with `data`
    pub fn store(&self, key: &CacheKey, data: &ResultSet) -> Result<()> {
        let path = self.path_for(key);
        let tmp = path.with_extension(format!("{CACHE_EXTENSION}.tmp"));

        let payload = serde_json::to_vec(data)?;
        let mut file = fs::File::create(&tmp)?;
        file.write_all(&payload)?;
        file.sync_all()?;
        fs::rename(&tmp, &path)?;

        debug!("Wrote cache entry {}", key);
        Ok(())
    }
}
