//! Configuration types shared across crates.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// File name of the on-disk LRU index inside the workspace.
pub const CACHE_DB_NAME: &str = "cachedb";

/// File name of the exclusive database lock inside the workspace.
pub const CACHE_DB_LOCK_NAME: &str = "lock_cachedb";

/// File name of the command FIFO inside the workspace.
pub const COMMAND_PIPE_NAME: &str = "cache.cmdpipe";

/// Local cache configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Directory holding the content-addressed object files.
    pub cache_dir: PathBuf,
    /// Directory for the index database, lock file, and pipes.
    /// Defaults to `cache_dir` when not set.
    #[serde(default)]
    pub workspace_dir: Option<PathBuf>,
}

impl CacheConfig {
    /// Create a cache configuration rooted at a single directory.
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            workspace_dir: None,
        }
    }

    /// The effective workspace directory.
    pub fn workspace(&self) -> &Path {
        self.workspace_dir.as_deref().unwrap_or(&self.cache_dir)
    }

    /// Path of the on-disk LRU index.
    pub fn cachedb_path(&self) -> PathBuf {
        self.workspace().join(CACHE_DB_NAME)
    }

    /// Path of the exclusive database lock file.
    pub fn lock_path(&self) -> PathBuf {
        self.workspace().join(CACHE_DB_LOCK_NAME)
    }

    /// Path of the command FIFO.
    pub fn command_pipe_path(&self) -> PathBuf {
        self.workspace().join(COMMAND_PIPE_NAME)
    }
}

/// Quota manager configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QuotaConfig {
    /// Soft limit in bytes; cleanup starts when reached.
    pub limit: u64,
    /// Cleanup evicts until this many bytes remain.
    #[serde(default)]
    pub cleanup_threshold: Option<u64>,
    /// Hand file unlinks of a cleanup run to a detached process.
    #[serde(default)]
    pub async_delete: bool,
    /// Fraction of the limit that pinned objects may occupy, in percent.
    #[serde(default = "default_pinned_fraction_pct")]
    pub pinned_fraction_pct: u8,
}

fn default_pinned_fraction_pct() -> u8 {
    50
}

impl QuotaConfig {
    /// Create a quota configuration with the default cleanup threshold
    /// (half the limit).
    pub fn new(limit: u64) -> Self {
        Self {
            limit,
            cleanup_threshold: None,
            async_delete: false,
            pinned_fraction_pct: default_pinned_fraction_pct(),
        }
    }

    /// The effective cleanup threshold.
    pub fn threshold(&self) -> u64 {
        self.cleanup_threshold.unwrap_or(self.limit / 2)
    }

    /// The byte budget pinned objects may occupy.
    pub fn pinned_limit(&self) -> u64 {
        (u128::from(self.limit) * u128::from(self.pinned_fraction_pct) / 100) as u64
    }

    /// Validate quota configuration invariants.
    pub fn validate(&self) -> Result<(), String> {
        if self.limit == 0 {
            return Err("quota limit must be non-zero".to_string());
        }
        if self.threshold() > self.limit {
            return Err(format!(
                "cleanup threshold {} exceeds limit {}",
                self.threshold(),
                self.limit
            ));
        }
        if self.pinned_fraction_pct == 0 || self.pinned_fraction_pct > 100 {
            return Err(format!(
                "pinned fraction {}% out of range (1..=100)",
                self.pinned_fraction_pct
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workspace_defaults_to_cache_dir() {
        let config = CacheConfig::new("/var/cache/cairn");
        assert_eq!(config.workspace(), Path::new("/var/cache/cairn"));
        assert_eq!(
            config.command_pipe_path(),
            Path::new("/var/cache/cairn/cache.cmdpipe")
        );

        let split = CacheConfig {
            cache_dir: PathBuf::from("/var/cache/cairn"),
            workspace_dir: Some(PathBuf::from("/run/cairn")),
        };
        assert_eq!(split.cachedb_path(), Path::new("/run/cairn/cachedb"));
    }

    #[test]
    fn test_quota_defaults() {
        let config = QuotaConfig::new(1000);
        assert_eq!(config.threshold(), 500);
        assert_eq!(config.pinned_limit(), 500);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_pinned_limit_keeps_precision_for_small_limits() {
        // Limits below 100 bytes must not truncate the budget to zero.
        assert_eq!(QuotaConfig::new(10).pinned_limit(), 5);
        assert_eq!(QuotaConfig::new(3).pinned_limit(), 1);

        let mut config = QuotaConfig::new(u64::MAX);
        config.pinned_fraction_pct = 100;
        assert_eq!(config.pinned_limit(), u64::MAX);
    }

    #[test]
    fn test_quota_validate_rejects_bad_threshold() {
        let mut config = QuotaConfig::new(100);
        config.cleanup_threshold = Some(200);
        assert!(config.validate().is_err());

        config = QuotaConfig::new(0);
        assert!(config.validate().is_err());
    }
}
