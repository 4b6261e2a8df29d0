//! Changelog configuration via `changelog.toml`
//!
//! On first open, a default `changelog.toml` is created in the changelog
//! root. Edit the file and reopen to change settings. The purge delay and
//! change-number computation can also be changed at runtime through the
//! registry.

use changelog_core::{ChangelogError, ChangelogResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Config file name placed in the changelog root directory.
pub const CONFIG_FILE_NAME: &str = "changelog.toml";

/// Default retention: three days.
pub const DEFAULT_PURGE_DELAY_SECS: u64 = 3 * 24 * 60 * 60;

/// How appends reach durable storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DurabilityMode {
    /// Appends are flushed to the OS; fsync happens on explicit sync and close.
    Standard,
    /// Every replica append and every index append is fsynced.
    Always,
}

impl DurabilityMode {
    /// True when each append must be followed by an fsync
    pub fn sync_on_append(&self) -> bool {
        matches!(self, DurabilityMode::Always)
    }
}

/// Changelog configuration loaded from `changelog.toml`.
///
/// # Example
///
/// ```toml
/// durability = "standard"
/// purge_delay_secs = 259200
/// purge_interval_ms = 1000
/// compute_change_number = true
/// indexer_wake_interval_ms = 1000
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangelogConfig {
    /// Durability mode: `"standard"` or `"always"`.
    #[serde(default = "default_durability_str")]
    pub durability: String,
    /// Retention period in seconds. `0` disables purging.
    #[serde(default = "default_purge_delay_secs")]
    pub purge_delay_secs: u64,
    /// Longest sleep between two purge passes, in milliseconds.
    #[serde(default = "default_interval_ms")]
    pub purge_interval_ms: u64,
    /// Whether updates get change numbers.
    #[serde(default = "default_compute_change_number")]
    pub compute_change_number: bool,
    /// Fallback wake period of the indexer worker, in milliseconds.
    #[serde(default = "default_interval_ms")]
    pub indexer_wake_interval_ms: u64,
}

fn default_durability_str() -> String {
    "standard".to_string()
}

fn default_purge_delay_secs() -> u64 {
    DEFAULT_PURGE_DELAY_SECS
}

fn default_interval_ms() -> u64 {
    1000
}

fn default_compute_change_number() -> bool {
    true
}

impl Default for ChangelogConfig {
    fn default() -> Self {
        Self {
            durability: default_durability_str(),
            purge_delay_secs: default_purge_delay_secs(),
            purge_interval_ms: default_interval_ms(),
            compute_change_number: default_compute_change_number(),
            indexer_wake_interval_ms: default_interval_ms(),
        }
    }
}

impl ChangelogConfig {
    /// Parse the durability string into a `DurabilityMode`.
    ///
    /// # Errors
    ///
    /// Returns an error if the string is not `"standard"` or `"always"`.
    pub fn durability_mode(&self) -> ChangelogResult<DurabilityMode> {
        match self.durability.as_str() {
            "standard" => Ok(DurabilityMode::Standard),
            "always" => Ok(DurabilityMode::Always),
            other => Err(ChangelogError::parse(format!(
                "Invalid durability mode '{}' in changelog.toml. Expected \"standard\" or \"always\".",
                other
            ))),
        }
    }

    /// Retention period; `Duration::ZERO` disables purging
    pub fn purge_delay(&self) -> Duration {
        Duration::from_secs(self.purge_delay_secs)
    }

    /// Longest sleep between two purge passes
    pub fn purge_interval(&self) -> Duration {
        Duration::from_millis(self.purge_interval_ms)
    }

    /// Fallback wake period of the indexer worker
    pub fn indexer_wake_interval(&self) -> Duration {
        Duration::from_millis(self.indexer_wake_interval_ms)
    }

    /// Check every field.
    ///
    /// # Errors
    ///
    /// Returns a parse error for an unknown durability mode or a zero interval.
    pub fn validate(&self) -> ChangelogResult<()> {
        self.durability_mode()?;
        if self.purge_interval_ms == 0 {
            return Err(ChangelogError::parse(
                "purge_interval_ms must be greater than zero",
            ));
        }
        if self.indexer_wake_interval_ms == 0 {
            return Err(ChangelogError::parse(
                "indexer_wake_interval_ms must be greater than zero",
            ));
        }
        Ok(())
    }

    /// Returns the default config file content with comments.
    pub fn default_toml() -> &'static str {
        r#"# Replication changelog configuration
#
# Durability mode: "standard" (default) or "always"
#   "standard" = appends reach the OS, fsync on explicit sync and on close
#   "always"   = fsync after every append
durability = "standard"

# Retention period in seconds (default: 3 days). 0 disables purging.
purge_delay_secs = 259200

# Longest sleep between two purge passes, in milliseconds.
purge_interval_ms = 1000

# Assign change numbers to replicated updates (default: true).
compute_change_number = true

# Fallback wake period of the change number indexer, in milliseconds.
indexer_wake_interval_ms = 1000
"#
    }

    /// Read and parse config from a file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: &Path) -> ChangelogResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ChangelogError::storage(format!(
                "Failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        let config: ChangelogConfig = toml::from_str(&content).map_err(|e| {
            ChangelogError::parse(format!(
                "Failed to parse config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Write the default config file if it does not already exist.
    ///
    /// Returns `Ok(())` whether the file was created or already existed.
    pub fn write_default_if_missing(path: &Path) -> ChangelogResult<()> {
        if !path.exists() {
            std::fs::write(path, Self::default_toml()).map_err(|e| {
                ChangelogError::storage(format!(
                    "Failed to write default config file '{}': {}",
                    path.display(),
                    e
                ))
            })?;
        }
        Ok(())
    }

    /// Serialize this config to TOML and write it to the given path.
    pub fn write_to_file(&self, path: &Path) -> ChangelogResult<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ChangelogError::storage(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, content).map_err(|e| {
            ChangelogError::storage(format!(
                "Failed to write config file '{}': {}",
                path.display(),
                e
            ))
        })
    }
}
