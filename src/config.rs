//! TOML configuration parsing and validation.
//!
//! All settings come from one TOML file. Validation happens at load time so
//! a bad config is a pre-flight error, surfaced before any source is
//! contacted.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::SyncError;
use crate::failure::FailurePolicy;
use crate::retry::RetryPolicy;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub lease: LeaseConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub sources: SourcesConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SyncConfig {
    /// Items (and failures) per yielded batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Default policy: record per-item failures and keep going.
    #[serde(default = "default_true")]
    pub continue_on_failure: bool,
    /// Lookback buffer applied to every source that does not override it.
    #[serde(default = "default_lookback_secs")]
    pub default_lookback_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            continue_on_failure: true,
            default_lookback_secs: default_lookback_secs(),
        }
    }
}

impl SyncConfig {
    pub fn failure_policy(&self) -> FailurePolicy {
        FailurePolicy {
            continue_on_failure: self.continue_on_failure,
        }
    }
}

fn default_batch_size() -> usize {
    64
}
fn default_true() -> bool {
    true
}
fn default_lookback_secs() -> u64 {
    // One day, matching sources whose record visibility can lag by hours.
    24 * 60 * 60
}

#[derive(Debug, Deserialize, Clone)]
pub struct LeaseConfig {
    #[serde(default = "default_lease_ttl_secs")]
    pub ttl_secs: u64,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_lease_ttl_secs(),
        }
    }
}

impl LeaseConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

fn default_lease_ttl_secs() -> u64 {
    120
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            multiplier: default_multiplier(),
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            multiplier: self.multiplier,
        }
    }
}

fn default_max_retries() -> u32 {
    5
}
fn default_base_delay_ms() -> u64 {
    500
}
fn default_multiplier() -> u32 {
    2
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct SourcesConfig {
    #[serde(default)]
    pub filesystem: BTreeMap<String, FsSourceConfig>,
    #[serde(default)]
    pub feed: BTreeMap<String, FeedSourceConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct FsSourceConfig {
    pub root: PathBuf,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
    /// Never index files modified before this date (YYYY-MM-DD).
    #[serde(default)]
    pub floor_date: Option<String>,
    /// Per-source lookback override, in seconds.
    #[serde(default)]
    pub lookback_secs: Option<u64>,
}

fn default_include_globs() -> Vec<String> {
    vec!["**/*.md".to_string(), "**/*.txt".to_string()]
}

#[derive(Debug, Deserialize, Clone)]
pub struct FeedSourceConfig {
    /// Base URL of the feed API, without a trailing slash.
    pub base_url: String,
    /// Workspaces to sync, each an independently-paginated sub-resource.
    pub workspaces: Vec<String>,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    /// Never fetch entries updated before this date (YYYY-MM-DD).
    #[serde(default)]
    pub floor_date: Option<String>,
    #[serde(default)]
    pub lookback_secs: Option<u64>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Whether to enrich entries from the (eventually-consistent) detail
    /// endpoint.
    #[serde(default)]
    pub fetch_details: bool,
}

fn default_page_size() -> usize {
    100
}
fn default_timeout_secs() -> u64 {
    30
}

pub fn load_config(path: &Path) -> Result<Config, SyncError> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        SyncError::Configuration(format!("failed to read config file {}: {e}", path.display()))
    })?;

    let config: Config = toml::from_str(&content)
        .map_err(|e| SyncError::Configuration(format!("failed to parse config file: {e}")))?;

    if config.sync.batch_size == 0 {
        return Err(SyncError::Configuration("sync.batch_size must be > 0".into()));
    }
    if config.lease.ttl_secs == 0 {
        return Err(SyncError::Configuration("lease.ttl_secs must be > 0".into()));
    }
    if config.retry.max_attempts == 0 {
        return Err(SyncError::Configuration(
            "retry.max_attempts must be > 0".into(),
        ));
    }

    for (name, feed) in &config.sources.feed {
        if feed.workspaces.is_empty() {
            return Err(SyncError::Configuration(format!(
                "feed source '{name}' must list at least one workspace"
            )));
        }
        if feed.page_size == 0 {
            return Err(SyncError::Configuration(format!(
                "feed source '{name}': page_size must be > 0"
            )));
        }
        if feed.base_url.ends_with('/') {
            return Err(SyncError::Configuration(format!(
                "feed source '{name}': base_url must not end with '/'"
            )));
        }
    }

    Ok(config)
}
