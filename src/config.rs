use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{TlError, TlResult};
use crate::model::Partition;

pub const DEFAULT_UNIVERSE_MULTIPLIER: u32 = 12_000;
pub const DEFAULT_PAGE_SIZE: u32 = 1_000;
pub const DEFAULT_BUCKET_WIDTH: u64 = 1_000;
pub const DEFAULT_MAX_RECENT_PAGES: u32 = 10;
pub const DEFAULT_PAUSE_FACTOR: f64 = 5.0;
pub const DEFAULT_START_LAG_THRESHOLD_MS: u32 = 1;
const DEFAULT_RECENT_OVERLAP_MS: i64 = 15 * 60 * 1_000;
const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// Built-in multipliers for partitions whose scripts pack more meaning per
/// character than the 5-characters-per-word convention assumes.
#[must_use]
pub fn default_multiplier(partition: &str) -> u32 {
    match partition {
        "lang_ko" => 24_000,
        "lang_zh" | "lang_zh-tw" | "new_lang_zh-tw" | "lang_ja" => 60_000,
        _ => DEFAULT_UNIVERSE_MULTIPLIER,
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub db_path: Option<PathBuf>,
    pub api: ApiConfig,
    pub sync: SyncConfig,
    pub metrics: MetricsConfig,
    /// Partition name to universe multiplier, overriding [`default_multiplier`].
    pub partitions: BTreeMap<String, u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub base_url: String,
    /// `user:password` pairs, rotated per request.
    pub credentials: Vec<String>,
    pub timeout_ms: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://data.typeracer.com/api/v1".to_owned(),
            credentials: Vec::new(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
        }
    }
}

impl ApiConfig {
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub page_size: u32,
    pub bucket_width: u64,
    /// How far before `last_synced_at` the recent scan starts, so races that
    /// completed while the previous sync was running are not missed.
    pub recent_overlap_ms: i64,
    /// Upper bound on listing pages per recent scan; older races are left to
    /// the historical buckets.
    pub max_recent_pages: u32,
    pub compress_logs: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            bucket_width: DEFAULT_BUCKET_WIDTH,
            recent_overlap_ms: DEFAULT_RECENT_OVERLAP_MS,
            max_recent_pages: DEFAULT_MAX_RECENT_PAGES,
            compress_logs: true,
        }
    }
}

/// Tunables of the metrics engine. They change magnitudes, never correctness.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// A delay at or above `average * pause_factor` counts as a pause.
    pub pause_factor: f64,
    /// Delays at or below this directly after the first keystroke are treated
    /// as pre-typed and share the reaction delay.
    pub start_lag_threshold_ms: u32,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            pause_factor: DEFAULT_PAUSE_FACTOR,
            start_lag_threshold_ms: DEFAULT_START_LAG_THRESHOLD_MS,
        }
    }
}

impl Config {
    /// Load configuration from `path` (if given) and apply environment
    /// overrides on top.
    pub fn load(path: Option<&Path>) -> TlResult<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> TlResult<Self> {
        let contents = fs::read_to_string(path).map_err(|error| {
            TlError::Config(format!("cannot read {}: {error}", path.display()))
        })?;
        let config: Self = serde_json::from_str(&contents)?;
        Ok(config)
    }

    /// Overrides are read through `lookup` so tests need not touch the process
    /// environment.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> TlResult<()> {
        if let Some(path) = lookup("TYPELEDGER_DB_PATH") {
            self.db_path = Some(PathBuf::from(path));
        }
        if let Some(url) = lookup("TYPELEDGER_API_BASE_URL") {
            self.api.base_url = url;
        }
        if let Some(credentials) = lookup("TYPELEDGER_API_CREDENTIALS") {
            self.api.credentials = credentials
                .split(',')
                .map(str::trim)
                .filter(|entry| !entry.is_empty())
                .map(str::to_owned)
                .collect();
        }
        if let Some(page_size) = lookup("TYPELEDGER_PAGE_SIZE") {
            self.sync.page_size = page_size.parse().map_err(|_| {
                TlError::Config(format!("TYPELEDGER_PAGE_SIZE is not a number: {page_size}"))
            })?;
        }
        if let Some(factor) = lookup("TYPELEDGER_PAUSE_FACTOR") {
            self.metrics.pause_factor = factor.parse().map_err(|_| {
                TlError::Config(format!("TYPELEDGER_PAUSE_FACTOR is not a number: {factor}"))
            })?;
        }
        Ok(())
    }

    pub fn validate(&self) -> TlResult<()> {
        if self.sync.page_size == 0 {
            return Err(TlError::Config("sync.page_size must be positive".to_owned()));
        }
        if self.sync.max_recent_pages == 0 {
            return Err(TlError::Config(
                "sync.max_recent_pages must be positive".to_owned(),
            ));
        }
        if self.sync.bucket_width == 0 {
            return Err(TlError::Config(
                "sync.bucket_width must be positive".to_owned(),
            ));
        }
        if !(self.metrics.pause_factor.is_finite() && self.metrics.pause_factor > 1.0) {
            return Err(TlError::Config(format!(
                "metrics.pause_factor must be greater than 1, got {}",
                self.metrics.pause_factor
            )));
        }
        if let Some((name, _)) = self.partitions.iter().find(|(_, value)| **value == 0) {
            return Err(TlError::Config(format!(
                "partition `{name}` has a zero multiplier"
            )));
        }
        Ok(())
    }

    /// Resolve a partition name into a [`Partition`] carrying its multiplier.
    #[must_use]
    pub fn partition(&self, name: &str) -> Partition {
        let multiplier = self
            .partitions
            .get(name)
            .copied()
            .unwrap_or_else(|| default_multiplier(name));
        Partition::new(name, multiplier)
    }

    #[must_use]
    pub fn db_path_or_default(&self) -> PathBuf {
        self.db_path
            .clone()
            .unwrap_or_else(|| PathBuf::from("typeledger.sqlite3"))
    }

    /// Lock files live next to the store so every process using it sees them.
    #[must_use]
    pub fn lock_dir(&self) -> PathBuf {
        let db_path = self.db_path_or_default();
        match db_path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.join("locks"),
            _ => PathBuf::from("locks"),
        }
    }
}
