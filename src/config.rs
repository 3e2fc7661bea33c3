// src/config.rs
//! Runtime configuration loaded from TOML, with env overrides for the hot knobs.
//!
//! Lookup order:
//! 1) `$GEO_AGG_CONFIG_PATH`
//! 2) `config/aggregator.toml`
//! 3) built-in defaults
//!
//! Every section and field is optional; missing values fall back to defaults.

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const ENV_CONFIG_PATH: &str = "GEO_AGG_CONFIG_PATH";
pub const DEFAULT_CONFIG_PATH: &str = "config/aggregator.toml";

pub const ENV_MAX_TOTAL_POINTS: &str = "GEO_AGG_MAX_TOTAL_POINTS";
pub const ENV_MAX_POINTS_PER_SOURCE: &str = "GEO_AGG_MAX_POINTS_PER_SOURCE";
pub const ENV_RATE_LIMIT_MS: &str = "GEO_AGG_RATE_LIMIT_MS";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub aggregator: AggregatorConfig,
    #[serde(default)]
    pub resolver: ResolverConfig,
    #[serde(default)]
    pub geocoder: GeocoderConfig,
    #[serde(default)]
    pub sources: Vec<FileSourceConfig>,
}

/// Capacity bounds and fetch behaviour of the aggregation engine.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AggregatorConfig {
    pub max_total_points: usize,
    pub max_points_per_source: usize,
    /// Buffer of the change-notification channel; slow subscribers skip ahead.
    pub notification_capacity: usize,
    pub fetch_timeout_secs: u64,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            max_total_points: 5000,
            max_points_per_source: 1000,
            notification_capacity: 256,
            fetch_timeout_secs: 30,
        }
    }
}

impl AggregatorConfig {
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// Minimum spacing between two external geocoder calls, process-wide.
    pub rate_limit_interval_ms: u64,
    pub cache_ttl_secs: u64,
    pub request_timeout_secs: u64,
    pub max_candidates: usize,
    pub min_candidate_len: usize,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            rate_limit_interval_ms: 1100,
            cache_ttl_secs: 24 * 3600,
            request_timeout_secs: 10,
            max_candidates: 3,
            min_candidate_len: 3,
        }
    }
}

impl ResolverConfig {
    pub fn rate_limit_interval(&self) -> Duration {
        Duration::from_millis(self.rate_limit_interval_ms)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GeocoderConfig {
    pub base_url: String,
    pub user_agent: String,
}

impl Default for GeocoderConfig {
    fn default() -> Self {
        Self {
            base_url: "https://nominatim.openstreetmap.org".to_string(),
            user_agent: concat!("geo-event-aggregator/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

/// A feed backed by a JSON file on disk.
#[derive(Debug, Clone, Deserialize)]
pub struct FileSourceConfig {
    pub name: String,
    pub path: PathBuf,
    #[serde(default = "default_refresh_secs")]
    pub refresh_secs: u64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_refresh_secs() -> u64 {
    300
}

fn default_enabled() -> bool {
    true
}

impl AppConfig {
    /// Load from an explicit path, then apply env overrides.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        let mut cfg: AppConfig = toml::from_str(&content)
            .with_context(|| format!("parsing config {}", path.display()))?;
        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load using env var + fallbacks, see module docs.
    pub fn load_default() -> Result<Self> {
        if let Ok(p) = std::env::var(ENV_CONFIG_PATH) {
            let pb = PathBuf::from(p);
            if pb.exists() {
                return Self::load_from(&pb);
            }
            return Err(anyhow!("{ENV_CONFIG_PATH} points to non-existent path"));
        }
        let default_p = PathBuf::from(DEFAULT_CONFIG_PATH);
        if default_p.exists() {
            return Self::load_from(&default_p);
        }
        let mut cfg = AppConfig::default();
        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    fn apply_env_overrides(&mut self) {
        if let Some(v) = env_parse::<usize>(ENV_MAX_TOTAL_POINTS) {
            self.aggregator.max_total_points = v;
        }
        if let Some(v) = env_parse::<usize>(ENV_MAX_POINTS_PER_SOURCE) {
            self.aggregator.max_points_per_source = v;
        }
        if let Some(v) = env_parse::<u64>(ENV_RATE_LIMIT_MS) {
            self.resolver.rate_limit_interval_ms = v;
        }
    }

    fn validate(&self) -> Result<()> {
        if self.aggregator.max_total_points == 0 || self.aggregator.max_points_per_source == 0 {
            return Err(anyhow!("aggregator caps must be greater than zero"));
        }
        if self.aggregator.notification_capacity == 0 {
            return Err(anyhow!("aggregator.notification_capacity must be greater than zero"));
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}
