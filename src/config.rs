// src/config.rs
//! Auto-update configuration: one explicit structure, defaults applied before
//! first use, validated at load time.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;
use crate::model::{Priority, SourceConfig};

// --- env defaults & names ---
pub const DEFAULT_CONFIG_PATH: &str = "config/autoupdate.toml";

pub const ENV_CONFIG_PATH: &str = "AUTOUPDATE_CONFIG_PATH";
pub const ENV_EMERGENCY_STOP: &str = "AUTOUPDATE_EMERGENCY_STOP";
pub const ENV_ENABLED: &str = "AUTOUPDATE_ENABLED";

fn default_true() -> bool {
    true
}
fn default_max_rollback_attempts() -> u32 {
    3
}
fn default_rollback_window_seconds() -> u64 {
    3600
}
fn default_performance_threshold() -> f64 {
    2.0
}
fn default_performance_base_cost() -> f64 {
    10.0
}
fn default_false_positive_threshold() -> f64 {
    0.001
}
fn default_health_check_interval_seconds() -> u64 {
    300
}
fn default_health_samples_per_window() -> usize {
    5
}
fn default_pattern_refresh_interval_seconds() -> u64 {
    3600
}
fn default_max_error_rate() -> f64 {
    0.05
}
fn default_min_confidence() -> f32 {
    0.5
}
fn default_low_confidence_fp_factor() -> f64 {
    0.25
}
fn default_strict_confidence_cutoff() -> f32 {
    0.7
}
fn default_validation_workers() -> usize {
    4
}
fn default_stage_timeout_ms() -> u64 {
    250
}
fn default_fetch_timeout_secs() -> u64 {
    30
}
fn default_max_backoff_secs() -> u64 {
    3600
}
fn default_channel_capacity() -> usize {
    64
}

/// Default poll interval per priority tier, in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierIntervals {
    #[serde(default = "TierIntervals::default_high")]
    pub high: u64,
    #[serde(default = "TierIntervals::default_medium")]
    pub medium: u64,
    #[serde(default = "TierIntervals::default_low")]
    pub low: u64,
}

impl TierIntervals {
    fn default_high() -> u64 {
        300
    }
    fn default_medium() -> u64 {
        1800
    }
    fn default_low() -> u64 {
        3600
    }

    pub fn for_priority(&self, p: Priority) -> u64 {
        match p {
            Priority::High => self.high,
            Priority::Medium => self.medium,
            Priority::Low => self.low,
        }
    }
}

impl Default for TierIntervals {
    fn default() -> Self {
        Self {
            high: Self::default_high(),
            medium: Self::default_medium(),
            low: Self::default_low(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoUpdateConfig {
    #[serde(default = "default_true")]
    pub auto_update_enabled: bool,
    #[serde(default = "default_true")]
    pub validation_enabled: bool,
    #[serde(default = "default_true")]
    pub auto_rollback: bool,
    #[serde(default = "default_max_rollback_attempts")]
    pub max_rollback_attempts: u32,
    /// Window over which rollback attempts are counted.
    #[serde(default = "default_rollback_window_seconds")]
    pub rollback_window_seconds: u64,
    /// Max allowed latency multiplier over baseline.
    #[serde(default = "default_performance_threshold")]
    pub performance_threshold: f64,
    /// Fixed per-lookup engine cost, in units of one literal regex pattern.
    #[serde(default = "default_performance_base_cost")]
    pub performance_base_cost: f64,
    /// Max allowed match rate against the clean corpus.
    #[serde(default = "default_false_positive_threshold")]
    pub false_positive_threshold: f64,
    #[serde(default = "default_health_check_interval_seconds")]
    pub health_check_interval_seconds: u64,
    #[serde(default = "default_health_samples_per_window")]
    pub health_samples_per_window: usize,
    #[serde(default = "default_pattern_refresh_interval_seconds")]
    pub pattern_refresh_interval_seconds: u64,
    #[serde(default)]
    pub emergency_stop: bool,
    #[serde(default = "default_max_error_rate")]
    pub max_error_rate: f64,
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f32,
    /// Multiplier applied to the fp ceiling for low-confidence candidates.
    #[serde(default = "default_low_confidence_fp_factor")]
    pub low_confidence_fp_factor: f64,
    /// Confidence at or above which the regular fp ceiling applies.
    #[serde(default = "default_strict_confidence_cutoff")]
    pub strict_confidence_cutoff: f32,
    #[serde(default = "default_validation_workers")]
    pub validation_workers: usize,
    #[serde(default = "default_stage_timeout_ms")]
    pub stage_timeout_ms: u64,
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    #[serde(default)]
    pub store_dir: Option<PathBuf>,
    #[serde(default)]
    pub clean_corpus_path: Option<PathBuf>,
    #[serde(default)]
    pub fingerprint_state_path: Option<PathBuf>,
    #[serde(default)]
    pub tiers: TierIntervals,
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
}

impl Default for AutoUpdateConfig {
    fn default() -> Self {
        Self {
            auto_update_enabled: true,
            validation_enabled: true,
            auto_rollback: true,
            max_rollback_attempts: default_max_rollback_attempts(),
            rollback_window_seconds: default_rollback_window_seconds(),
            performance_threshold: default_performance_threshold(),
            performance_base_cost: default_performance_base_cost(),
            false_positive_threshold: default_false_positive_threshold(),
            health_check_interval_seconds: default_health_check_interval_seconds(),
            health_samples_per_window: default_health_samples_per_window(),
            pattern_refresh_interval_seconds: default_pattern_refresh_interval_seconds(),
            emergency_stop: false,
            max_error_rate: default_max_error_rate(),
            min_confidence: default_min_confidence(),
            low_confidence_fp_factor: default_low_confidence_fp_factor(),
            strict_confidence_cutoff: default_strict_confidence_cutoff(),
            validation_workers: default_validation_workers(),
            stage_timeout_ms: default_stage_timeout_ms(),
            fetch_timeout_secs: default_fetch_timeout_secs(),
            max_backoff_secs: default_max_backoff_secs(),
            channel_capacity: default_channel_capacity(),
            store_dir: None,
            clean_corpus_path: None,
            fingerprint_state_path: None,
            tiers: TierIntervals::default(),
            sources: Vec::new(),
        }
    }
}

impl AutoUpdateConfig {
    /// Load using AUTOUPDATE_CONFIG_PATH or "config/autoupdate.toml".
    /// A missing default file yields the built-in defaults.
    pub fn load_default() -> Result<Self> {
        if let Ok(p) = std::env::var(ENV_CONFIG_PATH) {
            let path = PathBuf::from(p);
            return Self::load_from_file(&path);
        }
        let path = PathBuf::from(DEFAULT_CONFIG_PATH);
        if path.exists() {
            return Self::load_from_file(&path);
        }
        let mut cfg = Self::default();
        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading auto-update config from {}", path.display()))?;
        let mut cfg = Self::from_toml_str(&content)
            .with_context(|| format!("parsing auto-update config {}", path.display()))?;
        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Parse and validate; env overrides are not applied.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let cfg: AutoUpdateConfig = toml::from_str(s)?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn apply_env_overrides(&mut self) {
        if let Some(v) = parse_bool_env(std::env::var(ENV_EMERGENCY_STOP).ok()) {
            self.emergency_stop = v;
        }
        if let Some(v) = parse_bool_env(std::env::var(ENV_ENABLED).ok()) {
            self.auto_update_enabled = v;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        fn invalid(field: &'static str, message: impl Into<String>) -> ConfigError {
            ConfigError::Invalid {
                field,
                message: message.into(),
            }
        }

        if !(self.performance_threshold.is_finite() && self.performance_threshold > 1.0) {
            return Err(invalid(
                "performance_threshold",
                "must be a finite multiplier greater than 1.0",
            ));
        }
        if !(self.performance_base_cost.is_finite() && self.performance_base_cost > 0.0) {
            return Err(invalid("performance_base_cost", "must be a positive number"));
        }
        if !(self.false_positive_threshold > 0.0 && self.false_positive_threshold <= 1.0) {
            return Err(invalid("false_positive_threshold", "must be in (0, 1]"));
        }
        if !(self.max_error_rate >= 0.0 && self.max_error_rate <= 1.0) {
            return Err(invalid("max_error_rate", "must be in [0, 1]"));
        }
        if !(0.0..=1.0).contains(&self.min_confidence) {
            return Err(invalid("min_confidence", "must be in [0, 1]"));
        }
        if !(0.0..=1.0).contains(&self.strict_confidence_cutoff) {
            return Err(invalid("strict_confidence_cutoff", "must be in [0, 1]"));
        }
        if !(self.low_confidence_fp_factor > 0.0 && self.low_confidence_fp_factor <= 1.0) {
            return Err(invalid("low_confidence_fp_factor", "must be in (0, 1]"));
        }
        if self.max_rollback_attempts == 0 {
            return Err(invalid("max_rollback_attempts", "must be at least 1"));
        }
        for (field, v) in [
            ("rollback_window_seconds", self.rollback_window_seconds),
            (
                "health_check_interval_seconds",
                self.health_check_interval_seconds,
            ),
            (
                "pattern_refresh_interval_seconds",
                self.pattern_refresh_interval_seconds,
            ),
            ("stage_timeout_ms", self.stage_timeout_ms),
            ("fetch_timeout_secs", self.fetch_timeout_secs),
            ("max_backoff_secs", self.max_backoff_secs),
            ("tiers.high", self.tiers.high),
            ("tiers.medium", self.tiers.medium),
            ("tiers.low", self.tiers.low),
        ] {
            if v == 0 {
                return Err(invalid(field, "must be greater than zero"));
            }
        }
        if self.health_samples_per_window < 3 {
            return Err(invalid(
                "health_samples_per_window",
                "needs at least 3 samples for window aggregation",
            ));
        }
        if self.validation_workers == 0 {
            return Err(invalid("validation_workers", "must be at least 1"));
        }
        if self.channel_capacity == 0 {
            return Err(invalid("channel_capacity", "must be at least 1"));
        }

        let mut names = HashSet::new();
        for s in &self.sources {
            if s.name.trim().is_empty() {
                return Err(invalid("sources.name", "must not be empty"));
            }
            if s.url.trim().is_empty() {
                return Err(invalid("sources.url", format!("empty url for `{}`", s.name)));
            }
            if s.poll_interval_secs == Some(0) {
                return Err(invalid(
                    "sources.poll_interval_secs",
                    format!("zero interval for `{}`", s.name),
                ));
            }
            if !names.insert(s.name.clone()) {
                return Err(ConfigError::DuplicateSource(s.name.clone()));
            }
        }
        Ok(())
    }

    /// Effective poll interval of a source (override, else tier default).
    pub fn poll_interval(&self, source: &SourceConfig) -> Duration {
        let secs = source
            .poll_interval_secs
            .unwrap_or_else(|| self.tiers.for_priority(source.priority));
        Duration::from_secs(secs)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_seconds)
    }

    pub fn pattern_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.pattern_refresh_interval_seconds)
    }

    pub fn rollback_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.rollback_window_seconds as i64)
    }

    pub fn stage_timeout(&self) -> Duration {
        Duration::from_millis(self.stage_timeout_ms)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_secs)
    }
}

// "1"/"true"/"on" → true, "0"/"false"/"off" → false, anything else ignored
fn parse_bool_env(raw: Option<String>) -> Option<bool> {
    let v = raw?.trim().to_ascii_lowercase();
    match v.as_str() {
        "1" | "true" | "on" | "yes" => Some(true),
        "0" | "false" | "off" | "no" => Some(false),
        _ => None,
    }
}
