use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::aggregate::AggregatorConfig;

/// Top-level configuration for the llcwatch agent.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Per-CPU perf ring configuration.
    #[serde(default)]
    pub ring: RingConfig,

    /// Time-slot aggregation configuration.
    #[serde(default)]
    pub aggregation: AggregationConfig,

    /// How often the rings are drained. Default: 1ms.
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,

    /// How often message counters are logged. Default: 10s.
    #[serde(default = "default_stats_interval", with = "humantime_serde")]
    pub stats_interval: Duration,
}

/// Per-CPU perf ring configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RingConfig {
    /// Data pages per CPU ring; must be a power of two. Default: 64.
    #[serde(default = "default_data_pages")]
    pub data_pages: u32,

    /// Bytes buffered before the kernel wakes readers; 0 wakes on every
    /// record. Default: 0.
    #[serde(default)]
    pub watermark_bytes: u32,

    /// CPUs to open rings on. Empty means every online CPU.
    #[serde(default)]
    pub cpus: Vec<u32>,
}

/// Time-slot aggregation configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AggregationConfig {
    /// Width of one slot. Default: 1ms.
    #[serde(default = "default_slot_length", with = "humantime_serde")]
    pub slot_length: Duration,

    /// Slots held before the oldest is emitted. Default: 8.
    #[serde(default = "default_window_size")]
    pub window_size: u32,

    /// Phase of slot boundaries; must be shorter than `slot_length`.
    /// Default: 0.
    #[serde(default, with = "humantime_serde")]
    pub slot_offset: Duration,
}

impl AggregationConfig {
    /// Nanosecond form used by the aggregator.
    pub fn aggregator_config(&self) -> Result<AggregatorConfig> {
        let slot_length_ns = u64::try_from(self.slot_length.as_nanos())
            .context("aggregation.slot_length does not fit in u64 nanoseconds")?;
        let slot_offset_ns = u64::try_from(self.slot_offset.as_nanos())
            .context("aggregation.slot_offset does not fit in u64 nanoseconds")?;
        Ok(AggregatorConfig {
            slot_length_ns,
            window_size: self.window_size,
            slot_offset_ns,
        })
    }
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_poll_interval() -> Duration {
    Duration::from_millis(1)
}

fn default_stats_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_data_pages() -> u32 {
    64
}

fn default_slot_length() -> Duration {
    Duration::from_millis(1)
}

fn default_window_size() -> u32 {
    8
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            ring: RingConfig::default(),
            aggregation: AggregationConfig::default(),
            poll_interval: default_poll_interval(),
            stats_interval: default_stats_interval(),
        }
    }
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            data_pages: default_data_pages(),
            watermark_bytes: 0,
            cpus: Vec::new(),
        }
    }
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            slot_length: default_slot_length(),
            window_size: default_window_size(),
            slot_offset: Duration::ZERO,
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for consistency.
    pub fn validate(&self) -> Result<()> {
        if self.ring.data_pages == 0 || !self.ring.data_pages.is_power_of_two() {
            bail!(
                "ring.data_pages must be a positive power of two, got {}",
                self.ring.data_pages
            );
        }

        if self.aggregation.slot_length.is_zero() {
            bail!("aggregation.slot_length must be positive");
        }

        if self.aggregation.window_size == 0 {
            bail!("aggregation.window_size must be positive");
        }

        if self.aggregation.slot_offset >= self.aggregation.slot_length {
            bail!("aggregation.slot_offset must be less than aggregation.slot_length");
        }

        self.aggregation.aggregator_config()?;

        if self.poll_interval.is_zero() {
            bail!("poll_interval must be positive");
        }

        if self.stats_interval.is_zero() {
            bail!("stats_interval must be positive");
        }

        Ok(())
    }
}
