//! Configuration management for firmflow
//!
//! Typed configuration for the unpacking and analysis pipeline. Values are
//! layered by figment (see [`core`]): embedded defaults, an optional config
//! file, then `FIRMFLOW_` environment variables.

use crate::error::ConfigError;
use crate::objects::mime::MimeFilter;
use crate::process::CrashPolicy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

pub mod core;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FirmflowConfig {
    #[serde(default)]
    pub unpack: UnpackConfig,

    #[serde(default)]
    pub analysis: AnalysisConfig,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Unpacking stage settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnpackConfig {
    /// Number of unpack workers, 0 means derive from CPU count
    pub threads: usize,

    /// Objects at this depth or deeper are not extracted
    pub max_depth: usize,

    /// Combined backlog above which admission pauses, negative disables
    pub throttle_limit: i64,

    /// Mime globs that are analyzed but never extracted
    pub skip_mime_types: Vec<String>,

    /// Where extracted content is stored, defaults to a directory under the system temp dir
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
}

impl Default for UnpackConfig {
    fn default() -> Self {
        Self {
            threads: 0,
            max_depth: 8,
            throttle_limit: 50,
            skip_mime_types: vec!["text/*".into(), "inode/x-empty".into()],
            data_dir: None,
        }
    }
}

/// Analysis stage settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisConfig {
    /// In-flight plugin tasks above which new objects wait, negative disables
    pub throttle_limit: i64,

    /// Plugins scheduled for every object, empty selects all registered plugins
    #[serde(default)]
    pub default_plugins: Vec<String>,

    /// Per-plugin overrides keyed by plugin name
    #[serde(default)]
    pub plugins: BTreeMap<String, PluginOverride>,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            throttle_limit: 200,
            default_plugins: Vec::new(),
            plugins: BTreeMap::new(),
        }
    }
}

/// Overrides for a single plugin's declared settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_count: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,

    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl Default for PluginOverride {
    fn default() -> Self {
        Self {
            process_count: None,
            timeout_ms: None,
            enabled: true,
        }
    }
}

fn default_enabled() -> bool {
    true
}

/// Worker loop timing and crash handling
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Bounded wait on every queue receive
    pub block_delay_ms: u64,

    pub monitor_interval_ms: u64,

    /// Sleep applied while the throttle indicator is raised
    pub throttle_pause_ms: u64,

    pub supervisor_interval_ms: u64,

    pub crash_policy: CrashPolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            block_delay_ms: 100,
            monitor_interval_ms: 1000,
            throttle_pause_ms: 250,
            supervisor_interval_ms: 500,
            crash_policy: CrashPolicy::Restart,
        }
    }
}

impl SchedulerConfig {
    pub fn block_delay(&self) -> Duration {
        Duration::from_millis(self.block_delay_ms)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }

    pub fn throttle_pause(&self) -> Duration {
        Duration::from_millis(self.throttle_pause_ms)
    }

    pub fn supervisor_interval(&self) -> Duration {
        Duration::from_millis(self.supervisor_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

impl FirmflowConfig {
    /// Number of unpack workers after resolving the automatic setting
    pub fn unpack_threads(&self) -> usize {
        resolve_worker_count(self.unpack.threads)
    }

    pub fn skip_filter(&self) -> Result<MimeFilter, ConfigError> {
        MimeFilter::new(&self.unpack.skip_mime_types)
    }

    /// Directory holding extracted content
    pub fn data_dir(&self) -> PathBuf {
        self.unpack
            .data_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("firmflow"))
    }

    /// Check values that would stall or break the pipeline
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.unpack.max_depth == 0 {
            return Err(ConfigError::invalid("unpack.max_depth", "must be at least 1"));
        }
        self.skip_filter()?;

        for (key, value) in [
            ("scheduler.block_delay_ms", self.scheduler.block_delay_ms),
            ("scheduler.monitor_interval_ms", self.scheduler.monitor_interval_ms),
            ("scheduler.supervisor_interval_ms", self.scheduler.supervisor_interval_ms),
            ("scheduler.throttle_pause_ms", self.scheduler.throttle_pause_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::invalid(key, "must be greater than zero"));
            }
        }

        for (name, plugin) in &self.analysis.plugins {
            if plugin.process_count == Some(0) {
                return Err(ConfigError::invalid(
                    &format!("analysis.plugins.{name}.process_count"),
                    "must be at least 1",
                ));
            }
            if plugin.timeout_ms == Some(0) {
                return Err(ConfigError::invalid(
                    &format!("analysis.plugins.{name}.timeout_ms"),
                    "must be greater than zero",
                ));
            }
        }

        if let Err(e) = self.logging.level.parse::<tracing::Level>() {
            return Err(ConfigError::invalid("logging.level", e));
        }

        Ok(())
    }
}

/// Use three quarters of the available CPUs when no explicit count is configured
pub fn resolve_worker_count(configured: usize) -> usize {
    if configured > 0 {
        return configured;
    }
    let cpus = num_cpus::get();
    ((cpus * 75) / 100).max(1)
}
