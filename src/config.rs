//! Configuration consumed by the core.
//!
//! The daemon does not load files itself; configuration is assembled by the
//! embedding binary and handed to [`crate::supervisor::Core`]. The structs
//! derive serde so a caller can round-trip them through JSON if it wants
//! to.
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Seconds between reporter drains.
pub const DEFAULT_REPORT_INTERVAL: u64 = 600;
/// Seconds between outbound flushes; `0` selects streaming mode.
pub const DEFAULT_FLUSH_PERIOD: u64 = 10;
/// Outbound admission limit in bytes.
pub const DEFAULT_OUTBOUND_LIMIT: usize = 1 << 20;
/// Bounded-map capacity shared by the processors.
pub const DEFAULT_CACHE_LIMIT: usize = 10_000;
/// Seconds between rate-processor emissions.
pub const DEFAULT_PROCESSOR_PERIOD: u64 = 10;

/// Defaults stamped onto outgoing items by the core emitter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoreConfig {
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    #[serde(default)]
    pub ttl: Option<u64>,
}

/// One input/output/tunnel plugin entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginConfig {
    /// Names the plugin to instantiate. Entries without a type are
    /// rejected at load time.
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default = "default_protocol")]
    pub protocol: String,
    /// Socket path for the unix protocol families.
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default = "default_flush_period")]
    pub flush_period: u64,
    #[serde(default = "default_outbound_limit")]
    pub outbound_limit: usize,
}

impl Default for PluginConfig {
    fn default() -> Self {
        PluginConfig {
            kind: None,
            host: None,
            port: None,
            protocol: default_protocol(),
            path: None,
            flush_period: DEFAULT_FLUSH_PERIOD,
            outbound_limit: DEFAULT_OUTBOUND_LIMIT,
        }
    }
}

impl PluginConfig {
    pub fn new(kind: impl Into<String>) -> Self {
        PluginConfig {
            kind: Some(kind.into()),
            ..Default::default()
        }
    }

    pub fn with_addr(mut self, host: impl Into<String>, port: u16) -> Self {
        self.host = Some(host.into());
        self.port = Some(port);
        self
    }
}

/// Per-processor options, keyed by processor name in
/// [`Config::processor_opts`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessorOptions {
    #[serde(default = "default_cache_limit")]
    pub cache_limit: usize,
    /// Emission period for windowed processors, in seconds.
    #[serde(default = "default_processor_period")]
    pub period: u64,
}

impl Default for ProcessorOptions {
    fn default() -> Self {
        ProcessorOptions {
            cache_limit: DEFAULT_CACHE_LIMIT,
            period: DEFAULT_PROCESSOR_PERIOD,
        }
    }
}

/// Self-metric reporting. Present means enabled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatisticsConfig {
    /// Key prefix for emitted counter metrics.
    #[serde(default = "default_statistics_prefix")]
    pub prefix: String,
}

impl Default for StatisticsConfig {
    fn default() -> Self {
        StatisticsConfig {
            prefix: default_statistics_prefix(),
        }
    }
}

/// Debug channel taps. Present means enabled.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DebugConfig {}

/// Everything the supervisor needs to boot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_report_interval")]
    pub report_interval: u64,
    #[serde(default)]
    pub core: CoreConfig,
    #[serde(default)]
    pub processor_opts: BTreeMap<String, ProcessorOptions>,
    #[serde(default)]
    pub input: Vec<PluginConfig>,
    #[serde(default)]
    pub output: Vec<PluginConfig>,
    #[serde(default)]
    pub tunnel: Vec<PluginConfig>,
    #[serde(default)]
    pub statistics: Option<StatisticsConfig>,
    #[serde(default)]
    pub debug: Option<DebugConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            report_interval: DEFAULT_REPORT_INTERVAL,
            core: CoreConfig::default(),
            processor_opts: BTreeMap::new(),
            input: Vec::new(),
            output: Vec::new(),
            tunnel: Vec::new(),
            statistics: None,
            debug: None,
        }
    }
}

fn default_protocol() -> String {
    "tcp".to_string()
}

fn default_flush_period() -> u64 {
    DEFAULT_FLUSH_PERIOD
}

fn default_outbound_limit() -> usize {
    DEFAULT_OUTBOUND_LIMIT
}

fn default_cache_limit() -> usize {
    DEFAULT_CACHE_LIMIT
}

fn default_processor_period() -> u64 {
    DEFAULT_PROCESSOR_PERIOD
}

fn default_report_interval() -> u64 {
    DEFAULT_REPORT_INTERVAL
}

fn default_statistics_prefix() -> String {
    "ffwd".to_string()
}
