//! Configuration file parsing and structures.
//!
//! elmd is configured with a single TOML file: the power budget, polling cadence, an
//! optional status API, and the list of gateways to manage.

use std::collections::HashMap;
use std::collections::HashSet;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::filter::Targets;

use crate::model;
use crate::poller::PollerConfig;
use crate::scheduler::SchedulerConfig;

/// Top-level configuration structure
#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub logging: LoggingConfig,
    pub scheduler: SchedulerSection,
    #[serde(default)]
    pub poller: PollerSection,
    #[serde(default)]
    pub api: Option<ApiConfig>,
    #[serde(default)]
    pub gateways: Vec<GatewayConfig>,
    #[serde(default)]
    pub feedback_routes: Vec<FeedbackRouteConfig>,
}

#[derive(Debug, Default, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => LevelFilter::TRACE,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Error => LevelFilter::ERROR,
        }
    }
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default)]
    pub level: LogLevel,

    /// Per-target levels, e.g. `"elmd::poller" = "debug"`
    #[serde(default)]
    pub overrides: HashMap<String, LogLevel>,
}

impl LoggingConfig {
    /// Filter for the subscriber; `level` replaces the configured default when given.
    pub fn targets(&self, level: Option<LogLevel>) -> Targets {
        let default = level.unwrap_or(self.level);
        self.overrides.iter().fold(
            Targets::new().with_default(LevelFilter::from(default)),
            |targets, (target, level)| {
                targets.with_target(target.clone(), LevelFilter::from(*level))
            },
        )
    }
}

/// Power budget and decision loop timing
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerSection {
    pub overload_power_limit_watt: u32,
    pub saturation_power_limit_watt: u32,

    #[serde(default = "default_scheduling_interval_ms")]
    pub scheduling_interval_ms: u64,

    /// Typical tap length, used for waiting-time estimates
    #[serde(default = "default_mean_consumption_ms")]
    pub mean_consumption_ms: u64,

    /// Disable only for debugging
    #[serde(default = "default_true")]
    pub check_alive: bool,
}

impl SchedulerSection {
    pub fn to_scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            saturation_power_limit_watt: self.saturation_power_limit_watt,
            overload_power_limit_watt: self.overload_power_limit_watt,
            scheduling_interval: Duration::from_millis(self.scheduling_interval_ms),
            mean_consumption: Duration::from_millis(self.mean_consumption_ms),
            check_alive: self.check_alive,
        }
    }
}

/// Gateway polling cadence
#[derive(Debug, Clone, Deserialize)]
pub struct PollerSection {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// How long after its last poll a gateway still counts as alive
    #[serde(default = "default_poll_alive_tolerance_ms")]
    pub poll_alive_tolerance_ms: u64,

    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
}

impl Default for PollerSection {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            poll_alive_tolerance_ms: default_poll_alive_tolerance_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            max_consecutive_failures: default_max_consecutive_failures(),
        }
    }
}

impl PollerSection {
    pub fn poll_alive_tolerance(&self) -> Duration {
        Duration::from_millis(self.poll_alive_tolerance_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn to_poller_config(&self) -> PollerConfig {
        PollerConfig {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            max_consecutive_failures: self.max_consecutive_failures,
        }
    }
}

/// HTTP status API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_listen")]
    pub listen: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

/// One managed gateway
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    pub uri: String,
    pub password: String,

    #[serde(default)]
    pub name: Option<String>,
}

/// Send a device's user feedback through another gateway than the one managing it
#[derive(Debug, Clone, Deserialize)]
pub struct FeedbackRouteConfig {
    pub device_id: String,
    /// Uri of a configured gateway
    pub gateway: String,
}

fn default_true() -> bool {
    true
}

fn default_scheduling_interval_ms() -> u64 {
    1000
}

fn default_mean_consumption_ms() -> u64 {
    180_000
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_poll_alive_tolerance_ms() -> u64 {
    5000
}

fn default_request_timeout_ms() -> u64 {
    3000
}

fn default_max_consecutive_failures() -> u32 {
    5
}

fn default_listen() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8565
}

impl Config {
    /// Load and validate configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Io(path.as_ref().to_path_buf(), e))?;

        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let scheduler = &self.scheduler;
        scheduler.to_scheduler_config().validate()?;

        // Headroom for one more heater at full power before overload.
        let max_device_power = model::max_device_power_watt();
        if scheduler.saturation_power_limit_watt
            > scheduler
                .overload_power_limit_watt
                .saturating_sub(max_device_power)
        {
            return Err(ConfigError::Invalid(format!(
                "saturation power limit ({} W) must leave room for a {} W device \
                 below the overload power limit ({} W)",
                scheduler.saturation_power_limit_watt,
                max_device_power,
                scheduler.overload_power_limit_watt
            )));
        }

        if scheduler.mean_consumption_ms == 0 {
            return Err(ConfigError::Invalid(
                "mean consumption time must be non-zero".to_string(),
            ));
        }

        let poller = &self.poller;
        if poller.poll_interval_ms == 0
            || poller.poll_alive_tolerance_ms == 0
            || poller.request_timeout_ms == 0
        {
            return Err(ConfigError::Invalid(
                "poller intervals must be non-zero".to_string(),
            ));
        }

        let mut uris = HashSet::new();
        for gateway in &self.gateways {
            if !uris.insert(gateway.uri.trim_end_matches('/')) {
                return Err(ConfigError::Invalid(format!(
                    "gateway {} is configured more than once",
                    gateway.uri
                )));
            }
        }

        let mut routed = HashSet::new();
        for route in &self.feedback_routes {
            if !uris.contains(route.gateway.trim_end_matches('/')) {
                return Err(ConfigError::Invalid(format!(
                    "feedback route for {} names unknown gateway {}",
                    route.device_id, route.gateway
                )));
            }
            if !routed.insert(route.device_id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "device {} has more than one feedback route",
                    route.device_id
                )));
            }
        }

        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {0}: {1}")]
    Io(PathBuf, #[source] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
