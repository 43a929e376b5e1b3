//! Configuration System
//!
//! Handles loading configuration from a TOML file and environment variables.
//! Command-line flags are applied on top by the binary. Every value is
//! checked by [`Config::validate`] before the bridge touches the network
//! or the filesystem.

use crate::cloud::{CloudConfig, Target};
use crate::sink::InfluxConfig;
use crate::state::Credential;
use crate::sync::SyncConfig;
use crate::transform::parse_timestamp_ms;
use regex::Regex;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

/// Accepted shape of an ISO start position
const START_ISO_PATTERN: &str = r"^\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}\.\d{6}Z$";

/// Upper bound of `sync.interval_secs` (one week)
pub const MAX_INTERVAL_SECS: u64 = 7 * 24 * 3600;

/// Upper bound of `sync.retry_delay_secs`
pub const MAX_RETRY_DELAY_SECS: u64 = 3600;

/// Upper bound of `cloud.request_timeout_secs`
pub const MAX_REQUEST_TIMEOUT_SECS: u64 = 600;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub target: TargetConfig,

    #[serde(default)]
    pub cloud: CloudSection,

    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub sync: SyncSection,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// What to synchronize
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TargetConfig {
    /// Device whose readings are mirrored
    #[serde(default)]
    pub device_id: String,

    /// Device group whose readings are mirrored; excludes `device_id`
    #[serde(default)]
    pub group_id: Option<String>,

    /// Unique target name; keys the state file. Defaults to the device or group id.
    #[serde(default)]
    pub name: Option<String>,

    /// Only poll series whose name contains this string
    #[serde(default)]
    pub series_filter: Option<String>,
}

/// Device cloud settings
#[derive(Debug, Clone, Deserialize)]
pub struct CloudSection {
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// Bootstrap access token
    #[serde(default)]
    pub token: String,

    /// Expiry of the bootstrap token (ISO-8601); unknown means renew on first use
    #[serde(default)]
    pub token_expires_at: Option<String>,

    /// Application name used for token renewal
    #[serde(default = "default_app_name")]
    pub app_name: String,

    /// Aggregation bucket width for readings
    #[serde(default = "default_aggregation_interval")]
    pub aggregation_interval: String,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_api_url() -> String {
    "https://api.relayr.io".to_string()
}

fn default_app_name() -> String {
    "cloudbridge".to_string()
}

fn default_aggregation_interval() -> String {
    "1m".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

impl Default for CloudSection {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            token: String::new(),
            token_expires_at: None,
            app_name: default_app_name(),
            aggregation_interval: default_aggregation_interval(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

/// Time-series database settings
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_host")]
    pub host: String,

    #[serde(default = "default_db_port")]
    pub port: u16,

    /// Database name (required)
    #[serde(default)]
    pub name: String,

    #[serde(default = "default_db_user")]
    pub username: String,

    #[serde(default = "default_db_user")]
    pub password: String,
}

fn default_db_host() -> String {
    "localhost".to_string()
}

fn default_db_port() -> u16 {
    8086
}

fn default_db_user() -> String {
    "root".to_string()
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: default_db_host(),
            port: default_db_port(),
            name: String::new(),
            username: default_db_user(),
            password: default_db_user(),
        }
    }
}

/// Sync loop settings
#[derive(Debug, Clone, Deserialize)]
pub struct SyncSection {
    /// Seconds between cycles
    #[serde(default = "default_interval")]
    pub interval_secs: u64,

    /// Divisor applied to every reading
    #[serde(default = "default_norm_factor")]
    pub norm_factor: f64,

    /// Explicit start position for the first cycle (Unix ms)
    #[serde(default)]
    pub start_ms: Option<i64>,

    /// Explicit start position for the first cycle (YYYY-MM-DDTHH:MM:SS.ffffffZ)
    #[serde(default)]
    pub start_iso: Option<String>,

    /// Fixed delay between retries of an unavailable dependency
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,

    #[serde(default = "default_state_dir")]
    pub state_dir: String,
}

fn default_interval() -> u64 {
    60
}

fn default_norm_factor() -> f64 {
    1.0
}

fn default_retry_delay() -> u64 {
    5
}

fn default_state_dir() -> String {
    dirs::data_local_dir()
        .map(|p| p.join("cloudbridge").to_string_lossy().to_string())
        .unwrap_or_else(|| "./state".to_string())
}

impl Default for SyncSection {
    fn default() -> Self {
        Self {
            interval_secs: default_interval(),
            norm_factor: default_norm_factor(),
            start_ms: None,
            start_iso: None,
            retry_delay_secs: default_retry_delay(),
            state_dir: default_state_dir(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// "pretty" or "json"
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            error: e.to_string(),
        })
    }

    /// Load from an optional file, then apply environment overrides
    pub fn load_with_env(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply `CLOUDBRIDGE_*` environment variable overrides
    pub fn apply_env_overrides(&mut self) {
        if let Ok(device) = std::env::var("CLOUDBRIDGE_DEVICE") {
            self.target.device_id = device;
        }
        if let Ok(group) = std::env::var("CLOUDBRIDGE_GROUP") {
            self.target.group_id = Some(group);
        }
        if let Ok(token) = std::env::var("CLOUDBRIDGE_TOKEN") {
            self.cloud.token = token;
        }
        if let Ok(url) = std::env::var("CLOUDBRIDGE_API_URL") {
            self.cloud.api_url = url;
        }

        if let Ok(db) = std::env::var("CLOUDBRIDGE_DB") {
            self.database.name = db;
        }
        if let Ok(host) = std::env::var("CLOUDBRIDGE_DB_HOST") {
            self.database.host = host;
        }
        if let Ok(port) = std::env::var("CLOUDBRIDGE_DB_PORT") {
            if let Ok(p) = port.parse() {
                self.database.port = p;
            }
        }

        if let Ok(dir) = std::env::var("CLOUDBRIDGE_STATE_DIR") {
            self.sync.state_dir = dir;
        }

        if let Ok(level) = std::env::var("CLOUDBRIDGE_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(format) = std::env::var("CLOUDBRIDGE_LOG_FORMAT") {
            self.logging.format = format;
        }
    }

    /// Check every setting; must pass before the bridge starts
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.target()?;
        if self.database.name.trim().is_empty() {
            return Err(ConfigError::Missing("database.name"));
        }
        if self.cloud.token.trim().is_empty() {
            return Err(ConfigError::Missing("cloud.token"));
        }

        let norm = self.sync.norm_factor;
        if !norm.is_finite() || norm == 0.0 {
            return Err(ConfigError::InvalidNormFactor(norm));
        }
        if !(1..=MAX_INTERVAL_SECS).contains(&self.sync.interval_secs) {
            return Err(ConfigError::InvalidInterval(self.sync.interval_secs));
        }
        if !(1..=MAX_RETRY_DELAY_SECS).contains(&self.sync.retry_delay_secs) {
            return Err(ConfigError::InvalidRetryDelay(self.sync.retry_delay_secs));
        }
        if !(1..=MAX_REQUEST_TIMEOUT_SECS).contains(&self.cloud.request_timeout_secs) {
            return Err(ConfigError::InvalidTimeout(self.cloud.request_timeout_secs));
        }
        if self.cloud.aggregation_interval.trim().is_empty() {
            return Err(ConfigError::Missing("cloud.aggregation_interval"));
        }

        self.start_position()?;
        self.bootstrap_credential()?;
        Ok(())
    }

    /// The device or device group to mirror; exactly one must be set
    pub fn target(&self) -> Result<Target, ConfigError> {
        let device = self.target.device_id.trim();
        let group = self.target.group_id.as_deref().map(str::trim).unwrap_or("");

        match (device.is_empty(), group.is_empty()) {
            (false, true) => Ok(Target::Device(device.to_string())),
            (true, false) => Ok(Target::Group(group.to_string())),
            (false, false) => Err(ConfigError::ConflictingTarget),
            (true, true) => Err(ConfigError::Missing("target.device_id or target.group_id")),
        }
    }

    /// Explicit first-cycle start position, if configured
    pub fn start_position(&self) -> Result<Option<i64>, ConfigError> {
        match (self.sync.start_ms, self.sync.start_iso.as_deref()) {
            (Some(_), Some(_)) => Err(ConfigError::ConflictingStart),
            (Some(ms), None) if ms < 0 => Err(ConfigError::InvalidStartMs(ms)),
            (Some(ms), None) => Ok(Some(ms)),
            (None, Some(iso)) => parse_start_iso(iso).map(Some),
            (None, None) => Ok(None),
        }
    }

    /// Bootstrap credential from the configured token
    pub fn bootstrap_credential(&self) -> Result<Option<Credential>, ConfigError> {
        if self.cloud.token.is_empty() {
            return Ok(None);
        }

        let expires_at = match self.cloud.token_expires_at.as_deref() {
            Some(iso) => parse_timestamp_ms(iso)
                .map_err(|e| ConfigError::InvalidTokenExpiry(format!("{}: {}", iso, e)))?,
            // Unknown expiry: renew as soon as the token is first needed
            None => 0,
        };

        Ok(Some(Credential {
            token: self.cloud.token.clone(),
            expires_at,
        }))
    }

    /// Unique target name keying the state file
    pub fn target_name(&self) -> &str {
        let id = self
            .target
            .group_id
            .as_deref()
            .filter(|g| !g.is_empty())
            .unwrap_or(&self.target.device_id);

        self.target
            .name
            .as_deref()
            .filter(|n| !n.is_empty())
            .unwrap_or(id)
    }

    pub fn state_dir(&self) -> PathBuf {
        PathBuf::from(&self.sync.state_dir)
    }

    pub fn cloud_config(&self) -> CloudConfig {
        CloudConfig {
            base_url: self.cloud.api_url.clone(),
            request_timeout_secs: self.cloud.request_timeout_secs,
            ..Default::default()
        }
    }

    pub fn influx_config(&self) -> InfluxConfig {
        InfluxConfig {
            host: self.database.host.clone(),
            port: self.database.port,
            database: self.database.name.clone(),
            username: self.database.username.clone(),
            password: self.database.password.clone(),
            request_timeout_secs: self.cloud.request_timeout_secs,
        }
    }

    /// Settings for the sync engine; call after [`Config::validate`]
    pub fn sync_config(&self) -> Result<SyncConfig, ConfigError> {
        Ok(SyncConfig {
            target: self.target()?,
            series_filter: self.target.series_filter.clone().filter(|f| !f.is_empty()),
            aggregation_interval: self.cloud.aggregation_interval.clone(),
            norm_factor: self.sync.norm_factor,
            interval: Duration::from_secs(self.sync.interval_secs),
            retry_delay: Duration::from_secs(self.sync.retry_delay_secs),
            start_override: self.start_position()?,
            ..Default::default()
        })
    }
}

fn parse_start_iso(iso: &str) -> Result<i64, ConfigError> {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let pattern =
        PATTERN.get_or_init(|| Regex::new(START_ISO_PATTERN).expect("start pattern is valid"));

    if !pattern.is_match(iso) {
        return Err(ConfigError::InvalidStartIso(iso.to_string()));
    }
    parse_timestamp_ms(iso).map_err(|_| ConfigError::InvalidStartIso(iso.to_string()))
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {error}")]
    Io { path: PathBuf, error: String },

    #[error("Failed to parse config file {path:?}: {error}")]
    Parse { path: PathBuf, error: String },

    #[error("Missing required setting: {0}")]
    Missing(&'static str),

    #[error("Normalization factor must be finite and non-zero, got {0}")]
    InvalidNormFactor(f64),

    #[error("Device and group given as target; use only one")]
    ConflictingTarget,

    #[error("Sync interval must be between 1 and {max} seconds, got {0}", max = MAX_INTERVAL_SECS)]
    InvalidInterval(u64),

    #[error("Retry delay must be between 1 and {max} seconds, got {0}", max = MAX_RETRY_DELAY_SECS)]
    InvalidRetryDelay(u64),

    #[error(
        "Request timeout must be between 1 and {max} seconds, got {0}",
        max = MAX_REQUEST_TIMEOUT_SECS
    )]
    InvalidTimeout(u64),

    #[error("Start position given both as Unix ms and as ISO-8601; use only one")]
    ConflictingStart,

    #[error("Start position must not be negative, got {0}")]
    InvalidStartMs(i64),

    #[error("Start position {0:?} does not match YYYY-MM-DDTHH:MM:SS.ffffffZ")]
    InvalidStartIso(String),

    #[error("Invalid token expiry {0}")]
    InvalidTokenExpiry(String),
}

/// Generate a default config file content
pub fn generate_default_config() -> String {
    r##"# cloudbridge configuration
#
# Environment variables override these settings:
# - CLOUDBRIDGE_DEVICE, CLOUDBRIDGE_GROUP, CLOUDBRIDGE_TOKEN, CLOUDBRIDGE_API_URL
# - CLOUDBRIDGE_DB, CLOUDBRIDGE_DB_HOST, CLOUDBRIDGE_DB_PORT
# - CLOUDBRIDGE_STATE_DIR
# - CLOUDBRIDGE_LOG_LEVEL, CLOUDBRIDGE_LOG_FORMAT
#
# Command-line flags override both.

[target]
# Device whose readings are mirrored
device_id = ""

# Or mirror every device of a group instead; series are stored as
# "<device name>.<measurement>"
# group_id = ""

# Unique name of this target (defaults to the device or group id). Keys the state file:
# never run two bridges with the same target name.
# name = "greenhouse-1"

# Only poll series whose name contains this string
# series_filter = "#"

[cloud]
api_url = "https://api.relayr.io"

# Bootstrap access token
token = ""

# Expiry of the bootstrap token; if unset the token is renewed on first use
# token_expires_at = "2024-01-01T00:00:00.000000Z"

# Application name used to renew tokens
app_name = "cloudbridge"

# Aggregation bucket width for readings
aggregation_interval = "1m"

# Timeout for every HTTP request (seconds, 1-600)
request_timeout_secs = 30

[database]
host = "localhost"
port = 8086
name = ""
username = "root"
password = "root"

[sync]
# Seconds between sync cycles (at most one week)
interval_secs = 60

# Every reading is divided by this value
norm_factor = 1.0

# Optional start position for the first cycle (pick one)
# start_ms = 1481024400000
# start_iso = "2016-12-06T11:40:00.000000Z"

# Delay before retrying an unavailable database or API (seconds, 1-3600)
retry_delay_secs = 5

# Directory holding checkpoint and token state
# state_dir = "~/.local/share/cloudbridge"

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Log format: pretty (for development) or json (for production)
format = "pretty"
"##
    .to_string()
}
