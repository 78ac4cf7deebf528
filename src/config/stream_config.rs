//! Stream Configuration - every tunable of the processor as TOML values
//!
//! Each struct implements `Default` from `defaults.rs`, so an empty file (or
//! no file at all) reproduces the stock behaviour.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

use super::defaults;

/// Environment variable naming the config file.
pub const CONFIG_ENV_VAR: &str = "AGRISTREAM_CONFIG";

/// Config file looked up in the working directory.
pub const LOCAL_CONFIG_FILE: &str = "agristream.toml";

// ============================================================================
// Top-Level Config
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamConfig {
    #[serde(default)]
    pub channels: ChannelConfig,

    #[serde(default)]
    pub windows: WindowConfig,

    #[serde(default)]
    pub drought: DroughtConfig,

    #[serde(default)]
    pub flood: FloodConfig,

    #[serde(default)]
    pub operational: OperationalConfig,

    #[serde(default)]
    pub heartbeats: HeartbeatConfig,

    #[serde(default)]
    pub enrichment: EnrichmentConfig,

    #[serde(default)]
    pub notifications: NotificationConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub server: ServerConfig,
}

impl StreamConfig {
    /// Load configuration.
    ///
    /// An explicit path must load successfully. Otherwise searches
    /// `$AGRISTREAM_CONFIG`, then `./agristream.toml`, then falls back to
    /// defaults, logging (not failing) on a bad file.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = explicit {
            let config = Self::load_from_file(path)?;
            info!(path = %path.display(), "Loaded stream config");
            return Ok(config);
        }

        if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
            let p = PathBuf::from(&path);
            if p.exists() {
                match Self::load_from_file(&p) {
                    Ok(config) => {
                        info!(path = %p.display(), "Loaded stream config from {}", CONFIG_ENV_VAR);
                        return Ok(config);
                    }
                    Err(e) => {
                        warn!(path = %p.display(), error = %e, "Failed to load config from {}, falling back", CONFIG_ENV_VAR);
                    }
                }
            } else {
                warn!(path = %path, "{} points to non-existent file, falling back", CONFIG_ENV_VAR);
            }
        }

        let local = PathBuf::from(LOCAL_CONFIG_FILE);
        if local.exists() {
            match Self::load_from_file(&local) {
                Ok(config) => {
                    info!("Loaded stream config from ./{}", LOCAL_CONFIG_FILE);
                    return Ok(config);
                }
                Err(e) => {
                    warn!(error = %e, "Failed to load ./{}, using defaults", LOCAL_CONFIG_FILE);
                }
            }
        }

        info!("No {} found, using built-in defaults", LOCAL_CONFIG_FILE);
        Ok(Self::default())
    }

    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        let config = Self::from_toml_str(&contents).map_err(|e| match e {
            ConfigError::Parse(_, inner) => ConfigError::Parse(path.to_path_buf(), inner),
            other => other,
        })?;
        Ok(config)
    }

    /// Parse and validate a TOML document. Unknown keys are logged as warnings.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        for w in super::validation::validate_unknown_keys(contents) {
            warn!("{}", w);
        }
        let config: Self =
            toml::from_str(contents).map_err(|e| ConfigError::Parse(PathBuf::new(), e))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    /// Validate every section, collecting all problems before failing.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors: Vec<String> = Vec::new();

        let c = &self.channels;
        let topics = [
            ("channels.weather_topic", &c.weather_topic),
            ("channels.yield_topic", &c.yield_topic),
            ("channels.metrics_topic", &c.metrics_topic),
            ("channels.output_topic", &c.output_topic),
        ];
        for (name, topic) in topics {
            if topic.trim().is_empty() {
                errors.push(format!("{name} must not be empty"));
            }
        }
        if c.weather_topic == c.yield_topic
            || c.weather_topic == c.metrics_topic
            || c.yield_topic == c.metrics_topic
        {
            errors.push("channels: input topics must be distinct".to_string());
        }

        if self.windows.soil_moisture_window_minutes == 0 {
            errors.push("windows.soil_moisture_window_minutes must be > 0".to_string());
        }
        if self.windows.rolling_window_days == 0 {
            errors.push("windows.rolling_window_days must be > 0".to_string());
        }

        if self.drought.drought_days == 0 {
            errors.push("drought.drought_days must be >= 1".to_string());
        }
        Self::check_non_negative(self.drought.precip_threshold, "drought.precip_threshold", &mut errors);

        if self.flood.window_days == 0 {
            errors.push("flood.window_days must be >= 1".to_string());
        }
        Self::check_non_negative(self.flood.flood_threshold, "flood.flood_threshold", &mut errors);

        for (metric, threshold) in &self.operational.thresholds {
            if !threshold.is_finite() {
                errors.push(format!(
                    "operational.thresholds.{metric} must be finite (got {threshold})"
                ));
            }
        }

        if self.heartbeats.check_interval_secs == 0 {
            errors.push("heartbeats.check_interval_secs must be > 0".to_string());
        }
        for (stream, timeout) in &self.heartbeats.streams {
            if *timeout == 0 {
                errors.push(format!("heartbeats.streams.{stream} must be > 0 seconds"));
            }
        }

        if self.enrichment.selection == EntitySelection::TargetOnly
            && self.enrichment.target_entity().is_none()
        {
            errors.push(
                "enrichment.selection = \"target_only\" requires enrichment.target_entity".to_string(),
            );
        }

        if self.notifications.queue_capacity == 0 {
            errors.push("notifications.queue_capacity must be > 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }

    fn check_non_negative(value: f64, name: &str, errors: &mut Vec<String>) {
        if !value.is_finite() || value < 0.0 {
            errors.push(format!("{name} must be a finite, non-negative number (got {value})"));
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Config I/O error ({}): {}", .0.display(), .1)]
    Io(PathBuf, #[source] std::io::Error),

    #[error("Config parse error ({}): {}", .0.display(), .1)]
    Parse(PathBuf, #[source] toml::de::Error),

    #[error("Config serialization error: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Config validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),
}

// ============================================================================
// Channels
// ============================================================================

/// Logical channel (topic) names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    pub weather_topic: String,
    pub yield_topic: String,
    pub metrics_topic: String,
    pub output_topic: String,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            weather_topic: defaults::WEATHER_TOPIC.to_string(),
            yield_topic: defaults::YIELD_TOPIC.to_string(),
            metrics_topic: defaults::METRICS_TOPIC.to_string(),
            output_topic: defaults::OUTPUT_TOPIC.to_string(),
        }
    }
}

// ============================================================================
// Windows
// ============================================================================

/// How several samples on the same calendar day collapse into one bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DailyAggregation {
    /// Daily total (precipitation accumulates)
    #[default]
    Sum,
    Mean,
    Max,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub soil_moisture_window_minutes: u64,
    /// Retention for TMAX/TMIN/WIND and other instantaneous metrics
    pub rolling_window_days: u64,
    pub daily_aggregation: DailyAggregation,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            soil_moisture_window_minutes: defaults::SOIL_MOISTURE_WINDOW_MINUTES,
            rolling_window_days: defaults::ROLLING_WINDOW_DAYS,
            daily_aggregation: DailyAggregation::default(),
        }
    }
}

impl WindowConfig {
    pub fn soil_moisture_window(&self) -> chrono::Duration {
        i64::try_from(self.soil_moisture_window_minutes)
            .ok()
            .and_then(chrono::Duration::try_minutes)
            .unwrap_or(chrono::Duration::MAX)
    }

    pub fn rolling_window(&self) -> chrono::Duration {
        i64::try_from(self.rolling_window_days)
            .ok()
            .and_then(chrono::Duration::try_days)
            .unwrap_or(chrono::Duration::MAX)
    }
}

// ============================================================================
// Environmental rules
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DroughtConfig {
    pub drought_days: u32,
    pub precip_threshold: f64,
}

impl Default for DroughtConfig {
    fn default() -> Self {
        Self {
            drought_days: defaults::DROUGHT_DAYS,
            precip_threshold: defaults::PRECIP_THRESHOLD,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FloodConfig {
    pub window_days: u32,
    pub flood_threshold: f64,
}

impl Default for FloodConfig {
    fn default() -> Self {
        Self {
            window_days: defaults::FLOOD_WINDOW_DAYS,
            flood_threshold: defaults::FLOOD_THRESHOLD,
        }
    }
}

// ============================================================================
// Operational monitoring
// ============================================================================

/// Per-metric breach thresholds. Metrics not listed are never alerted on.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OperationalConfig {
    pub thresholds: BTreeMap<String, f64>,
}

impl Default for OperationalConfig {
    fn default() -> Self {
        let mut thresholds = BTreeMap::new();
        thresholds.insert("lag".to_string(), defaults::LAG_THRESHOLD);
        thresholds.insert("error_rate".to_string(), defaults::ERROR_RATE_THRESHOLD);
        Self { thresholds }
    }
}

/// Liveness monitoring: stream name → allowed silence in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub check_interval_secs: u64,
    pub streams: BTreeMap<String, u64>,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: defaults::HEARTBEAT_CHECK_INTERVAL_SECS,
            streams: BTreeMap::new(),
        }
    }
}

impl HeartbeatConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub fn timeouts(&self) -> BTreeMap<String, chrono::Duration> {
        self.streams
            .iter()
            .map(|(stream, secs)| {
                let timeout = i64::try_from(*secs)
                    .ok()
                    .and_then(chrono::Duration::try_seconds)
                    .unwrap_or(chrono::Duration::MAX);
                (stream.clone(), timeout)
            })
            .collect()
    }
}

// ============================================================================
// Enrichment
// ============================================================================

/// Which entity's windows enrich a yield report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntitySelection {
    /// Configured target when it has data, else the first entity with any window
    #[default]
    TargetOrAny,
    /// Configured target only; no substitution
    TargetOnly,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EnrichmentConfig {
    pub target_entity: Option<String>,
    pub selection: EntitySelection,
    /// Fail with `InsufficientContext` instead of emitting null aggregates
    pub require_weather_context: bool,
}

impl EnrichmentConfig {
    /// Target entity, treating an empty string as unset.
    pub fn target_entity(&self) -> Option<&str> {
        self.target_entity
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}

// ============================================================================
// Notifications
// ============================================================================

/// Notification gateway settings. Credentials come from the environment
/// (`SMS_ACCOUNT_SID`, `SMS_AUTH_TOKEN`); numbers may be set here or via
/// `SMS_FROM_NUMBER` / `SMS_TO_NUMBER`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    pub enabled: bool,
    pub gateway_url: String,
    pub from_number: Option<String>,
    pub to_number: Option<String>,
    pub queue_capacity: usize,
    pub request_timeout_secs: u64,
    /// Also notify on drought/flood signal activation
    pub notify_environmental_signals: bool,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            gateway_url: defaults::SMS_GATEWAY_URL.to_string(),
            from_number: None,
            to_number: None,
            queue_capacity: defaults::NOTIFICATION_QUEUE_CAPACITY,
            request_timeout_secs: defaults::SMS_REQUEST_TIMEOUT_SECS,
            notify_environmental_signals: true,
        }
    }
}

// ============================================================================
// Storage & Server
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(defaults::DATA_DIR),
        }
    }
}

impl StorageConfig {
    pub fn incident_db_path(&self) -> PathBuf {
        self.data_dir.join(defaults::INCIDENT_DB_NAME)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: defaults::SERVER_ADDR.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = StreamConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.drought.drought_days, 3);
        assert_eq!(config.operational.thresholds.get("lag"), Some(&1000.0));
        assert_eq!(config.windows.daily_aggregation, DailyAggregation::Sum);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = StreamConfig::from_toml_str(
            r#"
[drought]
precip_threshold = 1.0

[heartbeats.streams]
weather = 300
"#,
        )
        .unwrap();
        assert_eq!(config.drought.drought_days, 3);
        assert!((config.drought.precip_threshold - 1.0).abs() < f64::EPSILON);
        assert_eq!(config.heartbeats.streams.get("weather"), Some(&300));
        assert_eq!(config.channels.weather_topic, "weather");
    }

    #[test]
    fn test_validation_collects_all_errors() {
        let mut config = StreamConfig::default();
        config.drought.drought_days = 0;
        config.flood.flood_threshold = f64::NAN;
        config.notifications.queue_capacity = 0;
        match config.validate() {
            Err(ConfigError::Validation(errors)) => assert_eq!(errors.len(), 3),
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn test_target_only_requires_target() {
        let mut config = StreamConfig::default();
        config.enrichment.selection = EntitySelection::TargetOnly;
        config.enrichment.target_entity = Some("  ".to_string());
        assert!(config.validate().is_err());

        config.enrichment.target_entity = Some("GHCND:USW00003952".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_duplicate_input_topics_rejected() {
        let mut config = StreamConfig::default();
        config.channels.yield_topic = "weather".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_round_trip() {
        let config = StreamConfig::default();
        let text = config.to_toml().unwrap();
        let back = StreamConfig::from_toml_str(&text).unwrap();
        assert_eq!(back.channels, config.channels);
    }
}
