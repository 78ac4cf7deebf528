//! System-wide default constants.
//!
//! Grouped by subsystem. Every `Default` impl in `stream_config.rs` reads
//! from here.

// ============================================================================
// Channels
// ============================================================================

pub const WEATHER_TOPIC: &str = "weather";
pub const YIELD_TOPIC: &str = "yield";
pub const METRICS_TOPIC: &str = "metrics";
pub const OUTPUT_TOPIC: &str = "enriched_yield";

// ============================================================================
// Windows & environmental rules
// ============================================================================

/// Soil moisture rolling window (minutes).
pub const SOIL_MOISTURE_WINDOW_MINUTES: u64 = 5;

/// Rolling window for temperature, wind and other instantaneous metrics (days).
pub const ROLLING_WINDOW_DAYS: u64 = 7;

/// Consecutive dry days required to raise a drought signal.
pub const DROUGHT_DAYS: u32 = 3;

/// Daily precipitation strictly below this counts as a dry day (mm).
pub const PRECIP_THRESHOLD: f64 = 2.0;

/// Trailing days averaged for flood detection.
pub const FLOOD_WINDOW_DAYS: u32 = 7;

/// Average daily precipitation above this raises a flood signal (mm).
pub const FLOOD_THRESHOLD: f64 = 20.0;

// ============================================================================
// Operational monitoring
// ============================================================================

/// Consumer lag threshold (messages).
pub const LAG_THRESHOLD: f64 = 1000.0;

/// Error-rate threshold (fraction of messages).
pub const ERROR_RATE_THRESHOLD: f64 = 0.05;

/// How often monitored streams are checked for missed heartbeats (seconds).
pub const HEARTBEAT_CHECK_INTERVAL_SECS: u64 = 30;

// ============================================================================
// Notifications
// ============================================================================

/// Twilio-compatible REST API base URL.
pub const SMS_GATEWAY_URL: &str = "https://api.twilio.com/2010-04-01";

/// Pending notifications held before `dispatch()` starts failing.
pub const NOTIFICATION_QUEUE_CAPACITY: usize = 64;

/// HTTP timeout for a single gateway request (seconds).
pub const SMS_REQUEST_TIMEOUT_SECS: u64 = 10;

// ============================================================================
// Storage & server
// ============================================================================

pub const DATA_DIR: &str = "./data";

/// Sled database directory name under the data directory.
pub const INCIDENT_DB_NAME: &str = "incidents.db";

pub const SERVER_ADDR: &str = "0.0.0.0:8080";

/// Default page size for incident listings.
pub const INCIDENT_LIST_LIMIT: usize = 100;
