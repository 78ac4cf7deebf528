//! Alert identity, environmental signals and incident records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind used for stream liveness incidents (`<stream>:down`).
pub const STREAM_DOWN_KIND: &str = "down";

/// Identity used to deduplicate alerts: a subject (stream or entity) plus
/// the metric or incident type.
///
/// Rendered as `subject:kind`. Station identifiers may themselves contain
/// colons (`GHCND:USW00003952`), so parsing splits on the last one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AlertKey {
    pub subject: String,
    pub kind: String,
}

impl AlertKey {
    pub fn new(subject: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            kind: kind.into(),
        }
    }

    /// Operational threshold key for `stream` / `metric`.
    pub fn metric(stream: &str, metric: &str) -> Self {
        Self::new(stream, metric)
    }

    /// Liveness key for a monitored stream.
    pub fn stream_down(stream: &str) -> Self {
        Self::new(stream, STREAM_DOWN_KIND)
    }

    /// Environmental signal key for an entity.
    pub fn signal(entity_id: &str, signal: SignalKind) -> Self {
        Self::new(entity_id, signal.as_str())
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let (subject, kind) = raw.trim().rsplit_once(':')?;
        if subject.is_empty() || kind.is_empty() {
            return None;
        }
        Some(Self::new(subject, kind))
    }
}

impl std::fmt::Display for AlertKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.subject, self.kind)
    }
}

impl TryFrom<String> for AlertKey {
    type Error = String;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        Self::parse(&raw).ok_or_else(|| format!("invalid alert key '{raw}' (expected subject:kind)"))
    }
}

impl From<AlertKey> for String {
    fn from(key: AlertKey) -> Self {
        key.to_string()
    }
}

/// Durability class of an alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertClass {
    /// Persisted, acknowledgeable operational or liveness anomaly
    Incident,
    /// Self-clearing environmental anomaly; notified but never persisted
    Signal,
}

/// Environmental signal derived purely from current window state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    Drought,
    Flood,
}

impl SignalKind {
    pub const ALL: [Self; 2] = [Self::Drought, Self::Flood];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Drought => "drought",
            Self::Flood => "flood",
        }
    }
}

impl std::fmt::Display for SignalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted incident row.
///
/// Append-only: a breach after acknowledgment creates a new record. Only
/// `acknowledged` and `acknowledged_at` change after insertion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Incident {
    /// Store-assigned identifier (0 until persisted)
    pub id: u64,
    pub key: AlertKey,
    pub first_detected_at: DateTime<Utc>,
    pub last_notified_at: DateTime<Utc>,
    pub acknowledged: bool,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub details: String,
}

impl Incident {
    pub fn open(key: AlertKey, now: DateTime<Utc>, details: impl Into<String>) -> Self {
        Self {
            id: 0,
            key,
            first_detected_at: now,
            last_notified_at: now,
            acknowledged: false,
            acknowledged_at: None,
            details: details.into(),
        }
    }
}
