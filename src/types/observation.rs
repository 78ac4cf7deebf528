//! Observation types carried on the input channels

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Metric name that marks a metrics-channel event as a liveness heartbeat.
pub const HEARTBEAT_METRIC: &str = "heartbeat";

/// Kind of weather measurement.
///
/// Parsing is case-insensitive and accepts the GHCND short codes
/// (`SM` for soil moisture, `AWND` for average wind speed). Anything
/// unrecognised is kept verbatim (upper-cased) in [`MetricKind::Other`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MetricKind {
    /// Daily maximum temperature
    Tmax,
    /// Daily minimum temperature
    Tmin,
    /// Precipitation
    Prcp,
    /// Wind speed
    Wind,
    /// Volumetric soil moisture
    SoilMoisture,
    Other(String),
}

impl MetricKind {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_uppercase().as_str() {
            "TMAX" => Self::Tmax,
            "TMIN" => Self::Tmin,
            "PRCP" => Self::Prcp,
            "WIND" | "AWND" => Self::Wind,
            "SM" | "SOIL_MOISTURE" => Self::SoilMoisture,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Tmax => "TMAX",
            Self::Tmin => "TMIN",
            Self::Prcp => "PRCP",
            Self::Wind => "WIND",
            Self::SoilMoisture => "SOIL_MOISTURE",
            Self::Other(name) => name,
        }
    }
}

impl From<String> for MetricKind {
    fn from(raw: String) -> Self {
        Self::parse(&raw)
    }
}

impl From<MetricKind> for String {
    fn from(kind: MetricKind) -> Self {
        kind.as_str().to_string()
    }
}

impl std::fmt::Display for MetricKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A single station measurement. Immutable once ingested.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherObservation {
    /// Station identifier (e.g. `GHCND:USW00003952`)
    pub entity_id: String,
    pub observed_at: DateTime<Utc>,
    pub metric_kind: MetricKind,
    pub value: f64,
}

/// Annual yield figure for one region and commodity. Immutable once ingested.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct YieldReport {
    pub region: String,
    pub commodity: String,
    pub year: i32,
    pub yield_value: f64,
}

/// Operational metric reported by (or about) a named stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricEvent {
    pub stream: String,
    /// Metric name, e.g. `lag`, `error_rate` or `heartbeat`
    pub metric: String,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

impl MetricEvent {
    pub fn is_heartbeat(&self) -> bool {
        self.metric.eq_ignore_ascii_case(HEARTBEAT_METRIC)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metric_kind_aliases() {
        assert_eq!(MetricKind::parse("sm"), MetricKind::SoilMoisture);
        assert_eq!(MetricKind::parse("SOIL_MOISTURE"), MetricKind::SoilMoisture);
        assert_eq!(MetricKind::parse("AWND"), MetricKind::Wind);
        assert_eq!(MetricKind::parse(" prcp "), MetricKind::Prcp);
        assert_eq!(MetricKind::parse("snwd"), MetricKind::Other("SNWD".to_string()));
    }

    #[test]
    fn test_metric_kind_serde_uses_canonical_name() {
        let json = serde_json::to_string(&MetricKind::SoilMoisture).unwrap();
        assert_eq!(json, "\"SOIL_MOISTURE\"");
        let back: MetricKind = serde_json::from_str("\"SM\"").unwrap();
        assert_eq!(back, MetricKind::SoilMoisture);
    }

    #[test]
    fn test_heartbeat_detection_is_case_insensitive() {
        let event = MetricEvent {
            stream: "ingest-a".to_string(),
            metric: "Heartbeat".to_string(),
            value: 1.0,
            timestamp: Utc::now(),
        };
        assert!(event.is_heartbeat());
    }
}
