//! Ingress boundary: channel envelope and payload normalization.
//!
//! Upstream producers disagree on field names (`station` vs `entity_id`,
//! `state_name` vs `region`, `Value` vs `yield`...). All of that is absorbed
//! here; everything past this module sees a single validated shape.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use super::{MetricEvent, MetricKind, WeatherObservation, YieldReport};

/// One message read from a named logical channel.
///
/// Wire form (one per line): `{"topic": "weather", "payload": {...}}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelMessage {
    pub topic: String,
    pub payload: Value,
}

impl ChannelMessage {
    pub fn new(topic: impl Into<String>, payload: Value) -> Self {
        Self {
            topic: topic.into(),
            payload,
        }
    }
}

/// Unparseable or incomplete input. Always dropped, never fatal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("malformed {channel} message: {reason}")]
pub struct MalformedMessage {
    pub channel: &'static str,
    pub reason: String,
}

impl MalformedMessage {
    fn new(channel: &'static str, reason: impl Into<String>) -> Self {
        Self {
            channel,
            reason: reason.into(),
        }
    }

    fn missing(channel: &'static str, field: &str) -> Self {
        Self::new(channel, format!("missing field `{field}`"))
    }

    fn invalid(channel: &'static str, field: &str, raw: impl std::fmt::Display) -> Self {
        Self::new(channel, format!("invalid {field} `{raw}`"))
    }
}

// ============================================================================
// Raw shapes (alias-tolerant)
// ============================================================================

#[derive(Debug, Deserialize)]
struct RawWeather {
    #[serde(default, alias = "entity_id")]
    station: Option<String>,
    #[serde(default, alias = "time", alias = "observed_at")]
    date: Option<String>,
    #[serde(default, alias = "metric_kind")]
    datatype: Option<String>,
    #[serde(default)]
    value: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct RawYield {
    #[serde(default, alias = "state", alias = "region")]
    state_name: Option<String>,
    #[serde(default, alias = "commodity")]
    commodity_desc: Option<String>,
    #[serde(default, alias = "Year")]
    year: Option<Value>,
    #[serde(default, rename = "Value", alias = "yield", alias = "value", alias = "yield_value")]
    value: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct RawMetric {
    #[serde(default)]
    stream: Option<String>,
    #[serde(default)]
    metric: Option<String>,
    #[serde(default)]
    value: Option<Value>,
    #[serde(default, alias = "time")]
    timestamp: Option<String>,
}

// ============================================================================
// Normalization
// ============================================================================

pub fn normalize_weather(payload: &Value) -> Result<WeatherObservation, MalformedMessage> {
    const CH: &str = "weather";
    let raw = RawWeather::deserialize(payload).map_err(|e| MalformedMessage::new(CH, e.to_string()))?;

    let entity_id = non_empty(raw.station).ok_or_else(|| MalformedMessage::missing(CH, "station"))?;
    let date = non_empty(raw.date).ok_or_else(|| MalformedMessage::missing(CH, "date"))?;
    let datatype = non_empty(raw.datatype).ok_or_else(|| MalformedMessage::missing(CH, "datatype"))?;
    let raw_value = raw.value.ok_or_else(|| MalformedMessage::missing(CH, "value"))?;

    let observed_at = parse_timestamp(&date).ok_or_else(|| MalformedMessage::invalid(CH, "date", &date))?;
    let value = number_field(&raw_value).ok_or_else(|| MalformedMessage::invalid(CH, "value", &raw_value))?;

    Ok(WeatherObservation {
        entity_id,
        observed_at,
        metric_kind: MetricKind::parse(&datatype),
        value,
    })
}

pub fn normalize_yield(payload: &Value) -> Result<YieldReport, MalformedMessage> {
    const CH: &str = "yield";
    let raw = RawYield::deserialize(payload).map_err(|e| MalformedMessage::new(CH, e.to_string()))?;

    let region = non_empty(raw.state_name).ok_or_else(|| MalformedMessage::missing(CH, "state_name"))?;
    let commodity =
        non_empty(raw.commodity_desc).ok_or_else(|| MalformedMessage::missing(CH, "commodity_desc"))?;
    let raw_year = raw.year.ok_or_else(|| MalformedMessage::missing(CH, "year"))?;
    let raw_value = raw.value.ok_or_else(|| MalformedMessage::missing(CH, "Value"))?;

    let year = year_field(&raw_year).ok_or_else(|| MalformedMessage::invalid(CH, "year", &raw_year))?;
    let yield_value =
        number_field(&raw_value).ok_or_else(|| MalformedMessage::invalid(CH, "Value", &raw_value))?;

    Ok(YieldReport {
        region,
        commodity,
        year,
        yield_value,
    })
}

pub fn normalize_metric(payload: &Value) -> Result<MetricEvent, MalformedMessage> {
    const CH: &str = "metrics";
    let raw = RawMetric::deserialize(payload).map_err(|e| MalformedMessage::new(CH, e.to_string()))?;

    let stream = non_empty(raw.stream).ok_or_else(|| MalformedMessage::missing(CH, "stream"))?;
    let metric = non_empty(raw.metric).ok_or_else(|| MalformedMessage::missing(CH, "metric"))?;
    let raw_value = raw.value.ok_or_else(|| MalformedMessage::missing(CH, "value"))?;
    let ts = non_empty(raw.timestamp).ok_or_else(|| MalformedMessage::missing(CH, "timestamp"))?;

    let value = number_field(&raw_value).ok_or_else(|| MalformedMessage::invalid(CH, "value", &raw_value))?;
    let timestamp = parse_timestamp(&ts).ok_or_else(|| MalformedMessage::invalid(CH, "timestamp", &ts))?;

    Ok(MetricEvent {
        stream,
        metric: metric.to_ascii_lowercase(),
        value,
        timestamp,
    })
}

/// Parse an ingress timestamp.
///
/// Accepts RFC 3339, a naive date-time (taken as UTC), or a bare date
/// (midnight UTC).
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

fn non_empty(field: Option<String>) -> Option<String> {
    field
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Numeric field that may arrive as a JSON number or a string
/// (USDA publishes `"1,234.5"`).
fn number_field(value: &Value) -> Option<f64> {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().replace(',', "").parse::<f64>().ok(),
        _ => None,
    };
    parsed.filter(|v| v.is_finite())
}

fn year_field(value: &Value) -> Option<i32> {
    match value {
        Value::Number(n) => n.as_i64().and_then(|y| i32::try_from(y).ok()),
        Value::String(s) => s.trim().parse::<i32>().ok(),
        _ => None,
    }
}
