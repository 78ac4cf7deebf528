//! Record Publisher - fixed-schema serialization onto the output channel
//!
//! ## Output schema
//!
//! ```text
//! region:            string        (required)
//! commodity:         string        (required)
//! year:              int           (required)
//! yield:             float         (required)
//! avg_precipitation: float | null
//! avg_temperature:   float | null
//! avg_soil_moisture: float | null
//! drought:           bool
//! event_time:        ISO-8601 UTC  (required)
//! ```
//!
//! Publishing is fire-and-forget: a successful [`RecordPublisher::publish`]
//! means the sink accepted the bytes, not that they are durable.

mod sink;

pub use sink::{ChannelSink, JsonLinesSink, OutboundRecord, RecordSink};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::EnrichedYieldRecord;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PublishError {
    /// A required field is absent or invalid
    #[error("serialization error: {0}")]
    Serialization(String),
    /// The output channel rejected the write
    #[error("transport error: {0}")]
    Transport(String),
}

/// Wire form of an enriched record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireRecord {
    pub region: String,
    pub commodity: String,
    pub year: i32,
    #[serde(rename = "yield")]
    pub yield_value: f64,
    pub avg_precipitation: Option<f64>,
    pub avg_temperature: Option<f64>,
    pub avg_soil_moisture: Option<f64>,
    pub drought: bool,
    pub event_time: String,
}

impl TryFrom<&EnrichedYieldRecord> for WireRecord {
    type Error = PublishError;

    fn try_from(record: &EnrichedYieldRecord) -> Result<Self, Self::Error> {
        if record.region.trim().is_empty() {
            return Err(PublishError::Serialization("region is required".to_string()));
        }
        if record.commodity.trim().is_empty() {
            return Err(PublishError::Serialization("commodity is required".to_string()));
        }
        if !record.yield_value.is_finite() {
            return Err(PublishError::Serialization(format!(
                "yield must be finite (got {})",
                record.yield_value
            )));
        }
        let finite = |v: Option<f64>| v.filter(|x| x.is_finite());
        Ok(Self {
            region: record.region.clone(),
            commodity: record.commodity.clone(),
            year: record.year,
            yield_value: record.yield_value,
            avg_precipitation: finite(record.avg_precipitation),
            avg_temperature: finite(record.avg_temperature),
            avg_soil_moisture: finite(record.avg_soil_moisture),
            drought: record.drought,
            event_time: record.emitted_at.to_rfc3339_opts(SecondsFormat::Millis, true),
        })
    }
}

/// Acknowledgment that the sink accepted a record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PublishReceipt {
    pub topic: String,
    /// 1-based count of records this publisher has emitted
    pub sequence: u64,
    pub bytes: usize,
    pub published_at: DateTime<Utc>,
}

pub struct RecordPublisher {
    topic: String,
    sink: Box<dyn RecordSink>,
    sequence: u64,
}

impl RecordPublisher {
    pub fn new(topic: impl Into<String>, sink: Box<dyn RecordSink>) -> Self {
        Self {
            topic: topic.into(),
            sink,
            sequence: 0,
        }
    }

    pub async fn publish(&mut self, record: &EnrichedYieldRecord) -> Result<PublishReceipt, PublishError> {
        let wire = WireRecord::try_from(record)?;
        let payload = serde_json::to_vec(&wire).map_err(|e| PublishError::Serialization(e.to_string()))?;
        self.sink.send(&self.topic, &payload).await?;

        self.sequence += 1;
        Ok(PublishReceipt {
            topic: self.topic.clone(),
            sequence: self.sequence,
            bytes: payload.len(),
            published_at: Utc::now(),
        })
    }

    pub async fn flush(&mut self) -> Result<(), PublishError> {
        self.sink.flush().await
    }

    pub fn published(&self) -> u64 {
        self.sequence
    }

    pub fn sink_name(&self) -> &str {
        self.sink.sink_name()
    }
}
