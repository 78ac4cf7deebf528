//! Enriched output record

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A yield report joined with the weather context available when it arrived.
///
/// Produced once per processed `YieldReport` and never mutated afterwards.
/// Weather aggregates are `None` when the selected entity has no window for
/// that metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedYieldRecord {
    pub region: String,
    pub commodity: String,
    pub year: i32,
    pub yield_value: f64,
    pub avg_soil_moisture: Option<f64>,
    pub avg_precipitation: Option<f64>,
    /// Mean of the TMAX and TMIN rolling averages; `None` unless both exist
    pub avg_temperature: Option<f64>,
    pub drought: bool,
    /// Entity whose windows supplied the weather context
    pub source_entity: Option<String>,
    pub emitted_at: DateTime<Utc>,
}
