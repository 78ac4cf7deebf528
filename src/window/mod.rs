//! Window Store - bounded per-entity histories for rolling statistics
//!
//! Two retention regimes:
//!
//! - [`RollingWindow`]: time-bounded `(timestamp, value)` sequence, used for
//!   instantaneous metrics (soil moisture over minutes, temperature over days).
//! - [`DailyWindow`]: calendar-day buckets, used for daily metrics such as
//!   precipitation where same-day samples collapse into one value before the
//!   drought/flood rules look at them.
//!
//! Both purge against the *maximum* timestamp seen for the key, never the
//! last-appended one, so late (out-of-order) samples cannot shrink the
//! horizon. Summaries are recomputed on every mutation.
//!
//! Duplicate deliveries are appended like any other sample and bias the
//! averages; deduplication is the channel's job.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};

use crate::config::{DailyAggregation, StreamConfig};
use crate::types::MetricKind;

// ============================================================================
// Retention
// ============================================================================

/// Retention rule for one window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retention {
    /// Keep samples no older than `max_seen - duration`
    Rolling(Duration),
    /// Keep the trailing `days` calendar days, ending at the latest day seen
    Daily {
        days: u32,
        aggregation: DailyAggregation,
    },
}

/// Maps each metric kind to its retention regime.
#[derive(Debug, Clone)]
pub struct RetentionPolicy {
    pub soil_moisture: Duration,
    pub rolling: Duration,
    pub precipitation_days: u32,
    pub aggregation: DailyAggregation,
}

impl RetentionPolicy {
    /// Precipitation keeps enough days for both the drought span and the
    /// flood averaging window.
    pub fn from_config(config: &StreamConfig) -> Self {
        Self {
            soil_moisture: config.windows.soil_moisture_window(),
            rolling: config.windows.rolling_window(),
            precipitation_days: config.drought.drought_days.max(config.flood.window_days),
            aggregation: config.windows.daily_aggregation,
        }
    }

    pub fn retention_for(&self, kind: &MetricKind) -> Retention {
        match kind {
            MetricKind::SoilMoisture => Retention::Rolling(self.soil_moisture),
            MetricKind::Prcp => Retention::Daily {
                days: self.precipitation_days,
                aggregation: self.aggregation,
            },
            _ => Retention::Rolling(self.rolling),
        }
    }
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self::from_config(&StreamConfig::default())
    }
}

// ============================================================================
// Summary
// ============================================================================

/// Aggregate view of a window after its latest mutation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WindowSummary {
    pub count: usize,
    /// Rolling average; `None` only for an empty window
    pub average: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub latest_at: Option<DateTime<Utc>>,
}

impl WindowSummary {
    fn from_values(values: impl Iterator<Item = f64>, latest_at: Option<DateTime<Utc>>) -> Self {
        let mut count = 0usize;
        let mut sum = 0.0;
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        for v in values {
            count += 1;
            sum += v;
            min = min.min(v);
            max = max.max(v);
        }
        if count == 0 {
            return Self {
                latest_at,
                ..Self::default()
            };
        }
        #[allow(clippy::cast_precision_loss)]
        let average = sum / count as f64;
        Self {
            count,
            average: Some(average),
            min: Some(min),
            max: Some(max),
            latest_at,
        }
    }
}

// ============================================================================
// Rolling Window
// ============================================================================

/// Time-bounded, timestamp-ordered sample sequence.
#[derive(Debug, Clone)]
pub struct RollingWindow {
    entries: VecDeque<(DateTime<Utc>, f64)>,
    retention: Duration,
    max_seen: Option<DateTime<Utc>>,
    summary: WindowSummary,
}

impl RollingWindow {
    pub fn new(retention: Duration) -> Self {
        Self {
            entries: VecDeque::new(),
            retention,
            max_seen: None,
            summary: WindowSummary::default(),
        }
    }

    /// Insert in timestamp order (after any equal timestamps), then purge
    /// against the maximum timestamp seen.
    pub fn insert(&mut self, timestamp: DateTime<Utc>, value: f64) -> &WindowSummary {
        let reference = self.max_seen.map_or(timestamp, |m| m.max(timestamp));
        self.max_seen = Some(reference);

        let pos = self.entries.partition_point(|(t, _)| *t <= timestamp);
        self.entries.insert(pos, (timestamp, value));

        self.purge(reference);
        &self.summary
    }

    /// Drop entries older than `reference - retention`. Returns the number
    /// removed. Idempotent for a fixed `reference`.
    pub fn purge(&mut self, reference: DateTime<Utc>) -> usize {
        let mut removed = 0;
        if let Some(horizon) = reference.checked_sub_signed(self.retention) {
            while self.entries.front().is_some_and(|(t, _)| *t < horizon) {
                self.entries.pop_front();
                removed += 1;
            }
        }
        self.refresh();
        removed
    }

    fn refresh(&mut self) {
        self.summary = WindowSummary::from_values(self.entries.iter().map(|(_, v)| *v), self.max_seen);
    }

    pub fn summary(&self) -> &WindowSummary {
        &self.summary
    }

    pub fn entries(&self) -> impl Iterator<Item = &(DateTime<Utc>, f64)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ============================================================================
// Daily Window
// ============================================================================

/// All samples observed on one calendar day.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DayBucket {
    pub sum: f64,
    pub count: u32,
    pub max: f64,
}

impl DayBucket {
    fn new(value: f64) -> Self {
        Self {
            sum: value,
            count: 1,
            max: value,
        }
    }

    fn add(&mut self, value: f64) {
        self.sum += value;
        self.count += 1;
        self.max = self.max.max(value);
    }

    pub fn value(&self, aggregation: DailyAggregation) -> f64 {
        match aggregation {
            DailyAggregation::Sum => self.sum,
            DailyAggregation::Mean => self.sum / f64::from(self.count),
            DailyAggregation::Max => self.max,
        }
    }
}

/// Calendar-day bucketed window over the trailing `days` days.
#[derive(Debug, Clone)]
pub struct DailyWindow {
    buckets: BTreeMap<NaiveDate, DayBucket>,
    days: u32,
    aggregation: DailyAggregation,
    max_seen: Option<DateTime<Utc>>,
    summary: WindowSummary,
}

impl DailyWindow {
    pub fn new(days: u32, aggregation: DailyAggregation) -> Self {
        Self {
            buckets: BTreeMap::new(),
            days: days.max(1),
            aggregation,
            max_seen: None,
            summary: WindowSummary::default(),
        }
    }

    pub fn insert(&mut self, timestamp: DateTime<Utc>, value: f64) -> &WindowSummary {
        let reference = self.max_seen.map_or(timestamp, |m| m.max(timestamp));
        self.max_seen = Some(reference);

        self.buckets
            .entry(timestamp.date_naive())
            .and_modify(|b| b.add(value))
            .or_insert_with(|| DayBucket::new(value));

        self.purge(reference.date_naive());
        &self.summary
    }

    /// Drop buckets before `reference_day - (days - 1)`. Idempotent for a
    /// fixed reference day.
    pub fn purge(&mut self, reference_day: NaiveDate) -> usize {
        let before = self.buckets.len();
        if let Some(cutoff) = reference_day.checked_sub_days(chrono::Days::new(u64::from(self.days - 1))) {
            self.buckets = self.buckets.split_off(&cutoff);
        }
        self.refresh();
        before - self.buckets.len()
    }

    fn refresh(&mut self) {
        let aggregation = self.aggregation;
        self.summary =
            WindowSummary::from_values(self.buckets.values().map(|b| b.value(aggregation)), self.max_seen);
    }

    pub fn latest_day(&self) -> Option<NaiveDate> {
        self.buckets.keys().next_back().copied()
    }

    /// Aggregated bucket values, oldest day first.
    pub fn daily_values(&self) -> impl Iterator<Item = (NaiveDate, f64)> + '_ {
        let aggregation = self.aggregation;
        self.buckets.iter().map(move |(d, b)| (*d, b.value(aggregation)))
    }

    /// Bucket values for the trailing `n` calendar days ending at the latest
    /// day. Days with no bucket are simply absent.
    pub fn trailing(&self, n: u32) -> Vec<(NaiveDate, f64)> {
        let Some(latest) = self.latest_day() else {
            return Vec::new();
        };
        let start = latest
            .checked_sub_days(chrono::Days::new(u64::from(n.saturating_sub(1))))
            .unwrap_or(NaiveDate::MIN);
        let aggregation = self.aggregation;
        self.buckets
            .range(start..=latest)
            .map(|(d, b)| (*d, b.value(aggregation)))
            .collect()
    }

    pub fn summary(&self) -> &WindowSummary {
        &self.summary
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

// ============================================================================
// Window Store
// ============================================================================

#[derive(Debug, Clone)]
pub enum Window {
    Rolling(RollingWindow),
    Daily(DailyWindow),
}

impl Window {
    fn new(retention: Retention) -> Self {
        match retention {
            Retention::Rolling(duration) => Self::Rolling(RollingWindow::new(duration)),
            Retention::Daily { days, aggregation } => Self::Daily(DailyWindow::new(days, aggregation)),
        }
    }

    fn insert(&mut self, timestamp: DateTime<Utc>, value: f64) -> &WindowSummary {
        match self {
            Self::Rolling(w) => w.insert(timestamp, value),
            Self::Daily(w) => w.insert(timestamp, value),
        }
    }

    pub fn summary(&self) -> &WindowSummary {
        match self {
            Self::Rolling(w) => w.summary(),
            Self::Daily(w) => w.summary(),
        }
    }

    pub fn as_daily(&self) -> Option<&DailyWindow> {
        match self {
            Self::Daily(w) => Some(w),
            Self::Rolling(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct WindowKey {
    entity_id: String,
    metric_kind: MetricKind,
}

/// All windows, keyed by `(entity_id, metric_kind)`.
///
/// Owned by the stream coordinator and mutated only on its dispatch path.
#[derive(Debug, Default)]
pub struct WindowStore {
    windows: HashMap<WindowKey, Window>,
    /// Entities in first-seen order
    entity_order: Vec<String>,
}

impl WindowStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an observation and return the refreshed aggregate.
    ///
    /// `retention` only applies when the window is created; an existing
    /// window keeps its regime.
    pub fn update(
        &mut self,
        entity_id: &str,
        metric_kind: &MetricKind,
        timestamp: DateTime<Utc>,
        value: f64,
        retention: Retention,
    ) -> WindowSummary {
        if !self.entity_order.iter().any(|e| e == entity_id) {
            self.entity_order.push(entity_id.to_string());
        }
        let key = WindowKey {
            entity_id: entity_id.to_string(),
            metric_kind: metric_kind.clone(),
        };
        self.windows
            .entry(key)
            .or_insert_with(|| Window::new(retention))
            .insert(timestamp, value)
            .clone()
    }

    pub fn window(&self, entity_id: &str, metric_kind: &MetricKind) -> Option<&Window> {
        self.windows.get(&WindowKey {
            entity_id: entity_id.to_string(),
            metric_kind: metric_kind.clone(),
        })
    }

    pub fn summary(&self, entity_id: &str, metric_kind: &MetricKind) -> Option<&WindowSummary> {
        self.window(entity_id, metric_kind).map(Window::summary)
    }

    pub fn rolling_average(&self, entity_id: &str, metric_kind: &MetricKind) -> Option<f64> {
        self.summary(entity_id, metric_kind).and_then(|s| s.average)
    }

    /// Day-bucketed window for a daily metric, if one exists.
    pub fn daily(&self, entity_id: &str, metric_kind: &MetricKind) -> Option<&DailyWindow> {
        self.window(entity_id, metric_kind).and_then(Window::as_daily)
    }

    pub fn has_entity(&self, entity_id: &str) -> bool {
        self.entity_order.iter().any(|e| e == entity_id)
    }

    /// First entity that ever received an observation.
    pub fn first_entity(&self) -> Option<&str> {
        self.entity_order.first().map(String::as_str)
    }

    pub fn entities(&self) -> impl Iterator<Item = &str> {
        self.entity_order.iter().map(String::as_str)
    }

    /// Number of `(entity, metric)` windows.
    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }
}
