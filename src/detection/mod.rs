//! Anomaly Detector - threshold rules over window state
//!
//! Two families:
//!
//! - **Environmental** (drought, flood): pure functions of the precipitation
//!   day-bucketed window. Each evaluation sets or clears the entity's
//!   [`AnomalyState`]; nothing is remembered beyond the current window.
//! - **Operational**: a metrics event breaches when `value > threshold`.
//!   Metrics without a configured threshold are ignored.
//!
//! Every evaluation (breached or not) is returned as an [`Evaluation`] and
//! handed to the incident manager, which owns open/closed lifecycle.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

use crate::config::{DroughtConfig, FloodConfig, StreamConfig};
use crate::types::{AlertClass, AlertKey, MetricEvent, SignalKind};
use crate::window::DailyWindow;

/// Outcome of one rule evaluation, fed to `IncidentManager::evaluate`.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub key: AlertKey,
    pub class: AlertClass,
    pub breached: bool,
    pub details: String,
}

// ============================================================================
// Anomaly State
// ============================================================================

/// When a signal became active and when it was last re-confirmed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SignalStatus {
    pub active_since: DateTime<Utc>,
    pub evaluated_at: DateTime<Utc>,
}

/// Active environmental signals for one entity.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AnomalyState {
    pub signals: BTreeMap<SignalKind, SignalStatus>,
}

impl AnomalyState {
    pub fn is_active(&self, kind: SignalKind) -> bool {
        self.signals.contains_key(&kind)
    }

    pub fn is_empty(&self) -> bool {
        self.signals.is_empty()
    }

    fn apply(&mut self, kind: SignalKind, active: bool, now: DateTime<Utc>) {
        if active {
            self.signals
                .entry(kind)
                .and_modify(|s| s.evaluated_at = now)
                .or_insert(SignalStatus {
                    active_since: now,
                    evaluated_at: now,
                });
        } else {
            self.signals.remove(&kind);
        }
    }
}

// ============================================================================
// Environmental rules
// ============================================================================

/// Drought holds when the trailing `drought_days` calendar days ending at the
/// latest observed day all have a bucket, and every bucket is strictly below
/// `precip_threshold`.
pub fn drought_active(window: &DailyWindow, config: &DroughtConfig) -> (bool, String) {
    let n = config.drought_days;
    let trailing = window.trailing(n);
    let covered = trailing.len() == usize::try_from(n).unwrap_or(usize::MAX);
    let dry = trailing.iter().all(|(_, v)| *v < config.precip_threshold);

    if covered && dry {
        let values: Vec<String> = trailing.iter().map(|(_, v)| format!("{v:.2}")).collect();
        (
            true,
            format!(
                "precipitation below {} for {} consecutive days [{}]",
                config.precip_threshold,
                n,
                values.join(", ")
            ),
        )
    } else if !covered {
        (false, format!("{} of {} trailing days observed", trailing.len(), n))
    } else {
        (false, format!("precipitation reached {} within last {} days", config.precip_threshold, n))
    }
}

/// Flood holds when the average daily precipitation over the trailing
/// `window_days` exceeds `flood_threshold`.
pub fn flood_active(window: &DailyWindow, config: &FloodConfig) -> (bool, String) {
    let trailing = window.trailing(config.window_days);
    if trailing.is_empty() {
        return (false, "no precipitation data".to_string());
    }
    #[allow(clippy::cast_precision_loss)]
    let average = trailing.iter().map(|(_, v)| v).sum::<f64>() / trailing.len() as f64;
    let active = average > config.flood_threshold;
    let cmp = if active { ">" } else { "<=" };
    (
        active,
        format!(
            "{}-day average precipitation {average:.2} {cmp} {}",
            config.window_days, config.flood_threshold
        ),
    )
}

// ============================================================================
// Detector
// ============================================================================

pub struct AnomalyDetector {
    drought: DroughtConfig,
    flood: FloodConfig,
    thresholds: BTreeMap<String, f64>,
    states: BTreeMap<String, AnomalyState>,
}

impl AnomalyDetector {
    pub fn new(config: &StreamConfig) -> Self {
        Self {
            drought: config.drought.clone(),
            flood: config.flood.clone(),
            thresholds: config
                .operational
                .thresholds
                .iter()
                .map(|(k, v)| (k.to_ascii_lowercase(), *v))
                .collect(),
            states: BTreeMap::new(),
        }
    }

    /// Re-evaluate drought and flood for `entity_id` after a precipitation
    /// update, refreshing its [`AnomalyState`].
    pub fn evaluate_environment(
        &mut self,
        entity_id: &str,
        window: &DailyWindow,
        now: DateTime<Utc>,
    ) -> Vec<Evaluation> {
        let state = self.states.entry(entity_id.to_string()).or_default();
        let mut evaluations = Vec::with_capacity(SignalKind::ALL.len());

        for kind in SignalKind::ALL {
            let (active, details) = match kind {
                SignalKind::Drought => drought_active(window, &self.drought),
                SignalKind::Flood => flood_active(window, &self.flood),
            };
            state.apply(kind, active, now);
            evaluations.push(Evaluation {
                key: AlertKey::signal(entity_id, kind),
                class: AlertClass::Signal,
                breached: active,
                details,
            });
        }

        if state.is_empty() {
            self.states.remove(entity_id);
        }
        evaluations
    }

    /// Threshold check for one metrics event. `None` when the metric has no
    /// configured threshold.
    pub fn evaluate_metric(&self, event: &MetricEvent) -> Option<Evaluation> {
        let threshold = *self.thresholds.get(&event.metric.to_ascii_lowercase())?;
        let breached = event.value > threshold;
        let details = if breached {
            format!("{}={} exceeds threshold {}", event.metric, event.value, threshold)
        } else {
            format!("{}={} within threshold {}", event.metric, event.value, threshold)
        };
        Some(Evaluation {
            key: AlertKey::metric(&event.stream, &event.metric),
            class: AlertClass::Incident,
            breached,
            details,
        })
    }

    pub fn state(&self, entity_id: &str) -> Option<&AnomalyState> {
        self.states.get(entity_id)
    }

    /// Entities with at least one active signal.
    pub fn active_states(&self) -> &BTreeMap<String, AnomalyState> {
        &self.states
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DailyAggregation;
    use chrono::TimeZone;

    fn day(d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 7, d, 0, 0, 0).unwrap()
    }

    fn prcp_window(values: &[(u32, f64)]) -> DailyWindow {
        let mut w = DailyWindow::new(7, DailyAggregation::Sum);
        for (d, v) in values {
            w.insert(day(*d), *v);
        }
        w
    }

    #[test]
    fn test_drought_requires_full_trailing_span() {
        let config = DroughtConfig::default();
        let (active, _) = drought_active(&prcp_window(&[(1, 0.5), (2, 0.3)]), &config);
        assert!(!active);

        let (active, details) = drought_active(&prcp_window(&[(1, 0.5), (2, 0.3), (3, 0.1)]), &config);
        assert!(active, "{details}");
    }

    #[test]
    fn test_drought_gap_breaks_contiguity() {
        let config = DroughtConfig::default();
        let (active, _) = drought_active(&prcp_window(&[(1, 0.1), (2, 0.1), (4, 0.1)]), &config);
        assert!(!active);
    }

    #[test]
    fn test_drought_threshold_is_strict() {
        let config = DroughtConfig::default();
        let (active, _) = drought_active(&prcp_window(&[(1, 0.1), (2, 2.0), (3, 0.1)]), &config);
        assert!(!active);
    }

    #[test]
    fn test_flood_uses_trailing_average() {
        let config = FloodConfig::default();
        let (active, _) = flood_active(&prcp_window(&[(1, 30.0), (2, 15.0)]), &config);
        assert!(active);
        let (active, _) = flood_active(&prcp_window(&[(1, 30.0), (2, 5.0)]), &config);
        assert!(!active);
    }

    #[test]
    fn test_environment_state_sets_and_clears() {
        let mut detector = AnomalyDetector::new(&StreamConfig::default());
        let mut w = prcp_window(&[(1, 0.5), (2, 0.3), (3, 0.1)]);

        let evals = detector.evaluate_environment("S1", &w, day(3));
        let drought = evals.iter().find(|e| e.key.kind == "drought").unwrap();
        assert!(drought.breached);
        assert_eq!(drought.class, AlertClass::Signal);
        assert!(detector.state("S1").unwrap().is_active(SignalKind::Drought));

        w.insert(day(4), 5.0);
        let evals = detector.evaluate_environment("S1", &w, day(4));
        assert!(evals.iter().all(|e| !e.breached));
        assert!(detector.state("S1").is_none());
        assert!(detector.active_states().is_empty());
    }

    #[test]
    fn test_signal_active_since_survives_reconfirmation() {
        let mut detector = AnomalyDetector::new(&StreamConfig::default());
        let mut w = prcp_window(&[(1, 0.5), (2, 0.3), (3, 0.1)]);
        detector.evaluate_environment("S1", &w, day(3));
        w.insert(day(4), 0.0);
        detector.evaluate_environment("S1", &w, day(4));

        let status = detector.state("S1").unwrap().signals[&SignalKind::Drought];
        assert_eq!(status.active_since, day(3));
        assert_eq!(status.evaluated_at, day(4));
    }

    #[test]
    fn test_metric_threshold() {
        let detector = AnomalyDetector::new(&StreamConfig::default());
        let mut event = MetricEvent {
            stream: "ingest-a".to_string(),
            metric: "lag".to_string(),
            value: 1500.0,
            timestamp: day(1),
        };
        let eval = detector.evaluate_metric(&event).unwrap();
        assert!(eval.breached);
        assert_eq!(eval.key.to_string(), "ingest-a:lag");
        assert_eq!(eval.class, AlertClass::Incident);

        event.value = 1000.0;
        assert!(!detector.evaluate_metric(&event).unwrap().breached);

        event.metric = "throughput".to_string();
        assert!(detector.evaluate_metric(&event).is_none());
    }
}
