//! Enrichment Engine - joins current weather context onto yield reports

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::config::{EnrichmentConfig, EntitySelection};
use crate::detection::AnomalyState;
use crate::types::{EnrichedYieldRecord, MetricKind, SignalKind, YieldReport};
use crate::window::WindowStore;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnrichmentError {
    /// Only raised when `require_weather_context` is set
    #[error("insufficient weather context for {region}/{commodity}: {reason}")]
    InsufficientContext {
        region: String,
        commodity: String,
        reason: String,
    },
}

pub struct EnrichmentEngine {
    config: EnrichmentConfig,
}

impl EnrichmentEngine {
    pub fn new(config: EnrichmentConfig) -> Self {
        Self { config }
    }

    /// Entity whose windows supply the context.
    ///
    /// The configured target wins when it has any window state. Under
    /// `target_or_any` the first entity ever observed is used otherwise;
    /// `target_only` never substitutes.
    pub fn select_entity<'a>(&'a self, windows: &'a WindowStore) -> Option<&'a str> {
        match (self.config.target_entity(), self.config.selection) {
            (Some(target), _) if windows.has_entity(target) => Some(target),
            (_, EntitySelection::TargetOnly) => None,
            (_, EntitySelection::TargetOrAny) => windows.first_entity(),
        }
    }

    /// Build the enriched record for `report` from the current window state.
    pub fn enrich(
        &self,
        report: &YieldReport,
        windows: &WindowStore,
        anomalies: &BTreeMap<String, AnomalyState>,
        now: DateTime<Utc>,
    ) -> Result<EnrichedYieldRecord, EnrichmentError> {
        let entity = self.select_entity(windows);

        let avg = |kind: MetricKind| entity.and_then(|e| windows.rolling_average(e, &kind));
        let avg_soil_moisture = avg(MetricKind::SoilMoisture);
        let avg_precipitation = avg(MetricKind::Prcp);
        let avg_temperature = match (avg(MetricKind::Tmax), avg(MetricKind::Tmin)) {
            (Some(tmax), Some(tmin)) => Some((tmax + tmin) / 2.0),
            _ => None,
        };
        let drought = entity
            .and_then(|e| anomalies.get(e))
            .is_some_and(|s| s.is_active(SignalKind::Drought));

        if self.config.require_weather_context {
            let reason = match entity {
                None => Some("no entity selected".to_string()),
                Some(e)
                    if avg_soil_moisture.is_none()
                        && avg_precipitation.is_none()
                        && avg_temperature.is_none() =>
                {
                    Some(format!("entity {e} has no usable aggregates"))
                }
                Some(_) => None,
            };
            if let Some(reason) = reason {
                return Err(EnrichmentError::InsufficientContext {
                    region: report.region.clone(),
                    commodity: report.commodity.clone(),
                    reason,
                });
            }
        }

        Ok(EnrichedYieldRecord {
            region: report.region.clone(),
            commodity: report.commodity.clone(),
            year: report.year,
            yield_value: report.yield_value,
            avg_soil_moisture,
            avg_precipitation,
            avg_temperature,
            drought,
            source_entity: entity.map(str::to_string),
            emitted_at: now,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::window::{Retention, RetentionPolicy};
    use chrono::TimeZone;

    fn ts(d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2022, 8, d, 6, 0, 0).unwrap()
    }

    fn report() -> YieldReport {
        YieldReport {
            region: "MISSOURI".to_string(),
            commodity: "CORN".to_string(),
            year: 2022,
            yield_value: 180.0,
        }
    }

    fn push(store: &mut WindowStore, entity: &str, kind: MetricKind, d: u32, value: f64) {
        let retention: Retention = RetentionPolicy::default().retention_for(&kind);
        store.update(entity, &kind, ts(d), value, retention);
    }

    #[test]
    fn test_avg_temperature_is_mean_of_tmax_and_tmin() {
        let mut store = WindowStore::new();
        push(&mut store, "S1", MetricKind::Tmax, 1, 80.0);
        push(&mut store, "S1", MetricKind::Tmax, 2, 90.0);
        push(&mut store, "S1", MetricKind::Tmin, 1, 65.0);

        let engine = EnrichmentEngine::new(EnrichmentConfig::default());
        let record = engine.enrich(&report(), &store, &BTreeMap::new(), ts(3)).unwrap();
        assert_eq!(record.avg_temperature, Some(75.0));
        assert_eq!(record.source_entity.as_deref(), Some("S1"));
        assert!(record.avg_precipitation.is_none());
        assert!(!record.drought);
    }

    #[test]
    fn test_avg_temperature_null_without_both_extremes() {
        let mut store = WindowStore::new();
        push(&mut store, "S1", MetricKind::Tmax, 1, 85.0);
        let engine = EnrichmentEngine::new(EnrichmentConfig::default());
        let record = engine.enrich(&report(), &store, &BTreeMap::new(), ts(2)).unwrap();
        assert!(record.avg_temperature.is_none());
    }

    #[test]
    fn test_target_entity_preferred_over_first_seen() {
        let mut store = WindowStore::new();
        push(&mut store, "S1", MetricKind::Prcp, 1, 1.0);
        push(&mut store, "S2", MetricKind::Prcp, 1, 9.0);

        let config = EnrichmentConfig {
            target_entity: Some("S2".to_string()),
            ..EnrichmentConfig::default()
        };
        let engine = EnrichmentEngine::new(config);
        assert_eq!(engine.select_entity(&store), Some("S2"));
        let record = engine.enrich(&report(), &store, &BTreeMap::new(), ts(2)).unwrap();
        assert_eq!(record.avg_precipitation, Some(9.0));
    }

    #[test]
    fn test_missing_target_falls_back_unless_target_only() {
        let mut store = WindowStore::new();
        push(&mut store, "S1", MetricKind::Tmax, 1, 85.0);

        let fallback = EnrichmentEngine::new(EnrichmentConfig {
            target_entity: Some("MISSING".to_string()),
            ..EnrichmentConfig::default()
        });
        assert_eq!(fallback.select_entity(&store), Some("S1"));

        let strict = EnrichmentEngine::new(EnrichmentConfig {
            target_entity: Some("MISSING".to_string()),
            selection: EntitySelection::TargetOnly,
            ..EnrichmentConfig::default()
        });
        assert_eq!(strict.select_entity(&store), None);
        let record = strict.enrich(&report(), &store, &BTreeMap::new(), ts(2)).unwrap();
        assert!(record.source_entity.is_none());
        assert!(record.avg_temperature.is_none());
    }

    #[test]
    fn test_drought_flag_comes_from_anomaly_state() {
        let mut store = WindowStore::new();
        push(&mut store, "S1", MetricKind::Prcp, 1, 0.1);
        let mut state = AnomalyState::default();
        state.signals.insert(
            SignalKind::Drought,
            crate::detection::SignalStatus {
                active_since: ts(1),
                evaluated_at: ts(1),
            },
        );
        let anomalies = BTreeMap::from([("S1".to_string(), state)]);

        let engine = EnrichmentEngine::new(EnrichmentConfig::default());
        let record = engine.enrich(&report(), &store, &anomalies, ts(2)).unwrap();
        assert!(record.drought);
    }

    #[test]
    fn test_require_context_rejects_empty_store() {
        let engine = EnrichmentEngine::new(EnrichmentConfig {
            require_weather_context: true,
            ..EnrichmentConfig::default()
        });
        let err = engine
            .enrich(&report(), &WindowStore::new(), &BTreeMap::new(), ts(1))
            .unwrap_err();
        assert!(matches!(err, EnrichmentError::InsufficientContext { .. }));
    }
}
