//! Stream Coordinator - routes one message at a time through the components
//!
//! The coordinator owns every piece of mutable pipeline state (windows,
//! anomaly state, incident active set). All work for a message completes
//! before [`StreamCoordinator::handle`] returns, which is what gives per-key
//! ordering.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::{ChannelConfig, StreamConfig};
use crate::detection::AnomalyDetector;
use crate::enrichment::{EnrichmentEngine, EnrichmentError};
use crate::incidents::{IncidentManager, Transition};
use crate::publisher::{PublishError, PublishReceipt, RecordPublisher};
use crate::types::ingress::{normalize_metric, normalize_weather, normalize_yield};
use crate::types::{AlertKey, ChannelMessage, MalformedMessage, MetricKind};
use crate::window::{RetentionPolicy, WindowStore, WindowSummary};

/// Per-run counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CoordinatorStats {
    pub messages_received: u64,
    pub weather_observations: u64,
    pub yield_reports: u64,
    pub metric_events: u64,
    pub heartbeats: u64,
    pub records_published: u64,
    pub malformed_messages: u64,
    pub unknown_topic: u64,
    pub enrichment_failures: u64,
    pub publish_failures: u64,
}

/// Why a message produced no effect.
#[derive(Debug, Clone, PartialEq)]
pub enum DropReason {
    UnknownTopic(String),
    Malformed(MalformedMessage),
    Enrichment(EnrichmentError),
    Publish(PublishError),
}

/// What handling one message did.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Weather observation folded into its window
    Observed {
        entity_id: String,
        metric_kind: MetricKind,
        summary: WindowSummary,
        transitions: Vec<(AlertKey, Transition)>,
    },
    /// Yield report enriched and emitted
    Published(PublishReceipt),
    /// Operational metric; `None` when no threshold applies
    Metric(Option<(AlertKey, Transition)>),
    /// Explicit heartbeat event
    Heartbeat(Transition),
    Dropped(DropReason),
}

pub struct StreamCoordinator {
    channels: ChannelConfig,
    retention: RetentionPolicy,
    windows: WindowStore,
    detector: AnomalyDetector,
    enrichment: EnrichmentEngine,
    publisher: RecordPublisher,
    incidents: IncidentManager,
    stats: CoordinatorStats,
}

impl StreamCoordinator {
    pub fn new(config: &StreamConfig, publisher: RecordPublisher, incidents: IncidentManager) -> Self {
        Self {
            channels: config.channels.clone(),
            retention: RetentionPolicy::from_config(config),
            windows: WindowStore::new(),
            detector: AnomalyDetector::new(config),
            enrichment: EnrichmentEngine::new(config.enrichment.clone()),
            publisher,
            incidents,
            stats: CoordinatorStats::default(),
        }
    }

    /// Route one message by topic. Never fails: every problem becomes a
    /// logged [`Outcome::Dropped`].
    pub async fn handle(&mut self, message: ChannelMessage, received_at: DateTime<Utc>) -> Outcome {
        self.stats.messages_received += 1;
        let topic = message.topic.as_str();

        let outcome = if topic == self.channels.weather_topic {
            self.incidents.record_heartbeat(topic, received_at);
            self.handle_weather(&message, received_at)
        } else if topic == self.channels.yield_topic {
            self.incidents.record_heartbeat(topic, received_at);
            self.handle_yield(&message, received_at).await
        } else if topic == self.channels.metrics_topic {
            self.incidents.record_heartbeat(topic, received_at);
            self.handle_metric(&message, received_at)
        } else {
            self.stats.unknown_topic += 1;
            debug!(topic = %topic, "Dropping message on unknown topic");
            Outcome::Dropped(DropReason::UnknownTopic(message.topic.clone()))
        };

        if let Outcome::Dropped(DropReason::Malformed(ref e)) = outcome {
            self.stats.malformed_messages += 1;
            warn!("{}", e);
        }
        outcome
    }

    fn handle_weather(&mut self, message: &ChannelMessage, now: DateTime<Utc>) -> Outcome {
        let obs = match normalize_weather(&message.payload) {
            Ok(obs) => obs,
            Err(e) => return Outcome::Dropped(DropReason::Malformed(e)),
        };
        self.stats.weather_observations += 1;

        let retention = self.retention.retention_for(&obs.metric_kind);
        let summary = self
            .windows
            .update(&obs.entity_id, &obs.metric_kind, obs.observed_at, obs.value, retention);

        let mut transitions = Vec::new();
        if obs.metric_kind == MetricKind::Prcp {
            if let Some(daily) = self.windows.daily(&obs.entity_id, &MetricKind::Prcp) {
                for eval in self.detector.evaluate_environment(&obs.entity_id, daily, now) {
                    let transition =
                        self.incidents
                            .evaluate(eval.key.clone(), eval.class, eval.breached, &eval.details, now);
                    if transition != Transition::Unchanged {
                        transitions.push((eval.key, transition));
                    }
                }
            }
        }

        debug!(
            entity = %obs.entity_id,
            metric = %obs.metric_kind,
            count = summary.count,
            "Window updated"
        );
        Outcome::Observed {
            entity_id: obs.entity_id,
            metric_kind: obs.metric_kind,
            summary,
            transitions,
        }
    }

    async fn handle_yield(&mut self, message: &ChannelMessage, now: DateTime<Utc>) -> Outcome {
        let report = match normalize_yield(&message.payload) {
            Ok(report) => report,
            Err(e) => return Outcome::Dropped(DropReason::Malformed(e)),
        };
        self.stats.yield_reports += 1;

        let record = match self
            .enrichment
            .enrich(&report, &self.windows, self.detector.active_states(), now)
        {
            Ok(record) => record,
            Err(e) => {
                self.stats.enrichment_failures += 1;
                warn!(region = %report.region, commodity = %report.commodity, "{}", e);
                return Outcome::Dropped(DropReason::Enrichment(e));
            }
        };

        match self.publisher.publish(&record).await {
            Ok(receipt) => {
                self.stats.records_published += 1;
                debug!(
                    region = %record.region,
                    commodity = %record.commodity,
                    sequence = receipt.sequence,
                    "Enriched record published"
                );
                Outcome::Published(receipt)
            }
            Err(e) => {
                self.stats.publish_failures += 1;
                warn!(region = %record.region, commodity = %record.commodity, error = %e, "Publish failed");
                Outcome::Dropped(DropReason::Publish(e))
            }
        }
    }

    fn handle_metric(&mut self, message: &ChannelMessage, now: DateTime<Utc>) -> Outcome {
        let event = match normalize_metric(&message.payload) {
            Ok(event) => event,
            Err(e) => return Outcome::Dropped(DropReason::Malformed(e)),
        };

        if event.is_heartbeat() {
            self.stats.heartbeats += 1;
            return Outcome::Heartbeat(self.incidents.record_heartbeat(&event.stream, now));
        }

        self.stats.metric_events += 1;
        let result = self.detector.evaluate_metric(&event).map(|eval| {
            let transition = self
                .incidents
                .evaluate(eval.key.clone(), eval.class, eval.breached, &eval.details, now);
            (eval.key, transition)
        });
        Outcome::Metric(result)
    }

    /// Periodic liveness check over every monitored stream.
    pub fn check_heartbeats(&mut self, now: DateTime<Utc>) -> Vec<(AlertKey, Transition)> {
        self.incidents.check_heartbeats(now)
    }

    pub fn acknowledge(&mut self, key: &AlertKey, now: DateTime<Utc>) -> bool {
        self.incidents.acknowledge(key, now)
    }

    /// Flush buffered output. Called once on shutdown.
    pub async fn flush(&mut self) -> Result<(), PublishError> {
        self.publisher.flush().await
    }

    pub fn stats(&self) -> &CoordinatorStats {
        &self.stats
    }

    pub fn windows(&self) -> &WindowStore {
        &self.windows
    }

    pub fn detector(&self) -> &AnomalyDetector {
        &self.detector
    }

    pub fn incidents(&self) -> &IncidentManager {
        &self.incidents
    }

    pub fn incidents_mut(&mut self) -> &mut IncidentManager {
        &mut self.incidents
    }

    pub fn sink_name(&self) -> &str {
        self.publisher.sink_name()
    }
}
