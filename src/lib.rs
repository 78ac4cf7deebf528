//! AgriStream: streaming weather/yield enrichment and alerting
//!
//! Consumes weather observations, yield reports and operational metrics from
//! named channels, keeps per-station rolling windows, raises drought/flood
//! signals and stream-health incidents, and emits yield records enriched with
//! the current weather context.
//!
//! ## Architecture
//!
//! - **Window Store**: bounded per-entity histories (rolling or day-bucketed)
//! - **Anomaly Detector**: drought/flood rules and operational thresholds
//! - **Enrichment Engine**: joins window aggregates onto yield reports
//! - **Record Publisher**: fixed-schema output onto a sink
//! - **Incident Manager**: dedup, persistence, acknowledgment, notification
//! - **Pipeline**: single-consumer coordinator and processing loop

pub mod config;
pub mod types;
pub mod window;
pub mod detection;
pub mod enrichment;
pub mod publisher;
pub mod incidents;
pub mod pipeline;
pub mod api;

// Re-export configuration
pub use config::StreamConfig;

// Re-export commonly used types
pub use types::{
    AlertKey, ChannelMessage, EnrichedYieldRecord, Incident, MetricEvent, MetricKind, SignalKind,
    WeatherObservation, YieldReport,
};

// Re-export components
pub use detection::AnomalyDetector;
pub use enrichment::{EnrichmentEngine, EnrichmentError};
pub use incidents::{IncidentManager, IncidentStore, InMemoryIncidentStore, SledIncidentStore};
pub use pipeline::{ProcessingLoop, StreamCoordinator};
pub use publisher::{PublishError, RecordPublisher};
pub use window::WindowStore;
