//! Application State and System Status
//!
//! Read-only snapshot of the dispatch path, published by the processing loop
//! after every message and read by the API handlers. The coordinator itself
//! is never shared.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Instant;

use crate::detection::AnomalyState;
use crate::incidents::{ActiveAlert, IncidentStats};

use super::CoordinatorStats;

// ============================================================================
// Application State
// ============================================================================

/// Shared application state, wrapped in `Arc<RwLock<>>`.
#[derive(Debug, Clone, Serialize)]
pub struct AppState {
    /// Process start (serializes as seconds via `uptime_secs()`)
    #[serde(skip)]
    pub started: Instant,

    pub status: SystemStatus,

    /// Name of the active message source
    pub source: String,

    /// Name of the output sink
    pub sink: String,

    pub stats: CoordinatorStats,

    pub incident_stats: IncidentStats,

    pub last_message_at: Option<DateTime<Utc>>,

    /// Number of `(entity, metric)` windows held
    pub window_count: usize,

    pub active_alerts: Vec<ActiveAlert>,

    /// Entities with active drought/flood signals
    pub signals: BTreeMap<String, AnomalyState>,
}

impl Default for AppState {
    fn default() -> Self {
        Self {
            started: Instant::now(),
            status: SystemStatus::Initializing,
            source: String::new(),
            sink: String::new(),
            stats: CoordinatorStats::default(),
            incident_stats: IncidentStats::default(),
            last_message_at: None,
            window_count: 0,
            active_alerts: Vec::new(),
            signals: BTreeMap::new(),
        }
    }
}

impl AppState {
    pub fn uptime_secs(&self) -> u64 {
        self.started.elapsed().as_secs()
    }
}

// ============================================================================
// System Status
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SystemStatus {
    /// Building components, restoring open incidents
    Initializing,
    /// Consuming input channels
    Streaming,
    /// Input exhausted; API still serving the final state
    Drained,
    /// Stop signal received
    Stopped,
}

impl std::fmt::Display for SystemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SystemStatus::Initializing => write!(f, "INITIALIZING"),
            SystemStatus::Streaming => write!(f, "STREAMING"),
            SystemStatus::Drained => write!(f, "DRAINED"),
            SystemStatus::Stopped => write!(f, "STOPPED"),
        }
    }
}
