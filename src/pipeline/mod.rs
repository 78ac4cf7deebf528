//! Streaming Pipeline Module
//!
//! ```text
//! MessageSource ──► ProcessingLoop ──► StreamCoordinator
//!                      ▲    │            ├─ weather ─► WindowStore ─► AnomalyDetector ─► IncidentManager
//!   API ─ControlCommand┘    │            ├─ yield   ─► EnrichmentEngine ─► RecordPublisher
//!                           ▼            └─ metrics ─► AnomalyDetector ─► IncidentManager
//!                       AppState (snapshot for the API)
//! ```
//!
//! Single consumer: one message is fully handled before the next is read.

mod state;
mod coordinator;
pub mod source;
pub mod processing_loop;

pub use state::*;
pub use coordinator::{CoordinatorStats, DropReason, Outcome, StreamCoordinator};
pub use processing_loop::{ControlCommand, ProcessingLoop};
