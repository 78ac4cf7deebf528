//! Shared data structures for the weather/yield streaming pipeline
//!
//! - Ingress: `ChannelMessage` envelope and boundary normalization
//! - Observations: `WeatherObservation`, `YieldReport`, `MetricEvent`
//! - Output: `EnrichedYieldRecord`
//! - Alerts: `AlertKey`, `Incident`, `SignalKind`

mod observation;
pub mod ingress;
mod record;
mod incident;

pub use observation::*;
pub use ingress::{ChannelMessage, MalformedMessage};
pub use record::*;
pub use incident::*;
