//! Single-consumer processing loop.
//!
//! One `select!` multiplexes, in priority order:
//!
//! 1. cancellation
//! 2. control commands from the API (acknowledgments)
//! 3. the periodic heartbeat check
//! 4. the next input message
//!
//! Every arm runs to completion on this task before the next is polled, so
//! the coordinator has exactly one mutator.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::source::{MessageSource, SourceEvent};
use super::{AppState, CoordinatorStats, StreamCoordinator, SystemStatus};
use crate::types::AlertKey;

/// Requests from outside the dispatch path.
#[derive(Debug)]
pub enum ControlCommand {
    /// Close the open incident for `key`; replies `false` if none was open.
    Acknowledge {
        key: AlertKey,
        respond_to: oneshot::Sender<bool>,
    },
}

/// Owns the coordinator for the lifetime of the loop.
///
/// Built with [`new()`](ProcessingLoop::new), optionally given a control
/// channel with [`with_control()`](ProcessingLoop::with_control), then
/// consumed by [`run()`](ProcessingLoop::run).
pub struct ProcessingLoop {
    coordinator: StreamCoordinator,
    app_state: Arc<RwLock<AppState>>,
    cancel_token: CancellationToken,
    heartbeat_interval: Duration,
    control_rx: Option<mpsc::Receiver<ControlCommand>>,
}

impl ProcessingLoop {
    pub fn new(
        coordinator: StreamCoordinator,
        app_state: Arc<RwLock<AppState>>,
        cancel_token: CancellationToken,
        heartbeat_interval: Duration,
    ) -> Self {
        Self {
            coordinator,
            app_state,
            cancel_token,
            heartbeat_interval,
            control_rx: None,
        }
    }

    pub fn with_control(mut self, control_rx: mpsc::Receiver<ControlCommand>) -> Self {
        self.control_rx = Some(control_rx);
        self
    }

    /// Run until the source is exhausted or cancellation. Output is flushed
    /// before returning.
    pub async fn run<S: MessageSource>(mut self, source: &mut S) -> CoordinatorStats {
        info!("[StreamProcessor] Consuming channels from {}", source.source_name());
        {
            let mut state = self.app_state.write().await;
            state.status = SystemStatus::Streaming;
            state.source = source.source_name().to_string();
            state.sink = self.coordinator.sink_name().to_string();
        }
        self.publish_state().await;

        let mut heartbeat_timer = tokio::time::interval(self.heartbeat_interval.max(Duration::from_millis(1)));
        heartbeat_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // First tick completes immediately; the first check is one interval in
        heartbeat_timer.tick().await;

        let final_status = loop {
            tokio::select! {
                biased;

                _ = self.cancel_token.cancelled() => {
                    info!("[StreamProcessor] Shutdown signal received");
                    break SystemStatus::Stopped;
                }

                command = recv_control(&mut self.control_rx) => {
                    match command {
                        Some(command) => self.handle_control(command),
                        None => self.control_rx = None,
                    }
                }

                _ = heartbeat_timer.tick() => {
                    let now = chrono::Utc::now();
                    for (key, transition) in self.coordinator.check_heartbeats(now) {
                        tracing::debug!(key = %key, ?transition, "Heartbeat check");
                    }
                }

                result = source.next_message() => {
                    match result {
                        Ok(SourceEvent::Message(message)) => {
                            let now = chrono::Utc::now();
                            self.coordinator.handle(message, now).await;
                            self.app_state.write().await.last_message_at = Some(now);
                        }
                        Ok(SourceEvent::Eof) => {
                            info!(
                                "[StreamProcessor] Source reached end ({} messages processed)",
                                self.coordinator.stats().messages_received
                            );
                            break SystemStatus::Drained;
                        }
                        Err(e) => {
                            warn!("[StreamProcessor] Source error: {}", e);
                            break SystemStatus::Stopped;
                        }
                    }
                }
            }
            self.publish_state().await;
        };

        if let Err(e) = self.coordinator.flush().await {
            warn!("[StreamProcessor] Failed to flush output: {}", e);
        }

        self.app_state.write().await.status = final_status;
        self.publish_state().await;

        let stats = self.coordinator.stats().clone();
        log_final_stats(&stats);
        stats
    }

    fn handle_control(&mut self, command: ControlCommand) {
        match command {
            ControlCommand::Acknowledge { key, respond_to } => {
                let closed = self.coordinator.acknowledge(&key, chrono::Utc::now());
                if !closed {
                    info!(key = %key, "Acknowledge ignored: no open incident");
                }
                // Requester may have timed out
                let _ = respond_to.send(closed);
            }
        }
    }

    /// Copy the coordinator's view into the shared snapshot.
    async fn publish_state(&self) {
        let mut state = self.app_state.write().await;
        state.stats = self.coordinator.stats().clone();
        state.incident_stats = self.coordinator.incidents().stats().clone();
        state.window_count = self.coordinator.windows().len();
        state.active_alerts = self.coordinator.incidents().active_alerts().cloned().collect();
        state.signals = self.coordinator.detector().active_states().clone();
    }

    pub fn coordinator(&self) -> &StreamCoordinator {
        &self.coordinator
    }
}

async fn recv_control(rx: &mut Option<mpsc::Receiver<ControlCommand>>) -> Option<ControlCommand> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

fn log_final_stats(stats: &CoordinatorStats) {
    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    info!("FINAL STATISTICS");
    info!("   Messages Received:    {}", stats.messages_received);
    info!("   Weather Observations: {}", stats.weather_observations);
    info!("   Yield Reports:        {}", stats.yield_reports);
    info!("   Records Published:    {}", stats.records_published);
    info!("   Metric Events:        {}", stats.metric_events);
    info!("   Heartbeats:           {}", stats.heartbeats);
    info!("   Malformed Dropped:    {}", stats.malformed_messages);
    info!("   Unknown Topic:        {}", stats.unknown_topic);
    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
}
