//! Incident Manager - alert lifecycle, persistence and notification
//!
//! ## Lifecycle (per alert key)
//!
//! ```text
//! CLOSED --breach--> OPEN --breach--> OPEN (no repeat notification)
//!                      |
//!                      +--resolved / acknowledged--> CLOSED
//! ```
//!
//! Two alert classes share the lifecycle:
//!
//! - **Incidents** (operational thresholds, stream liveness) are persisted
//!   through the [`IncidentStore`] and can be acknowledged.
//! - **Signals** (drought, flood) are notified on activation and dropped on
//!   deactivation, never persisted.
//!
//! The in-memory active set is what suppresses duplicate notifications. It
//! is updated even when persistence fails, so a storage outage costs history,
//! not an SMS storm.

mod notify;
mod store;

pub use notify::{
    run_dispatch_worker, DispatchError, LogNotifier, Notification, NotificationDispatcher, Notifier,
    Recipients, SmsGateway,
};
pub use store::{InMemoryIncidentStore, IncidentStore, OpenOutcome, PersistenceError, SledIncidentStore};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::StreamConfig;
use crate::types::{AlertClass, AlertKey, Incident};

/// What an evaluation did to the key's lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Transition {
    Opened,
    StillOpen,
    Closed,
    Unchanged,
}

/// One entry of the in-memory active set.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActiveAlert {
    pub key: AlertKey,
    pub class: AlertClass,
    pub since: DateTime<Utc>,
    pub details: String,
    /// Store id; `None` for signals or when persistence failed
    pub incident_id: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IncidentStats {
    pub opened: u64,
    pub closed: u64,
    pub acknowledged: u64,
    pub notifications_queued: u64,
    pub dispatch_errors: u64,
    pub persistence_errors: u64,
}

pub struct IncidentManager {
    store: Arc<dyn IncidentStore>,
    dispatcher: NotificationDispatcher,
    active: BTreeMap<AlertKey, ActiveAlert>,
    heartbeats: HashMap<String, DateTime<Utc>>,
    heartbeat_timeouts: BTreeMap<String, Duration>,
    notifications_enabled: bool,
    notify_signals: bool,
    stats: IncidentStats,
}

impl IncidentManager {
    pub fn new(store: Arc<dyn IncidentStore>, dispatcher: NotificationDispatcher, config: &StreamConfig) -> Self {
        Self {
            store,
            dispatcher,
            active: BTreeMap::new(),
            heartbeats: HashMap::new(),
            heartbeat_timeouts: config.heartbeats.timeouts(),
            notifications_enabled: config.notifications.enabled,
            notify_signals: config.notifications.notify_environmental_signals,
            stats: IncidentStats::default(),
        }
    }

    /// Load open incidents from the store into the active set, so a restart
    /// does not notify again for incidents that were already open.
    pub fn restore_open(&mut self) -> Result<usize, PersistenceError> {
        let open = self.store.open_incidents()?;
        let count = open.len();
        for incident in open {
            self.active.insert(
                incident.key.clone(),
                ActiveAlert {
                    key: incident.key,
                    class: AlertClass::Incident,
                    since: incident.first_detected_at,
                    details: incident.details,
                    incident_id: Some(incident.id),
                },
            );
        }
        Ok(count)
    }

    /// Apply one evaluation result to the key's lifecycle.
    pub fn evaluate(
        &mut self,
        key: AlertKey,
        class: AlertClass,
        breached: bool,
        details: &str,
        now: DateTime<Utc>,
    ) -> Transition {
        match (breached, self.active.contains_key(&key)) {
            (true, false) => {
                self.open(key, class, details, now);
                Transition::Opened
            }
            (true, true) => Transition::StillOpen,
            (false, true) => {
                self.close(&key, now);
                info!(key = %key, "Alert resolved: {}", details);
                Transition::Closed
            }
            (false, false) => Transition::Unchanged,
        }
    }

    /// Close an open incident by hand. No-op (returns `false`) when the key
    /// has no open incident; signals cannot be acknowledged.
    pub fn acknowledge(&mut self, key: &AlertKey, now: DateTime<Utc>) -> bool {
        match self.active.get(key) {
            Some(alert) if alert.class == AlertClass::Incident => {
                self.close(key, now);
                self.stats.acknowledged += 1;
                info!(key = %key, "Incident acknowledged");
                true
            }
            _ => false,
        }
    }

    /// Record liveness for `stream` and resolve its `down` incident if open.
    pub fn record_heartbeat(&mut self, stream: &str, now: DateTime<Utc>) -> Transition {
        self.heartbeats.insert(stream.to_string(), now);
        self.evaluate(AlertKey::stream_down(stream), AlertClass::Incident, false, "heartbeat received", now)
    }

    /// Evaluate every monitored stream's liveness. A stream never heard from
    /// counts as breached.
    pub fn check_heartbeats(&mut self, now: DateTime<Utc>) -> Vec<(AlertKey, Transition)> {
        let checks: Vec<(String, bool, String)> = self
            .heartbeat_timeouts
            .iter()
            .map(|(stream, timeout)| match self.heartbeats.get(stream) {
                None => (stream.clone(), true, "no heartbeat received".to_string()),
                Some(last) => {
                    let silence = now.signed_duration_since(*last);
                    let breached = silence > *timeout;
                    (
                        stream.clone(),
                        breached,
                        format!(
                            "last heartbeat {}s ago (timeout {}s)",
                            silence.num_seconds(),
                            timeout.num_seconds()
                        ),
                    )
                }
            })
            .collect();

        checks
            .into_iter()
            .map(|(stream, breached, details)| {
                let key = AlertKey::stream_down(&stream);
                let transition = self.evaluate(key.clone(), AlertClass::Incident, breached, &details, now);
                (key, transition)
            })
            .collect()
    }

    fn open(&mut self, key: AlertKey, class: AlertClass, details: &str, now: DateTime<Utc>) {
        let (incident_id, notify) = match class {
            AlertClass::Incident => match self.store.open_if_absent(Incident::open(key.clone(), now, details)) {
                Ok(OpenOutcome::Opened(incident)) => (Some(incident.id), true),
                Ok(OpenOutcome::AlreadyOpen(incident)) => {
                    debug!(key = %key, id = incident.id, "Incident already open in store");
                    (Some(incident.id), false)
                }
                Err(e) => {
                    self.stats.persistence_errors += 1;
                    warn!(key = %key, error = %e, "Failed to persist incident");
                    (None, true)
                }
            },
            AlertClass::Signal => (None, self.notify_signals),
        };

        warn!(key = %key, "Alert opened: {}", details);
        self.stats.opened += 1;
        self.active.insert(
            key.clone(),
            ActiveAlert {
                key: key.clone(),
                class,
                since: now,
                details: details.to_string(),
                incident_id,
            },
        );

        if notify {
            let body = match class {
                AlertClass::Incident => format!("ALERT {key}: {details}"),
                AlertClass::Signal => format!("{} signal at {}: {}", key.kind.to_uppercase(), key.subject, details),
            };
            self.notify(key, body, now);
        }
    }

    fn close(&mut self, key: &AlertKey, now: DateTime<Utc>) {
        let Some(alert) = self.active.remove(key) else {
            return;
        };
        self.stats.closed += 1;
        if alert.class == AlertClass::Incident {
            if let Err(e) = self.store.close_open(key, now) {
                self.stats.persistence_errors += 1;
                warn!(key = %key, error = %e, "Failed to persist incident closure");
            }
        }
    }

    fn notify(&mut self, key: AlertKey, body: String, now: DateTime<Utc>) {
        if !self.notifications_enabled {
            return;
        }
        let notification = Notification {
            key,
            body,
            created_at: now,
        };
        let key = notification.key.clone();
        match self.dispatcher.dispatch(notification) {
            Ok(()) => self.stats.notifications_queued += 1,
            Err(e) => {
                self.stats.dispatch_errors += 1;
                warn!(key = %key, error = %e, "Failed to dispatch notification");
            }
        }
    }

    pub fn is_active(&self, key: &AlertKey) -> bool {
        self.active.contains_key(key)
    }

    pub fn active_alerts(&self) -> impl Iterator<Item = &ActiveAlert> {
        self.active.values()
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn stats(&self) -> &IncidentStats {
        &self.stats
    }

    pub fn store(&self) -> &Arc<dyn IncidentStore> {
        &self.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tokio::sync::mpsc;

    fn t(s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, s).unwrap()
    }

    fn manager(config: &StreamConfig) -> (IncidentManager, Arc<InMemoryIncidentStore>, mpsc::Receiver<Notification>) {
        let store = Arc::new(InMemoryIncidentStore::new());
        let (dispatcher, rx) = NotificationDispatcher::channel(16);
        (IncidentManager::new(store.clone(), dispatcher, config), store, rx)
    }

    struct BrokenStore;

    impl IncidentStore for BrokenStore {
        fn open_if_absent(&self, _: Incident) -> Result<OpenOutcome, PersistenceError> {
            Err(PersistenceError::Database("disk full".to_string()))
        }
        fn close_open(&self, _: &AlertKey, _: DateTime<Utc>) -> Result<Option<Incident>, PersistenceError> {
            Err(PersistenceError::Database("disk full".to_string()))
        }
        fn open_incidents(&self) -> Result<Vec<Incident>, PersistenceError> {
            Ok(Vec::new())
        }
        fn recent(&self, _: usize) -> Result<Vec<Incident>, PersistenceError> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn test_open_dedup_close() {
        let (mut mgr, store, mut rx) = manager(&StreamConfig::default());
        let key = AlertKey::metric("ingest-a", "lag");

        assert_eq!(mgr.evaluate(key.clone(), AlertClass::Incident, true, "lag=1500", t(0)), Transition::Opened);
        assert_eq!(mgr.evaluate(key.clone(), AlertClass::Incident, true, "lag=1600", t(1)), Transition::StillOpen);
        assert_eq!(store.open_incidents().unwrap().len(), 1);
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());

        assert_eq!(mgr.evaluate(key.clone(), AlertClass::Incident, false, "lag=500", t(2)), Transition::Closed);
        assert!(!mgr.is_active(&key));
        assert!(store.open_incidents().unwrap().is_empty());
        assert_eq!(mgr.evaluate(key, AlertClass::Incident, false, "lag=400", t(3)), Transition::Unchanged);
    }

    #[test]
    fn test_acknowledge_without_open_incident_is_noop() {
        let (mut mgr, store, _rx) = manager(&StreamConfig::default());
        assert!(!mgr.acknowledge(&AlertKey::metric("ingest-a", "lag"), t(0)));
        assert!(store.recent(10).unwrap().is_empty());
        assert_eq!(mgr.stats().acknowledged, 0);
    }

    #[test]
    fn test_breach_after_acknowledgment_opens_new_incident() {
        let (mut mgr, store, mut rx) = manager(&StreamConfig::default());
        let key = AlertKey::metric("ingest-a", "error_rate");

        mgr.evaluate(key.clone(), AlertClass::Incident, true, "error_rate=0.2", t(0));
        assert!(mgr.acknowledge(&key, t(1)));
        mgr.evaluate(key.clone(), AlertClass::Incident, true, "error_rate=0.3", t(2));

        let history = store.recent(10).unwrap();
        assert_eq!(history.len(), 2);
        assert!(history[1].acknowledged);
        assert!(!history[0].acknowledged);
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn test_signals_notify_but_are_not_persisted() {
        let (mut mgr, store, mut rx) = manager(&StreamConfig::default());
        let key = AlertKey::new("S1", "drought");

        assert_eq!(mgr.evaluate(key.clone(), AlertClass::Signal, true, "dry", t(0)), Transition::Opened);
        assert!(store.recent(10).unwrap().is_empty());
        let note = rx.try_recv().unwrap();
        assert!(note.body.starts_with("DROUGHT signal at S1"));

        assert!(!mgr.acknowledge(&key, t(1)));
        assert_eq!(mgr.evaluate(key, AlertClass::Signal, false, "rain", t(2)), Transition::Closed);
    }

    #[test]
    fn test_signal_notifications_can_be_disabled() {
        let mut config = StreamConfig::default();
        config.notifications.notify_environmental_signals = false;
        let (mut mgr, _store, mut rx) = manager(&config);
        mgr.evaluate(AlertKey::new("S1", "flood"), AlertClass::Signal, true, "wet", t(0));
        assert!(rx.try_recv().is_err());
        assert_eq!(mgr.active_count(), 1);
    }

    #[test]
    fn test_persistence_failure_still_deduplicates() {
        let (dispatcher, mut rx) = NotificationDispatcher::channel(16);
        let mut mgr = IncidentManager::new(Arc::new(BrokenStore), dispatcher, &StreamConfig::default());
        let key = AlertKey::metric("ingest-a", "lag");

        mgr.evaluate(key.clone(), AlertClass::Incident, true, "lag=1500", t(0));
        mgr.evaluate(key.clone(), AlertClass::Incident, true, "lag=1500", t(1));
        assert!(mgr.is_active(&key));
        assert_eq!(mgr.stats().persistence_errors, 1);
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_dispatch_failure_keeps_incident_open() {
        let (dispatcher, rx) = NotificationDispatcher::channel(1);
        drop(rx);
        let store = Arc::new(InMemoryIncidentStore::new());
        let mut mgr = IncidentManager::new(store.clone(), dispatcher, &StreamConfig::default());
        let key = AlertKey::metric("ingest-a", "lag");

        mgr.evaluate(key.clone(), AlertClass::Incident, true, "lag=1500", t(0));
        assert!(mgr.is_active(&key));
        assert_eq!(mgr.stats().dispatch_errors, 1);
        assert_eq!(store.open_incidents().unwrap().len(), 1);
    }

    #[test]
    fn test_heartbeat_liveness() {
        let mut config = StreamConfig::default();
        config.heartbeats.streams.insert("weather".to_string(), 60);
        let (mut mgr, _store, _rx) = manager(&config);
        let key = AlertKey::stream_down("weather");

        // Never heard from → breached
        let results = mgr.check_heartbeats(t(0));
        assert_eq!(results, vec![(key.clone(), Transition::Opened)]);

        // Heartbeat resolves immediately
        assert_eq!(mgr.record_heartbeat("weather", t(10)), Transition::Closed);
        assert_eq!(mgr.check_heartbeats(t(50)), vec![(key.clone(), Transition::Unchanged)]);

        // Exactly at the timeout is still alive
        let at_timeout = t(10) + Duration::seconds(60);
        assert_eq!(mgr.check_heartbeats(at_timeout), vec![(key.clone(), Transition::Unchanged)]);
        let past = at_timeout + Duration::seconds(1);
        assert_eq!(mgr.check_heartbeats(past), vec![(key, Transition::Opened)]);
    }

    #[test]
    fn test_restore_open_suppresses_renotification() {
        let store = Arc::new(InMemoryIncidentStore::new());
        let key = AlertKey::metric("ingest-a", "lag");
        store.open_if_absent(Incident::open(key.clone(), t(0), "lag=1500")).unwrap();

        let (dispatcher, mut rx) = NotificationDispatcher::channel(16);
        let mut mgr = IncidentManager::new(store, dispatcher, &StreamConfig::default());
        assert_eq!(mgr.restore_open().unwrap(), 1);
        assert_eq!(mgr.evaluate(key, AlertClass::Incident, true, "lag=1700", t(5)), Transition::StillOpen);
        assert!(rx.try_recv().is_err());
    }
}
