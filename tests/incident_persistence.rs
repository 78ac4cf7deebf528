//! Incident persistence across restarts
//!
//! Open incidents live in sled; a fresh `IncidentManager` over the same
//! database must pick them up without re-notifying.

use agristream::config::StreamConfig;
use agristream::incidents::{IncidentManager, IncidentStore, NotificationDispatcher, SledIncidentStore, Transition};
use agristream::types::{AlertClass, AlertKey};

use chrono::Utc;
use std::sync::Arc;
use tempfile::TempDir;

#[test]
fn test_open_incident_survives_restart() {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("incidents.db");
    let config = StreamConfig::default();
    let key = AlertKey::metric("ingest-a", "lag");
    let now = Utc::now();

    let first_id = {
        let store = Arc::new(SledIncidentStore::open(&db_path).unwrap());
        let (dispatcher, mut notes) = NotificationDispatcher::channel(8);
        let mut manager = IncidentManager::new(store.clone(), dispatcher, &config);

        let t = manager.evaluate(key.clone(), AlertClass::Incident, true, "lag 1500 > 1000", now);
        assert_eq!(t, Transition::Opened);
        assert!(notes.try_recv().is_ok());
        store.flush().unwrap();
        store.open_incidents().unwrap()[0].id
    };

    let store = Arc::new(SledIncidentStore::open(&db_path).unwrap());
    let (dispatcher, mut notes) = NotificationDispatcher::channel(8);
    let mut manager = IncidentManager::new(store.clone(), dispatcher, &config);

    assert_eq!(manager.restore_open().unwrap(), 1);
    assert!(manager.is_active(&key));

    let t = manager.evaluate(key.clone(), AlertClass::Incident, true, "lag 1700 > 1000", now);
    assert_eq!(t, Transition::StillOpen);
    assert!(notes.try_recv().is_err(), "restored incident must not re-notify");

    let t = manager.evaluate(key.clone(), AlertClass::Incident, false, "lag 200 <= 1000", now);
    assert_eq!(t, Transition::Closed);
    assert!(store.open_incidents().unwrap().is_empty());

    // Ids keep increasing after a reopen
    manager.evaluate(key.clone(), AlertClass::Incident, true, "lag 3000 > 1000", now);
    let open = store.open_incidents().unwrap();
    assert_eq!(open.len(), 1);
    assert!(open[0].id > first_id);
    assert_eq!(store.recent(10).unwrap().len(), 2);
}

#[test]
fn test_acknowledged_incident_stays_closed_after_restart() {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("incidents.db");
    let config = StreamConfig::default();
    let key = AlertKey::metric("ingest-b", "error_rate");

    {
        let store = Arc::new(SledIncidentStore::open(&db_path).unwrap());
        let (dispatcher, _notes) = NotificationDispatcher::channel(8);
        let mut manager = IncidentManager::new(store.clone(), dispatcher, &config);
        manager.evaluate(key.clone(), AlertClass::Incident, true, "error_rate 0.2 > 0.05", Utc::now());
        assert!(manager.acknowledge(&key, Utc::now()));
        store.flush().unwrap();
    }

    let store = Arc::new(SledIncidentStore::open(&db_path).unwrap());
    let (dispatcher, _notes) = NotificationDispatcher::channel(8);
    let mut manager = IncidentManager::new(store.clone(), dispatcher, &config);
    assert_eq!(manager.restore_open().unwrap(), 0);
    assert!(!manager.is_active(&key));

    let history = store.recent(10).unwrap();
    assert_eq!(history.len(), 1);
    assert!(history[0].acknowledged);
}
