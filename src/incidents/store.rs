//! Incident persistence
//!
//! The sled store keeps two named trees:
//!
//! - `incidents`: every incident ever opened, keyed by a generated id
//!   (big-endian u64, so iteration is chronological)
//! - `open_incidents`: alert key → id of its open incident
//!
//! Opening is a compare-and-swap on `open_incidents`, so the "already open?"
//! check and the insert cannot interleave even with several writers.

use chrono::{DateTime, Utc};
use sled::Tree;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;

use crate::types::{AlertKey, Incident};

const INCIDENTS_TREE: &str = "incidents";
const OPEN_TREE: &str = "open_incidents";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PersistenceError {
    #[error("Database error: {0}")]
    Database(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<sled::Error> for PersistenceError {
    fn from(err: sled::Error) -> Self {
        Self::Database(err.to_string())
    }
}

impl From<serde_json::Error> for PersistenceError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Result of [`IncidentStore::open_if_absent`].
#[derive(Debug, Clone, PartialEq)]
pub enum OpenOutcome {
    /// Newly persisted, with its assigned id
    Opened(Incident),
    /// The key already had an open incident; nothing was written
    AlreadyOpen(Incident),
}

/// Durable incident history. The source of truth across restarts.
pub trait IncidentStore: Send + Sync {
    /// Atomically insert `incident` unless its key already has an open one.
    fn open_if_absent(&self, incident: Incident) -> Result<OpenOutcome, PersistenceError>;

    /// Mark the open incident for `key` acknowledged. `None` when nothing
    /// was open.
    fn close_open(&self, key: &AlertKey, at: DateTime<Utc>) -> Result<Option<Incident>, PersistenceError>;

    fn open_incidents(&self) -> Result<Vec<Incident>, PersistenceError>;

    /// Newest first.
    fn recent(&self, limit: usize) -> Result<Vec<Incident>, PersistenceError>;
}

// ============================================================================
// Sled Store
// ============================================================================

pub struct SledIncidentStore {
    db: sled::Db,
    incidents: Tree,
    open: Tree,
}

impl SledIncidentStore {
    /// Open or create the store at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, PersistenceError> {
        let db = sled::open(path)?;
        let incidents = db.open_tree(INCIDENTS_TREE)?;
        let open = db.open_tree(OPEN_TREE)?;
        Ok(Self { db, incidents, open })
    }

    fn load(&self, id: u64) -> Result<Incident, PersistenceError> {
        let bytes = self
            .incidents
            .get(id.to_be_bytes())?
            .ok_or_else(|| PersistenceError::Database(format!("incident {id} missing")))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    fn write(&self, incident: &Incident) -> Result<(), PersistenceError> {
        let bytes = serde_json::to_vec(incident)?;
        self.incidents.insert(incident.id.to_be_bytes(), bytes)?;
        Ok(())
    }

    pub fn flush(&self) -> Result<(), PersistenceError> {
        self.db.flush()?;
        Ok(())
    }
}

fn decode_id(raw: &[u8]) -> Result<u64, PersistenceError> {
    let bytes: [u8; 8] = raw
        .try_into()
        .map_err(|_| PersistenceError::Database(format!("corrupt incident id ({} bytes)", raw.len())))?;
    Ok(u64::from_be_bytes(bytes))
}

impl IncidentStore for SledIncidentStore {
    fn open_if_absent(&self, mut incident: Incident) -> Result<OpenOutcome, PersistenceError> {
        // generate_id starts at 0; 0 is reserved for "not persisted"
        let id = self.db.generate_id()? + 1;
        let key = incident.key.to_string();

        match self
            .open
            .compare_and_swap(key.as_bytes(), None::<&[u8]>, Some(&id.to_be_bytes()[..]))?
        {
            Ok(()) => {
                incident.id = id;
                if let Err(e) = self.write(&incident) {
                    // Leave no dangling index entry behind
                    let _ = self.open.remove(key.as_bytes());
                    return Err(e);
                }
                Ok(OpenOutcome::Opened(incident))
            }
            Err(conflict) => {
                let current = conflict
                    .current
                    .ok_or_else(|| PersistenceError::Database("open index conflict without value".to_string()))?;
                Ok(OpenOutcome::AlreadyOpen(self.load(decode_id(&current)?)?))
            }
        }
    }

    fn close_open(&self, key: &AlertKey, at: DateTime<Utc>) -> Result<Option<Incident>, PersistenceError> {
        let key = key.to_string();
        let Some(raw) = self.open.get(key.as_bytes())? else {
            return Ok(None);
        };
        let mut incident = self.load(decode_id(&raw)?)?;
        incident.acknowledged = true;
        incident.acknowledged_at = Some(at);
        self.write(&incident)?;

        // Only clear the index if it still points at this incident
        let _ = self
            .open
            .compare_and_swap(key.as_bytes(), Some(&raw), None::<&[u8]>)?;
        Ok(Some(incident))
    }

    fn open_incidents(&self) -> Result<Vec<Incident>, PersistenceError> {
        let mut incidents = Vec::new();
        for item in self.open.iter() {
            let (_, raw) = item?;
            incidents.push(self.load(decode_id(&raw)?)?);
        }
        incidents.sort_by_key(|i| i.id);
        Ok(incidents)
    }

    fn recent(&self, limit: usize) -> Result<Vec<Incident>, PersistenceError> {
        let mut incidents = Vec::with_capacity(limit.min(256));
        for item in self.incidents.iter().rev().take(limit) {
            let (_, bytes) = item?;
            incidents.push(serde_json::from_slice(&bytes)?);
        }
        Ok(incidents)
    }
}

// ============================================================================
// In-Memory Store
// ============================================================================

#[derive(Default)]
struct MemoryInner {
    next_id: u64,
    incidents: BTreeMap<u64, Incident>,
    open: HashMap<AlertKey, u64>,
}

/// Non-durable store for tests and `--ephemeral` runs.
#[derive(Default)]
pub struct InMemoryIncidentStore {
    inner: Mutex<MemoryInner>,
}

impl InMemoryIncidentStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryInner>, PersistenceError> {
        self.inner
            .lock()
            .map_err(|_| PersistenceError::Database("incident store lock poisoned".to_string()))
    }
}

impl IncidentStore for InMemoryIncidentStore {
    fn open_if_absent(&self, mut incident: Incident) -> Result<OpenOutcome, PersistenceError> {
        let mut inner = self.lock()?;
        if let Some(existing) = inner.open.get(&incident.key).and_then(|id| inner.incidents.get(id)) {
            return Ok(OpenOutcome::AlreadyOpen(existing.clone()));
        }
        inner.next_id += 1;
        incident.id = inner.next_id;
        inner.open.insert(incident.key.clone(), incident.id);
        inner.incidents.insert(incident.id, incident.clone());
        Ok(OpenOutcome::Opened(incident))
    }

    fn close_open(&self, key: &AlertKey, at: DateTime<Utc>) -> Result<Option<Incident>, PersistenceError> {
        let mut inner = self.lock()?;
        let Some(id) = inner.open.remove(key) else {
            return Ok(None);
        };
        Ok(inner.incidents.get_mut(&id).map(|incident| {
            incident.acknowledged = true;
            incident.acknowledged_at = Some(at);
            incident.clone()
        }))
    }

    fn open_incidents(&self) -> Result<Vec<Incident>, PersistenceError> {
        let inner = self.lock()?;
        let mut incidents: Vec<Incident> = inner
            .open
            .values()
            .filter_map(|id| inner.incidents.get(id).cloned())
            .collect();
        incidents.sort_by_key(|i| i.id);
        Ok(incidents)
    }

    fn recent(&self, limit: usize) -> Result<Vec<Incident>, PersistenceError> {
        let inner = self.lock()?;
        Ok(inner.incidents.values().rev().take(limit).cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn incident(key: &str) -> Incident {
        Incident::open(AlertKey::parse(key).unwrap(), Utc::now(), "test")
    }

    fn exercise(store: &dyn IncidentStore) {
        let first = match store.open_if_absent(incident("ingest-a:lag")).unwrap() {
            OpenOutcome::Opened(i) => i,
            other => panic!("expected Opened, got {other:?}"),
        };
        assert!(first.id > 0);

        match store.open_if_absent(incident("ingest-a:lag")).unwrap() {
            OpenOutcome::AlreadyOpen(i) => assert_eq!(i.id, first.id),
            other => panic!("expected AlreadyOpen, got {other:?}"),
        }
        assert_eq!(store.open_incidents().unwrap().len(), 1);

        let key = AlertKey::metric("ingest-a", "lag");
        let closed = store.close_open(&key, Utc::now()).unwrap().unwrap();
        assert!(closed.acknowledged);
        assert!(closed.acknowledged_at.is_some());
        assert!(store.open_incidents().unwrap().is_empty());
        assert!(store.close_open(&key, Utc::now()).unwrap().is_none());

        // A new breach after acknowledgment is a new record
        let second = match store.open_if_absent(incident("ingest-a:lag")).unwrap() {
            OpenOutcome::Opened(i) => i,
            other => panic!("expected Opened, got {other:?}"),
        };
        assert_ne!(second.id, first.id);

        let recent = store.recent(10).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].id, second.id);
        assert!(recent[1].acknowledged);
        assert_eq!(store.recent(1).unwrap().len(), 1);
    }

    #[test]
    fn test_in_memory_store_lifecycle() {
        exercise(&InMemoryIncidentStore::new());
    }

    #[test]
    fn test_sled_store_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let store = SledIncidentStore::open(dir.path().join("incidents.db")).unwrap();
        exercise(&store);
    }

    #[test]
    fn test_sled_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("incidents.db");
        {
            let store = SledIncidentStore::open(&path).unwrap();
            store.open_if_absent(incident("GHCND:USW00003952:down")).unwrap();
            store.flush().unwrap();
        }
        let store = SledIncidentStore::open(&path).unwrap();
        let open = store.open_incidents().unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].key.subject, "GHCND:USW00003952");
    }
}
