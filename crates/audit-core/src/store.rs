//! Session store: the single owner of interview sessions.
//!
//! Mutations go through [`crate::machine::InterviewMachine`]; the store notifies
//! registered observers (persistence) synchronously and broadcasts change events to
//! subscribers (UI). Sled persistence is one such observer.

use crate::error::{AuditError, AuditResult};
use crate::session::InterviewSession;
use serde::{Deserialize, Serialize};
use sled::Db;
use std::path::Path;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::broadcast;
use tracing::{debug, warn};

const SESSIONS_KEY: &str = "sessions";
const CURRENT_KEY: &str = "current_session";
const EVENT_CAPACITY: usize = 64;

/// Everything the store holds; this is also the persisted shape.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub sessions: Vec<InterviewSession>,
    pub current: Option<String>,
}

/// Change notifications for subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    Created(String),
    Updated(String),
    CurrentChanged(Option<String>),
    Discarded(String),
}

/// Synchronous observer invoked after every mutation with the new state, while the
/// store's write lock is held.
pub trait StoreObserver: Send + Sync {
    fn on_change(&self, snapshot: &StoreSnapshot);
}

/// Sled-backed persistence of the session list and current session id.
pub struct SledPersistence {
    db: Db,
}

impl SledPersistence {
    pub fn open_path<P: AsRef<Path>>(path: P) -> AuditResult<Self> {
        let db = sled::open(path)?;
        Ok(Self { db })
    }

    /// Read the persisted state. Absent or corrupt entries fall back to empty.
    pub fn load(&self) -> StoreSnapshot {
        let sessions = match self.db.get(SESSIONS_KEY) {
            Ok(Some(raw)) => match serde_json::from_slice::<Vec<InterviewSession>>(&raw) {
                Ok(list) => list,
                Err(e) => {
                    warn!(error = %e, "stored session list is corrupt; starting empty");
                    Vec::new()
                }
            },
            Ok(None) => Vec::new(),
            Err(e) => {
                warn!(error = %e, "session list unreadable; starting empty");
                Vec::new()
            }
        };
        let current = match self.db.get(CURRENT_KEY) {
            Ok(Some(raw)) => serde_json::from_slice::<Option<String>>(&raw).unwrap_or(None),
            _ => None,
        };
        let current = current.filter(|id| sessions.iter().any(|s| &s.id == id));
        StoreSnapshot { sessions, current }
    }

    fn write(&self, snapshot: &StoreSnapshot) -> AuditResult<()> {
        self.db.insert(SESSIONS_KEY, serde_json::to_vec(&snapshot.sessions)?)?;
        self.db.insert(CURRENT_KEY, serde_json::to_vec(&snapshot.current)?)?;
        self.db.flush()?;
        Ok(())
    }
}

impl StoreObserver for SledPersistence {
    fn on_change(&self, snapshot: &StoreSnapshot) {
        if let Err(e) = self.write(snapshot) {
            warn!(error = %e, "failed to persist sessions");
        }
    }
}

/// Holds all sessions and the identity of the current one.
pub struct SessionStore {
    state: RwLock<StoreSnapshot>,
    observers: RwLock<Vec<Arc<dyn StoreObserver>>>,
    events: broadcast::Sender<StoreEvent>,
}

impl SessionStore {
    /// Empty, in-memory store.
    pub fn new() -> Self {
        Self::with_snapshot(StoreSnapshot::default())
    }

    pub fn with_snapshot(snapshot: StoreSnapshot) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            state: RwLock::new(snapshot),
            observers: RwLock::new(Vec::new()),
            events,
        }
    }

    /// Open the sled database at `path`, load its state, and persist every later mutation.
    pub fn open_persistent<P: AsRef<Path>>(path: P) -> AuditResult<Self> {
        let persistence = SledPersistence::open_path(path)?;
        let store = Self::with_snapshot(persistence.load());
        store.add_observer(Arc::new(persistence));
        debug!(sessions = store.list().len(), "session store loaded");
        Ok(store)
    }

    pub fn add_observer(&self, observer: Arc<dyn StoreObserver>) {
        self.observers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(observer);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    pub fn get(&self, id: &str) -> Option<InterviewSession> {
        self.read().sessions.iter().find(|s| s.id == id).cloned()
    }

    pub fn current_id(&self) -> Option<String> {
        self.read().current.clone()
    }

    pub fn current(&self) -> Option<InterviewSession> {
        let state = self.read();
        let id = state.current.as_deref()?;
        state.sessions.iter().find(|s| s.id == id).cloned()
    }

    /// All sessions in creation order.
    pub fn list(&self) -> Vec<InterviewSession> {
        self.read().sessions.clone()
    }

    pub fn snapshot(&self) -> StoreSnapshot {
        self.read().clone()
    }

    /// Create a new session and make it current.
    pub(crate) fn create(&self) -> InterviewSession {
        let session = InterviewSession::new();
        self.mutate(
            |state| {
                state.sessions.push(session.clone());
                state.current = Some(session.id.clone());
            },
            vec![
                StoreEvent::Created(session.id.clone()),
                StoreEvent::CurrentChanged(Some(session.id.clone())),
            ],
        );
        session
    }

    /// Apply `f` to the session with `id` and persist the result.
    pub(crate) fn update<R>(
        &self,
        id: &str,
        f: impl FnOnce(&mut InterviewSession) -> AuditResult<R>,
    ) -> AuditResult<R> {
        let result;
        {
            let mut state = self.write();
            let session = state
                .sessions
                .iter_mut()
                .find(|s| s.id == id)
                .ok_or_else(|| AuditError::SessionNotFound(id.to_string()))?;
            result = f(session)?;
            self.persist(&state);
        }
        self.broadcast(vec![StoreEvent::Updated(id.to_string())]);
        Ok(result)
    }

    pub(crate) fn set_current(&self, id: Option<String>) {
        self.mutate(
            |state| state.current = id.clone(),
            vec![StoreEvent::CurrentChanged(id.clone())],
        );
    }

    /// Remove a session permanently. Only ever called on explicit user request.
    pub fn discard(&self, id: &str) -> AuditResult<()> {
        let mut events = vec![StoreEvent::Discarded(id.to_string())];
        {
            let mut state = self.write();
            let before = state.sessions.len();
            state.sessions.retain(|s| s.id != id);
            if state.sessions.len() == before {
                return Err(AuditError::SessionNotFound(id.to_string()));
            }
            if state.current.as_deref() == Some(id) {
                state.current = None;
                events.push(StoreEvent::CurrentChanged(None));
            }
            self.persist(&state);
        }
        self.broadcast(events);
        Ok(())
    }

    fn mutate(&self, f: impl FnOnce(&mut StoreSnapshot), events: Vec<StoreEvent>) {
        {
            let mut state = self.write();
            f(&mut state);
            self.persist(&state);
        }
        self.broadcast(events);
    }

    /// Runs observers under the state write lock, so they see snapshots in mutation
    /// order. Observers must not call back into the store.
    fn persist(&self, snapshot: &StoreSnapshot) {
        let observers = self.observers.read().unwrap_or_else(|e| e.into_inner()).clone();
        for observer in observers {
            observer.on_change(snapshot);
        }
    }

    fn broadcast(&self, events: Vec<StoreEvent>) {
        for event in events {
            // No subscribers is fine.
            let _ = self.events.send(event);
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, StoreSnapshot> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, StoreSnapshot> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}
