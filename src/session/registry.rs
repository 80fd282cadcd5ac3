use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;

use super::state::Session;

#[derive(Debug, Clone)]
enum KeyEntry {
    /// A start with this key is in flight.
    Pending,
    Bound(String),
}

/// Outcome of claiming an idempotency key.
#[derive(Debug)]
pub enum KeyClaim {
    Claimed,
    Existing(Arc<Session>),
    InFlight,
}

/// Process-wide index of live sessions and their idempotency keys.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    keys: Mutex<HashMap<String, KeyEntry>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.read().get(id).cloned()
    }

    pub fn insert(&self, session: Arc<Session>) {
        let id = session.id().to_string();
        let key = session.idempotency_key().map(str::to_string);
        self.sessions.write().insert(id.clone(), session);
        if let Some(key) = key {
            self.keys.lock().insert(key, KeyEntry::Bound(id));
        }
    }

    /// Drop a session and any key still bound to it.
    pub fn remove(&self, id: &str) -> Option<Arc<Session>> {
        let removed = self.sessions.write().remove(id);
        if let Some(key) = removed.as_ref().and_then(|s| s.idempotency_key()) {
            let mut keys = self.keys.lock();
            if matches!(keys.get(key), Some(KeyEntry::Bound(bound)) if bound == id) {
                keys.remove(key);
            }
        }
        removed
    }

    /// Reserve `key` for a new start, or report who already holds it.
    pub fn claim_key(&self, key: &str) -> KeyClaim {
        let mut keys = self.keys.lock();
        match keys.get(key) {
            Some(KeyEntry::Pending) => KeyClaim::InFlight,
            Some(KeyEntry::Bound(id)) => match self.sessions.read().get(id) {
                Some(session) => KeyClaim::Existing(Arc::clone(session)),
                None => {
                    keys.insert(key.to_string(), KeyEntry::Pending);
                    KeyClaim::Claimed
                }
            },
            None => {
                keys.insert(key.to_string(), KeyEntry::Pending);
                KeyClaim::Claimed
            }
        }
    }

    /// Forget a reservation after a failed start.
    pub fn release_key(&self, key: &str) {
        let mut keys = self.keys.lock();
        if matches!(keys.get(key), Some(KeyEntry::Pending)) {
            keys.remove(key);
        }
    }

    pub fn all(&self) -> Vec<Arc<Session>> {
        self.sessions.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }
}
