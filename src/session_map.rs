//! Copy-on-write map of live sessions
//!
//! Readers take a snapshot (`Arc` clone) and iterate without holding any lock.
//! Writers are rare (register, unregister, GC) and rebuild the map.

use crate::session::BdvSession;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

pub type SessionSnapshot = Arc<HashMap<String, Arc<BdvSession>>>;

#[derive(Debug, Default)]
pub struct SessionMap {
    sessions: RwLock<SessionSnapshot>,
}

impl SessionMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert under a fresh id. Returns false if the id is taken.
    pub fn insert_new(&self, id: String, session: Arc<BdvSession>) -> bool {
        let mut sessions = self.sessions.write();
        if sessions.contains_key(&id) {
            return false;
        }
        let mut next = HashMap::clone(&sessions);
        next.insert(id, session);
        *sessions = Arc::new(next);
        true
    }

    pub fn remove(&self, id: &str) -> Option<Arc<BdvSession>> {
        let mut sessions = self.sessions.write();
        if !sessions.contains_key(id) {
            return None;
        }
        let mut next = HashMap::clone(&sessions);
        let removed = next.remove(id);
        *sessions = Arc::new(next);
        removed
    }

    pub fn get(&self, id: &str) -> Option<Arc<BdvSession>> {
        self.sessions.read().get(id).cloned()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        Arc::clone(&self.sessions.read())
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn drain_all(&self) -> Vec<Arc<BdvSession>> {
        let drained = std::mem::take(&mut *self.sessions.write());
        match Arc::try_unwrap(drained) {
            Ok(map) => map.into_values().collect(),
            Err(shared) => shared.values().cloned().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::time::Duration;

    fn session(id: &str) -> Arc<BdvSession> {
        Arc::new(BdvSession::new(
            id.to_string(),
            Arc::new(MemoryStore::new()),
            None,
            Duration::from_millis(10),
        ))
    }

    #[test]
    fn test_insert_rejects_taken_id() {
        let map = SessionMap::new();
        assert!(map.insert_new("a".to_string(), session("a")));
        assert!(!map.insert_new("a".to_string(), session("a")));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_snapshot_survives_removal() {
        let map = SessionMap::new();
        map.insert_new("a".to_string(), session("a"));
        map.insert_new("b".to_string(), session("b"));

        let snapshot = map.snapshot();
        assert!(map.remove("a").is_some());
        assert!(map.remove("a").is_none());

        assert_eq!(snapshot.len(), 2);
        assert_eq!(map.ids(), vec!["b".to_string()]);
        assert!(map.get("a").is_none());
    }

    #[test]
    fn test_remove_and_drain() {
        let map = SessionMap::new();
        for id in ["a", "b", "c"] {
            map.insert_new(id.to_string(), session(id));
        }
        assert!(map.remove("a").is_some());
        assert!(map.remove("zz").is_none());

        assert_eq!(map.drain_all().len(), 2);
        assert!(map.is_empty());
    }
}
