//! Table of live sessions, keyed by id.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use super::{Session, SessionId};

/// Live sessions of one bridge.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionId, Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a session.
    pub fn insert(&self, session: Arc<Session>) {
        let id = session.id().clone();
        self.sessions.write().insert(id.clone(), session);
        debug!(session = %id, "session registered");
    }

    /// Stop tracking a session.
    pub fn remove(&self, id: &SessionId) -> Option<Arc<Session>> {
        let removed = self.sessions.write().remove(id);
        if removed.is_some() {
            debug!(session = %id, "session removed");
        }
        removed
    }

    pub fn get(&self, id: &SessionId) -> Option<Arc<Session>> {
        self.sessions.read().get(id).cloned()
    }

    pub fn contains(&self, id: &SessionId) -> bool {
        self.sessions.read().contains_key(id)
    }

    /// Number of live sessions.
    pub fn count(&self) -> usize {
        self.sessions.read().len()
    }

    /// Snapshot of all live sessions.
    pub fn all(&self) -> Vec<Arc<Session>> {
        self.sessions.read().values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ContextPool, WorkerConfig};
    use tokio::sync::mpsc;

    #[test]
    fn test_insert_remove() {
        let pool = ContextPool::new(&WorkerConfig {
            workers: 1,
            ..Default::default()
        })
        .unwrap();
        let (tx, _rx) = mpsc::channel(4);
        let session = Arc::new(Session::new("test", "127.0.0.1:1".parse().unwrap(), pool.create(), tx));
        let id = session.id().clone();

        let registry = SessionRegistry::new();
        registry.insert(session);
        assert!(registry.contains(&id));
        assert_eq!(registry.count(), 1);
        assert_eq!(registry.get(&id).unwrap().bridge(), "test");

        assert!(registry.remove(&id).is_some());
        assert!(registry.remove(&id).is_none());
        assert_eq!(registry.count(), 0);
    }
}
