//! Workers registered for one function and which of them are asleep.

use crate::session::{Session, SessionId};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Worker pool for a single function name.
#[derive(Debug)]
pub struct WorkerPool {
    function_name: String,
    workers: RwLock<HashMap<SessionId, Arc<Session>>>,
    sleepers: RwLock<HashMap<SessionId, Arc<Session>>>,
}

impl WorkerPool {
    pub fn new(function_name: impl Into<String>) -> Self {
        Self {
            function_name: function_name.into(),
            workers: RwLock::new(HashMap::new()),
            sleepers: RwLock::new(HashMap::new()),
        }
    }

    /// Registers a worker. Returns false if it was already registered.
    pub fn add_worker(&self, session: Arc<Session>) -> bool {
        let id = session.id();
        let added = self.workers.write().insert(id, session).is_none();
        if added {
            debug!(function = %self.function_name, session = %id, "Worker registered");
        }
        added
    }

    /// Removes the worker from the pool and the sleep set.
    pub fn remove_worker(&self, id: SessionId) -> bool {
        self.sleepers.write().remove(&id);
        let removed = self.workers.write().remove(&id).is_some();
        if removed {
            debug!(function = %self.function_name, session = %id, "Worker unregistered");
        }
        removed
    }

    pub fn mark_sleeping(&self, session: Arc<Session>) {
        self.sleepers.write().insert(session.id(), session);
    }

    pub fn remove_sleeper(&self, id: SessionId) -> bool {
        self.sleepers.write().remove(&id).is_some()
    }

    /// Wakes every sleeping worker and empties the sleep set. Returns how
    /// many were actually woken.
    pub fn wake_sleepers(&self) -> usize {
        let sleepers: Vec<Arc<Session>> = self.sleepers.write().drain().map(|(_, s)| s).collect();
        let woken = sleepers.iter().filter(|s| s.wake()).count();
        if woken > 0 {
            debug!(function = %self.function_name, woken, "Woke sleeping workers");
        }
        woken
    }

    pub fn worker_count(&self) -> usize {
        self.workers.read().len()
    }

    pub fn sleeper_count(&self) -> usize {
        self.sleepers.read().len()
    }

    pub fn workers(&self) -> Vec<Arc<Session>> {
        self.workers.read().values().cloned().collect()
    }
}
