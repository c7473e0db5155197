//! Clients waiting on job results, keyed by unique id.
//!
//! Several clients can wait on one deduplicated execution; every one of
//! them gets the result.

use crate::session::{Session, SessionId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Waiters for one function's jobs.
#[derive(Debug, Default)]
pub struct ClientRegistry {
    waiters: Mutex<HashMap<String, Vec<Arc<Session>>>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a waiter. A session waits on a given job at most once.
    pub fn register(&self, unique_id: &str, session: Arc<Session>) -> bool {
        let mut waiters = self.waiters.lock();
        let list = waiters.entry(unique_id.to_string()).or_default();
        if list.iter().any(|s| s.id() == session.id()) {
            return false;
        }
        list.push(session);
        true
    }

    pub fn waiters(&self, unique_id: &str) -> Vec<Arc<Session>> {
        self.waiters
            .lock()
            .get(unique_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Removes and returns every waiter of a finished job.
    pub fn release(&self, unique_id: &str) -> Vec<Arc<Session>> {
        self.waiters.lock().remove(unique_id).unwrap_or_default()
    }

    pub fn waiting_count(&self, unique_id: &str) -> usize {
        self.waiters.lock().get(unique_id).map_or(0, Vec::len)
    }

    /// Drops a disconnected session from every wait list.
    pub fn remove_session(&self, id: SessionId) -> usize {
        let mut waiters = self.waiters.lock();
        let mut removed = 0;
        waiters.retain(|_, list| {
            let before = list.len();
            list.retain(|s| s.id() != id);
            removed += before - list.len();
            !list.is_empty()
        });
        removed
    }

    /// Number of jobs with at least one waiter.
    pub fn len(&self) -> usize {
        self.waiters.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
