//! Job handle and unique id generation.
//!
//! Generators are plain objects owned by the job manager, so tests can
//! inject deterministic sequences.

use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

/// Source of fresh identifiers.
pub trait IdGenerator: Send + Sync {
    fn next_id(&self) -> String;

    /// Informs the generator of an id issued by an earlier run, so it never
    /// hands the same one out again.
    fn observe(&self, _id: &str) {}
}

/// Produces `H:<host>:<seq>` with a strictly increasing sequence.
#[derive(Debug)]
pub struct JobHandleFactory {
    host: String,
    seq: AtomicU64,
}

impl JobHandleFactory {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            seq: AtomicU64::new(0),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }
}

impl IdGenerator for JobHandleFactory {
    fn next_id(&self) -> String {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        format!("H:{}:{}", self.host, seq)
    }

    fn observe(&self, id: &str) {
        let Some(rest) = id.strip_prefix("H:") else {
            return;
        };
        let Some((host, seq)) = rest.rsplit_once(':') else {
            return;
        };
        if host != self.host {
            return;
        }
        if let Ok(seq) = seq.parse::<u64>() {
            self.seq.fetch_max(seq, Ordering::SeqCst);
        }
    }
}

/// Random unique ids for submissions that did not supply one.
#[derive(Debug, Default, Clone, Copy)]
pub struct UniqueIdFactory;

impl IdGenerator for UniqueIdFactory {
    fn next_id(&self) -> String {
        Uuid::new_v4().to_string()
    }
}
