//! Per-connection session state shared with the job manager.
//!
//! The connection task owns the socket; everything the engine wants to
//! tell the peer goes through the session's outbound channel.

use foreman_protocol::{Packet, PacketBody};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt::{self, Display};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tokio::time::Instant;
use uuid::Uuid;

/// Identifier of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub Uuid);

impl SessionId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A connected client or worker.
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    peer: String,
    client_id: RwLock<Option<String>>,
    /// Functions in registration order.
    abilities: RwLock<Vec<String>>,
    /// CAN_DO_TIMEOUT values, recorded only.
    timeouts: RwLock<HashMap<String, u32>>,
    outbound: mpsc::UnboundedSender<Packet>,
    sleeping: AtomicBool,
    sleep_deadline: Mutex<Option<Instant>>,
    exceptions: AtomicBool,
    /// Handles of jobs this worker is executing.
    assigned: Mutex<HashSet<String>>,
}

impl Session {
    pub fn new(peer: impl Into<String>, outbound: mpsc::UnboundedSender<Packet>) -> Self {
        Self {
            id: SessionId::new(),
            peer: peer.into(),
            client_id: RwLock::new(None),
            abilities: RwLock::new(Vec::new()),
            timeouts: RwLock::new(HashMap::new()),
            outbound,
            sleeping: AtomicBool::new(false),
            sleep_deadline: Mutex::new(None),
            exceptions: AtomicBool::new(false),
            assigned: Mutex::new(HashSet::new()),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn client_id(&self) -> Option<String> {
        self.client_id.read().clone()
    }

    pub fn set_client_id(&self, client_id: impl Into<String>) {
        *self.client_id.write() = Some(client_id.into());
    }

    /// Queues a packet for the peer. Returns false once the connection is gone.
    pub fn send(&self, packet: Packet) -> bool {
        self.outbound.send(packet).is_ok()
    }

    pub fn abilities(&self) -> Vec<String> {
        self.abilities.read().clone()
    }

    pub fn can_do(&self, function_name: &str) -> bool {
        self.abilities.read().iter().any(|f| f == function_name)
    }

    /// Adds a function at the end of the ability list. Returns false if
    /// it was already there.
    pub fn add_ability(&self, function_name: &str, timeout: Option<u32>) -> bool {
        if let Some(timeout) = timeout {
            self.timeouts.write().insert(function_name.to_string(), timeout);
        }
        let mut abilities = self.abilities.write();
        if abilities.iter().any(|f| f == function_name) {
            return false;
        }
        abilities.push(function_name.to_string());
        true
    }

    pub fn remove_ability(&self, function_name: &str) -> bool {
        self.timeouts.write().remove(function_name);
        let mut abilities = self.abilities.write();
        let before = abilities.len();
        abilities.retain(|f| f != function_name);
        abilities.len() != before
    }

    /// Clears every ability and returns what was registered.
    pub fn clear_abilities(&self) -> Vec<String> {
        self.timeouts.write().clear();
        std::mem::take(&mut *self.abilities.write())
    }

    pub fn ability_timeout(&self, function_name: &str) -> Option<u32> {
        self.timeouts.read().get(function_name).copied()
    }

    pub fn is_worker(&self) -> bool {
        !self.abilities.read().is_empty()
    }

    /// Marks the session asleep until woken or until `deadline`.
    pub fn sleep_until(&self, deadline: Instant) {
        *self.sleep_deadline.lock() = Some(deadline);
        self.sleeping.store(true, Ordering::SeqCst);
    }

    pub fn is_sleeping(&self) -> bool {
        self.sleeping.load(Ordering::SeqCst)
    }

    /// When the bounded re-poll fires, if asleep.
    pub fn sleep_deadline(&self) -> Option<Instant> {
        if self.is_sleeping() {
            *self.sleep_deadline.lock()
        } else {
            None
        }
    }

    /// Sends NOOP if the session was asleep. Returns true if it was.
    pub fn wake(&self) -> bool {
        if !self.sleeping.swap(false, Ordering::SeqCst) {
            return false;
        }
        *self.sleep_deadline.lock() = None;
        self.send(Packet::response(PacketBody::Noop));
        true
    }

    /// OPTION_REQ `exceptions`.
    pub fn set_exceptions(&self, enabled: bool) {
        self.exceptions.store(enabled, Ordering::SeqCst);
    }

    pub fn wants_exceptions(&self) -> bool {
        self.exceptions.load(Ordering::SeqCst)
    }

    pub fn assign(&self, handle: &str) {
        self.assigned.lock().insert(handle.to_string());
    }

    pub fn release(&self, handle: &str) -> bool {
        self.assigned.lock().remove(handle)
    }

    /// Drains the handles of jobs still in flight on this session.
    pub fn take_assigned(&self) -> Vec<String> {
        self.assigned.lock().drain().collect()
    }

    pub fn assigned_count(&self) -> usize {
        self.assigned.lock().len()
    }
}
