//! Session identity and per-session state.
//!
//! A session is created by `initialize`, owns a TTL-bounded key/value
//! memory, and dies on `shutdown`, idle expiry, or transport disconnect.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::time::Duration;

mod in_memory;
mod store;

pub use in_memory::{InMemorySessionStore, spawn_reaper};
pub use store::{SessionError, SessionStore};

/// A unique identifier for a session.
///
/// Server-generated from 128 bits of OS entropy; never derived from client
/// input.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    /// Creates a new, random session ID.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 16];
        rand::rng().fill_bytes(&mut bytes);
        SessionId(hex::encode(bytes))
    }

    /// Wraps a client-supplied string for lookup.
    pub fn from_str(s: &str) -> Self {
        SessionId(s.to_owned())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Authenticated caller identity bound to a session at `initialize` time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Principal {
    Anonymous,
    User(String),
}

impl std::fmt::Display for Principal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Principal::Anonymous => write!(f, "anonymous"),
            Principal::User(name) => write!(f, "{name}"),
        }
    }
}

/// One entry of session memory with its own expiry.
#[derive(Debug, Clone)]
pub struct MemoryEntry {
    pub value: Value,
    pub expires_at: Option<DateTime<Utc>>,
}

impl MemoryEntry {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at < now)
    }
}

/// Mutable per-session state, owned by the session store and only touched
/// under the per-session lock.
#[derive(Debug)]
pub struct SessionContext {
    pub id: SessionId,
    pub principal: Principal,
    pub capabilities: HashSet<String>,
    pub(crate) memory: HashMap<String, MemoryEntry>,
    pub created_at: DateTime<Utc>,
    pub last_touched_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// In-flight invocation ids, in start order.
    pub trace_ids: Vec<String>,
    idle_ttl: ChronoDuration,
}

impl SessionContext {
    pub(crate) fn new(
        principal: Principal,
        capabilities: HashSet<String>,
        idle_ttl: Duration,
    ) -> Self {
        let now = Utc::now();
        let idle_ttl = ChronoDuration::from_std(idle_ttl).unwrap_or(ChronoDuration::MAX);
        SessionContext {
            id: SessionId::generate(),
            principal,
            capabilities,
            memory: HashMap::new(),
            created_at: now,
            last_touched_at: now,
            expires_at: far_future(now, idle_ttl),
            trace_ids: Vec::new(),
            idle_ttl,
        }
    }

    pub(crate) fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }

    /// Any activity refreshes `last_touched_at` and pushes `expires_at` out
    /// by one idle TTL.
    pub(crate) fn touch(&mut self, now: DateTime<Utc>) {
        self.last_touched_at = now;
        self.expires_at = far_future(now, self.idle_ttl);
    }

    /// Drop expired memory entries; returns how many were removed.
    pub(crate) fn sweep_memory(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.memory.len();
        self.memory.retain(|_, entry| !entry.is_expired(now));
        before - self.memory.len()
    }
}

/// Saturating deadline arithmetic; an unrepresentable TTL means "never".
pub(crate) fn far_future(now: DateTime<Utc>, ttl: ChronoDuration) -> DateTime<Utc> {
    now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Read-only view of a session handed out by `get`.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub id: SessionId,
    pub principal: Principal,
    pub capabilities: HashSet<String>,
    pub created_at: DateTime<Utc>,
    pub last_touched_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub in_flight: usize,
}
