use super::{Principal, SessionId, SessionSnapshot};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashSet;
use std::time::Duration;

/// An error type for session store operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SessionError {
    #[error("session not found: {0}")]
    NotFound(SessionId),
    #[error("session expired: {0}")]
    Expired(SessionId),
    #[error("no such entry: {0}")]
    MissingEntry(String),
    #[error("entry expired: {0}")]
    EntryExpired(String),
}

/// Trait for abstracting session storage.
///
/// The core ships [`super::InMemorySessionStore`]; database-backed stores
/// implement the same contract behind this seam. Every operation re-checks
/// session expiry itself; callers must not rely on the reaper having run.
#[async_trait]
pub trait SessionStore: Send + Sync + 'static {
    /// Creates a session and returns its generated id.
    async fn create(
        &self,
        principal: Principal,
        capabilities: HashSet<String>,
        idle_ttl: Duration,
    ) -> SessionId;

    /// Looks up a session. A hit refreshes `last_touched_at` and extends
    /// the idle deadline; an expired session reports `Expired` even before
    /// the reaper reclaims it.
    async fn get(&self, id: &SessionId) -> Result<SessionSnapshot, SessionError>;

    /// Refreshes `last_touched_at` without reading any state.
    async fn touch(&self, id: &SessionId) -> Result<(), SessionError>;

    /// Writes one memory entry, optionally with its own TTL.
    async fn put(
        &self,
        id: &SessionId,
        key: &str,
        value: Value,
        entry_ttl: Option<Duration>,
    ) -> Result<(), SessionError>;

    /// Removes and returns one memory entry.
    async fn take(&self, id: &SessionId, key: &str) -> Result<Value, SessionError>;

    /// Destroys a session. Returns true when something was removed.
    async fn destroy(&self, id: &SessionId) -> bool;

    /// Number of live (non-expired) sessions.
    async fn count(&self) -> usize;

    /// Records an in-flight invocation id on the session trace.
    async fn attach_invocation(
        &self,
        id: &SessionId,
        invocation_id: String,
    ) -> Result<(), SessionError>;

    /// Removes an invocation id from the session trace. Best effort; the
    /// session may already be gone.
    async fn detach_invocation(&self, id: &SessionId, invocation_id: &str);
}
