use super::{
    MemoryEntry, Principal, SessionContext, SessionError, SessionId, SessionSnapshot, SessionStore,
};
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// An in-memory implementation of the [`SessionStore`] trait.
///
/// The id table is read-mostly and guarded by a `RwLock`; each session's
/// state sits behind its own async mutex so two sessions never contend and
/// no operation ever holds two session locks at once.
pub struct InMemorySessionStore {
    sessions: RwLock<HashMap<SessionId, Arc<Mutex<SessionContext>>>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
        }
    }

    fn handle(&self, id: &SessionId) -> Result<Arc<Mutex<SessionContext>>, SessionError> {
        self.sessions
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| SessionError::NotFound(id.clone()))
    }

    /// One reaper pass: drop expired sessions, sweep expired entries in the
    /// survivors. Returns the number of sessions reclaimed.
    pub async fn sweep(&self) -> usize {
        let now = Utc::now();
        let handles: Vec<(SessionId, Arc<Mutex<SessionContext>>)> = {
            let table = self.sessions.read();
            table.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
        };

        let mut dead = Vec::new();
        for (id, handle) in handles {
            let mut ctx = handle.lock().await;
            if ctx.is_expired(now) {
                dead.push(id);
            } else {
                let dropped = ctx.sweep_memory(now);
                if dropped > 0 {
                    trace!(session_id = %id, dropped, "swept expired memory entries");
                }
            }
        }

        let reclaimed = dead.len();
        if reclaimed > 0 {
            let mut table = self.sessions.write();
            for id in &dead {
                table.remove(id);
            }
            debug!(reclaimed, "reaped expired sessions");
        }
        reclaimed
    }
}

impl Default for InMemorySessionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn create(
        &self,
        principal: Principal,
        capabilities: HashSet<String>,
        idle_ttl: Duration,
    ) -> SessionId {
        let ctx = SessionContext::new(principal, capabilities, idle_ttl);
        let id = ctx.id.clone();
        self.sessions
            .write()
            .insert(id.clone(), Arc::new(Mutex::new(ctx)));
        id
    }

    async fn get(&self, id: &SessionId) -> Result<SessionSnapshot, SessionError> {
        let handle = self.handle(id)?;
        let mut ctx = handle.lock().await;
        let now = Utc::now();
        if ctx.is_expired(now) {
            return Err(SessionError::Expired(id.clone()));
        }
        ctx.touch(now);
        Ok(SessionSnapshot {
            id: ctx.id.clone(),
            principal: ctx.principal.clone(),
            capabilities: ctx.capabilities.clone(),
            created_at: ctx.created_at,
            last_touched_at: ctx.last_touched_at,
            expires_at: ctx.expires_at,
            in_flight: ctx.trace_ids.len(),
        })
    }

    async fn touch(&self, id: &SessionId) -> Result<(), SessionError> {
        let handle = self.handle(id)?;
        let mut ctx = handle.lock().await;
        let now = Utc::now();
        if ctx.is_expired(now) {
            return Err(SessionError::Expired(id.clone()));
        }
        ctx.touch(now);
        Ok(())
    }

    async fn put(
        &self,
        id: &SessionId,
        key: &str,
        value: Value,
        entry_ttl: Option<Duration>,
    ) -> Result<(), SessionError> {
        let handle = self.handle(id)?;
        let mut ctx = handle.lock().await;
        let now = Utc::now();
        if ctx.is_expired(now) {
            return Err(SessionError::Expired(id.clone()));
        }
        ctx.touch(now);
        let expires_at = entry_ttl
            .and_then(|ttl| ChronoDuration::from_std(ttl).ok())
            .map(|ttl| super::far_future(now, ttl));
        ctx.memory
            .insert(key.to_owned(), MemoryEntry { value, expires_at });
        Ok(())
    }

    async fn take(&self, id: &SessionId, key: &str) -> Result<Value, SessionError> {
        let handle = self.handle(id)?;
        let mut ctx = handle.lock().await;
        let now = Utc::now();
        if ctx.is_expired(now) {
            return Err(SessionError::Expired(id.clone()));
        }
        ctx.touch(now);
        match ctx.memory.remove(key) {
            Some(entry) if entry.is_expired(now) => {
                Err(SessionError::EntryExpired(key.to_owned()))
            }
            Some(entry) => Ok(entry.value),
            None => Err(SessionError::MissingEntry(key.to_owned())),
        }
    }

    async fn destroy(&self, id: &SessionId) -> bool {
        self.sessions.write().remove(id).is_some()
    }

    async fn count(&self) -> usize {
        let handles: Vec<Arc<Mutex<SessionContext>>> =
            self.sessions.read().values().cloned().collect();
        let now = Utc::now();
        let mut live = 0;
        for handle in handles {
            if !handle.lock().await.is_expired(now) {
                live += 1;
            }
        }
        live
    }

    async fn attach_invocation(
        &self,
        id: &SessionId,
        invocation_id: String,
    ) -> Result<(), SessionError> {
        let handle = self.handle(id)?;
        let mut ctx = handle.lock().await;
        let now = Utc::now();
        if ctx.is_expired(now) {
            return Err(SessionError::Expired(id.clone()));
        }
        ctx.trace_ids.push(invocation_id);
        Ok(())
    }

    async fn detach_invocation(&self, id: &SessionId, invocation_id: &str) {
        if let Ok(handle) = self.handle(id) {
            let mut ctx = handle.lock().await;
            ctx.trace_ids.retain(|t| t != invocation_id);
        }
    }
}

/// Spawn the background reaper sweeping expired sessions and entries at a
/// fixed cadence until `shutdown` fires. Reaping is best effort; every
/// store operation re-checks expiry on its own.
pub fn spawn_reaper(
    store: Arc<InMemorySessionStore>,
    interval: Duration,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    store.sweep().await;
                }
                _ = shutdown.cancelled() => {
                    debug!("session reaper stopping");
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> InMemorySessionStore {
        InMemorySessionStore::new()
    }

    const TTL: Duration = Duration::from_secs(3600);

    // ── Lifecycle ──────────────────────────────────────────────────────────

    #[tokio::test]
    async fn create_then_get_round_trips_identity() {
        let store = store();
        let caps: HashSet<String> = ["tools".to_owned()].into();
        let id = store
            .create(Principal::User("ada".into()), caps.clone(), TTL)
            .await;

        let snap = store.get(&id).await.unwrap();
        assert_eq!(snap.principal, Principal::User("ada".into()));
        assert_eq!(snap.capabilities, caps);
        assert!(snap.last_touched_at <= snap.expires_at);
    }

    #[tokio::test]
    async fn session_ids_are_long_and_unique() {
        let store = store();
        let a = store.create(Principal::Anonymous, HashSet::new(), TTL).await;
        let b = store.create(Principal::Anonymous, HashSet::new(), TTL).await;
        assert_ne!(a, b);
        // 128 bits, hex-encoded.
        assert_eq!(a.as_str().len(), 32);
    }

    #[tokio::test]
    async fn get_unknown_is_not_found() {
        let store = store();
        let err = store.get(&SessionId::from_str("nope")).await.unwrap_err();
        assert!(matches!(err, SessionError::NotFound(_)));
    }

    #[tokio::test]
    async fn destroy_then_get_is_not_found() {
        let store = store();
        let id = store.create(Principal::Anonymous, HashSet::new(), TTL).await;
        assert!(store.destroy(&id).await);
        assert!(!store.destroy(&id).await);
        assert!(matches!(
            store.get(&id).await.unwrap_err(),
            SessionError::NotFound(_)
        ));
    }

    // ── Expiry ─────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn expired_session_reports_expired_without_reaper() {
        let store = store();
        let id = store
            .create(Principal::Anonymous, HashSet::new(), Duration::ZERO)
            .await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(matches!(
            store.get(&id).await.unwrap_err(),
            SessionError::Expired(_)
        ));
    }

    #[tokio::test]
    async fn touch_extends_the_idle_deadline() {
        let store = store();
        let id = store.create(Principal::Anonymous, HashSet::new(), TTL).await;
        let before = store.get(&id).await.unwrap().expires_at;
        tokio::time::sleep(Duration::from_millis(20)).await;
        store.touch(&id).await.unwrap();
        let after = store.get(&id).await.unwrap().expires_at;
        assert!(after >= before);
    }

    #[tokio::test]
    async fn sweep_reclaims_expired_sessions() {
        let store = store();
        let dead = store
            .create(Principal::Anonymous, HashSet::new(), Duration::ZERO)
            .await;
        let live = store.create(Principal::Anonymous, HashSet::new(), TTL).await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(store.sweep().await, 1);
        assert!(matches!(
            store.get(&dead).await.unwrap_err(),
            SessionError::NotFound(_)
        ));
        assert!(store.get(&live).await.is_ok());
    }

    // ── Memory ─────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn put_take_round_trip() {
        let store = store();
        let id = store.create(Principal::Anonymous, HashSet::new(), TTL).await;
        store
            .put(&id, "story", json!({"title": "x"}), None)
            .await
            .unwrap();
        let value = store.take(&id, "story").await.unwrap();
        assert_eq!(value["title"], "x");
        // take removes the entry
        assert!(matches!(
            store.take(&id, "story").await.unwrap_err(),
            SessionError::MissingEntry(_)
        ));
    }

    #[tokio::test]
    async fn expired_entry_is_invisible() {
        let store = store();
        let id = store.create(Principal::Anonymous, HashSet::new(), TTL).await;
        store
            .put(&id, "blip", json!(1), Some(Duration::ZERO))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(matches!(
            store.take(&id, "blip").await.unwrap_err(),
            SessionError::EntryExpired(_)
        ));
    }

    #[tokio::test]
    async fn concurrent_puts_linearize_to_one_winner() {
        let store = Arc::new(store());
        let id = store.create(Principal::Anonymous, HashSet::new(), TTL).await;

        let mut tasks = Vec::new();
        for i in 0..16 {
            let store = store.clone();
            let id = id.clone();
            tasks.push(tokio::spawn(async move {
                store.put(&id, "k", json!(i), None).await.unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let value = store.take(&id, "k").await.unwrap();
        let winner = value.as_i64().unwrap();
        assert!((0..16).contains(&winner));
    }

    // ── Trace bookkeeping ──────────────────────────────────────────────────

    #[tokio::test]
    async fn invocations_attach_and_detach() {
        let store = store();
        let id = store.create(Principal::Anonymous, HashSet::new(), TTL).await;
        store.attach_invocation(&id, "inv-1".into()).await.unwrap();
        store.attach_invocation(&id, "inv-2".into()).await.unwrap();
        assert_eq!(store.get(&id).await.unwrap().in_flight, 2);

        store.detach_invocation(&id, "inv-1").await;
        assert_eq!(store.get(&id).await.unwrap().in_flight, 1);
    }
}
