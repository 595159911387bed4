//! Invocation engine: validate, call, wrap.
//!
//! Every call runs the same pipeline: resolve the descriptor, gate on
//! capabilities, validate input, admit against the in-flight caps, then
//! race the handler against its deadline and its cancellation token. The
//! handler body runs inside its own task so a panic is contained and
//! surfaces as an internal error instead of tearing down the transport.

use crate::context::{InvocationContext, InvocationId};
use crate::error::McpError;
use crate::registry::{HandlerError, PrimitiveDescriptor, PrimitiveKind, PrimitiveRegistry};
use crate::rpc::CallResult;
use crate::session::{SessionError, SessionId, SessionStore};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, info_span, warn};

/// Engine-wide knobs, all overridable from configuration.
#[derive(Debug, Clone)]
pub struct InvocationLimits {
    pub default_timeout: Duration,
    pub max_inflight_per_session: usize,
    pub max_inflight_global: usize,
}

impl Default for InvocationLimits {
    fn default() -> Self {
        InvocationLimits {
            default_timeout: Duration::from_secs(30),
            max_inflight_per_session: 64,
            max_inflight_global: 1024,
        }
    }
}

/// Per-call knobs.
///
/// The timeout override ranks above the descriptor's own timeout; the
/// parent token links the invocation into a larger unit of work (a
/// workflow) so cancelling the parent cancels the call.
#[derive(Default, Clone)]
pub struct InvokeOptions {
    pub timeout_override: Option<Duration>,
    pub parent_cancel: Option<CancellationToken>,
    /// Pre-assigned invocation id, letting the dispatcher announce the id
    /// before the call settles so `$/cancel` has something to aim at.
    pub invocation_id: Option<InvocationId>,
}

impl InvokeOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        InvokeOptions {
            timeout_override: Some(timeout),
            ..InvokeOptions::default()
        }
    }

    pub fn with_parent(parent: &CancellationToken) -> Self {
        InvokeOptions {
            parent_cancel: Some(parent.clone()),
            ..InvokeOptions::default()
        }
    }
}

/// Terminal and transient states of one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
    TimedOut,
}

/// Short-lived bookkeeping for one call.
#[derive(Debug, Clone)]
pub struct InvocationRecord {
    pub invocation_id: InvocationId,
    pub session_id: SessionId,
    pub primitive_name: String,
    pub primitive_kind: PrimitiveKind,
    pub started_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    pub state: InvocationState,
}

/// What one call produced: the final record plus either a result envelope
/// or a protocol error.
#[derive(Debug)]
pub struct InvocationOutcome {
    pub record: InvocationRecord,
    pub result: Result<CallResult, McpError>,
}

struct ActiveInvocation {
    token: CancellationToken,
}

/// Executes primitives against sessions.
pub struct InvocationEngine {
    registry: Arc<PrimitiveRegistry>,
    sessions: Arc<dyn SessionStore>,
    limits: InvocationLimits,
    active: Mutex<HashMap<InvocationId, ActiveInvocation>>,
    inflight_global: AtomicUsize,
    inflight_sessions: Mutex<HashMap<SessionId, usize>>,
}

impl InvocationEngine {
    pub fn new(
        registry: Arc<PrimitiveRegistry>,
        sessions: Arc<dyn SessionStore>,
        limits: InvocationLimits,
    ) -> Self {
        InvocationEngine {
            registry,
            sessions,
            limits,
            active: Mutex::new(HashMap::new()),
            inflight_global: AtomicUsize::new(0),
            inflight_sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<PrimitiveRegistry> {
        &self.registry
    }

    pub fn sessions(&self) -> &Arc<dyn SessionStore> {
        &self.sessions
    }

    /// Resolve by (kind, name) and invoke.
    pub async fn invoke_named(
        &self,
        session_id: &SessionId,
        kind: PrimitiveKind,
        name: &str,
        input: Value,
        opts: InvokeOptions,
    ) -> InvocationOutcome {
        match self.registry.lookup(kind, name) {
            Some(descriptor) => self.invoke(session_id, descriptor, input, opts).await,
            None => InvocationOutcome {
                record: self.stillborn_record(session_id, kind, name),
                result: Err(McpError::PrimitiveNotFound {
                    name: name.to_owned(),
                }),
            },
        }
    }

    /// Run the full pipeline for an already-resolved descriptor.
    pub async fn invoke(
        &self,
        session_id: &SessionId,
        descriptor: Arc<PrimitiveDescriptor>,
        input: Value,
        opts: InvokeOptions,
    ) -> InvocationOutcome {
        let invocation_id = opts
            .invocation_id
            .clone()
            .unwrap_or_else(InvocationId::generate);
        let started_at = Utc::now();
        let timeout = opts
            .timeout_override
            .or(descriptor.timeout)
            .unwrap_or(self.limits.default_timeout);
        let deadline = ChronoDuration::from_std(timeout)
            .ok()
            .and_then(|d| started_at.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        let mut record = InvocationRecord {
            invocation_id: invocation_id.clone(),
            session_id: session_id.clone(),
            primitive_name: descriptor.name.clone(),
            primitive_kind: descriptor.kind,
            started_at,
            deadline,
            state: InvocationState::Pending,
        };

        // Register the token before any suspension point so a `$/cancel`
        // racing the call start still finds its target.
        let token = opts
            .parent_cancel
            .map(|parent| parent.child_token())
            .unwrap_or_default();
        self.active.lock().insert(
            invocation_id.clone(),
            ActiveInvocation {
                token: token.clone(),
            },
        );

        let result = self
            .run_pipeline(&mut record, descriptor, input, timeout, token)
            .await;

        self.active.lock().remove(&invocation_id);
        InvocationOutcome { record, result }
    }

    /// Signal cooperative cancellation for an in-flight invocation.
    /// Returns false when the invocation is unknown or already finished.
    pub fn cancel(&self, invocation_id: &InvocationId) -> bool {
        let active = self.active.lock();
        match active.get(invocation_id) {
            Some(entry) => {
                entry.token.cancel();
                true
            }
            None => false,
        }
    }

    async fn run_pipeline(
        &self,
        record: &mut InvocationRecord,
        descriptor: Arc<PrimitiveDescriptor>,
        input: Value,
        timeout: Duration,
        token: CancellationToken,
    ) -> Result<CallResult, McpError> {
        // Session must be live; expired and destroyed look the same from
        // the protocol.
        let session = match self.sessions.get(&record.session_id).await {
            Ok(snapshot) => snapshot,
            Err(SessionError::NotFound(id) | SessionError::Expired(id)) => {
                record.state = InvocationState::Failed;
                return Err(McpError::SessionGone {
                    session_id: id.to_string(),
                });
            }
            Err(other) => {
                record.state = InvocationState::Failed;
                return Err(McpError::internal(other));
            }
        };

        // Capability gate before anything touches the input.
        let missing: Vec<String> = descriptor
            .required_capabilities
            .iter()
            .filter(|c| !session.capabilities.contains(*c))
            .cloned()
            .collect();
        if !missing.is_empty() {
            record.state = InvocationState::Failed;
            return Err(McpError::CapabilityDenied { missing });
        }

        if let Err(violations) = descriptor.input_schema.validate(&input) {
            record.state = InvocationState::Failed;
            return Err(McpError::InvalidParams {
                reason: "schema validation failed".to_owned(),
                violations,
            });
        }

        let _admission = self.try_admit(&record.session_id)?;

        if self
            .sessions
            .attach_invocation(&record.session_id, record.invocation_id.to_string())
            .await
            .is_err()
        {
            record.state = InvocationState::Failed;
            return Err(McpError::SessionGone {
                session_id: record.session_id.to_string(),
            });
        }

        record.state = InvocationState::Running;
        let capabilities = Arc::new(session.capabilities);
        let result = self
            .race_handler(record, &descriptor, input, timeout, token, capabilities)
            .await;

        self.sessions
            .detach_invocation(&record.session_id, record.invocation_id.as_str())
            .await;
        result
    }

    async fn race_handler(
        &self,
        record: &mut InvocationRecord,
        descriptor: &Arc<PrimitiveDescriptor>,
        input: Value,
        timeout: Duration,
        token: CancellationToken,
        capabilities: Arc<std::collections::HashSet<String>>,
    ) -> Result<CallResult, McpError> {
        let span = info_span!(
            "invoke",
            session_id = %record.session_id,
            invocation_id = %record.invocation_id,
            primitive = %descriptor.name,
        );
        let ctx = InvocationContext {
            session_id: record.session_id.clone(),
            invocation_id: record.invocation_id.clone(),
            capabilities,
            cancellation: token.clone(),
            deadline: record.deadline,
            span: span.clone(),
        };

        // The handler runs in its own task: a panic ends that task, not the
        // request loop.
        let handler = Arc::clone(&descriptor.handler);
        let mut handle =
            tokio::spawn(async move { handler.invoke(ctx, input).await }.instrument(span));

        let sleep = tokio::time::sleep(timeout);
        tokio::pin!(sleep);

        tokio::select! {
            biased;

            joined = &mut handle => {
                self.finish(record, descriptor, joined)
            }
            _ = token.cancelled() => {
                record.state = InvocationState::Cancelled;
                let handler_abandoned = !handle.is_finished();
                if handler_abandoned {
                    warn!(
                        invocation_id = %record.invocation_id,
                        "cancelled invocation abandoned; handler may still be running"
                    );
                }
                Err(McpError::Cancelled {
                    invocation_id: record.invocation_id.to_string(),
                    handler_abandoned,
                })
            }
            _ = &mut sleep => {
                record.state = InvocationState::TimedOut;
                // Let the orphaned handler learn it should stop.
                token.cancel();
                Err(McpError::InvocationTimeout {
                    invocation_id: record.invocation_id.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    fn finish(
        &self,
        record: &mut InvocationRecord,
        descriptor: &Arc<PrimitiveDescriptor>,
        joined: Result<Result<Value, HandlerError>, tokio::task::JoinError>,
    ) -> Result<CallResult, McpError> {
        match joined {
            Ok(Ok(output)) => {
                // An output that breaks its declared schema is a tool bug,
                // surfaced as internal rather than invalid params.
                if let Err(violations) = descriptor.output_schema.validate(&output) {
                    record.state = InvocationState::Failed;
                    return Err(McpError::internal(format!(
                        "{} `{}` produced output violating its schema: {:?}",
                        descriptor.kind, descriptor.name, violations
                    )));
                }
                record.state = InvocationState::Succeeded;
                Ok(CallResult::from_output(output))
            }
            Ok(Err(HandlerError::Domain { message, detail })) => {
                record.state = InvocationState::Failed;
                Ok(CallResult::domain_error(message, detail))
            }
            Ok(Err(HandlerError::Internal(cause))) => {
                record.state = InvocationState::Failed;
                Err(McpError::internal(cause))
            }
            Err(join_err) if join_err.is_panic() => {
                record.state = InvocationState::Failed;
                Err(McpError::internal(format!(
                    "handler panicked: {join_err}"
                )))
            }
            Err(join_err) => {
                record.state = InvocationState::Failed;
                Err(McpError::internal(join_err))
            }
        }
    }

    /// Current number of in-flight invocations across all sessions.
    pub fn inflight_global(&self) -> usize {
        self.inflight_global.load(Ordering::SeqCst)
    }

    pub fn max_inflight_global(&self) -> usize {
        self.limits.max_inflight_global
    }

    fn try_admit(&self, session_id: &SessionId) -> Result<InflightGuard<'_>, McpError> {
        let global = self.inflight_global.fetch_add(1, Ordering::SeqCst);
        if global >= self.limits.max_inflight_global {
            self.inflight_global.fetch_sub(1, Ordering::SeqCst);
            return Err(McpError::RateLimited {
                scope: "global".to_owned(),
                retry_after_ms: 1000,
            });
        }

        let mut per_session = self.inflight_sessions.lock();
        let count = per_session.entry(session_id.clone()).or_insert(0);
        if *count >= self.limits.max_inflight_per_session {
            drop(per_session);
            self.inflight_global.fetch_sub(1, Ordering::SeqCst);
            return Err(McpError::RateLimited {
                scope: "session".to_owned(),
                retry_after_ms: 1000,
            });
        }
        *count += 1;

        Ok(InflightGuard {
            engine: self,
            session_id: session_id.clone(),
        })
    }

    fn stillborn_record(
        &self,
        session_id: &SessionId,
        kind: PrimitiveKind,
        name: &str,
    ) -> InvocationRecord {
        let now = Utc::now();
        InvocationRecord {
            invocation_id: InvocationId::generate(),
            session_id: session_id.clone(),
            primitive_name: name.to_owned(),
            primitive_kind: kind,
            started_at: now,
            deadline: now,
            state: InvocationState::Failed,
        }
    }
}

/// Releases the in-flight slots when the invocation finishes, whichever
/// way it finishes.
struct InflightGuard<'a> {
    engine: &'a InvocationEngine,
    session_id: SessionId,
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        self.engine.inflight_global.fetch_sub(1, Ordering::SeqCst);
        let mut per_session = self.engine.inflight_sessions.lock();
        if let Some(count) = per_session.get_mut(&self.session_id) {
            *count -= 1;
            if *count == 0 {
                per_session.remove(&self.session_id);
            }
        }
    }
}
