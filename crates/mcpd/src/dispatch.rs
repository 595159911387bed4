//! Protocol dispatcher: route JSON-RPC methods onto the core subsystems.
//!
//! The dispatcher owns the method table. Transports hand it one raw
//! message at a time together with any transport-level credentials; it
//! hands back at most one response. Notifications produce none. Nothing
//! in here ever panics outward: handler failures are already contained by
//! the engine, and dispatch failures become JSON-RPC error objects.

use crate::auth::{AuthVerifier, RateLimiter};
use crate::config::ServerConfig;
use crate::context::InvocationId;
use crate::error::McpError;
use crate::invoke::{InvocationEngine, InvocationLimits, InvokeOptions};
use crate::notify::NotificationBus;
use crate::registry::{PrimitiveKind, PrimitiveRegistry};
use crate::rpc::{self, Envelope, RequestId, Response};
use crate::session::{Principal, SessionError, SessionId, SessionStore};
use crate::workflow::{WorkflowContext, WorkflowOrchestrator, WorkflowStep};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What one inbound message produced, with the session bookkeeping the
/// owning transport needs for its own lifecycle (stdio destroys the
/// sessions it created when its stream ends).
#[derive(Debug, Default)]
pub struct DispatchResult {
    pub response: Option<Response>,
    pub session_created: Option<SessionId>,
    pub session_destroyed: Option<SessionId>,
}

impl DispatchResult {
    fn respond(response: Response) -> Self {
        DispatchResult {
            response: Some(response),
            ..DispatchResult::default()
        }
    }

    fn silent() -> Self {
        DispatchResult::default()
    }
}

/// Liveness summary served by `GET /health`.
#[derive(Debug, serde::Serialize)]
pub struct HealthSummary {
    pub status: &'static str,
    pub sessions: usize,
    pub uptime_s: u64,
    pub registry: RegistryCounts,
}

#[derive(Debug, serde::Serialize)]
pub struct RegistryCounts {
    pub tools: usize,
    pub prompts: usize,
    pub resources: usize,
}

/// The server core behind every transport.
pub struct Dispatcher {
    registry: Arc<PrimitiveRegistry>,
    sessions: Arc<dyn SessionStore>,
    engine: Arc<InvocationEngine>,
    orchestrator: WorkflowOrchestrator,
    verifier: Arc<dyn AuthVerifier>,
    config: ServerConfig,
    notifications: NotificationBus,
    rate: RateLimiter,
    started_at: std::time::Instant,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<PrimitiveRegistry>,
        sessions: Arc<dyn SessionStore>,
        verifier: Arc<dyn AuthVerifier>,
        config: ServerConfig,
    ) -> Self {
        let limits = InvocationLimits {
            default_timeout: config.invocation_timeout,
            max_inflight_per_session: config.max_inflight_per_session,
            max_inflight_global: config.max_inflight_global,
        };
        let engine = Arc::new(InvocationEngine::new(
            Arc::clone(&registry),
            Arc::clone(&sessions),
            limits,
        ));
        Dispatcher {
            registry,
            sessions,
            orchestrator: WorkflowOrchestrator::new(Arc::clone(&engine)),
            engine,
            verifier,
            rate: RateLimiter::new(config.rate_limit_per_min),
            config,
            notifications: NotificationBus::new(),
            started_at: std::time::Instant::now(),
        }
    }

    pub fn registry(&self) -> &Arc<PrimitiveRegistry> {
        &self.registry
    }

    pub fn sessions(&self) -> &Arc<dyn SessionStore> {
        &self.sessions
    }

    pub fn engine(&self) -> &Arc<InvocationEngine> {
        &self.engine
    }

    pub fn verifier(&self) -> &Arc<dyn AuthVerifier> {
        &self.verifier
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn notifications(&self) -> &NotificationBus {
        &self.notifications
    }

    /// Handle one raw inbound message.
    pub async fn handle(&self, raw: &str, bearer: Option<&str>) -> DispatchResult {
        let envelope = match rpc::parse_envelope(raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!(code = e.code(), "rejected unparseable message");
                return DispatchResult::respond(Response::err(None, e));
            }
        };

        if envelope.is_notification() {
            self.handle_notification(envelope).await;
            return DispatchResult::silent();
        }

        let id = envelope.id.clone().expect("checked above");
        let method = envelope.method.clone();
        let mut result = self.route(envelope, bearer).await;
        if let Err(e) = &result.1 {
            debug!(method = %method, code = e.code(), "request failed");
        }
        let response = match result.1 {
            Ok(value) => Response::ok(id, value),
            Err(e) => Response::err(Some(id), e),
        };
        result.0.response = Some(response);
        result.0
    }

    async fn handle_notification(&self, envelope: Envelope) {
        match envelope.method.as_str() {
            "$/cancel" => {
                let Some(invocation_id) =
                    param_str(&envelope.params, &["invocationId", "invocation_id"])
                else {
                    warn!("$/cancel without invocation id");
                    return;
                };
                let invocation_id = InvocationId::from_str(&invocation_id);
                if self.engine.cancel(&invocation_id) {
                    info!(invocation_id = %invocation_id, "cancellation requested");
                } else {
                    debug!(invocation_id = %invocation_id, "cancel for unknown invocation");
                }
            }
            other => {
                debug!(method = %other, "ignoring unknown notification");
            }
        }
    }

    async fn route(
        &self,
        envelope: Envelope,
        bearer: Option<&str>,
    ) -> (DispatchResult, Result<Value, McpError>) {
        let mut bookkeeping = DispatchResult::silent();
        let params = envelope.params;
        let request_id = envelope.id;

        let result = match envelope.method.as_str() {
            "initialize" => self.initialize(&params, bearer, &mut bookkeeping).await,
            "shutdown" => self.shutdown(&params, &mut bookkeeping).await,
            "ping" => self.ping(&params).await,
            "tools/list" => self.list(&params, PrimitiveKind::Tool).await,
            "prompts/list" => self.list(&params, PrimitiveKind::Prompt).await,
            "resources/list" => self.list(&params, PrimitiveKind::Resource).await,
            "tools/call" => {
                self.call_primitive(&params, PrimitiveKind::Tool, request_id.as_ref())
                    .await
            }
            "prompts/get" => {
                self.call_primitive(&params, PrimitiveKind::Prompt, request_id.as_ref())
                    .await
            }
            "resources/read" => self.read_resource(&params, request_id.as_ref()).await,
            "workflows/run" => self.run_workflow(&params).await,
            other => Err(McpError::MethodNotFound {
                method: other.to_owned(),
            }),
        };

        (bookkeeping, result)
    }

    pub async fn health(&self) -> HealthSummary {
        let (tools, prompts, resources) = self.registry.counts();
        let saturated =
            self.engine.inflight_global() * 10 >= self.engine.max_inflight_global() * 9;
        HealthSummary {
            status: if saturated { "degraded" } else { "ok" },
            sessions: self.sessions.count().await,
            uptime_s: self.started_at.elapsed().as_secs(),
            registry: RegistryCounts {
                tools,
                prompts,
                resources,
            },
        }
    }

    // ── Methods ────────────────────────────────────────────────────────────

    async fn initialize(
        &self,
        params: &Value,
        bearer: Option<&str>,
        bookkeeping: &mut DispatchResult,
    ) -> Result<Value, McpError> {
        // Stdio clients carry credentials in the handshake params; HTTP
        // clients in the Authorization header.
        let handshake_token = param_str(params, &["authToken", "auth_token"]);
        let token = bearer.or(handshake_token.as_deref());
        let identity =
            self.verifier
                .verify(token)
                .await
                .map_err(|e| McpError::Unauthorized {
                    reason: e.to_string(),
                })?;

        self.check_rate(&identity.principal)?;

        let client_version = param_str(params, &["protocolVersion", "protocol_version"]);
        let protocol_version = match client_version.as_deref() {
            None | Some(rpc::PROTOCOL_VERSION) => rpc::PROTOCOL_VERSION,
            Some(other) => {
                debug!(requested = %other, "client asked for a different protocol revision");
                rpc::PROTOCOL_VERSION
            }
        };

        let session_id = self
            .sessions
            .create(
                identity.principal.clone(),
                identity.capabilities,
                self.config.session_ttl,
            )
            .await;
        info!(session_id = %session_id, principal = %identity.principal, "session created");
        bookkeeping.session_created = Some(session_id.clone());

        Ok(json!({
            "protocolVersion": protocol_version,
            "serverInfo": {
                "name": "mcpd",
                "version": env!("CARGO_PKG_VERSION"),
            },
            "capabilities": {
                "tools": { "list": true, "call": true },
                "prompts": { "list": true, "get": true },
                "resources": { "list": true, "read": true },
                "workflows": { "run": true },
            },
            "sessionId": session_id.to_string(),
        }))
    }

    async fn shutdown(
        &self,
        params: &Value,
        bookkeeping: &mut DispatchResult,
    ) -> Result<Value, McpError> {
        let session_id = required_session(params)?;
        // Destroying twice (or a session already reaped) is SessionGone,
        // same as any other call on a dead session.
        if !self.sessions.destroy(&session_id).await {
            return Err(McpError::SessionGone {
                session_id: session_id.to_string(),
            });
        }
        info!(session_id = %session_id, "session destroyed");
        bookkeeping.session_destroyed = Some(session_id);
        Ok(json!({}))
    }

    async fn ping(&self, params: &Value) -> Result<Value, McpError> {
        let session_id = required_session(params)?;
        let snapshot = self.live_session(&session_id).await?;
        self.check_rate(&snapshot.principal)?;
        Ok(json!({}))
    }

    async fn list(&self, params: &Value, kind: PrimitiveKind) -> Result<Value, McpError> {
        let session_id = required_session(params)?;
        let snapshot = self.live_session(&session_id).await?;
        self.check_rate(&snapshot.principal)?;

        let cursor = param_str(params, &["cursor"]);
        let limit = params
            .get("limit")
            .and_then(Value::as_u64)
            .map(|l| l as usize);
        let include_schemas = params
            .get("includeSchemas")
            .or_else(|| params.get("include_schemas"))
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let page = self
            .registry
            .list(kind, cursor.as_deref(), limit, include_schemas)?;
        serde_json::to_value(&page).map_err(McpError::internal)
    }

    async fn call_primitive(
        &self,
        params: &Value,
        kind: PrimitiveKind,
        request_id: Option<&RequestId>,
    ) -> Result<Value, McpError> {
        let session_id = required_session(params)?;
        let snapshot = self.live_session(&session_id).await?;
        self.check_rate(&snapshot.principal)?;

        let name = param_str(params, &["name"])
            .ok_or_else(|| McpError::invalid_params("missing `name`"))?;
        let arguments = params
            .get("arguments")
            .cloned()
            .unwrap_or_else(|| json!({}));
        let timeout_override = params
            .get("timeoutMs")
            .or_else(|| params.get("timeout_ms"))
            .and_then(Value::as_u64)
            .map(Duration::from_millis);

        let invocation_id = InvocationId::generate();
        self.announce_invocation(&session_id, &invocation_id, request_id);

        let opts = InvokeOptions {
            timeout_override,
            parent_cancel: None,
            invocation_id: Some(invocation_id),
        };
        let outcome = self
            .engine
            .invoke_named(&session_id, kind, &name, arguments, opts)
            .await;
        let result = outcome.result?;
        serde_json::to_value(&result).map_err(McpError::internal)
    }

    async fn read_resource(
        &self,
        params: &Value,
        request_id: Option<&RequestId>,
    ) -> Result<Value, McpError> {
        let session_id = required_session(params)?;
        let snapshot = self.live_session(&session_id).await?;
        self.check_rate(&snapshot.principal)?;

        let uri = param_str(params, &["uri"])
            .ok_or_else(|| McpError::invalid_params("missing `uri`"))?;
        let (descriptor, extracted) = self.registry.resolve_resource(&uri)?;

        // Extracted placeholders are the handler input.
        let mut input = serde_json::Map::new();
        for (key, value) in extracted {
            input.insert(key, Value::String(value));
        }

        let invocation_id = InvocationId::generate();
        self.announce_invocation(&session_id, &invocation_id, request_id);

        let opts = InvokeOptions {
            invocation_id: Some(invocation_id),
            ..InvokeOptions::default()
        };
        let outcome = self
            .engine
            .invoke(&session_id, descriptor, Value::Object(input), opts)
            .await;
        let result = outcome.result?;
        serde_json::to_value(&result).map_err(McpError::internal)
    }

    async fn run_workflow(&self, params: &Value) -> Result<Value, McpError> {
        let session_id = required_session(params)?;
        let snapshot = self.live_session(&session_id).await?;
        self.check_rate(&snapshot.principal)?;

        let steps: Vec<WorkflowStep> = params
            .get("steps")
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| McpError::invalid_params(format!("bad steps: {e}")))?
            .ok_or_else(|| McpError::invalid_params("missing `steps`"))?;
        let initial: WorkflowContext = match params.get("context") {
            Some(Value::Object(map)) => map.clone(),
            Some(_) => {
                return Err(McpError::invalid_params("`context` must be an object"));
            }
            None => WorkflowContext::new(),
        };

        let outcome = self
            .orchestrator
            .run(&session_id, steps, initial, CancellationToken::new())
            .await?;
        serde_json::to_value(&outcome).map_err(McpError::internal)
    }

    // ── Helpers ────────────────────────────────────────────────────────────

    async fn live_session(
        &self,
        session_id: &SessionId,
    ) -> Result<crate::session::SessionSnapshot, McpError> {
        self.sessions.get(session_id).await.map_err(|e| match e {
            SessionError::NotFound(id) | SessionError::Expired(id) => McpError::SessionGone {
                session_id: id.to_string(),
            },
            other => McpError::internal(other),
        })
    }

    fn check_rate(&self, principal: &Principal) -> Result<(), McpError> {
        self.rate.check(principal).map_err(|retry_after_ms| {
            McpError::RateLimited {
                scope: "principal".to_owned(),
                retry_after_ms,
            }
        })
    }

    /// Tell streaming listeners which invocation id backs which request id,
    /// so they can target `$/cancel` at an in-flight call.
    fn announce_invocation(
        &self,
        session_id: &SessionId,
        invocation_id: &InvocationId,
        request_id: Option<&RequestId>,
    ) {
        self.notifications.publish(Envelope::notification(
            "$/invocation",
            json!({
                "sessionId": session_id.to_string(),
                "invocationId": invocation_id.to_string(),
                "requestId": request_id,
            }),
        ));
    }
}

fn param_str(params: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|key| params.get(key))
        .and_then(Value::as_str)
        .map(str::to_owned)
}

fn required_session(params: &Value) -> Result<SessionId, McpError> {
    param_str(params, &["sessionId", "session_id"])
        .map(|s| SessionId::from_str(&s))
        .ok_or_else(|| McpError::invalid_params("missing `sessionId`"))
}
