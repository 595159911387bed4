//! mcpd is the core of an MCP (Model Context Protocol) server.
//!
//! # Overview
//! The crate speaks JSON-RPC 2.0 and exposes three primitive classes to
//! LLM clients: tools (model-invoked actions), prompts (user-invoked
//! templates) and resources (URI-addressed context data). It supports:
//!
//! - Capability-gated registration and discovery of primitives
//! - Per-session state with TTL memory and a background reaper
//! - Deadline-bounded, cancellable invocation with contained failures
//! - Chained multi-step workflows with declared data flow
//!
//! # Architecture
//! Transports (HTTP+SSE, stdio) stay outside this crate and drive the
//! [`dispatch::Dispatcher`], which routes methods onto the registry, the
//! session store, the invocation engine and the workflow orchestrator.

/// Credential verification seam and per-principal rate limiting
pub mod auth;

/// Environment-driven server configuration
pub mod config;

/// Per-invocation context handed to every handler
pub mod context;

/// JSON-RPC method routing over the core subsystems
pub mod dispatch;

/// Protocol error taxonomy and JSON-RPC error codes
pub mod error;

/// The validate-call-wrap invocation pipeline
pub mod invoke;

/// Notification fan-out to streaming transports
pub mod notify;

/// Descriptor registry for tools, prompts and resources
pub mod registry;

/// JSON-RPC 2.0 envelopes and the MCP result envelope
pub mod rpc;

/// Schema datatype and the pure validator
pub mod schema;

/// Session identity, TTL memory and the in-memory store
pub mod session;

/// Chained multi-step execution with failure policies
pub mod workflow;

pub use auth::{AnonymousVerifier, AuthVerifier, Identity, StaticTokenVerifier};
pub use config::{ServerConfig, TransportKind};
pub use context::{InvocationContext, InvocationId};
pub use dispatch::{DispatchResult, Dispatcher, HealthSummary};
pub use error::McpError;
pub use invoke::{InvocationEngine, InvocationLimits, InvokeOptions};
pub use registry::{
    HandlerError, PrimitiveDescriptor, PrimitiveKind, PrimitiveRegistry, blocking_handler_fn,
    handler_fn,
};
pub use rpc::{CallResult, ContentItem, Envelope, RequestId, Response};
pub use schema::{Schema, Violation};
pub use session::{InMemorySessionStore, Principal, SessionId, SessionStore, spawn_reaper};
pub use workflow::{OnError, WorkflowOrchestrator, WorkflowStep};
