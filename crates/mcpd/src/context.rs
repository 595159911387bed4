//! Per-invocation context threaded through every handler call.

use crate::session::SessionId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// A unique identifier for one invocation of a primitive.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct InvocationId(String);

impl InvocationId {
    pub fn generate() -> Self {
        InvocationId(uuid::Uuid::new_v4().to_string())
    }

    pub fn from_str(s: &str) -> Self {
        InvocationId(s.to_owned())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for InvocationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Everything a handler may rely on during one call.
///
/// Handlers observe `cancellation` at their suspension points and should
/// give up promptly once it fires; the engine stops waiting at `deadline`
/// either way. There is no global state behind this struct.
#[derive(Clone)]
pub struct InvocationContext {
    pub session_id: SessionId,
    pub invocation_id: InvocationId,
    pub capabilities: Arc<HashSet<String>>,
    pub cancellation: CancellationToken,
    pub deadline: DateTime<Utc>,
    /// Span for handler-side structured logging, already tagged with the
    /// session and invocation ids.
    pub span: tracing::Span,
}

impl InvocationContext {
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.contains(capability)
    }

    /// Remaining time before the engine abandons this call.
    pub fn time_remaining(&self) -> std::time::Duration {
        (self.deadline - Utc::now())
            .to_std()
            .unwrap_or(std::time::Duration::ZERO)
    }
}
