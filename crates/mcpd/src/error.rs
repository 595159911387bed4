//! Structured protocol error type.
//!
//! Every variant carries typed context and maps to a specific JSON-RPC
//! error code via [`McpError::code`]. User-visible messages stay short and
//! stable; diagnostic detail travels in the error `data` object built by
//! [`McpError::data`] and in the server log.

use crate::schema::Violation;
use serde_json::{Value, json};
use thiserror::Error;

/// Protocol-level error for the MCP server core.
///
/// | Code   | Variant             | Meaning                              |
/// |--------|---------------------|--------------------------------------|
/// | -32700 | `Parse`             | malformed JSON                       |
/// | -32600 | `InvalidRequest`    | not a valid JSON-RPC envelope        |
/// | -32601 | `MethodNotFound`    | unknown method                       |
/// | -32602 | `InvalidParams`     | schema violation or bad arguments    |
/// | -32603 | `Internal`          | unexpected failure, see correlation  |
/// | -32010 | `Unauthorized`      | credential verification failed       |
/// | -32011 | `SessionGone`       | session destroyed or expired         |
/// | -32012 | `PrimitiveNotFound` | no descriptor for (kind, name)/URI   |
/// | -32013 | `AmbiguousResource` | URI matched by several templates     |
/// | -32014 | `InvocationTimeout` | handler missed its deadline          |
/// | -32015 | `Cancelled`         | invocation cancelled cooperatively   |
/// | -32016 | `CapabilityDenied`  | session lacks a required capability  |
/// | -32017 | `RateLimited`       | per-session/global/principal cap hit |
#[derive(Debug, Error, Clone)]
#[non_exhaustive]
pub enum McpError {
    #[error("parse error")]
    Parse { detail: String },

    #[error("invalid request")]
    InvalidRequest { reason: String },

    #[error("method not found")]
    MethodNotFound { method: String },

    #[error("invalid params")]
    InvalidParams {
        reason: String,
        violations: Vec<Violation>,
    },

    #[error("internal error")]
    Internal { correlation_id: String },

    #[error("unauthorized")]
    Unauthorized { reason: String },

    #[error("session gone")]
    SessionGone { session_id: String },

    #[error("primitive not found")]
    PrimitiveNotFound { name: String },

    #[error("ambiguous resource")]
    AmbiguousResource { uri: String, candidates: Vec<String> },

    #[error("invocation timeout")]
    InvocationTimeout {
        invocation_id: String,
        timeout_ms: u64,
    },

    #[error("cancelled")]
    Cancelled {
        invocation_id: String,
        /// The handler never observed the token; it may still be running.
        handler_abandoned: bool,
    },

    #[error("capability denied")]
    CapabilityDenied { missing: Vec<String> },

    #[error("rate limited")]
    RateLimited { scope: String, retry_after_ms: u64 },
}

impl McpError {
    /// JSON-RPC error code for this variant.
    pub fn code(&self) -> i64 {
        match self {
            McpError::Parse { .. } => -32700,
            McpError::InvalidRequest { .. } => -32600,
            McpError::MethodNotFound { .. } => -32601,
            McpError::InvalidParams { .. } => -32602,
            McpError::Internal { .. } => -32603,
            McpError::Unauthorized { .. } => -32010,
            McpError::SessionGone { .. } => -32011,
            McpError::PrimitiveNotFound { .. } => -32012,
            McpError::AmbiguousResource { .. } => -32013,
            McpError::InvocationTimeout { .. } => -32014,
            McpError::Cancelled { .. } => -32015,
            McpError::CapabilityDenied { .. } => -32016,
            McpError::RateLimited { .. } => -32017,
        }
    }

    /// Structured diagnostic payload for the JSON-RPC `data` field.
    pub fn data(&self) -> Option<Value> {
        match self {
            McpError::Parse { detail } => Some(json!({ "detail": detail })),
            McpError::InvalidRequest { reason } => Some(json!({ "reason": reason })),
            McpError::MethodNotFound { method } => Some(json!({ "method": method })),
            McpError::InvalidParams { reason, violations } => {
                let mut data = json!({ "reason": reason });
                if !violations.is_empty() {
                    data["violations"] = json!(violations);
                }
                Some(data)
            }
            McpError::Internal { correlation_id } => {
                Some(json!({ "correlation_id": correlation_id }))
            }
            McpError::Unauthorized { reason } => Some(json!({ "reason": reason })),
            McpError::SessionGone { session_id } => Some(json!({ "session_id": session_id })),
            McpError::PrimitiveNotFound { name } => Some(json!({ "name": name })),
            McpError::AmbiguousResource { uri, candidates } => {
                Some(json!({ "uri": uri, "candidates": candidates }))
            }
            McpError::InvocationTimeout {
                invocation_id,
                timeout_ms,
            } => Some(json!({ "invocation_id": invocation_id, "timeout_ms": timeout_ms })),
            McpError::Cancelled {
                invocation_id,
                handler_abandoned,
            } => Some(json!({
                "invocation_id": invocation_id,
                "handler_abandoned": handler_abandoned,
            })),
            McpError::CapabilityDenied { missing } => Some(json!({ "missing": missing })),
            McpError::RateLimited {
                scope,
                retry_after_ms,
            } => Some(json!({ "scope": scope, "retry_after_ms": retry_after_ms })),
        }
    }

    /// Schema-violation convenience constructor used at every input boundary.
    pub fn invalid_params(reason: impl Into<String>) -> Self {
        McpError::InvalidParams {
            reason: reason.into(),
            violations: Vec::new(),
        }
    }

    /// Mint a fresh correlation id and log the underlying cause at error
    /// level. The cause never reaches the client.
    pub fn internal(cause: impl std::fmt::Display) -> Self {
        let correlation_id = uuid::Uuid::new_v4().to_string();
        tracing::error!(correlation_id = %correlation_id, cause = %cause, "internal error");
        McpError::Internal { correlation_id }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── Code mapping ───────────────────────────────────────────────────────

    #[test]
    fn parse_error_is_32700() {
        let e = McpError::Parse {
            detail: "eof".into(),
        };
        assert_eq!(e.code(), -32700);
    }

    #[test]
    fn domain_subcodes_are_in_server_error_range() {
        let errors = [
            McpError::Unauthorized {
                reason: "x".into(),
            },
            McpError::SessionGone {
                session_id: "s".into(),
            },
            McpError::PrimitiveNotFound { name: "t".into() },
            McpError::AmbiguousResource {
                uri: "a://b".into(),
                candidates: vec![],
            },
            McpError::InvocationTimeout {
                invocation_id: "i".into(),
                timeout_ms: 1,
            },
            McpError::Cancelled {
                invocation_id: "i".into(),
                handler_abandoned: false,
            },
            McpError::CapabilityDenied { missing: vec![] },
            McpError::RateLimited {
                scope: "session".into(),
                retry_after_ms: 100,
            },
        ];
        for (offset, e) in errors.iter().enumerate() {
            assert_eq!(e.code(), -32010 - offset as i64, "{e:?}");
            assert!((-32099..=-32000).contains(&e.code()));
        }
    }

    // ── Messages and data ──────────────────────────────────────────────────

    #[test]
    fn messages_are_short_and_stable() {
        assert_eq!(
            McpError::MethodNotFound {
                method: "tools/paint".into()
            }
            .to_string(),
            "method not found"
        );
        assert_eq!(
            McpError::internal("boom").to_string(),
            "internal error"
        );
    }

    #[test]
    fn detail_goes_into_data_not_message() {
        let e = McpError::MethodNotFound {
            method: "tools/paint".into(),
        };
        let data = e.data().unwrap();
        assert_eq!(data["method"], "tools/paint");
        assert!(!e.to_string().contains("paint"));
    }

    #[test]
    fn violations_surface_in_data() {
        let e = McpError::InvalidParams {
            reason: "schema validation failed".into(),
            violations: vec![Violation {
                path: "message".into(),
                expected: "string".into(),
                actual: "missing".into(),
            }],
        };
        let data = e.data().unwrap();
        assert_eq!(data["violations"][0]["path"], "message");
        assert_eq!(data["violations"][0]["actual"], "missing");
    }

    #[test]
    fn internal_errors_carry_distinct_correlation_ids() {
        let a = McpError::internal("first");
        let b = McpError::internal("second");
        match (a, b) {
            (
                McpError::Internal { correlation_id: ca },
                McpError::Internal { correlation_id: cb },
            ) => assert_ne!(ca, cb),
            other => panic!("unexpected variants: {other:?}"),
        }
    }
}
