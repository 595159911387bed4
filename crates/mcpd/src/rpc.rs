//! JSON-RPC 2.0 envelopes and the MCP result envelope.
//!
//! Transports hand raw text to [`parse_envelope`]; malformed JSON is a
//! parse error, structurally valid JSON that is not a JSON-RPC 2.0 request
//! is an invalid request. Requests carry an `id` and get exactly one
//! response; notifications carry none and get none.

use crate::error::McpError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const JSONRPC_VERSION: &str = "2.0";

/// MCP protocol revision this server speaks.
pub const PROTOCOL_VERSION: &str = "2025-03-26";

/// Request id: integer or string, echoed verbatim in the response.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{n}"),
            RequestId::String(s) => write!(f, "{s}"),
        }
    }
}

/// Inbound envelope: request when `id` is present, notification otherwise.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RequestId>,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

impl Envelope {
    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }

    /// Build a server-initiated notification envelope.
    pub fn notification(method: impl Into<String>, params: Value) -> Self {
        Envelope {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            id: None,
            method: method.into(),
            params,
        }
    }
}

/// Wire form of a JSON-RPC error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl From<&McpError> for RpcError {
    fn from(e: &McpError) -> Self {
        RpcError {
            code: e.code(),
            message: e.to_string(),
            data: e.data(),
        }
    }
}

impl From<McpError> for RpcError {
    fn from(e: McpError) -> Self {
        RpcError::from(&e)
    }
}

/// Outbound response; exactly one of `result`/`error` is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub jsonrpc: String,
    pub id: Option<RequestId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl Response {
    pub fn ok(id: RequestId, result: Value) -> Self {
        Response {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            id: Some(id),
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: Option<RequestId>, error: impl Into<RpcError>) -> Self {
        Response {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            id,
            result: None,
            error: Some(error.into()),
        }
    }
}

/// Parse one inbound message.
///
/// Distinguishes the two protocol error strata: bytes that are not JSON at
/// all (`Parse`, -32700) and JSON that is not a JSON-RPC 2.0 envelope
/// (`InvalidRequest`, -32600).
pub fn parse_envelope(raw: &str) -> Result<Envelope, McpError> {
    let value: Value = serde_json::from_str(raw).map_err(|e| McpError::Parse {
        detail: e.to_string(),
    })?;

    let envelope: Envelope =
        serde_json::from_value(value).map_err(|e| McpError::InvalidRequest {
            reason: e.to_string(),
        })?;

    if envelope.jsonrpc != JSONRPC_VERSION {
        return Err(McpError::InvalidRequest {
            reason: format!("unsupported jsonrpc version `{}`", envelope.jsonrpc),
        });
    }
    if envelope.method.is_empty() {
        return Err(McpError::InvalidRequest {
            reason: "empty method".to_owned(),
        });
    }
    Ok(envelope)
}

/// One item of tool/prompt/resource output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ContentItem {
    Text { text: String },
    Json { data: Value },
}

/// MCP result envelope wrapped around every successful invocation and every
/// handler-signalled domain failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallResult {
    pub content: Vec<ContentItem>,
    #[serde(rename = "isError")]
    pub is_error: bool,
}

impl CallResult {
    /// Wrap a handler output value: strings become text content, anything
    /// else becomes structured json content.
    pub fn from_output(output: Value) -> Self {
        let item = match output {
            Value::String(text) => ContentItem::Text { text },
            other => ContentItem::Json { data: other },
        };
        CallResult {
            content: vec![item],
            is_error: false,
        }
    }

    /// Wrap a handler-reported domain failure.
    pub fn domain_error(message: String, detail: Option<Value>) -> Self {
        let mut content = vec![ContentItem::Text { text: message }];
        if let Some(data) = detail {
            content.push(ContentItem::Json { data });
        }
        CallResult {
            content,
            is_error: true,
        }
    }
}
