//! Primitive registry: descriptors for tools, prompts and resources.
//!
//! Descriptors are immutable after registration and looked up far more
//! often than they change, so the registry keeps them in an ordered map
//! behind a reader-writer lock. No lock is ever held across a handler
//! invocation; lookups hand out `Arc`s.

use crate::context::InvocationContext;
use crate::error::McpError;
use crate::schema::Schema;
use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// The three primitive classes of the protocol.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum PrimitiveKind {
    #[default]
    Tool,
    Prompt,
    Resource,
}

impl std::fmt::Display for PrimitiveKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PrimitiveKind::Tool => write!(f, "tool"),
            PrimitiveKind::Prompt => write!(f, "prompt"),
            PrimitiveKind::Resource => write!(f, "resource"),
        }
    }
}

/// Failure reported by a handler.
///
/// `Domain` failures are expected business outcomes and surface to the
/// client inside the result envelope with `isError: true`. Anything else is
/// a tool bug and becomes an internal error with a correlation id.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("{message}")]
    Domain {
        message: String,
        detail: Option<Value>,
    },
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl HandlerError {
    pub fn domain(message: impl Into<String>) -> Self {
        HandlerError::Domain {
            message: message.into(),
            detail: None,
        }
    }
}

/// The capability every primitive implementation exposes to the engine.
#[async_trait]
pub trait PrimitiveHandler: Send + Sync {
    async fn invoke(
        &self,
        ctx: InvocationContext,
        input: Value,
    ) -> Result<Value, HandlerError>;
}

type BoxedHandlerFuture = Pin<Box<dyn Future<Output = Result<Value, HandlerError>> + Send>>;

struct FnHandler {
    f: Box<dyn Fn(InvocationContext, Value) -> BoxedHandlerFuture + Send + Sync>,
}

#[async_trait]
impl PrimitiveHandler for FnHandler {
    async fn invoke(&self, ctx: InvocationContext, input: Value) -> Result<Value, HandlerError> {
        (self.f)(ctx, input).await
    }
}

/// Wrap an async closure as a [`PrimitiveHandler`].
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn PrimitiveHandler>
where
    F: Fn(InvocationContext, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler {
        f: Box::new(move |ctx, input| Box::pin(f(ctx, input))),
    })
}

/// Wrap a synchronous, CPU-bound function as a [`PrimitiveHandler`].
///
/// The work is dispatched to the runtime's bounded blocking pool so it
/// never stalls the async workers. The function should still poll
/// `ctx.is_cancelled()` between expensive phases.
pub fn blocking_handler_fn<F>(f: F) -> Arc<dyn PrimitiveHandler>
where
    F: Fn(InvocationContext, Value) -> Result<Value, HandlerError> + Send + Sync + 'static,
{
    let f = Arc::new(f);
    handler_fn(move |ctx, input| {
        let f = Arc::clone(&f);
        async move {
            tokio::task::spawn_blocking(move || f(ctx, input))
                .await
                .map_err(|e| {
                    HandlerError::Internal(anyhow::anyhow!("blocking handler failed: {e}"))
                })?
        }
    })
}

/// Human-facing descriptor metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PrimitiveMetadata {
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// Immutable registration record for one primitive.
pub struct PrimitiveDescriptor {
    /// Unique per kind. For resources this is a URI template such as
    /// `dom://{page_id}`.
    pub name: String,
    pub kind: PrimitiveKind,
    pub input_schema: Schema,
    pub output_schema: Schema,
    pub metadata: PrimitiveMetadata,
    /// Capabilities the session must hold; empty means open to everyone.
    pub required_capabilities: Vec<String>,
    /// Per-descriptor deadline override.
    pub timeout: Option<Duration>,
    pub handler: Arc<dyn PrimitiveHandler>,
    pub(crate) template: Option<UriTemplate>,
}

impl PrimitiveDescriptor {
    pub fn new(
        kind: PrimitiveKind,
        name: impl Into<String>,
        input_schema: Schema,
        output_schema: Schema,
        handler: Arc<dyn PrimitiveHandler>,
    ) -> Self {
        PrimitiveDescriptor {
            name: name.into(),
            kind,
            input_schema,
            output_schema,
            metadata: PrimitiveMetadata::default(),
            required_capabilities: Vec::new(),
            timeout: None,
            handler,
            template: None,
        }
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.metadata.description = description.into();
        self
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.metadata.version = Some(version.into());
        self
    }

    pub fn require_capability(mut self, capability: impl Into<String>) -> Self {
        self.required_capabilities.push(capability.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl std::fmt::Debug for PrimitiveDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrimitiveDescriptor")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("required_capabilities", &self.required_capabilities)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// Descriptor summary returned by the `*/list` methods.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrimitiveSummary {
    pub name: String,
    pub kind: PrimitiveKind,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub required_capabilities: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<Schema>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<Schema>,
}

/// Registration/deregistration failures.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("duplicate {kind} `{name}`")]
    DuplicateName { kind: PrimitiveKind, name: String },
    #[error("invalid schema for {kind} `{name}`: {reason}")]
    SchemaInvalid {
        kind: PrimitiveKind,
        name: String,
        reason: String,
    },
    #[error("invalid resource template `{template}`: {reason}")]
    InvalidTemplate { template: String, reason: String },
    #[error("{kind} `{name}` not found")]
    NotFound { kind: PrimitiveKind, name: String },
}

struct RegistryInner {
    entries: BTreeMap<(PrimitiveKind, String), Arc<PrimitiveDescriptor>>,
    epoch: u64,
}

/// Concurrent-safe descriptor table.
pub struct PrimitiveRegistry {
    inner: RwLock<RegistryInner>,
}

/// Page of list results plus the cursor for the next page, if any.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListPage {
    pub items: Vec<PrimitiveSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

const DEFAULT_PAGE_SIZE: usize = 50;

impl PrimitiveRegistry {
    pub fn new() -> Self {
        PrimitiveRegistry {
            inner: RwLock::new(RegistryInner {
                entries: BTreeMap::new(),
                epoch: 0,
            }),
        }
    }

    /// Register a descriptor. Resource names must parse as URI templates;
    /// schemas must be well formed.
    pub fn register(&self, mut descriptor: PrimitiveDescriptor) -> Result<(), RegistryError> {
        descriptor.input_schema.check().map_err(|reason| {
            RegistryError::SchemaInvalid {
                kind: descriptor.kind,
                name: descriptor.name.clone(),
                reason,
            }
        })?;
        descriptor.output_schema.check().map_err(|reason| {
            RegistryError::SchemaInvalid {
                kind: descriptor.kind,
                name: descriptor.name.clone(),
                reason,
            }
        })?;

        if descriptor.kind == PrimitiveKind::Resource {
            let template = UriTemplate::parse(&descriptor.name).map_err(|reason| {
                RegistryError::InvalidTemplate {
                    template: descriptor.name.clone(),
                    reason,
                }
            })?;
            descriptor.template = Some(template);
        }

        let key = (descriptor.kind, descriptor.name.clone());
        let mut inner = self.inner.write();
        if inner.entries.contains_key(&key) {
            return Err(RegistryError::DuplicateName {
                kind: descriptor.kind,
                name: descriptor.name,
            });
        }
        inner.entries.insert(key, Arc::new(descriptor));
        inner.epoch += 1;
        Ok(())
    }

    pub fn unregister(&self, kind: PrimitiveKind, name: &str) -> Result<(), RegistryError> {
        let mut inner = self.inner.write();
        match inner.entries.remove(&(kind, name.to_owned())) {
            Some(_) => {
                inner.epoch += 1;
                Ok(())
            }
            None => Err(RegistryError::NotFound {
                kind,
                name: name.to_owned(),
            }),
        }
    }

    pub fn lookup(
        &self,
        kind: PrimitiveKind,
        name: &str,
    ) -> Option<Arc<PrimitiveDescriptor>> {
        self.inner.read().entries.get(&(kind, name.to_owned())).cloned()
    }

    /// List descriptors of one kind in stable name order. The cursor is
    /// opaque; an unknown cursor is an invalid-params condition for the
    /// dispatcher to report.
    pub fn list(
        &self,
        kind: PrimitiveKind,
        cursor: Option<&str>,
        limit: Option<usize>,
        include_schemas: bool,
    ) -> Result<ListPage, McpError> {
        let after = cursor.map(decode_cursor).transpose()?;
        let limit = limit.unwrap_or(DEFAULT_PAGE_SIZE).max(1);

        let inner = self.inner.read();
        let mut items = Vec::new();
        let mut next_cursor = None;
        for ((entry_kind, name), descriptor) in &inner.entries {
            if *entry_kind != kind {
                continue;
            }
            if let Some(after) = &after {
                if name <= after {
                    continue;
                }
            }
            if items.len() == limit {
                next_cursor = items
                    .last()
                    .map(|s: &PrimitiveSummary| encode_cursor(&s.name));
                break;
            }
            items.push(summarize(descriptor, include_schemas));
        }
        Ok(ListPage { items, next_cursor })
    }

    /// Match a concrete URI against the registered resource templates and
    /// extract its placeholder values.
    ///
    /// Exactly one template must win. When several match, the one with the
    /// longest literal prefix is preferred; a shared longest prefix is an
    /// ambiguity error.
    pub fn resolve_resource(
        &self,
        uri: &str,
    ) -> Result<(Arc<PrimitiveDescriptor>, BTreeMap<String, String>), McpError> {
        let inner = self.inner.read();
        let mut matches: Vec<(usize, Arc<PrimitiveDescriptor>, BTreeMap<String, String>)> =
            Vec::new();
        for ((kind, _), descriptor) in &inner.entries {
            if *kind != PrimitiveKind::Resource {
                continue;
            }
            let Some(template) = &descriptor.template else {
                continue;
            };
            if let Some(params) = template.match_uri(uri) {
                matches.push((template.literal_prefix_len(), descriptor.clone(), params));
            }
        }
        drop(inner);

        let Some(best) = matches.iter().map(|(len, _, _)| *len).max() else {
            return Err(McpError::PrimitiveNotFound {
                name: uri.to_owned(),
            });
        };
        let mut winners: Vec<_> = matches
            .into_iter()
            .filter(|(len, _, _)| *len == best)
            .collect();
        if winners.len() > 1 {
            return Err(McpError::AmbiguousResource {
                uri: uri.to_owned(),
                candidates: winners
                    .iter()
                    .map(|(_, d, _)| d.name.clone())
                    .collect(),
            });
        }
        let (_, descriptor, params) = winners.remove(0);
        Ok((descriptor, params))
    }

    /// Monotonic write counter; list order is stable within one epoch.
    pub fn epoch(&self) -> u64 {
        self.inner.read().epoch
    }

    /// (tools, prompts, resources) counts for the health endpoint.
    pub fn counts(&self) -> (usize, usize, usize) {
        let inner = self.inner.read();
        let mut counts = (0, 0, 0);
        for (kind, _) in inner.entries.keys() {
            match kind {
                PrimitiveKind::Tool => counts.0 += 1,
                PrimitiveKind::Prompt => counts.1 += 1,
                PrimitiveKind::Resource => counts.2 += 1,
            }
        }
        counts
    }
}

impl Default for PrimitiveRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn summarize(descriptor: &PrimitiveDescriptor, include_schemas: bool) -> PrimitiveSummary {
    PrimitiveSummary {
        name: descriptor.name.clone(),
        kind: descriptor.kind,
        description: descriptor.metadata.description.clone(),
        version: descriptor.metadata.version.clone(),
        required_capabilities: descriptor.required_capabilities.clone(),
        input_schema: include_schemas.then(|| descriptor.input_schema.clone()),
        output_schema: include_schemas.then(|| descriptor.output_schema.clone()),
    }
}

fn encode_cursor(name: &str) -> String {
    BASE64.encode(name)
}

fn decode_cursor(cursor: &str) -> Result<String, McpError> {
    let bytes = BASE64
        .decode(cursor)
        .map_err(|_| McpError::invalid_params("unreadable cursor"))?;
    String::from_utf8(bytes).map_err(|_| McpError::invalid_params("unreadable cursor"))
}

// ---------------------------------------------------------------------------
// URI templates
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
enum TemplateSegment {
    Literal(String),
    Placeholder(String),
}

/// Parsed resource name of the form `scheme://seg(/seg)*` where each
/// segment is a literal or a whole-segment `{placeholder}`.
#[derive(Debug, Clone)]
pub struct UriTemplate {
    raw: String,
    scheme: String,
    segments: Vec<TemplateSegment>,
    literal_prefix_len: usize,
}

impl UriTemplate {
    pub fn parse(raw: &str) -> Result<Self, String> {
        let (scheme, rest) = raw
            .split_once("://")
            .ok_or_else(|| "missing `://`".to_owned())?;
        if scheme.is_empty()
            || !scheme.chars().next().is_some_and(|c| c.is_ascii_alphabetic())
            || !scheme
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '.' | '-'))
        {
            return Err(format!("invalid scheme `{scheme}`"));
        }
        if rest.is_empty() {
            return Err("empty path".to_owned());
        }

        let mut segments = Vec::new();
        for segment in rest.split('/') {
            if segment.is_empty() {
                return Err("empty segment".to_owned());
            }
            if let Some(name) = segment.strip_prefix('{') {
                let name = name
                    .strip_suffix('}')
                    .ok_or_else(|| format!("unterminated placeholder in `{segment}`"))?;
                if !is_placeholder_name(name) {
                    return Err(format!("invalid placeholder name `{name}`"));
                }
                segments.push(TemplateSegment::Placeholder(name.to_owned()));
            } else if segment.contains('{') || segment.contains('}') {
                return Err(format!(
                    "placeholders must span a whole segment: `{segment}`"
                ));
            } else {
                segments.push(TemplateSegment::Literal(segment.to_owned()));
            }
        }

        let literal_prefix_len = raw.find('{').unwrap_or(raw.len());
        Ok(UriTemplate {
            raw: raw.to_owned(),
            scheme: scheme.to_owned(),
            segments,
            literal_prefix_len,
        })
    }

    /// Match a concrete URI; returns the extracted placeholder values.
    pub fn match_uri(&self, uri: &str) -> Option<BTreeMap<String, String>> {
        let (scheme, rest) = uri.split_once("://")?;
        if scheme != self.scheme {
            return None;
        }
        let parts: Vec<&str> = rest.split('/').collect();
        if parts.len() != self.segments.len() {
            return None;
        }
        let mut params = BTreeMap::new();
        for (segment, part) in self.segments.iter().zip(parts) {
            if part.is_empty() {
                return None;
            }
            match segment {
                TemplateSegment::Literal(literal) => {
                    if literal != part {
                        return None;
                    }
                }
                TemplateSegment::Placeholder(name) => {
                    params.insert(name.clone(), part.to_owned());
                }
            }
        }
        Some(params)
    }

    /// Length of the leading literal run, used to disambiguate overlapping
    /// templates.
    pub fn literal_prefix_len(&self) -> usize {
        self.literal_prefix_len
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

fn is_placeholder_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn echo_descriptor(name: &str) -> PrimitiveDescriptor {
        PrimitiveDescriptor::new(
            PrimitiveKind::Tool,
            name,
            Schema::object([("message", Schema::string())]),
            Schema::object([("echo", Schema::string())]),
            handler_fn(|_ctx, input| async move { Ok(json!({"echo": input["message"]})) }),
        )
        .describe("echo back the message")
    }

    fn resource_descriptor(template: &str) -> PrimitiveDescriptor {
        PrimitiveDescriptor::new(
            PrimitiveKind::Resource,
            template,
            Schema::object([]),
            Schema::object([]),
            handler_fn(|_ctx, input| async move { Ok(input) }),
        )
    }

    // ── Registration ───────────────────────────────────────────────────────

    #[test]
    fn register_then_lookup_returns_same_descriptor() {
        let registry = PrimitiveRegistry::new();
        registry.register(echo_descriptor("echo")).unwrap();

        let a = registry.lookup(PrimitiveKind::Tool, "echo").unwrap();
        let b = registry.lookup(PrimitiveKind::Tool, "echo").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn duplicate_name_within_kind_is_rejected() {
        let registry = PrimitiveRegistry::new();
        registry.register(echo_descriptor("echo")).unwrap();
        let err = registry.register(echo_descriptor("echo")).unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateName { .. }));
    }

    #[test]
    fn same_name_across_kinds_is_allowed() {
        let registry = PrimitiveRegistry::new();
        registry.register(echo_descriptor("echo")).unwrap();
        let mut prompt = echo_descriptor("echo");
        prompt.kind = PrimitiveKind::Prompt;
        registry.register(prompt).unwrap();
        assert!(registry.lookup(PrimitiveKind::Prompt, "echo").is_some());
    }

    #[test]
    fn bad_schema_pattern_is_schema_invalid() {
        let registry = PrimitiveRegistry::new();
        let mut descriptor = echo_descriptor("broken");
        descriptor.input_schema = Schema::string().with_pattern("([");
        let err = registry.register(descriptor).unwrap_err();
        assert!(matches!(err, RegistryError::SchemaInvalid { .. }));
    }

    #[test]
    fn unregister_removes_and_reports_missing() {
        let registry = PrimitiveRegistry::new();
        registry.register(echo_descriptor("echo")).unwrap();
        registry.unregister(PrimitiveKind::Tool, "echo").unwrap();
        assert!(registry.lookup(PrimitiveKind::Tool, "echo").is_none());
        assert!(matches!(
            registry.unregister(PrimitiveKind::Tool, "echo").unwrap_err(),
            RegistryError::NotFound { .. }
        ));
    }

    #[tokio::test]
    async fn blocking_handler_runs_off_the_async_workers() {
        let registry = PrimitiveRegistry::new();
        registry
            .register(PrimitiveDescriptor::new(
                PrimitiveKind::Tool,
                "checksum",
                Schema::object([("data", Schema::string())]),
                Schema::object([("length", Schema::integer())]),
                blocking_handler_fn(|_ctx, input| {
                    let data = input["data"].as_str().unwrap_or_default();
                    Ok(json!({"length": data.len()}))
                }),
            ))
            .unwrap();
        let descriptor = registry.lookup(PrimitiveKind::Tool, "checksum").unwrap();

        let ctx = crate::context::InvocationContext {
            session_id: crate::session::SessionId::from_str("s"),
            invocation_id: crate::context::InvocationId::generate(),
            capabilities: Arc::new(Default::default()),
            cancellation: tokio_util::sync::CancellationToken::new(),
            deadline: chrono::Utc::now(),
            span: tracing::Span::none(),
        };
        let output = descriptor
            .handler
            .invoke(ctx, json!({"data": "abcd"}))
            .await
            .unwrap();
        assert_eq!(output["length"], 4);
    }

    #[test]
    fn epoch_advances_on_writes_only() {
        let registry = PrimitiveRegistry::new();
        let e0 = registry.epoch();
        registry.register(echo_descriptor("echo")).unwrap();
        let e1 = registry.epoch();
        assert!(e1 > e0);
        registry.lookup(PrimitiveKind::Tool, "echo");
        assert_eq!(registry.epoch(), e1);
    }

    // ── Listing ────────────────────────────────────────────────────────────

    #[test]
    fn list_is_name_ordered_and_stable() {
        let registry = PrimitiveRegistry::new();
        for name in ["zeta", "alpha", "mid"] {
            registry.register(echo_descriptor(name)).unwrap();
        }
        let page = registry.list(PrimitiveKind::Tool, None, None, false).unwrap();
        let names: Vec<&str> = page.items.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, ["alpha", "mid", "zeta"]);
        assert!(page.next_cursor.is_none());
        assert!(page.items[0].input_schema.is_none());
    }

    #[test]
    fn list_paginates_with_opaque_cursor() {
        let registry = PrimitiveRegistry::new();
        for name in ["a", "b", "c", "d", "e"] {
            registry.register(echo_descriptor(name)).unwrap();
        }

        let first = registry
            .list(PrimitiveKind::Tool, None, Some(2), false)
            .unwrap();
        assert_eq!(first.items.len(), 2);
        let cursor = first.next_cursor.unwrap();

        let second = registry
            .list(PrimitiveKind::Tool, Some(&cursor), Some(2), false)
            .unwrap();
        let names: Vec<&str> = second.items.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, ["c", "d"]);
    }

    #[test]
    fn garbage_cursor_is_invalid_params() {
        let registry = PrimitiveRegistry::new();
        let err = registry
            .list(PrimitiveKind::Tool, Some("?!"), None, false)
            .unwrap_err();
        assert_eq!(err.code(), -32602);
    }

    #[test]
    fn list_can_include_schemas() {
        let registry = PrimitiveRegistry::new();
        registry.register(echo_descriptor("echo")).unwrap();
        let page = registry.list(PrimitiveKind::Tool, None, None, true).unwrap();
        assert!(page.items[0].input_schema.is_some());
    }

    // ── URI templates ──────────────────────────────────────────────────────

    #[test]
    fn template_extracts_placeholders() {
        let template = UriTemplate::parse("dom://{page_id}/nodes/{node_id}").unwrap();
        let params = template.match_uri("dom://p1/nodes/n9").unwrap();
        assert_eq!(params["page_id"], "p1");
        assert_eq!(params["node_id"], "n9");
        assert!(template.match_uri("dom://p1").is_none());
        assert!(template.match_uri("css://p1/nodes/n9").is_none());
    }

    #[test]
    fn template_rejects_bad_shapes() {
        assert!(UriTemplate::parse("no-scheme").is_err());
        assert!(UriTemplate::parse("dom://").is_err());
        assert!(UriTemplate::parse("dom://a{b}").is_err());
        assert!(UriTemplate::parse("dom://{1bad}").is_err());
        assert!(UriTemplate::parse("dom://{unclosed").is_err());
        assert!(UriTemplate::parse("9scheme://x").is_err());
    }

    #[test]
    fn resolve_resource_extracts_params() {
        let registry = PrimitiveRegistry::new();
        registry
            .register(resource_descriptor("dom://{page_id}"))
            .unwrap();
        let (descriptor, params) = registry.resolve_resource("dom://abc123").unwrap();
        assert_eq!(descriptor.name, "dom://{page_id}");
        assert_eq!(params["page_id"], "abc123");
    }

    #[test]
    fn unknown_scheme_is_primitive_not_found() {
        let registry = PrimitiveRegistry::new();
        registry
            .register(resource_descriptor("dom://{page_id}"))
            .unwrap();
        let err = registry.resolve_resource("unknown://x").unwrap_err();
        assert_eq!(err.code(), -32012);
    }

    #[test]
    fn longest_literal_prefix_wins() {
        let registry = PrimitiveRegistry::new();
        registry
            .register(resource_descriptor("dom://{page_id}/body"))
            .unwrap();
        registry
            .register(resource_descriptor("dom://snapshots/{tail}"))
            .unwrap();

        // Both templates match; the longer literal prefix takes it.
        let (descriptor, params) = registry.resolve_resource("dom://snapshots/body").unwrap();
        assert_eq!(descriptor.name, "dom://snapshots/{tail}");
        assert_eq!(params["tail"], "body");
    }

    #[test]
    fn tied_prefixes_are_ambiguous() {
        let registry = PrimitiveRegistry::new();
        registry
            .register(resource_descriptor("dom://{a}/left"))
            .unwrap();
        registry
            .register(resource_descriptor("dom://{b}/left"))
            .unwrap();
        let err = registry.resolve_resource("dom://x/left").unwrap_err();
        assert_eq!(err.code(), -32013);
    }
}
