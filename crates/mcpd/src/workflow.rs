//! Workflow orchestration: chained invocations with declared data flow.
//!
//! A workflow is an ordered list of steps run over a shared context map.
//! Each step reads its input through `input_mapping`, invokes one
//! primitive, and merges its output back through `output_mapping`.
//! Consecutive steps sharing a `group` label run concurrently and join
//! before the next step. Failure policy is per step: stop, continue, or
//! retry with exponential backoff.

use crate::error::McpError;
use crate::invoke::{InvocationEngine, InvokeOptions};
use crate::registry::PrimitiveKind;
use crate::rpc::{CallResult, ContentItem, RpcError};
use crate::session::SessionId;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

/// Longest single retry wait, regardless of the declared backoff.
const MAX_BACKOFF: Duration = Duration::from_secs(10);

/// What to do when a step fails.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OnError {
    #[default]
    Stop,
    Continue,
    Retry {
        max_attempts: u32,
        backoff_ms: u64,
    },
}

/// Caller-supplied configuration for one step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub step_name: String,
    pub primitive_name: String,
    #[serde(default)]
    pub kind: PrimitiveKind,
    /// step input key -> workflow context key to read.
    #[serde(default)]
    pub input_mapping: BTreeMap<String, String>,
    /// handler output key -> workflow context key to write.
    #[serde(default)]
    pub output_mapping: BTreeMap<String, String>,
    #[serde(default)]
    pub on_error: OnError,
    /// Steps sharing a group label with their neighbours run concurrently.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
}

/// Accumulating key/value state shared by all steps of one workflow.
pub type WorkflowContext = Map<String, Value>;

/// Per-step execution report.
#[derive(Debug, Clone, Serialize)]
pub struct StepReport {
    pub step_name: String,
    pub attempts: u32,
    pub succeeded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<CallResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

/// Final workflow report: every executed step, the accumulated context,
/// and the failure that aborted it, if any.
#[derive(Debug, Serialize)]
pub struct WorkflowOutcome {
    pub results: Vec<StepReport>,
    pub context: WorkflowContext,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_step: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

/// Drives workflows through the invocation engine.
pub struct WorkflowOrchestrator {
    engine: Arc<InvocationEngine>,
}

impl WorkflowOrchestrator {
    pub fn new(engine: Arc<InvocationEngine>) -> Self {
        WorkflowOrchestrator { engine }
    }

    /// Run `steps` over `initial` for `session_id`.
    ///
    /// Submission-time validation rejects the whole workflow before any
    /// step runs; runtime failures are reported through the outcome
    /// according to each step's `on_error` policy.
    #[instrument(name = "workflow.run", skip_all, fields(session_id = %session_id, steps = steps.len()))]
    pub async fn run(
        &self,
        session_id: &SessionId,
        steps: Vec<WorkflowStep>,
        initial: WorkflowContext,
        cancel: CancellationToken,
    ) -> Result<WorkflowOutcome, McpError> {
        validate_steps(&steps, &initial)?;

        let mut outcome = WorkflowOutcome {
            results: Vec::new(),
            context: initial,
            failed_step: None,
            error: None,
        };

        let batches = batch_steps(steps);
        'batches: for batch in batches {
            if cancel.is_cancelled() {
                outcome.failed_step = batch.first().map(|s| s.step_name.clone());
                outcome.error = Some(RpcError::from(McpError::Cancelled {
                    invocation_id: String::new(),
                    handler_abandoned: false,
                }));
                break;
            }

            // Build every input from the pre-batch context, then run the
            // whole batch concurrently.
            let mut inputs = Vec::with_capacity(batch.len());
            for step in &batch {
                inputs.push(build_step_input(step, &outcome.context)?);
            }

            let runs = batch
                .iter()
                .zip(inputs)
                .map(|(step, input)| self.run_step(session_id, step, input, &cancel));
            let reports = futures::future::join_all(runs).await;

            // Merge outputs in declaration order, then apply policy.
            let mut abort: Option<(String, RpcError)> = None;
            for (step, report) in batch.iter().zip(reports) {
                if report.succeeded {
                    if let Some(result) = &report.result {
                        merge_step_output(step, result, &mut outcome.context);
                    }
                } else if abort.is_none() && step.on_error != OnError::Continue {
                    abort = Some((
                        step.step_name.clone(),
                        report.error.clone().unwrap_or(RpcError {
                            code: -32000,
                            message: "step failed".to_owned(),
                            data: None,
                        }),
                    ));
                }
                outcome.results.push(report);
            }

            if let Some((failed_step, error)) = abort {
                outcome.failed_step = Some(failed_step);
                outcome.error = Some(error);
                break 'batches;
            }
        }

        Ok(outcome)
    }

    async fn run_step(
        &self,
        session_id: &SessionId,
        step: &WorkflowStep,
        input: Value,
        cancel: &CancellationToken,
    ) -> StepReport {
        let max_attempts = match step.on_error {
            OnError::Retry { max_attempts, .. } => max_attempts.max(1),
            _ => 1,
        };

        let mut attempt = 0;
        loop {
            attempt += 1;

            let outcome = self
                .engine
                .invoke_named(
                    session_id,
                    step.kind,
                    &step.primitive_name,
                    input.clone(),
                    InvokeOptions::with_parent(cancel),
                )
                .await;

            let (succeeded, result, error) = match outcome.result {
                Ok(result) if !result.is_error => (true, Some(result), None),
                Ok(result) => {
                    let error = domain_failure_error(&result);
                    (false, Some(result), Some(error))
                }
                Err(e) => (false, None, Some(RpcError::from(e))),
            };

            if succeeded || attempt >= max_attempts || cancel.is_cancelled() {
                return StepReport {
                    step_name: step.step_name.clone(),
                    attempts: attempt,
                    succeeded,
                    result,
                    error,
                };
            }

            let OnError::Retry { backoff_ms, .. } = &step.on_error else {
                unreachable!("max_attempts > 1 only with retry policy");
            };
            let wait = Duration::from_millis(
                backoff_ms.saturating_mul(1u64 << (attempt - 1).min(20)),
            )
            .min(MAX_BACKOFF);
            debug!(
                step = %step.step_name,
                attempt,
                wait_ms = wait.as_millis() as u64,
                "step failed, backing off before retry"
            );
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = cancel.cancelled() => {
                    return StepReport {
                        step_name: step.step_name.clone(),
                        attempts: attempt,
                        succeeded: false,
                        result: None,
                        error: Some(RpcError::from(McpError::Cancelled {
                            invocation_id: String::new(),
                            handler_abandoned: false,
                        })),
                    };
                }
            }
        }
    }
}

/// Group consecutive steps that share a `group` label.
fn batch_steps(steps: Vec<WorkflowStep>) -> Vec<Vec<WorkflowStep>> {
    let mut batches: Vec<Vec<WorkflowStep>> = Vec::new();
    for step in steps {
        let joins_previous = match (&step.group, batches.last().and_then(|b| b.first())) {
            (Some(group), Some(prev)) => prev.group.as_deref() == Some(group.as_str()),
            _ => false,
        };
        if joins_previous {
            batches.last_mut().expect("non-empty").push(step);
        } else {
            batches.push(vec![step]);
        }
    }
    batches
}

/// Submission-time validation: unique names, and every input reference
/// resolvable from the initial context or an earlier batch's outputs.
/// Forward and intra-batch references would form dependency cycles under
/// concurrent execution, so both are rejected.
fn validate_steps(steps: &[WorkflowStep], initial: &WorkflowContext) -> Result<(), McpError> {
    let mut names: HashSet<&str> = HashSet::new();
    for (index, step) in steps.iter().enumerate() {
        if step.step_name.is_empty() {
            return Err(McpError::invalid_params(format!(
                "step {index}: empty step_name"
            )));
        }
        if !names.insert(&step.step_name) {
            return Err(McpError::invalid_params(format!(
                "step {index}: duplicate step_name `{}`",
                step.step_name
            )));
        }
    }

    let mut available: HashSet<String> = initial.keys().cloned().collect();
    let mut index = 0;
    for batch in batch_steps(steps.to_vec()) {
        for step in &batch {
            for (input_key, source) in &step.input_mapping {
                if !available.contains(source) {
                    return Err(McpError::invalid_params(format!(
                        "step {index} (`{}`): input `{input_key}` reads `{source}`, \
                         which no earlier step provides",
                        step.step_name
                    )));
                }
            }
            index += 1;
        }
        for step in &batch {
            available.extend(step.output_mapping.values().cloned());
        }
    }
    Ok(())
}

fn build_step_input(
    step: &WorkflowStep,
    context: &WorkflowContext,
) -> Result<Value, McpError> {
    let mut input = Map::new();
    for (input_key, source) in &step.input_mapping {
        let value = context.get(source).ok_or_else(|| {
            McpError::invalid_params(format!(
                "step `{}`: context key `{source}` is missing",
                step.step_name
            ))
        })?;
        input.insert(input_key.clone(), value.clone());
    }
    Ok(Value::Object(input))
}

/// Copy mapped keys out of a step's json content into the workflow context.
fn merge_step_output(step: &WorkflowStep, result: &CallResult, context: &mut WorkflowContext) {
    let output = result.content.iter().find_map(|item| match item {
        ContentItem::Json { data } => data.as_object(),
        ContentItem::Text { .. } => None,
    });
    let Some(output) = output else {
        return;
    };
    for (output_key, target) in &step.output_mapping {
        if let Some(value) = output.get(output_key) {
            context.insert(target.clone(), value.clone());
        }
    }
}

/// A handler-signalled failure has no protocol code of its own; report it
/// in the generic server-error slot with the content attached.
fn domain_failure_error(result: &CallResult) -> RpcError {
    let message = result
        .content
        .iter()
        .find_map(|item| match item {
            ContentItem::Text { text } => Some(text.clone()),
            ContentItem::Json { .. } => None,
        })
        .unwrap_or_else(|| "tool reported an error".to_owned());
    RpcError {
        code: -32000,
        message,
        data: Some(json!({ "content": result.content })),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invoke::InvocationLimits;
    use crate::registry::{
        HandlerError, PrimitiveDescriptor, PrimitiveRegistry, handler_fn,
    };
    use crate::schema::Schema;
    use crate::session::{InMemorySessionStore, Principal, SessionStore};
    use std::collections::HashSet as StdHashSet;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Harness {
        orchestrator: WorkflowOrchestrator,
        engine: Arc<InvocationEngine>,
        session: SessionId,
    }

    async fn harness() -> Harness {
        let registry = Arc::new(PrimitiveRegistry::new());
        let sessions: Arc<dyn SessionStore> = Arc::new(InMemorySessionStore::new());
        let session = sessions
            .create(
                Principal::Anonymous,
                StdHashSet::new(),
                Duration::from_secs(3600),
            )
            .await;
        let engine = Arc::new(InvocationEngine::new(
            registry,
            sessions,
            InvocationLimits::default(),
        ));
        Harness {
            orchestrator: WorkflowOrchestrator::new(Arc::clone(&engine)),
            engine,
            session,
        }
    }

    fn gen_story() -> PrimitiveDescriptor {
        PrimitiveDescriptor::new(
            PrimitiveKind::Tool,
            "gen_story",
            Schema::object([]),
            Schema::object([("story", Schema::string())]),
            handler_fn(|_ctx, _input| async move { Ok(json!({"story": "a user logs in"})) }),
        )
    }

    fn gen_bdd() -> PrimitiveDescriptor {
        PrimitiveDescriptor::new(
            PrimitiveKind::Tool,
            "gen_bdd",
            Schema::object([("story", Schema::string())]),
            Schema::object([("gherkin", Schema::string())]),
            handler_fn(|_ctx, input| async move {
                let story = input["story"].as_str().unwrap_or_default();
                Ok(json!({"gherkin": format!("Given {story}")}))
            }),
        )
    }

    fn step(name: &str, primitive: &str) -> WorkflowStep {
        WorkflowStep {
            step_name: name.to_owned(),
            primitive_name: primitive.to_owned(),
            kind: PrimitiveKind::Tool,
            input_mapping: BTreeMap::new(),
            output_mapping: BTreeMap::new(),
            on_error: OnError::Stop,
            group: None,
        }
    }

    // ── Chaining ───────────────────────────────────────────────────────────

    #[tokio::test]
    async fn two_step_chain_threads_data_through_context() {
        let h = harness().await;
        h.engine.registry().register(gen_story()).unwrap();
        h.engine.registry().register(gen_bdd()).unwrap();

        let mut step1 = step("step1", "gen_story");
        step1.output_mapping.insert("story".into(), "story".into());
        let mut step2 = step("step2", "gen_bdd");
        step2.input_mapping.insert("story".into(), "story".into());
        step2.output_mapping.insert("gherkin".into(), "gherkin".into());

        let outcome = h
            .orchestrator
            .run(
                &h.session,
                vec![step1, step2],
                Map::new(),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(outcome.failed_step.is_none());
        assert_eq!(outcome.context["story"], "a user logs in");
        assert_eq!(outcome.context["gherkin"], "Given a user logs in");
        assert_eq!(outcome.results.len(), 2);
        assert!(outcome.results.iter().all(|r| r.succeeded));
    }

    #[tokio::test]
    async fn stop_policy_reports_partial_results() {
        let h = harness().await;
        h.engine.registry().register(gen_story()).unwrap();
        let broken = PrimitiveDescriptor::new(
            PrimitiveKind::Tool,
            "gen_bdd",
            Schema::object([("story", Schema::string())]),
            Schema::object([]),
            handler_fn(|_ctx, _input| async move {
                Err(HandlerError::domain("generator unavailable"))
            }),
        );
        h.engine.registry().register(broken).unwrap();

        let mut step1 = step("step1", "gen_story");
        step1.output_mapping.insert("story".into(), "story".into());
        let mut step2 = step("step2", "gen_bdd");
        step2.input_mapping.insert("story".into(), "story".into());

        let outcome = h
            .orchestrator
            .run(
                &h.session,
                vec![step1, step2],
                Map::new(),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.failed_step.as_deref(), Some("step2"));
        assert_eq!(outcome.results.len(), 2);
        assert!(outcome.results[0].succeeded);
        assert!(!outcome.results[1].succeeded);
        assert_eq!(
            outcome.error.as_ref().unwrap().message,
            "generator unavailable"
        );
        // step1's output survives in the partial context
        assert_eq!(outcome.context["story"], "a user logs in");
    }

    #[tokio::test]
    async fn continue_policy_keeps_going() {
        let h = harness().await;
        let flaky = PrimitiveDescriptor::new(
            PrimitiveKind::Tool,
            "flaky",
            Schema::object([]),
            Schema::object([]),
            handler_fn(|_ctx, _input| async move {
                Err(HandlerError::domain("down for maintenance"))
            }),
        );
        h.engine.registry().register(flaky).unwrap();
        h.engine.registry().register(gen_story()).unwrap();

        let mut first = step("first", "flaky");
        first.on_error = OnError::Continue;
        let mut second = step("second", "gen_story");
        second.output_mapping.insert("story".into(), "story".into());

        let outcome = h
            .orchestrator
            .run(
                &h.session,
                vec![first, second],
                Map::new(),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(outcome.failed_step.is_none());
        assert!(!outcome.results[0].succeeded);
        assert!(outcome.results[1].succeeded);
        assert_eq!(outcome.context["story"], "a user logs in");
    }

    // ── Retry ──────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn retry_succeeds_after_transient_failures() {
        let h = harness().await;
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);
        let eventually = PrimitiveDescriptor::new(
            PrimitiveKind::Tool,
            "eventually",
            Schema::object([]),
            Schema::object([("ok", Schema::boolean())]),
            handler_fn(move |_ctx, _input| {
                let counter = Arc::clone(&counter);
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(HandlerError::domain("transient"))
                    } else {
                        Ok(json!({"ok": true}))
                    }
                }
            }),
        );
        h.engine.registry().register(eventually).unwrap();

        let mut s = step("s", "eventually");
        s.on_error = OnError::Retry {
            max_attempts: 5,
            backoff_ms: 10,
        };

        let outcome = h
            .orchestrator
            .run(&h.session, vec![s], Map::new(), CancellationToken::new())
            .await
            .unwrap();

        assert!(outcome.failed_step.is_none());
        assert_eq!(outcome.results[0].attempts, 3);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_exhaustion_degrades_to_stop() {
        let h = harness().await;
        let hopeless = PrimitiveDescriptor::new(
            PrimitiveKind::Tool,
            "hopeless",
            Schema::object([]),
            Schema::object([]),
            handler_fn(|_ctx, _input| async move { Err(HandlerError::domain("still broken")) }),
        );
        h.engine.registry().register(hopeless).unwrap();

        let mut s = step("s", "hopeless");
        s.on_error = OnError::Retry {
            max_attempts: 3,
            backoff_ms: 1,
        };

        let outcome = h
            .orchestrator
            .run(&h.session, vec![s], Map::new(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.failed_step.as_deref(), Some("s"));
        assert_eq!(outcome.results[0].attempts, 3);
    }

    // ── Parallel groups ────────────────────────────────────────────────────

    #[tokio::test]
    async fn sibling_group_runs_concurrently_and_joins() {
        let h = harness().await;
        for name in ["left", "right"] {
            let tool = PrimitiveDescriptor::new(
                PrimitiveKind::Tool,
                name,
                Schema::object([]),
                Schema::object([("value", Schema::string())]),
                handler_fn(move |_ctx, _input| async move {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Ok(json!({"value": "done"}))
                }),
            );
            h.engine.registry().register(tool).unwrap();
        }

        let mut a = step("a", "left");
        a.group = Some("fan".into());
        a.output_mapping.insert("value".into(), "a_value".into());
        let mut b = step("b", "right");
        b.group = Some("fan".into());
        b.output_mapping.insert("value".into(), "b_value".into());

        let started = std::time::Instant::now();
        let outcome = h
            .orchestrator
            .run(&h.session, vec![a, b], Map::new(), CancellationToken::new())
            .await
            .unwrap();

        // Sequential execution would need ~200ms.
        assert!(started.elapsed() < Duration::from_millis(180));
        assert_eq!(outcome.context["a_value"], "done");
        assert_eq!(outcome.context["b_value"], "done");
    }

    // ── Validation ─────────────────────────────────────────────────────────

    #[tokio::test]
    async fn duplicate_step_names_are_rejected() {
        let h = harness().await;
        let err = h
            .orchestrator
            .run(
                &h.session,
                vec![step("same", "x"), step("same", "y")],
                Map::new(),
                CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), -32602);
    }

    #[tokio::test]
    async fn forward_reference_is_rejected_at_submission() {
        let h = harness().await;
        let mut first = step("first", "gen_bdd");
        first.input_mapping.insert("story".into(), "story".into());
        let mut second = step("second", "gen_story");
        second.output_mapping.insert("story".into(), "story".into());

        let err = h
            .orchestrator
            .run(
                &h.session,
                vec![first, second],
                Map::new(),
                CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), -32602);
        assert!(err.data().unwrap()["reason"]
            .as_str()
            .unwrap()
            .contains("step 0"));
    }

    #[tokio::test]
    async fn intra_group_dependency_is_rejected() {
        let h = harness().await;
        let mut a = step("a", "left");
        a.group = Some("fan".into());
        a.output_mapping.insert("value".into(), "shared".into());
        let mut b = step("b", "right");
        b.group = Some("fan".into());
        b.input_mapping.insert("value".into(), "shared".into());

        let err = h
            .orchestrator
            .run(&h.session, vec![a, b], Map::new(), CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.code(), -32602);
    }

    #[tokio::test]
    async fn initial_context_satisfies_references() {
        let h = harness().await;
        h.engine.registry().register(gen_bdd()).unwrap();

        let mut s = step("s", "gen_bdd");
        s.input_mapping.insert("story".into(), "story".into());
        s.output_mapping.insert("gherkin".into(), "gherkin".into());

        let mut initial = Map::new();
        initial.insert("story".into(), json!("seeded"));

        let outcome = h
            .orchestrator
            .run(&h.session, vec![s], initial, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.context["gherkin"], "Given seeded");
    }

    // ── Cancellation ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn cancelling_the_workflow_interrupts_the_running_step() {
        let h = harness().await;
        let slow = PrimitiveDescriptor::new(
            PrimitiveKind::Tool,
            "slow",
            Schema::object([]),
            Schema::object([]),
            handler_fn(|ctx: crate::context::InvocationContext, _input| async move {
                tokio::select! {
                    _ = ctx.cancellation.cancelled() => Err(HandlerError::domain("interrupted")),
                    _ = tokio::time::sleep(Duration::from_secs(10)) => Ok(json!({})),
                }
            }),
        );
        h.engine.registry().register(slow).unwrap();

        let cancel = CancellationToken::new();
        let run_cancel = cancel.clone();
        let orchestrator = WorkflowOrchestrator::new(Arc::clone(&h.engine));
        let session = h.session.clone();
        let task = tokio::spawn(async move {
            orchestrator
                .run(&session, vec![step("s", "slow")], Map::new(), run_cancel)
                .await
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();

        let started = std::time::Instant::now();
        let outcome = task.await.unwrap().unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(outcome.failed_step.as_deref(), Some("s"));
    }
}
