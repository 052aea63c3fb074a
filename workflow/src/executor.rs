//! Level-by-level workflow execution.
//!
//! The executor owns no transport: tool calls go through a [`ToolInvoker`]
//! supplied by the embedding gateway, which also decides how nested skill
//! invocations re-enter the executor. Per-level parallelism is bounded by
//! a semaphore; a level's template context is snapshotted before the level
//! starts, so steps in the same level never observe one another.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    error::WorkflowError,
    output::assemble_output,
    plan::plan,
    template::TemplateContext,
    types::{OnErrorPolicy, OutputSpec, StepResult, StepStatus, WorkflowStatus, WorkflowStep},
};

/// Outcome of one tool invocation as seen by the executor.
#[derive(Debug, Clone)]
pub struct InvokeOutcome {
    pub text: String,
    pub is_error: bool,
}

#[derive(Debug, Error)]
pub enum InvokeError {
    #[error("cancelled")]
    Cancelled,

    #[error("{0}")]
    Failed(String),
}

/// Bridge between workflow steps and the tool catalog.
#[async_trait]
pub trait ToolInvoker: Send + Sync {
    async fn invoke(
        &self,
        cancel: &CancellationToken,
        tool: &str,
        args: Map<String, Value>,
    ) -> Result<InvokeOutcome, InvokeError>;
}

#[derive(Debug, Clone)]
pub struct ExecutorLimits {
    /// Concurrent steps per level.
    pub max_parallel: usize,
    /// Maximum skill-composition depth.
    pub max_depth: usize,
    /// Wall-time bound for one workflow execution.
    pub deadline: Duration,
}

impl Default for ExecutorLimits {
    fn default() -> Self {
        Self {
            max_parallel: 4,
            max_depth: 5,
            deadline: Duration::from_secs(600),
        }
    }
}

/// One workflow execution request with inputs already defaulted.
#[derive(Debug, Clone)]
pub struct WorkflowRun {
    pub name: String,
    pub steps: Vec<WorkflowStep>,
    pub inputs: Map<String, Value>,
    pub output: OutputSpec,
}

/// Carried through nested skill invocations.
#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    pub cancel: CancellationToken,
    /// Skill names currently executing, outermost first.
    pub call_stack: Vec<String>,
}

impl ExecutionContext {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            call_stack: Vec::new(),
        }
    }

    /// Context for a skill nested under this one.
    #[must_use]
    pub fn nested(&self, skill: impl Into<String>) -> Self {
        let mut call_stack = self.call_stack.clone();
        call_stack.push(skill.into());
        Self {
            cancel: self.cancel.clone(),
            call_stack,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StepRecord {
    pub id: String,
    pub status: StepStatus,
    pub result: Option<StepResult>,
    pub skip_reason: Option<String>,
    pub error: Option<String>,
    pub attempts: u32,
}

impl StepRecord {
    fn succeeded(id: &str, result: StepResult, attempts: u32) -> Self {
        Self {
            id: id.to_string(),
            status: StepStatus::Succeeded,
            result: Some(result),
            skip_reason: None,
            error: None,
            attempts,
        }
    }

    fn failed(id: &str, message: String, attempts: u32) -> Self {
        Self {
            id: id.to_string(),
            status: StepStatus::Failed,
            result: None,
            skip_reason: None,
            error: Some(message),
            attempts,
        }
    }

    fn skipped(id: &str, reason: String) -> Self {
        Self {
            id: id.to_string(),
            status: StepStatus::Skipped,
            result: None,
            skip_reason: Some(reason),
            error: None,
            attempts: 0,
        }
    }
}

#[derive(Debug)]
pub struct WorkflowReport {
    pub name: String,
    pub status: WorkflowStatus,
    pub steps: Vec<StepRecord>,
    pub output: String,
}

enum StepOutcome {
    Succeeded { result: StepResult, attempts: u32 },
    ConditionSkipped,
    Failed { message: String, attempts: u32, halt: bool },
    Cancelled,
}

pub struct WorkflowExecutor {
    limits: ExecutorLimits,
}

impl WorkflowExecutor {
    pub fn new(limits: ExecutorLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &ExecutorLimits {
        &self.limits
    }

    pub async fn execute(
        &self,
        invoker: &dyn ToolInvoker,
        run: &WorkflowRun,
        ctx: &ExecutionContext,
    ) -> Result<WorkflowReport, WorkflowError> {
        if ctx.call_stack.iter().any(|name| name == &run.name) {
            return Err(WorkflowError::CompositionCycle(run.name.clone()));
        }
        if ctx.call_stack.len() >= self.limits.max_depth {
            return Err(WorkflowError::DepthExceeded(self.limits.max_depth));
        }
        let execution_plan = plan(&run.steps)?;

        let cancel = ctx.cancel.child_token();
        let outcome = tokio::select! {
            outcome = self.run_levels(invoker, run, &cancel, &execution_plan.levels) => outcome?,
            _ = tokio::time::sleep(self.limits.deadline) => {
                cancel.cancel();
                return Err(WorkflowError::DeadlineExceeded);
            }
            _ = ctx.cancel.cancelled() => return Err(WorkflowError::Cancelled),
        };
        let (status, records, results) = outcome;

        let final_context = TemplateContext::new(run.inputs.clone(), results);
        let output = assemble_output(&run.name, status, &run.steps, &records, &run.output, &final_context);
        Ok(WorkflowReport {
            name: run.name.clone(),
            status,
            steps: records,
            output,
        })
    }

    #[allow(clippy::type_complexity)]
    async fn run_levels(
        &self,
        invoker: &dyn ToolInvoker,
        run: &WorkflowRun,
        cancel: &CancellationToken,
        levels: &[Vec<usize>],
    ) -> Result<(WorkflowStatus, Vec<StepRecord>, HashMap<String, StepResult>), WorkflowError> {
        let semaphore = Arc::new(Semaphore::new(self.limits.max_parallel.max(1)));
        let mut results: HashMap<String, StepResult> = HashMap::new();
        let mut skipped: HashMap<String, String> = HashMap::new();
        let mut failed: HashSet<String> = HashSet::new();
        let mut records: Vec<StepRecord> = Vec::new();
        let mut status = WorkflowStatus::Completed;

        for level in levels {
            let mut runnable: Vec<&WorkflowStep> = Vec::new();
            for &index in level {
                let step = &run.steps[index];
                if let Some(reason) = dependency_block_reason(step, &failed, &skipped) {
                    debug!("'{}': step '{}' skipped: {}", run.name, step.id, reason);
                    skipped.insert(step.id.clone(), reason.clone());
                    records.push(StepRecord::skipped(&step.id, reason));
                    continue;
                }
                runnable.push(step);
            }
            if runnable.is_empty() {
                continue;
            }

            // Snapshot before the level starts; same-level results stay
            // invisible to each other.
            let context = TemplateContext::new(run.inputs.clone(), results.clone());
            let outcomes = futures::future::join_all(runnable.iter().copied().map(|step| {
                let semaphore = Arc::clone(&semaphore);
                let context = &context;
                async move {
                    let _permit = tokio::select! {
                        permit = semaphore.acquire_owned() => match permit {
                            Ok(permit) => permit,
                            Err(_) => return StepOutcome::Cancelled,
                        },
                        _ = cancel.cancelled() => return StepOutcome::Cancelled,
                    };
                    self.run_step(invoker, step, context, cancel).await
                }
            }))
            .await;

            // join_all keeps declaration order, which keeps logging and
            // policy handling deterministic.
            for (step, outcome) in runnable.iter().zip(outcomes) {
                match outcome {
                    StepOutcome::Succeeded { result, attempts } => {
                        results.insert(step.id.clone(), result.clone());
                        records.push(StepRecord::succeeded(&step.id, result, attempts));
                    }
                    StepOutcome::ConditionSkipped => {
                        let reason = "condition evaluated to false".to_string();
                        skipped.insert(step.id.clone(), reason.clone());
                        records.push(StepRecord::skipped(&step.id, reason));
                    }
                    StepOutcome::Cancelled => return Err(WorkflowError::Cancelled),
                    StepOutcome::Failed {
                        message,
                        attempts,
                        halt,
                    } => {
                        warn!("'{}': step '{}' failed: {}", run.name, step.id, message);
                        if halt || step.on_error == OnErrorPolicy::Fail {
                            records.push(StepRecord::failed(&step.id, message, attempts));
                            return Ok((WorkflowStatus::Failed, records, results));
                        }
                        status = WorkflowStatus::Partial;
                        match step.on_error {
                            OnErrorPolicy::Skip => {
                                failed.insert(step.id.clone());
                                records.push(StepRecord::failed(&step.id, message, attempts));
                            }
                            OnErrorPolicy::Continue => {
                                // Dependents may inspect steps.«id».is_error.
                                results
                                    .insert(step.id.clone(), StepResult::new(message.clone(), true));
                                records.push(StepRecord::failed(&step.id, message, attempts));
                            }
                            OnErrorPolicy::Fail => unreachable!("handled above"),
                        }
                    }
                }
            }
        }
        Ok((status, records, results))
    }

    async fn run_step(
        &self,
        invoker: &dyn ToolInvoker,
        step: &WorkflowStep,
        context: &TemplateContext,
        cancel: &CancellationToken,
    ) -> StepOutcome {
        if let Some(condition) = step.condition.as_deref().filter(|c| !c.trim().is_empty()) {
            match context.eval_condition(condition) {
                Ok(true) => {}
                Ok(false) => return StepOutcome::ConditionSkipped,
                // A broken condition always halts the workflow.
                Err(err) => {
                    return StepOutcome::Failed {
                        message: format!("condition '{condition}' failed to evaluate: {err}"),
                        attempts: 0,
                        halt: true,
                    }
                }
            }
        }

        let args = match context.resolve_map(&step.args) {
            Ok(args) => args,
            Err(err) => {
                return StepOutcome::Failed {
                    message: format!("argument resolution failed: {err}"),
                    attempts: 0,
                    halt: false,
                }
            }
        };
        let timeout = match step.timeout_duration() {
            Ok(timeout) => timeout,
            Err(err) => {
                return StepOutcome::Failed {
                    message: err.to_string(),
                    attempts: 0,
                    halt: false,
                }
            }
        };
        let (max_attempts, backoff) = match step.retry_schedule() {
            Ok(schedule) => schedule,
            Err(err) => {
                return StepOutcome::Failed {
                    message: err.to_string(),
                    attempts: 0,
                    halt: false,
                }
            }
        };

        let mut last_error = String::new();
        for attempt in 1..=max_attempts {
            if cancel.is_cancelled() {
                return StepOutcome::Cancelled;
            }
            match invoke_once(invoker, step, args.clone(), timeout, cancel).await {
                Ok(outcome) if !outcome.is_error => {
                    return StepOutcome::Succeeded {
                        result: StepResult::new(outcome.text, false),
                        attempts: attempt,
                    }
                }
                // A tool-reported error counts as a failed attempt and
                // contributes its text as the error message.
                Ok(outcome) => last_error = outcome.text,
                Err(InvokeError::Cancelled) => return StepOutcome::Cancelled,
                Err(InvokeError::Failed(message)) => last_error = message,
            }
            if attempt < max_attempts {
                debug!(
                    "step '{}' attempt {}/{} failed, retrying in {:?}",
                    step.id, attempt, max_attempts, backoff
                );
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = cancel.cancelled() => return StepOutcome::Cancelled,
                }
            }
        }
        StepOutcome::Failed {
            message: last_error,
            attempts: max_attempts,
            halt: false,
        }
    }
}

async fn invoke_once(
    invoker: &dyn ToolInvoker,
    step: &WorkflowStep,
    args: Map<String, Value>,
    timeout: Option<Duration>,
    cancel: &CancellationToken,
) -> Result<InvokeOutcome, InvokeError> {
    let call_cancel = cancel.child_token();
    let call = {
        let token = call_cancel.clone();
        let tool = step.tool.clone();
        async move { invoker.invoke(&token, &tool, args).await }
    };
    match timeout {
        Some(limit) => {
            tokio::select! {
                outcome = call => outcome,
                _ = tokio::time::sleep(limit) => {
                    call_cancel.cancel();
                    Err(InvokeError::Failed(format!(
                        "step '{}' timed out after {:?}", step.id, limit
                    )))
                }
            }
        }
        None => call.await,
    }
}

fn dependency_block_reason(
    step: &WorkflowStep,
    failed: &HashSet<String>,
    skipped: &HashMap<String, String>,
) -> Option<String> {
    for dependency in &step.depends_on {
        if failed.contains(dependency) {
            return Some(format!("dependency '{dependency}' failed"));
        }
        if skipped.contains_key(dependency) {
            return Some(format!("dependency '{dependency}' skipped"));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use parking_lot::Mutex;

    use super::*;
    use crate::types::RetrySpec;

    /// Scripted invoker: each tool maps to a canned behavior.
    #[derive(Default)]
    struct ScriptedInvoker {
        calls: Mutex<Vec<(String, Map<String, Value>)>>,
    }

    impl ScriptedInvoker {
        fn call_count(&self) -> usize {
            self.calls.lock().len()
        }

        fn calls_for(&self, tool: &str) -> usize {
            self.calls.lock().iter().filter(|(t, _)| t == tool).count()
        }
    }

    #[async_trait]
    impl ToolInvoker for ScriptedInvoker {
        async fn invoke(
            &self,
            cancel: &CancellationToken,
            tool: &str,
            args: Map<String, Value>,
        ) -> Result<InvokeOutcome, InvokeError> {
            self.calls.lock().push((tool.to_string(), args.clone()));
            match tool {
                "echo" => Ok(InvokeOutcome {
                    text: args
                        .get("text")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    is_error: false,
                }),
                "fail-transport" => Err(InvokeError::Failed("connection lost".to_string())),
                "fail-tool" => Ok(InvokeOutcome {
                    text: "tool exploded".to_string(),
                    is_error: true,
                }),
                "slow" => {
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs(60)) => Ok(InvokeOutcome {
                            text: "finally".to_string(),
                            is_error: false,
                        }),
                        _ = cancel.cancelled() => Err(InvokeError::Cancelled),
                    }
                }
                other => Ok(InvokeOutcome {
                    text: format!("ran {other}"),
                    is_error: false,
                }),
            }
        }
    }

    fn executor() -> WorkflowExecutor {
        WorkflowExecutor::new(ExecutorLimits {
            max_parallel: 4,
            max_depth: 3,
            deadline: Duration::from_secs(30),
        })
    }

    fn run_with(steps: Vec<WorkflowStep>, inputs: Value) -> WorkflowRun {
        let Value::Object(inputs) = inputs else { panic!("inputs must be an object") };
        WorkflowRun {
            name: "test".to_string(),
            steps,
            inputs,
            output: OutputSpec::default(),
        }
    }

    fn args(value: Value) -> Map<String, Value> {
        let Value::Object(map) = value else { panic!("args must be an object") };
        map
    }

    #[tokio::test]
    async fn sequential_steps_see_prior_results() {
        let invoker = ScriptedInvoker::default();
        let steps = vec![
            WorkflowStep::new("a", "echo").with_args(args(serde_json::json!({"text": "hi"}))),
            WorkflowStep::new("b", "echo")
                .with_args(args(serde_json::json!({
                    "text": "{{ steps.a.result }}, {{ inputs.user }}"
                })))
                .with_depends_on(vec!["a".to_string()]),
        ];
        let run = run_with(steps, serde_json::json!({"user": "Alice"}));

        let report = executor()
            .execute(&invoker, &run, &ExecutionContext::default())
            .await
            .unwrap();

        assert_eq!(report.status, WorkflowStatus::Completed);
        assert_eq!(invoker.call_count(), 2);
        let b = report.steps.iter().find(|r| r.id == "b").unwrap();
        assert_eq!(b.result.as_ref().unwrap().text, "hi, Alice");
    }

    #[tokio::test]
    async fn retry_then_skip_marks_dependents() {
        let invoker = ScriptedInvoker::default();
        let mut compute = WorkflowStep::new("compute", "fail-transport");
        compute.retry = Some(RetrySpec {
            max_attempts: 2,
            backoff: "10ms".to_string(),
        });
        compute.on_error = OnErrorPolicy::Skip;
        let format = WorkflowStep::new("format-result", "echo")
            .with_depends_on(vec!["compute".to_string()]);
        let run = run_with(vec![compute, format], serde_json::json!({}));

        let report = executor()
            .execute(&invoker, &run, &ExecutionContext::default())
            .await
            .unwrap();

        assert_eq!(report.status, WorkflowStatus::Partial);
        assert_eq!(invoker.calls_for("fail-transport"), 2);
        let compute = report.steps.iter().find(|r| r.id == "compute").unwrap();
        assert_eq!(compute.status, StepStatus::Failed);
        assert_eq!(compute.attempts, 2);
        let format = report.steps.iter().find(|r| r.id == "format-result").unwrap();
        assert_eq!(format.status, StepStatus::Skipped);
        assert_eq!(
            format.skip_reason.as_deref(),
            Some("dependency 'compute' failed")
        );
    }

    #[tokio::test]
    async fn fail_policy_halts_workflow() {
        let invoker = ScriptedInvoker::default();
        let steps = vec![
            WorkflowStep::new("boom", "fail-tool"),
            WorkflowStep::new("after", "echo").with_depends_on(vec!["boom".to_string()]),
        ];
        let run = run_with(steps, serde_json::json!({}));

        let report = executor()
            .execute(&invoker, &run, &ExecutionContext::default())
            .await
            .unwrap();

        assert_eq!(report.status, WorkflowStatus::Failed);
        // The dependent never ran.
        assert_eq!(invoker.calls_for("echo"), 0);
        assert!(report.output.contains("Workflow \"test\" failed"));
        assert!(report.output.contains("tool exploded"));
    }

    #[tokio::test]
    async fn continue_policy_exposes_error_to_dependents() {
        let invoker = ScriptedInvoker::default();
        let mut broken = WorkflowStep::new("broken", "fail-tool");
        broken.on_error = OnErrorPolicy::Continue;
        let mut recover = WorkflowStep::new("recover", "echo")
            .with_args(args(serde_json::json!({"text": "recovered"})))
            .with_depends_on(vec!["broken".to_string()]);
        recover.condition = Some("steps.broken.is_error".to_string());
        let run = run_with(vec![broken, recover], serde_json::json!({}));

        let report = executor()
            .execute(&invoker, &run, &ExecutionContext::default())
            .await
            .unwrap();

        assert_eq!(report.status, WorkflowStatus::Partial);
        let recover = report.steps.iter().find(|r| r.id == "recover").unwrap();
        assert_eq!(recover.status, StepStatus::Succeeded);
    }

    #[tokio::test]
    async fn false_condition_skips_step() {
        let invoker = ScriptedInvoker::default();
        let mut step = WorkflowStep::new("maybe", "echo");
        step.condition = Some("inputs.mode == 'verbose'".to_string());
        let run = run_with(vec![step], serde_json::json!({"mode": "quiet"}));

        let report = executor()
            .execute(&invoker, &run, &ExecutionContext::default())
            .await
            .unwrap();

        assert_eq!(report.status, WorkflowStatus::Completed);
        assert_eq!(invoker.call_count(), 0);
        assert_eq!(
            report.steps[0].skip_reason.as_deref(),
            Some("condition evaluated to false")
        );
    }

    #[tokio::test]
    async fn broken_condition_halts_workflow() {
        let invoker = ScriptedInvoker::default();
        let mut step = WorkflowStep::new("guarded", "echo");
        step.condition = Some("steps.ghost.is_error".to_string());
        step.on_error = OnErrorPolicy::Continue;
        let run = run_with(vec![step], serde_json::json!({}));

        let report = executor()
            .execute(&invoker, &run, &ExecutionContext::default())
            .await
            .unwrap();

        // Even under a non-halting policy a condition error is fatal.
        assert_eq!(report.status, WorkflowStatus::Failed);
    }

    #[tokio::test]
    async fn unresolvable_args_follow_policy() {
        let invoker = ScriptedInvoker::default();
        let mut step = WorkflowStep::new("bad", "echo")
            .with_args(args(serde_json::json!({"text": "{{ inputs.missing }}"})));
        step.on_error = OnErrorPolicy::Skip;
        let run = run_with(vec![step], serde_json::json!({}));

        let report = executor()
            .execute(&invoker, &run, &ExecutionContext::default())
            .await
            .unwrap();

        assert_eq!(report.status, WorkflowStatus::Partial);
        assert_eq!(invoker.call_count(), 0);
    }

    #[tokio::test]
    async fn step_timeout_bounds_one_call() {
        let invoker = ScriptedInvoker::default();
        let mut step = WorkflowStep::new("slow", "slow");
        step.timeout = Some("50ms".to_string());
        let run = run_with(vec![step], serde_json::json!({}));

        let started = Instant::now();
        let report = executor()
            .execute(&invoker, &run, &ExecutionContext::default())
            .await
            .unwrap();

        assert_eq!(report.status, WorkflowStatus::Failed);
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(report.output.contains("timed out"));
    }

    #[tokio::test]
    async fn workflow_deadline_bounds_total_time() {
        let invoker = ScriptedInvoker::default();
        let executor = WorkflowExecutor::new(ExecutorLimits {
            max_parallel: 2,
            max_depth: 3,
            deadline: Duration::from_millis(100),
        });
        let run = run_with(vec![WorkflowStep::new("slow", "slow")], serde_json::json!({}));

        let result = executor
            .execute(&invoker, &run, &ExecutionContext::default())
            .await;
        assert!(matches!(result, Err(WorkflowError::DeadlineExceeded)));
    }

    #[tokio::test]
    async fn composition_guards() {
        let invoker = ScriptedInvoker::default();
        let run = run_with(vec![WorkflowStep::new("a", "echo")], serde_json::json!({}));

        let cyclic = ExecutionContext {
            cancel: CancellationToken::new(),
            call_stack: vec!["outer".to_string(), "test".to_string()],
        };
        assert!(matches!(
            executor().execute(&invoker, &run, &cyclic).await,
            Err(WorkflowError::CompositionCycle(_))
        ));

        let deep = ExecutionContext {
            cancel: CancellationToken::new(),
            call_stack: vec!["a".to_string(), "b".to_string(), "c".to_string()],
        };
        assert!(matches!(
            executor().execute(&invoker, &run, &deep).await,
            Err(WorkflowError::DepthExceeded(_))
        ));
    }

    #[tokio::test]
    async fn same_level_steps_cannot_see_each_other() {
        let invoker = ScriptedInvoker::default();
        // Both in level 0; referencing a sibling is an unknown-step error.
        let mut peek = WorkflowStep::new("peek", "echo")
            .with_args(args(serde_json::json!({"text": "{{ steps.other.result }}"})));
        peek.on_error = OnErrorPolicy::Skip;
        let other = WorkflowStep::new("other", "echo")
            .with_args(args(serde_json::json!({"text": "x"})));
        let run = run_with(vec![peek, other], serde_json::json!({}));

        let report = executor()
            .execute(&invoker, &run, &ExecutionContext::default())
            .await
            .unwrap();

        let peek = report.steps.iter().find(|r| r.id == "peek").unwrap();
        assert_eq!(peek.status, StepStatus::Failed);
        let other = report.steps.iter().find(|r| r.id == "other").unwrap();
        assert_eq!(other.status, StepStatus::Succeeded);
    }
}
