//! Plan executor: walks the validated DAG, dispatching job steps to the
//! sandbox pool and forking state along enabled edges.
//!
//! The executor owns the run semantics. Validation and compilation both
//! happen up front, before any step body runs, so a bad plan never leaves a
//! half-executed run behind. Branch forks deep-clone the run state; sibling
//! branches execute concurrently and never observe each other's writes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::{BoxFuture, join_all};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::compiler::{CompiledBody, Compiler};
use crate::install::Repo;
use crate::plan::{
    ConfigurationRef, EdgeCondition, ExecutionPlan, Step, resolve_end, resolve_start, validate,
};
use crate::protocol::Reason;
use crate::resolver::Resolver;
use crate::sandbox::{ExecLimits, Outcome, SandboxPool, StepTask};
use crate::scrub::Scrubber;
use crate::state::{ErrorInfo, RunState};

/// Default wall-clock ceiling when the plan carries no timeout override.
pub const DEFAULT_RUN_TIMEOUT: Duration = Duration::from_secs(300);

/// Step-level progress emitted while a run executes. The publisher turns
/// these into wire events; the executor never touches the channel directly.
#[derive(Clone, Debug)]
pub enum ExecEvent {
    StepStart {
        /// Plan step id.
        job_id: String,
        /// Unique id for this execution of the step.
        step_id: String,
        input: RunState,
        /// Dataclip the input came from: the upstream step's output clip,
        /// or the run's seed clip for the first step.
        input_dataclip_id: Option<String>,
    },
    StepComplete {
        job_id: String,
        step_id: String,
        reason: Reason,
        error: Option<ErrorInfo>,
        duration_ms: u64,
        /// Absent when dataclip output is disabled or withheld.
        output: Option<RunState>,
        output_dataclip_id: Option<String>,
    },
    Log {
        step_id: Option<String>,
        level: String,
        message: String,
    },
}

/// Terminal verdict of one run.
#[derive(Clone, Debug)]
pub struct RunReport {
    pub reason: Reason,
    pub error: Option<ErrorInfo>,
    pub final_state: Option<RunState>,
    /// Output clip of the terminal step, when dataclips are enabled.
    pub final_dataclip_id: Option<String>,
}

impl RunReport {
    fn exception(error: ErrorInfo) -> Self {
        Self {
            reason: Reason::Exception,
            error: Some(error),
            final_state: None,
            final_dataclip_id: None,
        }
    }
}

/// The endpoint of one executed branch.
#[derive(Clone, Debug)]
struct Leaf {
    reason: Reason,
    error: Option<ErrorInfo>,
    state: RunState,
    dataclip_id: Option<String>,
}

fn severity(reason: Reason) -> u8 {
    match reason {
        Reason::Success => 0,
        Reason::Fail => 1,
        Reason::Crash => 2,
        Reason::Kill => 3,
        Reason::Exception => 4,
    }
}

/// Executes a single claimed run against a shared pool.
pub struct Executor {
    run_id: String,
    pool: Arc<dyn SandboxPool>,
    compiler: Arc<dyn Compiler>,
    resolver: Arc<dyn Resolver>,
    repo: Option<Arc<Repo>>,
    events: mpsc::Sender<ExecEvent>,
    scrubber: Arc<Scrubber>,
    default_timeout: Duration,
    default_memory_limit_mb: Option<u64>,
}

impl Executor {
    pub fn new(
        run_id: impl Into<String>,
        pool: Arc<dyn SandboxPool>,
        compiler: Arc<dyn Compiler>,
        resolver: Arc<dyn Resolver>,
        events: mpsc::Sender<ExecEvent>,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            pool,
            compiler,
            resolver,
            repo: None,
            events,
            scrubber: Arc::new(Scrubber::default()),
            default_timeout: DEFAULT_RUN_TIMEOUT,
            default_memory_limit_mb: None,
        }
    }

    /// Share a scrubber with the publisher so resolved credentials are
    /// redacted from everything it emits.
    pub fn with_scrubber(mut self, scrubber: Arc<Scrubber>) -> Self {
        self.scrubber = scrubber;
        self
    }

    /// Adaptors are provisioned through this repo before their step runs.
    pub fn with_repo(mut self, repo: Arc<Repo>) -> Self {
        self.repo = Some(repo);
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn with_default_memory_limit_mb(mut self, limit: Option<u64>) -> Self {
        self.default_memory_limit_mb = limit;
        self
    }

    /// Run the plan to completion. Never returns an error: every failure
    /// mode is folded into the report's reason code.
    pub async fn run(
        &self,
        plan: &ExecutionPlan,
        initial: RunState,
        input_dataclip_id: Option<String>,
    ) -> RunReport {
        let problems = validate(plan);
        if !problems.is_empty() {
            let message = problems
                .iter()
                .map(|p| p.to_string())
                .collect::<Vec<_>>()
                .join("; ");
            warn!(run_id = %self.run_id, %message, "rejecting invalid plan");
            return RunReport::exception(ErrorInfo::new("ValidationError", message));
        }

        // Compile every job body before the first step runs.
        let mut bodies: HashMap<String, CompiledBody> = HashMap::new();
        for step in plan.steps.iter().filter(|s| !s.is_trigger()) {
            let source = step.body.as_deref().unwrap_or_default();
            match self.compiler.compile(&step.id, source) {
                Ok(body) => {
                    bodies.insert(step.id.clone(), body);
                }
                Err(err) => {
                    warn!(run_id = %self.run_id, step_id = %step.id, %err, "compile failed");
                    return RunReport::exception(ErrorInfo::new("CompileError", err.to_string()));
                }
            }
        }

        let limits = ExecLimits {
            timeout: plan
                .options
                .run_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(self.default_timeout),
            memory_limit_mb: plan
                .options
                .run_memory_limit_mb
                .or(self.default_memory_limit_mb),
        };

        let end = match resolve_end(plan) {
            Ok(end) => end,
            Err(err) => {
                return RunReport::exception(ErrorInfo::new(
                    "ValidationError",
                    err.to_string(),
                ));
            }
        };

        let first = if let Some(only) = &plan.options.only {
            match plan.step(only) {
                Some(step) => step.id.clone(),
                None => {
                    return RunReport::exception(ErrorInfo::new(
                        "ValidationError",
                        format!("only step not found: {only}"),
                    ));
                }
            }
        } else {
            match resolve_start(plan) {
                Ok(id) => id.to_string(),
                Err(err) => {
                    return RunReport::exception(ErrorInfo::new(
                        "ValidationError",
                        err.to_string(),
                    ));
                }
            }
        };

        let ctx = RunContext {
            executor: self,
            plan,
            bodies,
            limits,
            end,
            only: plan.options.only.is_some(),
        };

        let leaves = ctx.run_branch(&first, initial, input_dataclip_id).await;
        // Deterministic pick under forks: the worst leaf, ties broken by
        // branch order.
        let worst = leaves
            .iter()
            .enumerate()
            .max_by_key(|(idx, leaf)| (severity(leaf.reason), std::cmp::Reverse(*idx)))
            .map(|(_, leaf)| leaf.clone());
        match worst {
            Some(leaf) => RunReport {
                reason: leaf.reason,
                error: leaf.error,
                final_state: Some(leaf.state),
                final_dataclip_id: leaf.dataclip_id,
            },
            None => RunReport::exception(ErrorInfo::new(
                "ValidationError",
                "start step not found",
            )),
        }
    }

    async fn emit(&self, event: ExecEvent) {
        // The publisher owning the receiver may already be gone during
        // shutdown; progress events are best-effort.
        let _ = self.events.send(event).await;
    }
}

/// Per-run immutable context threaded through the branch recursion.
struct RunContext<'a> {
    executor: &'a Executor,
    plan: &'a ExecutionPlan,
    bodies: HashMap<String, CompiledBody>,
    limits: ExecLimits,
    end: Option<String>,
    only: bool,
}

impl RunContext<'_> {
    /// Execute the branch rooted at `step_id`, returning its terminal
    /// leaves. Boxed because branches recurse through `join_all` forks.
    fn run_branch<'b>(
        &'b self,
        step_id: &'b str,
        state: RunState,
        clip: Option<String>,
    ) -> BoxFuture<'b, Vec<Leaf>> {
        Box::pin(async move {
            let step = match self.plan.step(step_id) {
                Some(step) => step,
                None => {
                    // Unreachable after validation; kept as a hard stop.
                    return vec![Leaf {
                        reason: Reason::Exception,
                        error: Some(ErrorInfo::new(
                            "ValidationError",
                            format!("unknown step: {step_id}"),
                        )),
                        state,
                        dataclip_id: clip,
                    }];
                }
            };

            let (reason, error, state, clip) = if step.is_trigger() {
                // Triggers only fan out; they never occupy a pool slot and
                // emit no step events.
                (Reason::Success, None, state, clip)
            } else {
                self.run_job(step, state, clip).await
            };

            let halted = severity(reason) >= severity(Reason::Crash);
            if halted || self.only || self.end.as_deref() == Some(step_id) {
                // Kill, crash, and exception halt the branch outright.
                return vec![Leaf {
                    reason,
                    error,
                    state,
                    dataclip_id: clip,
                }];
            }

            let targets: Vec<&str> = step
                .next
                .iter()
                .filter(|(_, edge)| !edge.disabled && edge_fires(&edge.condition, &state))
                .map(|(target, _)| target.as_str())
                .collect();
            if targets.is_empty() {
                return vec![Leaf {
                    reason,
                    error,
                    state,
                    dataclip_id: clip,
                }];
            }

            debug!(
                run_id = %self.executor.run_id,
                step_id,
                branches = targets.len(),
                "fanning out"
            );
            let branches = targets
                .iter()
                .map(|target| self.run_branch(target, state.clone(), clip.clone()));
            let mut leaves: Vec<Leaf> =
                join_all(branches).await.into_iter().flatten().collect();
            // A failed interior step still marks the run even when a rescue
            // branch finishes cleanly.
            for leaf in &mut leaves {
                if severity(leaf.reason) < severity(reason) {
                    leaf.reason = reason;
                    leaf.error = error.clone();
                }
            }
            leaves
        })
    }

    /// Run one job step through the pool and fold the outcome into the
    /// traveling state.
    async fn run_job(
        &self,
        step: &Step,
        state: RunState,
        input_clip: Option<String>,
    ) -> (Reason, Option<ErrorInfo>, RunState, Option<String>) {
        let executor = self.executor;
        let exec_id = Uuid::new_v4().to_string();

        if let (Some(repo), Some(adaptor)) = (&executor.repo, &step.adaptor) {
            if let Err(err) = repo.ensure_installed(adaptor).await {
                warn!(
                    run_id = %executor.run_id,
                    step_id = %step.id,
                    %err,
                    "adaptor provisioning failed"
                );
                let error = ErrorInfo::new("AutoinstallError", err.to_string());
                let mut state = state;
                state.record_error(&step.id, error.clone());
                return (Reason::Exception, Some(error), state, input_clip);
            }
        }

        let configuration = match self.fetch_configuration(step).await {
            Ok(configuration) => configuration,
            Err(error) => {
                let mut state = state;
                state.record_error(&step.id, error.clone());
                return (Reason::Exception, Some(error), state, input_clip);
            }
        };

        let mut input = state;
        if let Some(initial) = &step.initial_state {
            merge_initial_state(&mut input, initial);
        }

        executor
            .emit(ExecEvent::StepStart {
                job_id: step.id.clone(),
                step_id: exec_id.clone(),
                input: input.clone(),
                input_dataclip_id: input_clip,
            })
            .await;

        let body = self
            .bodies
            .get(&step.id)
            .cloned()
            .unwrap_or_default();
        let task = StepTask {
            run_id: executor.run_id.clone(),
            step_id: step.id.clone(),
            body,
            input: input.clone(),
            configuration,
        };

        let started = Instant::now();
        let outcome = executor.pool.execute(task, self.limits).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let (reason, error, output) = match outcome {
            Ok(Outcome::Success(next)) => (Reason::Success, None, next),
            Ok(Outcome::Fail(error)) => {
                let mut next = input;
                next.record_error(&step.id, error.clone());
                (Reason::Fail, Some(error), next)
            }
            Ok(Outcome::Kill(kind)) => {
                let error = ErrorInfo::new(kind.error_type(), kind.message());
                let mut next = input;
                next.record_error(&step.id, error.clone());
                (Reason::Kill, Some(error), next)
            }
            Ok(Outcome::Crash(message)) => {
                let error = ErrorInfo::new("RuntimeCrash", message);
                let mut next = input;
                next.record_error(&step.id, error.clone());
                (Reason::Crash, Some(error), next)
            }
            Err(err) => {
                let error = ErrorInfo::new("SandboxError", err.to_string());
                let mut next = input;
                next.record_error(&step.id, error.clone());
                (Reason::Exception, Some(error), next)
            }
        };

        let emitted_output = self.output_for_events(step, &output).await;
        let output_clip = emitted_output
            .as_ref()
            .map(|_| Uuid::new_v4().to_string());
        executor
            .emit(ExecEvent::StepComplete {
                job_id: step.id.clone(),
                step_id: exec_id,
                reason,
                error: error.clone(),
                duration_ms,
                output: emitted_output,
                output_dataclip_id: output_clip.clone(),
            })
            .await;

        (reason, error, output, output_clip)
    }

    async fn fetch_configuration(&self, step: &Step) -> Result<Option<Value>, ErrorInfo> {
        match &step.configuration {
            None => Ok(None),
            Some(ConfigurationRef::Inline(value)) => {
                self.executor.scrubber.add_secrets(value);
                Ok(Some(value.clone()))
            }
            Some(ConfigurationRef::Id(id)) => {
                match self.executor.resolver.fetch_credential(id).await {
                    Ok(value) => {
                        self.executor.scrubber.add_secrets(&value);
                        Ok(Some(value))
                    }
                    Err(err) => {
                        warn!(
                            run_id = %self.executor.run_id,
                            step_id = %step.id,
                            %err,
                            "credential fetch failed"
                        );
                        Err(ErrorInfo::new(err.error_type(), err.to_string()))
                    }
                }
            }
        }
    }

    /// Output attached to the step event, subject to the dataclip switch
    /// and the payload ceiling.
    async fn output_for_events(&self, step: &Step, output: &RunState) -> Option<RunState> {
        if !self.plan.options.output_dataclips {
            return None;
        }
        if let Some(limit_mb) = self.plan.options.payload_memory_limit_mb {
            let encoded = serde_json::to_vec(output).map(|b| b.len()).unwrap_or(0);
            if encoded as u64 > limit_mb * 1024 * 1024 {
                self.executor
                    .emit(ExecEvent::Log {
                        step_id: Some(step.id.clone()),
                        level: "warn".to_string(),
                        message: format!(
                            "step output exceeded the {limit_mb}MB payload limit; dataclip withheld"
                        ),
                    })
                    .await;
                return None;
            }
        }
        Some(output.clone())
    }
}

fn edge_fires(condition: &EdgeCondition, state: &RunState) -> bool {
    match condition {
        EdgeCondition::Always => true,
        EdgeCondition::OnSuccess(source) => !state.step_failed(source),
        EdgeCondition::OnFailure(source) => state.step_failed(source),
    }
}

/// Merge a step's partial initial state over the incoming `data` object.
fn merge_initial_state(state: &mut RunState, initial: &Value) {
    if let Value::Object(overrides) = initial {
        let mut data = state.data_object();
        for (key, value) in overrides {
            data.insert(key.clone(), value.clone());
        }
        state.data = Value::Object(data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::OpCompiler;
    use crate::plan::{Edge, PlanOptions};
    use crate::resolver::StaticResolver;
    use crate::sandbox::InlinePool;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn job(id: &str, ops: &str, next: BTreeMap<String, Edge>) -> Step {
        Step {
            id: id.to_string(),
            name: None,
            adaptor: None,
            body: Some(ops.to_string()),
            configuration: None,
            initial_state: None,
            next,
        }
    }

    fn trigger(id: &str, next: BTreeMap<String, Edge>) -> Step {
        Step {
            id: id.to_string(),
            name: None,
            adaptor: None,
            body: None,
            configuration: None,
            initial_state: None,
            next,
        }
    }

    fn executor(run_id: &str) -> (Executor, mpsc::Receiver<ExecEvent>) {
        let (tx, rx) = mpsc::channel(64);
        let exec = Executor::new(
            run_id,
            Arc::new(InlinePool::detached(4)),
            Arc::new(OpCompiler),
            StaticResolver::default().into_shared(),
            tx,
        );
        (exec, rx)
    }

    #[tokio::test]
    async fn runs_a_linear_plan() {
        let plan = ExecutionPlan {
            id: "p".to_string(),
            steps: vec![
                trigger("t", BTreeMap::from([("a".to_string(), Edge::always())])),
                job(
                    "a",
                    r#"[{"op": "set", "path": ["count"], "value": 22}]"#,
                    BTreeMap::from([("b".to_string(), Edge::on_success("a"))]),
                ),
                job(
                    "b",
                    r#"[{"op": "merge", "value": {"seen": true}}]"#,
                    BTreeMap::new(),
                ),
            ],
            options: PlanOptions::default(),
        };
        let (exec, _rx) = executor("r1");
        let report = exec.run(&plan, RunState::new(json!({})), None).await;
        assert_eq!(report.reason, Reason::Success);
        let state = report.final_state.expect("final state");
        assert_eq!(state.data, json!({"count": 22, "seen": true}));
    }

    #[tokio::test]
    async fn failure_routes_only_the_failure_edge() {
        let plan = ExecutionPlan {
            id: "p".to_string(),
            steps: vec![
                job(
                    "a",
                    r#"[{"op": "fail", "message": "boom"}]"#,
                    BTreeMap::from([
                        ("ok".to_string(), Edge::on_success("a")),
                        ("rescue".to_string(), Edge::on_failure("a")),
                    ]),
                ),
                job(
                    "ok",
                    r#"[{"op": "set", "path": ["ran"], "value": "ok"}]"#,
                    BTreeMap::new(),
                ),
                job(
                    "rescue",
                    r#"[{"op": "set", "path": ["ran"], "value": "rescue"}]"#,
                    BTreeMap::new(),
                ),
            ],
            options: PlanOptions::default(),
        };
        let (exec, _rx) = executor("r2");
        let report = exec.run(&plan, RunState::new(json!({})), None).await;
        // The rescue branch succeeded, but the step failure still marks
        // the run.
        assert_eq!(report.reason, Reason::Fail);
        let state = report.final_state.expect("final state");
        assert_eq!(state.data["ran"], json!("rescue"));
        assert!(state.step_failed("a"));
    }

    #[tokio::test]
    async fn disabled_edges_never_fire() {
        let mut edge = Edge::always();
        edge.disabled = true;
        let plan = ExecutionPlan {
            id: "p".to_string(),
            steps: vec![
                job(
                    "a",
                    r#"[]"#,
                    BTreeMap::from([("b".to_string(), edge)]),
                ),
                job(
                    "b",
                    r#"[{"op": "set", "path": ["ran"], "value": true}]"#,
                    BTreeMap::new(),
                ),
            ],
            options: PlanOptions::default(),
        };
        let (exec, _rx) = executor("r3");
        let report = exec.run(&plan, RunState::new(json!({"kept": 1})), None).await;
        assert_eq!(report.reason, Reason::Success);
        assert_eq!(
            report.final_state.expect("final state").data,
            json!({"kept": 1})
        );
    }

    #[tokio::test]
    async fn invalid_plans_abort_before_any_step() {
        let plan = ExecutionPlan {
            id: "p".to_string(),
            steps: vec![
                job(
                    "a",
                    r#"[]"#,
                    BTreeMap::from([("b".to_string(), Edge::always())]),
                ),
                job(
                    "b",
                    r#"[]"#,
                    BTreeMap::from([("a".to_string(), Edge::always())]),
                ),
            ],
            options: PlanOptions::default(),
        };
        let (exec, mut rx) = executor("r4");
        let report = exec.run(&plan, RunState::new(json!({})), None).await;
        assert_eq!(report.reason, Reason::Exception);
        let error = report.error.expect("error");
        assert_eq!(error.error_type, "ValidationError");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn compile_errors_are_fatal_before_execution() {
        let plan = ExecutionPlan {
            id: "p".to_string(),
            steps: vec![
                job(
                    "good",
                    r#"[{"op": "set", "path": ["x"], "value": 1}]"#,
                    BTreeMap::from([("bad".to_string(), Edge::on_success("good"))]),
                ),
                job("bad", "not json", BTreeMap::new()),
            ],
            options: PlanOptions::default(),
        };
        let (exec, mut rx) = executor("r5");
        let report = exec.run(&plan, RunState::new(json!({})), None).await;
        assert_eq!(report.reason, Reason::Exception);
        assert_eq!(report.error.expect("error").error_type, "CompileError");
        // The healthy upstream step never started.
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn only_mode_skips_edges() {
        let plan = ExecutionPlan {
            id: "p".to_string(),
            steps: vec![
                job(
                    "a",
                    r#"[{"op": "set", "path": ["ran"], "value": "a"}]"#,
                    BTreeMap::from([("b".to_string(), Edge::always())]),
                ),
                job(
                    "b",
                    r#"[{"op": "set", "path": ["ran"], "value": "b"}]"#,
                    BTreeMap::new(),
                ),
            ],
            options: PlanOptions {
                only: Some("b".to_string()),
                ..PlanOptions::default()
            },
        };
        let (exec, _rx) = executor("r6");
        let report = exec.run(&plan, RunState::new(json!({})), None).await;
        assert_eq!(report.reason, Reason::Success);
        assert_eq!(
            report.final_state.expect("final state").data["ran"],
            json!("b")
        );
    }

    #[tokio::test]
    async fn missing_only_step_names_the_option() {
        let plan = ExecutionPlan {
            id: "p".to_string(),
            steps: vec![job(
                "a",
                r#"[{"op": "set", "path": ["ran"], "value": "a"}]"#,
                BTreeMap::new(),
            )],
            options: PlanOptions {
                only: Some("ghost".to_string()),
                ..PlanOptions::default()
            },
        };
        let (exec, _rx) = executor("r6b");
        let report = exec.run(&plan, RunState::new(json!({})), None).await;
        assert_eq!(report.reason, Reason::Exception);
        let error = report.error.expect("error");
        assert_eq!(error.error_type, "ValidationError");
        assert_eq!(error.message, "only step not found: ghost");
    }

    #[tokio::test]
    async fn end_step_stops_the_walk() {
        let plan = ExecutionPlan {
            id: "p".to_string(),
            steps: vec![
                job(
                    "first",
                    r#"[{"op": "set", "path": ["ran"], "value": "first"}]"#,
                    BTreeMap::from([("second".to_string(), Edge::on_success("first"))]),
                ),
                job(
                    "second",
                    r#"[{"op": "set", "path": ["ran"], "value": "second"}]"#,
                    BTreeMap::new(),
                ),
            ],
            options: PlanOptions {
                end: Some("first".to_string()),
                ..PlanOptions::default()
            },
        };
        let (exec, _rx) = executor("r7");
        let report = exec.run(&plan, RunState::new(json!({})), None).await;
        assert_eq!(
            report.final_state.expect("final state").data["ran"],
            json!("first")
        );
    }

    #[tokio::test]
    async fn initial_state_overrides_incoming_data() {
        let mut step = job(
            "a",
            r#"[{"op": "set", "path": ["out"], "value": 1}]"#,
            BTreeMap::new(),
        );
        step.initial_state = Some(json!({"seed": 7}));
        let plan = ExecutionPlan {
            id: "p".to_string(),
            steps: vec![step],
            options: PlanOptions::default(),
        };
        let (exec, _rx) = executor("r8");
        let report = exec
            .run(&plan, RunState::new(json!({"seed": 1, "kept": true})), None)
            .await;
        let state = report.final_state.expect("final state");
        assert_eq!(state.data, json!({"seed": 7, "kept": true, "out": 1}));
    }

    #[tokio::test]
    async fn missing_credential_aborts_the_step_as_exception() {
        let mut step = job("a", r#"[]"#, BTreeMap::new());
        step.configuration = Some(ConfigurationRef::Id("nope".to_string()));
        let plan = ExecutionPlan {
            id: "p".to_string(),
            steps: vec![step],
            options: PlanOptions::default(),
        };
        let (exec, _rx) = executor("r9");
        let report = exec.run(&plan, RunState::new(json!({})), None).await;
        assert_eq!(report.reason, Reason::Exception);
        assert_eq!(
            report.error.expect("error").error_type,
            "CredentialLoadError"
        );
    }
}
