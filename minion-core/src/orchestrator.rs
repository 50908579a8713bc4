//! The attempt state machine.
//!
//! One [`TaskRunner::run`] drives one task through at most
//! `max_retries + 1` attempts. Each attempt assembles context, asks the
//! reasoning client for a patch, applies it in a fresh sandbox and runs the
//! lint and test gates there. Errors inside an attempt become that
//! attempt's failure and the next attempt's feedback; the task ends in
//! `Succeeded`, `Escalated`, `Aborted` or `Cancelled` with its full history.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use minion_graphs::{DependencyGraph, GraphBuilder, select_affected_tests};

use crate::config::MinionConfig;
use crate::context::{ContextAssembler, ContextLimits};
use crate::error::{ConfigError, MinionError, ReasoningError, Result};
use crate::escalation::EscalationSink;
use crate::gates::GateRunner;
use crate::plan::{PlanStore, initial_plan};
use crate::progress::{NoopReporter, ProgressReporter};
use crate::publish::ProposalPublisher;
use crate::reasoning::{Proposal, ReasoningClient, ReasoningRequest};
use crate::sandbox::{SandboxInstance, SandboxPool};
use crate::tools::{ToolContext, ToolRegistry};
use crate::types::{
    AttemptFailure, AttemptRecord, GateResult, Patch, Task, TaskId, TaskOutcome, TaskState,
};

/// Runs tasks against a shared sandbox pool.
pub struct TaskRunner {
    config: MinionConfig,
    reasoning: Arc<dyn ReasoningClient>,
    pool: Arc<SandboxPool>,
    publisher: Arc<dyn ProposalPublisher>,
    escalation: Arc<dyn EscalationSink>,
    plans: Arc<dyn PlanStore>,
    tools: ToolRegistry,
    gates: GateRunner,
    reporter: Arc<dyn ProgressReporter>,
    /// One graph per snapshot root, refreshed before each task.
    graphs: Mutex<HashMap<PathBuf, (Arc<GraphBuilder>, DependencyGraph)>>,
}

impl std::fmt::Debug for TaskRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRunner")
            .field("reasoning", &self.reasoning.name())
            .field("publisher", &self.publisher.name())
            .field("escalation", &self.escalation.name())
            .field("max_retries", &self.config.orchestrator.max_retries)
            .finish_non_exhaustive()
    }
}

impl TaskRunner {
    /// Refuses invalid configuration, including a retry cap above the
    /// default without `allow_retry_override`.
    pub fn new(
        config: MinionConfig,
        reasoning: Arc<dyn ReasoningClient>,
        pool: Arc<SandboxPool>,
        publisher: Arc<dyn ProposalPublisher>,
        escalation: Arc<dyn EscalationSink>,
        plans: Arc<dyn PlanStore>,
    ) -> std::result::Result<Self, ConfigError> {
        config.validate()?;
        let gates = GateRunner::new(config.gates.clone(), config.orchestrator.diagnostic_limit);
        Ok(Self {
            config,
            reasoning,
            pool,
            publisher,
            escalation,
            plans,
            tools: ToolRegistry::new(),
            gates,
            reporter: Arc::new(NoopReporter),
            graphs: Mutex::new(HashMap::new()),
        })
    }

    #[must_use]
    pub fn with_reporter(mut self, reporter: Arc<dyn ProgressReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    #[must_use]
    pub fn with_tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = tools;
        self
    }

    pub fn config(&self) -> &MinionConfig {
        &self.config
    }

    pub fn pool(&self) -> &Arc<SandboxPool> {
        &self.pool
    }

    /// Run tasks concurrently, at most `max_concurrent_tasks` at a time.
    /// Results are in input order.
    pub async fn run_batch(
        self: &Arc<Self>,
        tasks: Vec<Task>,
        cancel: &CancellationToken,
    ) -> Vec<Result<TaskOutcome>> {
        let permits = Arc::new(Semaphore::new(self.config.orchestrator.max_concurrent_tasks));
        let mut set = JoinSet::new();
        let count = tasks.len();

        for (index, task) in tasks.into_iter().enumerate() {
            let runner = Arc::clone(self);
            let permits = Arc::clone(&permits);
            let cancel = cancel.clone();
            set.spawn(async move {
                let _permit = permits.acquire_owned().await;
                (index, runner.run(&task, &cancel).await)
            });
        }

        let mut results: Vec<Option<Result<TaskOutcome>>> = (0..count).map(|_| None).collect();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((index, result)) => results[index] = Some(result),
                Err(e) => error!(error = %e, "Task runner panicked"),
            }
        }
        results
            .into_iter()
            .map(|r| {
                r.unwrap_or_else(|| Err(MinionError::Repository("task did not complete".into())))
            })
            .collect()
    }

    /// Drive `task` to a terminal state.
    ///
    /// Errors are returned only when the task cannot start (unreadable
    /// snapshot, graph construction failure).
    #[instrument(skip_all, name = "task_run", fields(task = %task.id))]
    pub async fn run(&self, task: &Task, cancel: &CancellationToken) -> Result<TaskOutcome> {
        let started = Instant::now();
        let mut machine = Machine::new(&task.id, self.reporter.as_ref());
        info!(description = %task.headline(80), revision = %task.snapshot.revision, "Task started");

        let (builder, graph) = self.graph_for(&task.snapshot.root).await?;

        let mut plan = match self.plans.load_plan(&task.id) {
            Ok(Some(plan)) => plan,
            Ok(None) => initial_plan(&task.id, &task.description),
            Err(e) => {
                warn!(error = %e, "Could not load plan, starting fresh");
                initial_plan(&task.id, &task.description)
            }
        };
        self.save_plan(&task.id, &plan);

        let limit = self.config.attempt_limit();
        self.reporter
            .start(&format!("{}: attempts", task.id), Some(u64::from(limit)));
        let mut attempts: Vec<AttemptRecord> = Vec::new();
        let mut last_diagnostic: Option<String> = None;
        let mut proposal_url = None;
        let mut publish_error = None;

        for number in 0..limit {
            if cancel.is_cancelled() {
                info!(attempt = number, "Task cancelled between attempts");
                machine.to(TaskState::Cancelled);
                break;
            }
            machine.to(TaskState::Planning);

            let step = self
                .attempt(
                    task,
                    number,
                    &graph,
                    &builder,
                    &mut plan,
                    last_diagnostic.as_deref(),
                    &mut machine,
                    cancel,
                )
                .await;
            let record = step.record;
            last_diagnostic = record.failure.as_ref().map(|f| f.diagnostic().to_string());
            let cancelled = matches!(record.failure, Some(AttemptFailure::Cancelled));
            match &record.failure {
                None => info!(attempt = number, "Attempt passed both gates"),
                Some(failure) => warn!(attempt = number, %failure, "Attempt failed"),
            }
            attempts.push(record);
            self.reporter.advance(1);
            if let Err(e) = self.plans.save_attempts(&task.id, &attempts) {
                warn!(error = %e, "Could not persist attempt history");
            }

            if cancelled {
                machine.to(TaskState::Cancelled);
                break;
            }
            if let Some(proposal) = step.proposal {
                machine.to(TaskState::Succeeded);
                match self.publisher.publish(task, &proposal).await {
                    Ok(url) => {
                        info!(url = %url, publisher = self.publisher.name(), "Proposal published");
                        proposal_url = Some(url);
                    }
                    Err(e) => {
                        warn!(error = %e, "Publishing failed; the patch passed both gates");
                        publish_error = Some(e.to_string());
                    }
                }
                break;
            }
        }

        if !machine.state.is_terminal() {
            if !attempts.is_empty()
                && attempts
                    .iter()
                    .all(|a| a.failure.as_ref().is_some_and(AttemptFailure::is_sandbox_unavailable))
            {
                error!(attempts = attempts.len(), "No sandbox could be obtained for any attempt");
                machine.to(TaskState::Aborted);
            } else {
                machine.to(TaskState::Escalated);
                match self.escalation.notify(task, &attempts).await {
                    Ok(true) => info!(sink = self.escalation.name(), "Escalation raised"),
                    Ok(false) => debug!("Task was already escalated"),
                    Err(e) => error!(error = %e, "Escalation delivery failed"),
                }
            }
        }

        let outcome = TaskOutcome {
            task_id: task.id.clone(),
            state: machine.state,
            attempts,
            proposal_url,
            publish_error,
            last_diagnostic,
            duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        };
        info!(
            state = %outcome.state,
            attempts = outcome.attempts.len(),
            duration_ms = outcome.duration_ms,
            "Task finished"
        );
        Ok(outcome)
    }

    /// One full reasoning, lint and test cycle.
    #[allow(clippy::too_many_arguments)]
    async fn attempt(
        &self,
        task: &Task,
        number: u32,
        graph: &DependencyGraph,
        builder: &GraphBuilder,
        plan: &mut String,
        last_diagnostic: Option<&str>,
        machine: &mut Machine<'_>,
        cancel: &CancellationToken,
    ) -> AttemptStep {
        let mut draft = Draft::new(number);

        // 1. Context
        let assembler = ContextAssembler::new(
            graph,
            &task.snapshot.root,
            ContextLimits::from(&self.config.graph),
        );
        let targets = assembler.target_files(task);
        let bundle = assembler.assemble(&targets);
        debug!(
            attempt = number,
            files = bundle.entries.len(),
            approx_tokens = bundle.approx_tokens,
            partially_ordered = bundle.partially_ordered,
            "Context assembled"
        );

        // 2. Reasoning
        let tool_context = ToolContext::new(
            &task.snapshot.root,
            task.id.clone(),
            Arc::clone(&self.plans),
            self.config.gates.clone(),
        );
        // No sandbox is leased while reasoning, so command tools stay hidden.
        let tools = self.tools.curate(task.domain).usable_with(&tool_context);
        let request = ReasoningRequest {
            task,
            attempt: number,
            bundle: &bundle,
            plan: plan.as_str(),
            last_diagnostic,
            tools: &tools,
            tool_context: &tool_context,
        };
        let timeout = self.config.reasoning.timeout();
        let proposal = match tokio::time::timeout(timeout, self.reasoning.propose(request)).await {
            Ok(Ok(proposal)) => proposal,
            Ok(Err(e)) => return draft.fail(AttemptFailure::Reasoning { message: e.to_string() }),
            Err(_) => {
                return draft.fail(AttemptFailure::Reasoning {
                    message: ReasoningError::Timeout(timeout).to_string(),
                });
            }
        };
        plan.clone_from(&proposal.updated_plan);
        self.save_plan(&task.id, plan);
        draft.patch = Some(proposal.patch.clone());
        draft.explanation = Some(proposal.explanation.clone());

        // 3. Sandbox
        if cancel.is_cancelled() {
            return draft.fail(AttemptFailure::Cancelled);
        }
        let instance = match self.pool.acquire(self.config.sandbox.acquire_timeout()).await {
            Ok(instance) => instance,
            Err(e) => {
                return draft.fail(AttemptFailure::SandboxUnavailable { message: e.to_string() });
            }
        };
        debug!(instance = instance.id(), "Sandbox acquired for attempt");

        let result = self
            .gate(&instance, graph, builder, &proposal, &mut draft, machine)
            .await;
        self.pool.release(&instance).await;

        match result {
            Ok(()) => AttemptStep {
                record: draft.finish(None),
                proposal: Some(proposal),
            },
            Err(failure) => draft.fail(failure),
        }
    }

    /// Apply the patch and run both gates in `instance`.
    async fn gate(
        &self,
        instance: &SandboxInstance,
        graph: &DependencyGraph,
        builder: &GraphBuilder,
        proposal: &Proposal,
        draft: &mut Draft,
        machine: &mut Machine<'_>,
    ) -> std::result::Result<(), AttemptFailure> {
        let sandbox_failure = |e: crate::error::SandboxError| AttemptFailure::Sandbox {
            message: e.to_string(),
        };

        for edit in proposal.patch.edits() {
            instance
                .write_file(&edit.path, &edit.content)
                .await
                .map_err(sandbox_failure)?;
        }
        let changed = proposal.patch.changed_files();

        // 4. Lint
        machine.to(TaskState::Linting);
        let lint = self
            .gates
            .lint(instance, &changed)
            .await
            .map_err(sandbox_failure)?;
        check(draft, lint)?;

        // 5. Affected tests against the patched graph
        machine.to(TaskState::Testing);
        let patched = patched_graph(graph, builder, proposal);
        let tests = select_affected_tests(&patched, &changed, &self.config.graph.test_selection());
        let test = self
            .gates
            .test(instance, &tests)
            .await
            .map_err(sandbox_failure)?;
        check(draft, test)
    }

    /// The dependency graph for `root`. Built on first use, then brought up
    /// to date with the files changed on disk since.
    async fn graph_for(&self, root: &Path) -> Result<(Arc<GraphBuilder>, DependencyGraph)> {
        let mut cache = self.graphs.lock().await;
        let (builder, graph) = match cache.remove(root) {
            Some((builder, graph)) => {
                let worker = Arc::clone(&builder);
                let graph = tokio::task::spawn_blocking(move || refresh_changed(&worker, graph))
                    .await
                    .map_err(|e| MinionError::Repository(format!("graph refresh task failed: {e}")))?;
                (builder, graph)
            }
            None => build_graph(root, &self.config).await?,
        };
        cache.insert(root.to_path_buf(), (Arc::clone(&builder), graph.clone()));
        Ok((builder, graph))
    }

    fn save_plan(&self, task: &TaskId, plan: &str) {
        if let Err(e) = self.plans.save_plan(task, plan) {
            warn!(error = %e, "Could not persist plan");
        }
    }
}

/// Build the dependency graph off the async runtime.
async fn build_graph(
    root: &Path,
    config: &MinionConfig,
) -> Result<(Arc<GraphBuilder>, DependencyGraph)> {
    let builder = Arc::new(GraphBuilder::new(root, config.graph.files.clone()));
    let worker = Arc::clone(&builder);
    let build = tokio::task::spawn_blocking(move || worker.build())
        .await
        .map_err(|e| MinionError::Repository(format!("graph build task failed: {e}")))??;
    for failure in &build.failures {
        debug!(file = %failure.file, message = %failure.message, "File kept without edges");
    }
    Ok((builder, build.graph))
}

/// Re-summarize every file edited, added or deleted since `graph` was built.
fn refresh_changed(builder: &GraphBuilder, mut graph: DependencyGraph) -> DependencyGraph {
    let changed = builder.changed_files(&graph);
    for file in &changed {
        match builder.refresh_file(&mut graph, file) {
            Ok(Some(failure)) => debug!(file = %failure.file, "Changed file did not parse"),
            Ok(None) => {}
            Err(e) => warn!(file = %file, error = %e, "Could not refresh changed file"),
        }
    }
    if !changed.is_empty() {
        debug!(files = changed.len(), "Dependency graph refreshed");
    }
    graph
}

/// The task graph with the patched files re-summarized in memory.
fn patched_graph(
    graph: &DependencyGraph,
    builder: &GraphBuilder,
    proposal: &Proposal,
) -> DependencyGraph {
    let mut patched = graph.clone();
    for edit in proposal.patch.edits() {
        match builder.refresh_source(&mut patched, &edit.path, &edit.content) {
            Ok(Some(failure)) => {
                debug!(file = %failure.file, "Patched file did not parse");
            }
            Ok(None) => {}
            Err(e) => warn!(file = %edit.path, error = %e, "Could not refresh patched file"),
        }
    }
    patched
}

/// Record `result` and turn a failed gate into the attempt's failure.
fn check(draft: &mut Draft, result: GateResult) -> std::result::Result<(), AttemptFailure> {
    let failure = (!result.passed()).then(|| AttemptFailure::Gate {
        gate: result.kind,
        diagnostic: result.diagnostic.clone(),
    });
    debug!(
        gate = %result.kind,
        outcome = ?result.outcome,
        elapsed_ms = result.elapsed_ms,
        "Gate finished"
    );
    draft.gates.push(result);
    failure.map_or(Ok(()), Err)
}

// ── State tracking ─────────────────────────────────────────────────

struct Machine<'a> {
    task: &'a TaskId,
    state: TaskState,
    reporter: &'a dyn ProgressReporter,
}

impl<'a> Machine<'a> {
    fn new(task: &'a TaskId, reporter: &'a dyn ProgressReporter) -> Self {
        Self {
            task,
            state: TaskState::Init,
            reporter,
        }
    }

    fn to(&mut self, next: TaskState) {
        let from = self.state;
        debug_assert!(
            from.can_transition_to(next),
            "invalid transition {from} -> {next}"
        );
        if !from.can_transition_to(next) {
            error!(%from, to = %next, "Invalid task state transition");
        }
        info!(task = %self.task, %from, to = %next, "Task state");
        self.reporter.transition(self.task, from, next);
        self.state = next;
    }
}

struct AttemptStep {
    record: AttemptRecord,
    /// Present when both gates passed.
    proposal: Option<Proposal>,
}

struct Draft {
    number: u32,
    started_at: chrono::DateTime<Utc>,
    patch: Option<Patch>,
    explanation: Option<String>,
    gates: Vec<GateResult>,
}

impl Draft {
    fn new(number: u32) -> Self {
        Self {
            number,
            started_at: Utc::now(),
            patch: None,
            explanation: None,
            gates: Vec::new(),
        }
    }

    fn finish(self, failure: Option<AttemptFailure>) -> AttemptRecord {
        AttemptRecord {
            number: self.number,
            patch: self.patch,
            explanation: self.explanation,
            gates: self.gates,
            failure,
            started_at: self.started_at,
            finished_at: Utc::now(),
        }
    }

    fn fail(self, failure: AttemptFailure) -> AttemptStep {
        AttemptStep {
            record: self.finish(Some(failure)),
            proposal: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::result::Result;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use minion_graphs::FileId;

    use super::*;
    use crate::error::{EscalationError, PublishError, SandboxError};
    use crate::plan::MemoryPlanStore;
    use crate::progress::IndicatifReporter;
    use crate::sandbox::{ExecOutput, InstanceHandle, PoolSettings, SandboxBackend};
    use crate::types::{FileEdit, GateKind, RepoSnapshot};

    fn repo() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("app")).unwrap();
        std::fs::create_dir_all(dir.path().join("tests")).unwrap();
        std::fs::write(dir.path().join("app/cart.py"), "def total(items):\n    return 0\n").unwrap();
        std::fs::write(
            dir.path().join("tests/test_cart.py"),
            "from app.cart import total\n\ndef test_total():\n    assert total([1]) == 1\n",
        )
        .unwrap();
        dir
    }

    fn task(root: &Path) -> Task {
        Task::new(
            "Fix the cart total",
            RepoSnapshot {
                root: root.to_path_buf(),
                revision: RepoSnapshot::WORKING_TREE.into(),
            },
        )
        .with_id(TaskId::from("minion-orch"))
        .with_files(["app/cart.py"])
    }

    fn proposal(content: &str) -> Proposal {
        Proposal {
            patch: Patch::new([FileEdit {
                path: "app/cart.py".into(),
                content: content.into(),
            }]),
            updated_plan: "- [x] sum the items".into(),
            explanation: "Sum the items.".into(),
            confidence: Some(0.9),
        }
    }

    // ── Fakes ──────────────────────────────────────────────────────

    /// Answers from a queue; repeats the last answer once it runs dry.
    #[derive(Debug)]
    struct Scripted {
        answers: Mutex<VecDeque<Result<Proposal, String>>>,
        diagnostics: Mutex<Vec<Option<String>>>,
        offered: Mutex<Vec<Vec<&'static str>>>,
        cancel_on_call: Option<CancellationToken>,
    }

    impl Scripted {
        fn new(answers: Vec<Result<Proposal, String>>) -> Arc<Self> {
            Arc::new(Self {
                answers: Mutex::new(answers.into()),
                diagnostics: Mutex::new(Vec::new()),
                offered: Mutex::new(Vec::new()),
                cancel_on_call: None,
            })
        }

        /// Cancels `token` while the proposal is being prepared.
        fn cancelling(answers: Vec<Result<Proposal, String>>, token: CancellationToken) -> Arc<Self> {
            Arc::new(Self {
                answers: Mutex::new(answers.into()),
                diagnostics: Mutex::new(Vec::new()),
                offered: Mutex::new(Vec::new()),
                cancel_on_call: Some(token),
            })
        }

        fn calls(&self) -> usize {
            self.diagnostics.lock().unwrap().len()
        }
    }

    #[async_trait::async_trait]
    impl ReasoningClient for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn propose(&self, request: ReasoningRequest<'_>) -> Result<Proposal, ReasoningError> {
            self.diagnostics
                .lock()
                .unwrap()
                .push(request.last_diagnostic.map(str::to_string));
            self.offered.lock().unwrap().push(request.tools.names());
            if let Some(token) = &self.cancel_on_call {
                token.cancel();
            }
            let mut answers = self.answers.lock().unwrap();
            let answer = if answers.len() > 1 {
                answers.pop_front().unwrap()
            } else {
                answers.front().cloned().unwrap()
            };
            answer.map_err(ReasoningError::Malformed)
        }
    }

    /// Lint and test commands exit with queued codes; everything else passes.
    #[derive(Debug, Default)]
    struct GateBackend {
        lint: Mutex<VecDeque<i32>>,
        test: Mutex<VecDeque<i32>>,
        broken: bool,
        provisioned: AtomicUsize,
        commands: Mutex<Vec<String>>,
        cancel_on_test: Option<CancellationToken>,
    }

    impl GateBackend {
        fn with_codes(lint: &[i32], test: &[i32]) -> Arc<Self> {
            Arc::new(Self {
                lint: Mutex::new(lint.iter().copied().collect()),
                test: Mutex::new(test.iter().copied().collect()),
                ..Self::default()
            })
        }
    }

    #[async_trait::async_trait]
    impl SandboxBackend for GateBackend {
        fn name(&self) -> &str {
            "gates"
        }

        async fn provision(&self) -> Result<InstanceHandle, SandboxError> {
            if self.broken {
                return Err(SandboxError::Provision("daemon down".into()));
            }
            let n = self.provisioned.fetch_add(1, Ordering::SeqCst);
            Ok(InstanceHandle {
                id: format!("sbx-{n}"),
                location: String::new(),
            })
        }

        async fn exec(
            &self,
            _handle: &InstanceHandle,
            command: &str,
            _timeout: Duration,
        ) -> Result<ExecOutput, SandboxError> {
            self.commands.lock().unwrap().push(command.to_string());
            if command.starts_with("test") {
                if let Some(token) = &self.cancel_on_test {
                    token.cancel();
                }
            }
            let queue = if command.starts_with("lint") { &self.lint } else { &self.test };
            let exit_code = queue.lock().unwrap().pop_front().unwrap_or(0);
            Ok(ExecOutput {
                exit_code,
                stdout: if exit_code == 0 { String::new() } else { format!("{command}: E1 failed") },
                stderr: String::new(),
                timed_out: false,
                elapsed_ms: 1,
            })
        }

        async fn write_file(
            &self,
            _handle: &InstanceHandle,
            _path: &FileId,
            _content: &str,
        ) -> Result<(), SandboxError> {
            Ok(())
        }

        async fn read_file(
            &self,
            _handle: &InstanceHandle,
            _path: &FileId,
        ) -> Result<Option<String>, SandboxError> {
            Ok(None)
        }

        async fn destroy(&self, _handle: &InstanceHandle) -> Result<(), SandboxError> {
            Ok(())
        }
    }

    #[derive(Debug, Default)]
    struct Recorder {
        published: AtomicUsize,
        escalated: AtomicUsize,
        fail_publish: bool,
    }

    #[async_trait::async_trait]
    impl ProposalPublisher for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }

        async fn publish(&self, task: &Task, _proposal: &Proposal) -> Result<String, PublishError> {
            self.published.fetch_add(1, Ordering::SeqCst);
            if self.fail_publish {
                return Err(PublishError::Api {
                    status: 422,
                    body: "branch exists".into(),
                });
            }
            Ok(format!("memory://{}", task.id))
        }
    }

    #[async_trait::async_trait]
    impl EscalationSink for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }

        async fn notify(&self, _task: &Task, _history: &[AttemptRecord]) -> Result<bool, EscalationError> {
            self.escalated.fetch_add(1, Ordering::SeqCst);
            Ok(true)
        }
    }

    fn config() -> MinionConfig {
        let mut config = MinionConfig::default();
        config.gates.lint_command = "lint {files}".into();
        config.gates.test_command = "test {tests}".into();
        config.gates.full_suite_command = "test --all".into();
        config.sandbox.acquire_timeout_secs = 2;
        config.sandbox.provision_retries = 0;
        config.sandbox.provision_backoff_ms = 1;
        config
    }

    fn runner(
        config: MinionConfig,
        reasoning: Arc<Scripted>,
        backend: Arc<GateBackend>,
        recorder: &Arc<Recorder>,
    ) -> TaskRunner {
        let settings = PoolSettings {
            target: 1,
            max: 2,
            ..PoolSettings::from(&config.sandbox)
        };
        let pool = SandboxPool::start(backend, settings).unwrap();
        TaskRunner::new(
            config,
            reasoning,
            pool,
            Arc::clone(recorder) as Arc<dyn ProposalPublisher>,
            Arc::clone(recorder) as Arc<dyn EscalationSink>,
            Arc::new(MemoryPlanStore::new()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn lint_failure_feeds_the_next_attempt() {
        let dir = repo();
        let reasoning = Scripted::new(vec![Ok(proposal("def total(items):\n    return sum(items)\n"))]);
        let backend = GateBackend::with_codes(&[1, 0], &[0]);
        let recorder = Arc::new(Recorder::default());
        let runner = runner(config(), Arc::clone(&reasoning), Arc::clone(&backend), &recorder);

        let outcome = runner.run(&task(dir.path()), &CancellationToken::new()).await.unwrap();

        assert_eq!(outcome.state, TaskState::Succeeded);
        assert_eq!(outcome.attempts.len(), 2);
        assert!(matches!(
            outcome.attempts[0].failure,
            Some(AttemptFailure::Gate { gate: GateKind::Lint, .. })
        ));
        let seen = reasoning.diagnostics.lock().unwrap().clone();
        assert_eq!(seen[0], None);
        assert!(seen[1].as_deref().unwrap().contains("E1 failed"));
        assert_eq!(outcome.proposal_url.as_deref(), Some("memory://minion-orch"));
        assert_eq!(recorder.published.load(Ordering::SeqCst), 1);

        // The test gate ran only the test that imports the patched module.
        let commands = backend.commands.lock().unwrap().clone();
        assert!(commands.contains(&"test tests/test_cart.py".to_string()));

        // Reasoning runs before a sandbox is leased: no command tools on offer.
        let offered = reasoning.offered.lock().unwrap().clone();
        assert!(offered[0].contains(&"read_file"));
        assert!(!offered[0].contains(&"run_tests"));
        assert!(!offered[0].contains(&"run_coverage"));
    }

    #[tokio::test]
    async fn later_tasks_see_files_added_to_the_snapshot() {
        let dir = repo();
        let reasoning = Scripted::new(vec![Ok(proposal("def total(items):\n    return sum(items)\n"))]);
        let backend = GateBackend::with_codes(&[], &[]);
        let recorder = Arc::new(Recorder::default());
        let reporter = Arc::new(IndicatifReporter::hidden());
        let runner = runner(config(), reasoning, Arc::clone(&backend), &recorder)
            .with_reporter(Arc::clone(&reporter) as Arc<dyn ProgressReporter>);

        runner.run(&task(dir.path()), &CancellationToken::new()).await.unwrap();
        std::fs::write(
            dir.path().join("tests/test_checkout.py"),
            "from app.cart import total\n\ndef test_checkout():\n    assert total([]) == 0\n",
        )
        .unwrap();
        let second = task(dir.path()).with_id(TaskId::from("minion-orch-2"));
        let outcome = runner.run(&second, &CancellationToken::new()).await.unwrap();

        assert_eq!(outcome.state, TaskState::Succeeded);
        let commands = backend.commands.lock().unwrap().clone();
        assert!(commands.contains(&"test tests/test_cart.py".to_string()));
        assert!(
            commands.contains(&"test tests/test_cart.py tests/test_checkout.py".to_string()),
            "{commands:?}"
        );
        assert_eq!(reporter.completed(), 1);
    }

    #[tokio::test]
    async fn exhausted_attempts_escalate_once() {
        let dir = repo();
        let reasoning = Scripted::new(vec![Ok(proposal("def total(items):\n    return 1\n"))]);
        let backend = GateBackend::with_codes(&[], &[1, 1, 1, 1]);
        let recorder = Arc::new(Recorder::default());
        let reporter = Arc::new(IndicatifReporter::hidden());
        let runner = runner(config(), Arc::clone(&reasoning), backend, &recorder)
            .with_reporter(Arc::clone(&reporter) as Arc<dyn ProgressReporter>);

        let outcome = runner.run(&task(dir.path()), &CancellationToken::new()).await.unwrap();

        assert_eq!(outcome.state, TaskState::Escalated);
        assert_eq!(outcome.attempts.len(), 3);
        assert_eq!(reasoning.calls(), 3);
        assert_eq!(reporter.completed(), 3);
        assert_eq!(recorder.escalated.load(Ordering::SeqCst), 1);
        assert_eq!(recorder.published.load(Ordering::SeqCst), 0);
        assert!(outcome.last_diagnostic.unwrap().contains("E1 failed"));
    }

    #[tokio::test]
    async fn reasoning_errors_count_as_attempts() {
        let dir = repo();
        let reasoning = Scripted::new(vec![
            Err("no JSON object in response".into()),
            Ok(proposal("def total(items):\n    return sum(items)\n")),
        ]);
        let backend = GateBackend::with_codes(&[], &[]);
        let recorder = Arc::new(Recorder::default());
        let runner = runner(config(), Arc::clone(&reasoning), backend, &recorder);

        let outcome = runner.run(&task(dir.path()), &CancellationToken::new()).await.unwrap();

        assert_eq!(outcome.state, TaskState::Succeeded);
        assert!(matches!(
            outcome.attempts[0].failure,
            Some(AttemptFailure::Reasoning { .. })
        ));
        assert!(outcome.attempts[0].gates.is_empty());
    }

    #[tokio::test]
    async fn cancelled_token_stops_before_reasoning() {
        let dir = repo();
        let reasoning = Scripted::new(vec![Ok(proposal("x = 1\n"))]);
        let recorder = Arc::new(Recorder::default());
        let runner = runner(
            config(),
            Arc::clone(&reasoning),
            GateBackend::with_codes(&[], &[]),
            &recorder,
        );
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = runner.run(&task(dir.path()), &cancel).await.unwrap();

        assert_eq!(outcome.state, TaskState::Cancelled);
        assert!(outcome.attempts.is_empty());
        assert_eq!(reasoning.calls(), 0);
        assert_eq!(recorder.escalated.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cancel_during_reasoning_keeps_history_and_skips_gates() {
        let dir = repo();
        let cancel = CancellationToken::new();
        let reasoning = Scripted::cancelling(
            vec![Ok(proposal("def total(items):\n    return sum(items)\n"))],
            cancel.clone(),
        );
        let backend = GateBackend::with_codes(&[], &[]);
        let recorder = Arc::new(Recorder::default());
        let runner = runner(config(), Arc::clone(&reasoning), Arc::clone(&backend), &recorder);

        let outcome = runner.run(&task(dir.path()), &cancel).await.unwrap();

        assert_eq!(outcome.state, TaskState::Cancelled);
        assert_eq!(outcome.attempts.len(), 1);
        assert!(matches!(outcome.attempts[0].failure, Some(AttemptFailure::Cancelled)));
        assert!(outcome.attempts[0].patch.is_some());
        assert!(outcome.attempts[0].gates.is_empty());
        assert_eq!(reasoning.calls(), 1);
        assert!(backend.commands.lock().unwrap().is_empty());
        assert_eq!(runner.pool().stats().leased, 0);
        assert_eq!(recorder.escalated.load(Ordering::SeqCst), 0);
        assert_eq!(recorder.published.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cancel_during_gates_releases_the_instance() {
        let dir = repo();
        let cancel = CancellationToken::new();
        let reasoning = Scripted::new(vec![Ok(proposal("def total(items):\n    return 1\n"))]);
        let backend = Arc::new(GateBackend {
            test: Mutex::new([1].into_iter().collect()),
            cancel_on_test: Some(cancel.clone()),
            ..GateBackend::default()
        });
        let recorder = Arc::new(Recorder::default());
        let runner = runner(config(), Arc::clone(&reasoning), Arc::clone(&backend), &recorder);

        let outcome = runner.run(&task(dir.path()), &cancel).await.unwrap();

        assert_eq!(outcome.state, TaskState::Cancelled);
        assert_eq!(outcome.attempts.len(), 1);
        assert!(matches!(
            outcome.attempts[0].failure,
            Some(AttemptFailure::Gate { gate: GateKind::Test, .. })
        ));
        assert_eq!(reasoning.calls(), 1);
        let stats = runner.pool().stats();
        assert_eq!(stats.leased, 0);
        assert!(stats.destroyed >= 1);
        assert_eq!(recorder.escalated.load(Ordering::SeqCst), 0);
        assert_eq!(recorder.published.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn mixed_failures_escalate_rather_than_abort() {
        let dir = repo();
        let reasoning = Scripted::new(vec![
            Err("no JSON object in response".into()),
            Ok(proposal("x = 1\n")),
        ]);
        let backend = Arc::new(GateBackend {
            broken: true,
            ..GateBackend::default()
        });
        let recorder = Arc::new(Recorder::default());
        let runner = runner(config(), reasoning, backend, &recorder);

        let outcome = runner.run(&task(dir.path()), &CancellationToken::new()).await.unwrap();

        assert_eq!(outcome.state, TaskState::Escalated);
        assert_eq!(outcome.attempts.len(), 3);
        assert!(matches!(
            outcome.attempts[0].failure,
            Some(AttemptFailure::Reasoning { .. })
        ));
        assert!(
            outcome.attempts[1..]
                .iter()
                .all(|a| a.failure.as_ref().is_some_and(AttemptFailure::is_sandbox_unavailable))
        );
        assert_eq!(recorder.escalated.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn no_sandbox_at_all_aborts_without_escalation() {
        let dir = repo();
        let reasoning = Scripted::new(vec![Ok(proposal("x = 1\n"))]);
        let backend = Arc::new(GateBackend {
            broken: true,
            ..GateBackend::default()
        });
        let recorder = Arc::new(Recorder::default());
        let runner = runner(config(), reasoning, backend, &recorder);

        let outcome = runner.run(&task(dir.path()), &CancellationToken::new()).await.unwrap();

        assert_eq!(outcome.state, TaskState::Aborted);
        assert!(
            outcome
                .attempts
                .iter()
                .all(|a| a.failure.as_ref().is_some_and(AttemptFailure::is_sandbox_unavailable))
        );
        assert_eq!(recorder.escalated.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn publish_failure_keeps_the_success() {
        let dir = repo();
        let reasoning = Scripted::new(vec![Ok(proposal("def total(items):\n    return sum(items)\n"))]);
        let recorder = Arc::new(Recorder {
            fail_publish: true,
            ..Recorder::default()
        });
        let runner = runner(config(), reasoning, GateBackend::with_codes(&[], &[]), &recorder);

        let outcome = runner.run(&task(dir.path()), &CancellationToken::new()).await.unwrap();

        assert_eq!(outcome.state, TaskState::Succeeded);
        assert_eq!(outcome.proposal_url, None);
        assert!(outcome.publish_error.unwrap().contains("422"));
        assert_eq!(outcome.attempts.len(), 1);
    }

    #[test]
    fn retry_cap_above_default_needs_override() {
        let mut config = config();
        config.orchestrator.max_retries = 5;
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async {
            let pool = SandboxPool::start(
                GateBackend::with_codes(&[], &[]),
                PoolSettings::from(&config.sandbox),
            )
            .unwrap();
            let recorder = Arc::new(Recorder::default());
            let result = TaskRunner::new(
                config,
                Scripted::new(vec![Ok(proposal("x = 1\n"))]),
                pool,
                Arc::clone(&recorder) as Arc<dyn ProposalPublisher>,
                recorder,
                Arc::new(MemoryPlanStore::new()),
            );
            assert!(result.is_err());
        });
    }

    #[tokio::test]
    async fn batch_results_keep_input_order() {
        let dir = repo();
        let reasoning = Scripted::new(vec![Ok(proposal("def total(items):\n    return sum(items)\n"))]);
        let recorder = Arc::new(Recorder::default());
        let runner = Arc::new(runner(
            config(),
            reasoning,
            GateBackend::with_codes(&[], &[]),
            &recorder,
        ));
        let tasks: Vec<Task> = (0..3)
            .map(|i| task(dir.path()).with_id(TaskId::from(format!("minion-batch-{i}"))))
            .collect();

        let results = runner.run_batch(tasks, &CancellationToken::new()).await;

        let ids: Vec<String> = results
            .into_iter()
            .map(|r| r.unwrap().task_id.to_string())
            .collect();
        assert_eq!(ids, ["minion-batch-0", "minion-batch-1", "minion-batch-2"]);
        assert_eq!(recorder.published.load(Ordering::SeqCst), 3);
    }
}
