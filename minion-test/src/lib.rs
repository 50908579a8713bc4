// Integration test utilities, fixture repositories and fakes for Minion.

use std::collections::VecDeque;
use std::path::Path;
use std::process::Command;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use minion_core::config::MinionConfig;
use minion_core::error::{EscalationError, PublishError, ReasoningError, SandboxError};
use minion_core::escalation::EscalationSink;
use minion_core::plan::MemoryPlanStore;
use minion_core::publish::ProposalPublisher;
use minion_core::reasoning::{Proposal, ReasoningClient, ReasoningRequest};
use minion_core::sandbox::{ExecOutput, InstanceHandle, PoolSettings, SandboxBackend, SandboxPool};
use minion_core::types::{AttemptRecord, FileEdit, Patch, RepoSnapshot, Task};
use minion_core::TaskRunner;
use minion_graphs::FileId;

/// A test fixture with a temporary repository.
#[derive(Debug)]
pub struct TestRepo {
    pub dir: tempfile::TempDir,
}

impl TestRepo {
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn snapshot(&self) -> RepoSnapshot {
        RepoSnapshot::open(self.path()).expect("open snapshot")
    }

    /// `a.py` imports `b.py`, which imports `c.py`. No git history.
    pub fn chain() -> Self {
        let dir = tempfile::tempdir().expect("create tempdir");
        let root = dir.path();
        write(root, "a.py", "import b\n\ndef run():\n    return b.step()\n");
        write(root, "b.py", "import c\n\ndef step():\n    return c.base()\n");
        write(root, "c.py", "def base():\n    return 1\n");
        Self { dir }
    }

    /// `x.py` and `y.py` import each other.
    pub fn cycle() -> Self {
        let dir = tempfile::tempdir().expect("create tempdir");
        let root = dir.path();
        write(root, "x.py", "import y\n\ndef ping():\n    return y.pong()\n");
        write(root, "y.py", "import x\n\ndef pong():\n    return 1\n");
        Self { dir }
    }

    /// A small Python shop with tests, committed to git.
    pub fn shop() -> Self {
        let dir = tempfile::tempdir().expect("create tempdir");
        let root = dir.path();

        git(root, &["init"]);
        git(root, &["config", "user.email", "test@minion.dev"]);
        git(root, &["config", "user.name", "Test"]);

        write(root, "shop/__init__.py", "");
        write(
            root,
            "shop/db.py",
            "class Database:\n    def __init__(self):\n        self.rows = {}\n\n    def get(self, key):\n        return self.rows.get(key)\n",
        );
        write(
            root,
            "shop/cart.py",
            "from shop.db import Database\n\n\ndef total(items):\n    return 0\n",
        );
        write(
            root,
            "shop/api.py",
            "from shop.cart import total\n\n\ndef checkout(items):\n    return {\"total\": total(items)}\n",
        );
        write(
            root,
            "tests/test_cart.py",
            "from shop.cart import total\n\n\ndef test_total():\n    assert total([1, 2]) == 3\n",
        );
        write(
            root,
            "tests/test_api.py",
            "from shop.api import checkout\n\n\ndef test_checkout():\n    assert checkout([2])[\"total\"] == 2\n",
        );
        write(
            root,
            "tests/test_db.py",
            "from shop.db import Database\n\n\ndef test_empty():\n    assert Database().get(\"x\") is None\n",
        );

        git(root, &["add", "."]);
        git(root, &["commit", "-m", "Initial shop"]);
        Self { dir }
    }
}

/// Write `content` to `rel` under `root`, creating parent directories.
pub fn write(root: &Path, rel: &str, content: &str) {
    let path = root.join(rel);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, content).unwrap();
}

fn git(dir: &Path, args: &[&str]) {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .expect("run git");
    assert!(
        output.status.success(),
        "git {} failed: {}",
        args.join(" "),
        String::from_utf8_lossy(&output.stderr)
    );
}

/// A one-file proposal.
pub fn proposal(path: &str, content: &str) -> Proposal {
    Proposal {
        patch: Patch::new([FileEdit {
            path: FileId::new(path),
            content: content.to_string(),
        }]),
        updated_plan: format!("- [x] rewrite `{path}`\n"),
        explanation: format!("Rewrote {path}."),
        confidence: Some(0.8),
    }
}

// ── Reasoning ──────────────────────────────────────────────────────

/// Replays queued answers; the last one repeats once the queue runs dry.
#[derive(Debug)]
pub struct ScriptedReasoning {
    answers: Mutex<VecDeque<Result<Proposal, String>>>,
    feedback: Mutex<Vec<Option<String>>>,
}

impl ScriptedReasoning {
    pub fn new(answers: Vec<Result<Proposal, String>>) -> Arc<Self> {
        assert!(!answers.is_empty(), "script needs at least one answer");
        Arc::new(Self {
            answers: Mutex::new(answers.into()),
            feedback: Mutex::new(Vec::new()),
        })
    }

    /// Always proposes the same patch.
    pub fn always(proposal: Proposal) -> Arc<Self> {
        Self::new(vec![Ok(proposal)])
    }

    pub fn calls(&self) -> usize {
        self.feedback.lock().unwrap().len()
    }

    /// The diagnostic each request carried, in call order.
    pub fn feedback(&self) -> Vec<Option<String>> {
        self.feedback.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl ReasoningClient for ScriptedReasoning {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn propose(&self, request: ReasoningRequest<'_>) -> Result<Proposal, ReasoningError> {
        self.feedback
            .lock()
            .unwrap()
            .push(request.last_diagnostic.map(str::to_string));
        let mut answers = self.answers.lock().unwrap();
        let answer = if answers.len() > 1 {
            answers.pop_front().unwrap()
        } else {
            answers.front().cloned().unwrap()
        };
        answer.map_err(ReasoningError::Malformed)
    }
}

// ── Sandbox ────────────────────────────────────────────────────────

/// Exit codes are queued per gate: commands starting with `lint` draw from
/// the lint queue, every other command from the test queue. An empty queue
/// passes.
#[derive(Debug, Default)]
pub struct ScriptedBackend {
    lint: Mutex<VecDeque<i32>>,
    test: Mutex<VecDeque<i32>>,
    provision_delay: Duration,
    broken: bool,
    provisioned: AtomicUsize,
    destroyed: AtomicUsize,
    commands: Mutex<Vec<String>>,
    writes: Mutex<Vec<(String, FileId)>>,
}

impl ScriptedBackend {
    pub fn passing() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_codes(lint: &[i32], test: &[i32]) -> Arc<Self> {
        Arc::new(Self {
            lint: Mutex::new(lint.iter().copied().collect()),
            test: Mutex::new(test.iter().copied().collect()),
            ..Self::default()
        })
    }

    /// Every provisioning takes `delay`.
    pub fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            provision_delay: delay,
            ..Self::default()
        })
    }

    /// Provisioning always fails.
    pub fn broken() -> Arc<Self> {
        Arc::new(Self {
            broken: true,
            ..Self::default()
        })
    }

    pub fn provisioned(&self) -> usize {
        self.provisioned.load(Ordering::SeqCst)
    }

    pub fn destroyed(&self) -> usize {
        self.destroyed.load(Ordering::SeqCst)
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    /// `(instance id, file)` for every write.
    pub fn writes(&self) -> Vec<(String, FileId)> {
        self.writes.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl SandboxBackend for ScriptedBackend {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn provision(&self) -> Result<InstanceHandle, SandboxError> {
        if !self.provision_delay.is_zero() {
            tokio::time::sleep(self.provision_delay).await;
        }
        if self.broken {
            return Err(SandboxError::Provision("scripted outage".into()));
        }
        let n = self.provisioned.fetch_add(1, Ordering::SeqCst);
        Ok(InstanceHandle {
            id: format!("scripted-{n}"),
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
        let queue = if command.starts_with("lint") {
            &self.lint
        } else {
            &self.test
        };
        let exit_code = queue.lock().unwrap().pop_front().unwrap_or(0);
        let stdout = if exit_code == 0 {
            "ok\n".to_string()
        } else {
            format!("FAILED {command} (exit {exit_code})\n")
        };
        Ok(ExecOutput {
            exit_code,
            stdout,
            stderr: String::new(),
            timed_out: false,
            elapsed_ms: 1,
        })
    }

    async fn write_file(
        &self,
        handle: &InstanceHandle,
        path: &FileId,
        _content: &str,
    ) -> Result<(), SandboxError> {
        self.writes
            .lock()
            .unwrap()
            .push((handle.id.clone(), path.clone()));
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
        self.destroyed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ── Publisher and escalation ───────────────────────────────────────

#[derive(Debug, Default)]
pub struct RecordingPublisher {
    published: Mutex<Vec<(Task, Proposal)>>,
    fail: bool,
}

impl RecordingPublisher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Every publish fails with an API error.
    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            fail: true,
            ..Self::default()
        })
    }

    pub fn published(&self) -> Vec<(Task, Proposal)> {
        self.published.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl ProposalPublisher for RecordingPublisher {
    fn name(&self) -> &'static str {
        "recording"
    }

    async fn publish(&self, task: &Task, proposal: &Proposal) -> Result<String, PublishError> {
        self.published
            .lock()
            .unwrap()
            .push((task.clone(), proposal.clone()));
        if self.fail {
            return Err(PublishError::Api {
                status: 502,
                body: "bad gateway".into(),
            });
        }
        Ok(format!("https://example.test/pull/{}", task.id))
    }
}

#[derive(Debug, Default)]
pub struct RecordingSink {
    reports: Mutex<Vec<(Task, Vec<AttemptRecord>)>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn reports(&self) -> Vec<(Task, Vec<AttemptRecord>)> {
        self.reports.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl EscalationSink for RecordingSink {
    fn name(&self) -> &'static str {
        "recording"
    }

    async fn notify(&self, task: &Task, history: &[AttemptRecord]) -> Result<bool, EscalationError> {
        let mut reports = self.reports.lock().unwrap();
        if reports.iter().any(|(t, _)| t.id == task.id) {
            return Ok(false);
        }
        reports.push((task.clone(), history.to_vec()));
        Ok(true)
    }
}

// ── Harness ────────────────────────────────────────────────────────

/// Configuration whose gates talk to [`ScriptedBackend`].
pub fn scripted_config() -> MinionConfig {
    let mut config = MinionConfig::default();
    config.gates.lint_command = "lint {files}".into();
    config.gates.test_command = "test {tests}".into();
    config.gates.full_suite_command = "test --all".into();
    config.sandbox.pool_target = 1;
    config.sandbox.pool_max = 2;
    config.sandbox.acquire_timeout_secs = 2;
    config.sandbox.provision_retries = 0;
    config.sandbox.provision_backoff_ms = 10;
    config
}

/// A runner wired to fakes, plus handles to inspect them.
#[derive(Debug)]
pub struct Harness {
    pub runner: Arc<TaskRunner>,
    pub reasoning: Arc<ScriptedReasoning>,
    pub backend: Arc<ScriptedBackend>,
    pub publisher: Arc<RecordingPublisher>,
    pub sink: Arc<RecordingSink>,
    pub plans: Arc<MemoryPlanStore>,
    pub pool: Arc<SandboxPool>,
}

impl Harness {
    /// Must be called inside a tokio runtime.
    pub fn new(
        config: MinionConfig,
        reasoning: Arc<ScriptedReasoning>,
        backend: Arc<ScriptedBackend>,
        publisher: Arc<RecordingPublisher>,
    ) -> anyhow::Result<Self> {
        let pool = SandboxPool::start(
            Arc::clone(&backend) as Arc<dyn SandboxBackend>,
            PoolSettings::from(&config.sandbox),
        )?;
        let sink = RecordingSink::new();
        let plans = Arc::new(MemoryPlanStore::new());
        let runner = TaskRunner::new(
            config,
            Arc::clone(&reasoning) as Arc<dyn ReasoningClient>,
            Arc::clone(&pool),
            Arc::clone(&publisher) as Arc<dyn ProposalPublisher>,
            Arc::clone(&sink) as Arc<dyn EscalationSink>,
            Arc::clone(&plans) as Arc<dyn minion_core::plan::PlanStore>,
        )?;
        Ok(Self {
            runner: Arc::new(runner),
            reasoning,
            backend,
            publisher,
            sink,
            plans,
            pool,
        })
    }
}
