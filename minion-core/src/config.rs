use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use minion_graphs::{BuildOptions, TestSelection};

use crate::error::ConfigError;

/// Retry caps above this need `allow_retry_override`.
pub const DEFAULT_MAX_RETRIES: u32 = 2;

/// Location of the per-repository config file, relative to the snapshot root.
pub const CONFIG_PATH: &str = ".minion/config.toml";

/// Top-level Minion configuration, matching `.minion/config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MinionConfig {
    #[serde(default)]
    pub reasoning: ReasoningSection,
    #[serde(default)]
    pub orchestrator: OrchestratorSection,
    #[serde(default)]
    pub sandbox: SandboxSection,
    #[serde(default)]
    pub gates: GatesSection,
    #[serde(default)]
    pub graph: GraphSection,
    #[serde(default)]
    pub publisher: PublisherSection,
    #[serde(default)]
    pub escalation: EscalationSection,
}

// ── Reasoning ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ReasoningBackend {
    /// Anthropic if a key is present, then OpenAI, then simulation.
    #[default]
    Auto,
    Anthropic,
    OpenAi,
    Simulated,
}

impl FromStr for ReasoningBackend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "anthropic" | "claude" => Ok(Self::Anthropic),
            "openai" => Ok(Self::OpenAi),
            "simulated" | "simulation" => Ok(Self::Simulated),
            other => Err(ConfigError::Invalid(format!(
                "unknown reasoning backend: {other}. Use: auto, anthropic, openai, simulated"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReasoningSection {
    pub backend: ReasoningBackend,
    pub anthropic_model: String,
    pub openai_model: String,
    /// Overrides the provider's API endpoint (proxies, local gateways).
    pub base_url: Option<String>,
    pub max_tokens: u32,
    pub temperature: f64,
    pub timeout_secs: u64,
}

impl Default for ReasoningSection {
    fn default() -> Self {
        Self {
            backend: ReasoningBackend::Auto,
            anthropic_model: "claude-3-5-sonnet-20241022".to_string(),
            openai_model: "gpt-4o".to_string(),
            base_url: None,
            max_tokens: 4096,
            temperature: 0.2,
            timeout_secs: 180,
        }
    }
}

impl ReasoningSection {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

// ── Orchestrator ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorSection {
    /// Retries after the first attempt; a task runs at most `max_retries + 1`
    /// attempts.
    pub max_retries: u32,
    pub allow_retry_override: bool,
    /// Plan memory and attempt history, relative to the snapshot root unless
    /// absolute.
    pub state_dir: PathBuf,
    /// Tasks run concurrently by a batch.
    pub max_concurrent_tasks: usize,
    /// Diagnostic characters fed back into the next attempt.
    pub diagnostic_limit: usize,
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            allow_retry_override: false,
            state_dir: PathBuf::from(".minion/state"),
            max_concurrent_tasks: 2,
            diagnostic_limit: 2000,
        }
    }
}

// ── Sandbox ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SandboxBackendKind {
    #[default]
    Docker,
    /// Temporary-directory overlays on the host. No network isolation.
    Local,
}

impl FromStr for SandboxBackendKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "docker" => Ok(Self::Docker),
            "local" => Ok(Self::Local),
            other => Err(ConfigError::Invalid(format!(
                "unknown sandbox backend: {other}. Use: docker, local"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxSection {
    pub backend: SandboxBackendKind,
    pub image: String,
    /// Ready instances the refiller aims for.
    pub pool_target: usize,
    /// Hard ceiling on live instances: ready, provisioning and leased.
    pub pool_max: usize,
    pub memory: String,
    pub cpus: f64,
    pub pids_limit: u32,
    /// Writable overlay inside the instance.
    pub workdir: String,
    /// Run once per instance after creation, e.g. to install tooling.
    pub setup_command: Option<String>,
    pub acquire_timeout_secs: u64,
    pub provision_retries: u32,
    pub provision_backoff_ms: u64,
}

impl Default for SandboxSection {
    fn default() -> Self {
        Self {
            backend: SandboxBackendKind::Docker,
            image: "python:3.11-slim".to_string(),
            pool_target: 3,
            pool_max: 6,
            memory: "512m".to_string(),
            cpus: 0.5,
            pids_limit: 256,
            workdir: "/workspace".to_string(),
            setup_command: None,
            acquire_timeout_secs: 60,
            provision_retries: 3,
            provision_backoff_ms: 500,
        }
    }
}

impl SandboxSection {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }

    pub fn provision_backoff(&self) -> Duration {
        Duration::from_millis(self.provision_backoff_ms)
    }
}

// ── Gates ──────────────────────────────────────────────────────────

/// Commands run inside the sandbox. `{files}` expands to the changed files
/// and `{tests}` to the selected test files, space separated and quoted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatesSection {
    pub lint_command: String,
    /// Changed files with other extensions are not linted.
    pub lint_extensions: Vec<String>,
    pub lint_timeout_secs: u64,
    pub test_command: String,
    pub full_suite_command: String,
    pub test_timeout_secs: u64,
    /// Exit codes counted as a passing test run. pytest exits 5 when it
    /// collected nothing.
    pub test_pass_exit_codes: Vec<i32>,
}

impl Default for GatesSection {
    fn default() -> Self {
        Self {
            lint_command: "ruff check --output-format=concise {files}".to_string(),
            lint_extensions: vec!["py".to_string(), "pyi".to_string()],
            lint_timeout_secs: 60,
            test_command: "python -m pytest -q --tb=short --no-header {tests}".to_string(),
            full_suite_command: "python -m pytest -q --tb=short --no-header".to_string(),
            test_timeout_secs: 300,
            test_pass_exit_codes: vec![0, 5],
        }
    }
}

impl GatesSection {
    pub fn lint_timeout(&self) -> Duration {
        Duration::from_secs(self.lint_timeout_secs)
    }

    pub fn test_timeout(&self) -> Duration {
        Duration::from_secs(self.test_timeout_secs)
    }
}

// ── Graph / context ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphSection {
    #[serde(flatten)]
    pub files: BuildOptions,
    /// Forward hops pulled into a bundle; unset means bounded by the budget.
    pub context_depth: Option<usize>,
    /// Approximate tokens per bundle (4 characters per token).
    pub token_budget: usize,
    pub test_hop_limit: usize,
    pub max_affected_tests: usize,
    /// Files seeded from the description when a task names none.
    pub max_seed_files: usize,
    /// Paths listed in the bundle's repository outline.
    pub outline_limit: usize,
}

impl Default for GraphSection {
    fn default() -> Self {
        let selection = TestSelection::default();
        Self {
            files: BuildOptions::default(),
            context_depth: None,
            token_budget: 24_000,
            test_hop_limit: selection.hop_limit,
            max_affected_tests: selection.max_tests,
            max_seed_files: 5,
            outline_limit: 50,
        }
    }
}

impl GraphSection {
    pub fn test_selection(&self) -> TestSelection {
        TestSelection {
            hop_limit: self.test_hop_limit,
            max_tests: self.max_affected_tests,
        }
    }
}

// ── Publisher / escalation ─────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum PublisherKind {
    /// Write the proposal and diff under `output_dir`.
    #[default]
    #[serde(rename = "dry-run")]
    DryRun,
    #[serde(rename = "github")]
    GitHub,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PublisherSection {
    pub kind: PublisherKind,
    pub output_dir: PathBuf,
    pub base_branch: String,
    pub branch_prefix: String,
    /// `owner/repo`; detected from the push remote when unset.
    pub github_repo: Option<String>,
    pub api_base: String,
    pub labels: Vec<String>,
}

impl Default for PublisherSection {
    fn default() -> Self {
        Self {
            kind: PublisherKind::DryRun,
            output_dir: PathBuf::from(".minion/proposals"),
            base_branch: "main".to_string(),
            branch_prefix: "minion".to_string(),
            github_repo: None,
            api_base: "https://api.github.com".to_string(),
            labels: vec!["minion-generated".to_string()],
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EscalationSection {
    /// JSON webhook notified on escalation in addition to the log sink.
    pub webhook_url: Option<String>,
}

// ── Loading ────────────────────────────────────────────────────────

impl MinionConfig {
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|_| ConfigError::NotFound(path.display().to_string()))?;
        Self::from_toml(&text)
    }

    /// Load `explicit` if given (it must exist), else `.minion/config.toml`
    /// under `repo_root` if present, else defaults.
    pub fn discover(repo_root: &Path, explicit: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        let default_path = repo_root.join(CONFIG_PATH);
        if default_path.is_file() {
            Self::load(&default_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Apply environment overrides. `lookup` is `std::env::var(..).ok()` in
    /// production and a map in tests.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |names: &[&str]| names.iter().find_map(|n| lookup(n).filter(|v| !v.is_empty()));

        if let Some(v) = get(&["MINION_REASONING_BACKEND", "LLM_BACKEND"]) {
            self.reasoning.backend = v.parse()?;
        }
        if let Some(v) = get(&["MINION_ANTHROPIC_MODEL", "CLAUDE_MODEL"]) {
            self.reasoning.anthropic_model = v;
        }
        if let Some(v) = get(&["MINION_OPENAI_MODEL", "OPENAI_MODEL"]) {
            self.reasoning.openai_model = v;
        }
        if let Some(v) = get(&["MINION_LLM_BASE_URL"]) {
            self.reasoning.base_url = Some(v);
        }
        if let Some(v) = get(&["MINION_MAX_TOKENS", "LLM_MAX_TOKENS"]) {
            self.reasoning.max_tokens = parse_num("LLM_MAX_TOKENS", &v)?;
        }
        if let Some(v) = get(&["MINION_MAX_RETRIES", "MAX_RETRIES"]) {
            self.orchestrator.max_retries = parse_num("MAX_RETRIES", &v)?;
        }
        if let Some(v) = get(&["MINION_ALLOW_RETRY_OVERRIDE"]) {
            self.orchestrator.allow_retry_override = parse_bool(&v);
        }
        if let Some(v) = get(&["MINION_STATE_DIR"]) {
            self.orchestrator.state_dir = PathBuf::from(v);
        }
        if let Some(v) = get(&["MINION_SANDBOX_BACKEND"]) {
            self.sandbox.backend = v.parse()?;
        }
        if let Some(v) = get(&["MINION_POOL_SIZE", "SANDBOX_POOL_SIZE"]) {
            self.sandbox.pool_target = parse_num("SANDBOX_POOL_SIZE", &v)?;
            self.sandbox.pool_max = self.sandbox.pool_max.max(self.sandbox.pool_target);
        }
        if let Some(v) = get(&["MINION_SANDBOX_IMAGE", "SANDBOX_BASE_IMAGE"]) {
            self.sandbox.image = v;
        }
        if let Some(v) = get(&["MINION_SANDBOX_MEMORY", "SANDBOX_MEMORY"]) {
            self.sandbox.memory = v;
        }
        if let Some(v) = get(&["MINION_TEST_TIMEOUT", "SANDBOX_TIMEOUT"]) {
            self.gates.test_timeout_secs = parse_num("SANDBOX_TIMEOUT", &v)?;
        }
        if let Some(v) = get(&["MINION_PUBLISH", "ENABLE_PR"]) {
            self.publisher.kind = if parse_bool(&v) {
                PublisherKind::GitHub
            } else {
                PublisherKind::DryRun
            };
        }
        if let Some(v) = get(&["MINION_BASE_BRANCH", "DEFAULT_BASE_BRANCH"]) {
            self.publisher.base_branch = v;
        }
        if let Some(v) = get(&["MINION_GITHUB_REPO", "GITHUB_REPO"]) {
            self.publisher.github_repo = Some(v);
        }
        if let Some(v) = get(&["MINION_ESCALATION_WEBHOOK"]) {
            self.escalation.webhook_url = Some(v);
        }
        Ok(())
    }

    /// Reject configurations the orchestrator must not start with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let o = &self.orchestrator;
        if o.max_retries > DEFAULT_MAX_RETRIES && !o.allow_retry_override {
            return Err(ConfigError::Invalid(format!(
                "max_retries = {} exceeds {DEFAULT_MAX_RETRIES}; set allow_retry_override to raise it",
                o.max_retries
            )));
        }
        if o.max_concurrent_tasks == 0 {
            return Err(ConfigError::Invalid(
                "max_concurrent_tasks must be at least 1".to_string(),
            ));
        }

        let s = &self.sandbox;
        if s.pool_target == 0 {
            return Err(ConfigError::Invalid(
                "sandbox pool_target must be at least 1".to_string(),
            ));
        }
        if s.pool_target > s.pool_max {
            return Err(ConfigError::Invalid(format!(
                "sandbox pool_target ({}) exceeds pool_max ({})",
                s.pool_target, s.pool_max
            )));
        }
        if s.cpus <= 0.0 {
            return Err(ConfigError::Invalid("sandbox cpus must be positive".to_string()));
        }

        for (name, secs) in [
            ("reasoning.timeout_secs", self.reasoning.timeout_secs),
            ("sandbox.acquire_timeout_secs", s.acquire_timeout_secs),
            ("gates.lint_timeout_secs", self.gates.lint_timeout_secs),
            ("gates.test_timeout_secs", self.gates.test_timeout_secs),
        ] {
            if secs == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be positive")));
            }
        }

        if self.graph.token_budget == 0 {
            return Err(ConfigError::Invalid("graph.token_budget must be positive".to_string()));
        }
        if self.publisher.base_branch.trim().is_empty() {
            return Err(ConfigError::Invalid("publisher.base_branch is empty".to_string()));
        }
        Ok(())
    }

    /// Upper bound on attempts per task.
    pub fn attempt_limit(&self) -> u32 {
        self.orchestrator.max_retries.saturating_add(1)
    }

    /// State directory resolved against the snapshot root.
    pub fn state_dir(&self, repo_root: &Path) -> PathBuf {
        resolve(repo_root, &self.orchestrator.state_dir)
    }

    pub fn proposal_dir(&self, repo_root: &Path) -> PathBuf {
        resolve(repo_root, &self.publisher.output_dir)
    }
}

fn resolve(root: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    }
}

fn parse_num<T: FromStr>(name: &str, value: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::Invalid(format!("{name} is not a number: {value}")))
}

fn parse_bool(value: &str) -> bool {
    matches!(value.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on")
}
