use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use minion_graphs::FileId;

use crate::error::{MinionError, Result};

// ── Task identity ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    /// A fresh `minion-<8 hex>` identifier.
    pub fn generate() -> Self {
        let uuid = uuid::Uuid::new_v4().simple().to_string();
        Self(format!("minion-{}", &uuid[..8]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Task ids become directory names; anything else is refused.
    pub fn is_path_safe(&self) -> bool {
        !self.0.is_empty()
            && self
                .0
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

impl Priority {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
        }
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "normal" => Ok(Self::Normal),
            "high" => Ok(Self::High),
            other => Err(format!("unknown priority: {other}. Use: low, normal, high")),
        }
    }
}

/// Tool families. A task names one; its curated view adds the always-on
/// filesystem and memory families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ToolDomain {
    Filesystem,
    Linting,
    #[default]
    Testing,
    Git,
    Search,
    Memory,
}

impl ToolDomain {
    pub const ALL: [Self; 6] = [
        Self::Filesystem,
        Self::Linting,
        Self::Testing,
        Self::Git,
        Self::Search,
        Self::Memory,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Filesystem => "filesystem",
            Self::Linting => "linting",
            Self::Testing => "testing",
            Self::Git => "git",
            Self::Search => "search",
            Self::Memory => "memory",
        }
    }

    /// Families every curated view includes.
    pub fn is_core(self) -> bool {
        matches!(self, Self::Filesystem | Self::Memory)
    }
}

impl std::fmt::Display for ToolDomain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ToolDomain {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|d| d.as_str() == s.to_lowercase())
            .ok_or_else(|| {
                format!(
                    "unknown tool domain: {s}. Use: filesystem, linting, testing, git, search, memory"
                )
            })
    }
}

// ── Snapshot ───────────────────────────────────────────────────────

/// Read-only view of the repository a task works against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoSnapshot {
    pub root: PathBuf,
    /// HEAD commit id, or `"working tree"` outside git.
    pub revision: String,
}

impl RepoSnapshot {
    pub const WORKING_TREE: &'static str = "working tree";

    pub fn open(root: &Path) -> Result<Self> {
        if !root.is_dir() {
            return Err(MinionError::Repository(format!(
                "{} is not a directory",
                root.display()
            )));
        }
        let root = root.canonicalize()?;
        let revision = gix::open(&root)
            .ok()
            .and_then(|repo| repo.head_id().ok().map(|id| id.to_string()))
            .unwrap_or_else(|| Self::WORKING_TREE.to_string());
        Ok(Self { root, revision })
    }

    pub fn path_of(&self, file: &FileId) -> PathBuf {
        file.to_path(&self.root)
    }
}

// ── Task ───────────────────────────────────────────────────────────

/// A unit of requested change. Immutable once built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub description: String,
    pub snapshot: RepoSnapshot,
    pub file_hints: Vec<FileId>,
    pub domain: ToolDomain,
    pub priority: Priority,
    /// GitHub logins requested as reviewers of the proposal.
    pub reviewers: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl Task {
    pub fn new(description: impl Into<String>, snapshot: RepoSnapshot) -> Self {
        Self {
            id: TaskId::generate(),
            description: description.into(),
            snapshot,
            file_hints: Vec::new(),
            domain: ToolDomain::default(),
            priority: Priority::default(),
            reviewers: Vec::new(),
            created_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn with_id(mut self, id: TaskId) -> Self {
        self.id = id;
        self
    }

    #[must_use]
    pub fn with_files<I, F>(mut self, files: I) -> Self
    where
        I: IntoIterator<Item = F>,
        F: Into<FileId>,
    {
        for file in files {
            let file = file.into();
            if !self.file_hints.contains(&file) {
                self.file_hints.push(file);
            }
        }
        self
    }

    #[must_use]
    pub fn with_domain(mut self, domain: ToolDomain) -> Self {
        self.domain = domain;
        self
    }

    #[must_use]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn with_reviewers(mut self, reviewers: Vec<String>) -> Self {
        self.reviewers = reviewers;
        self
    }

    /// The first line of the description, cut to `max` characters.
    pub fn headline(&self, max: usize) -> String {
        let line = self.description.lines().next().unwrap_or_default().trim();
        truncate_chars(line, max).to_string()
    }
}

// ── Patch ──────────────────────────────────────────────────────────

/// Full replacement content for one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEdit {
    pub path: FileId,
    pub content: String,
}

/// A set of whole-file edits. At most one edit per path; later edits to the
/// same path replace earlier ones.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Patch {
    edits: Vec<FileEdit>,
}

impl Patch {
    pub fn new(edits: impl IntoIterator<Item = FileEdit>) -> Self {
        let mut patch = Self::default();
        for edit in edits {
            patch.push(edit);
        }
        patch
    }

    pub fn push(&mut self, edit: FileEdit) {
        if let Some(existing) = self.edits.iter_mut().find(|e| e.path == edit.path) {
            existing.content = edit.content;
        } else {
            self.edits.push(edit);
        }
    }

    pub fn edits(&self) -> &[FileEdit] {
        &self.edits
    }

    pub fn is_empty(&self) -> bool {
        self.edits.is_empty()
    }

    pub fn len(&self) -> usize {
        self.edits.len()
    }

    pub fn changed_files(&self) -> BTreeSet<FileId> {
        self.edits.iter().map(|e| e.path.clone()).collect()
    }
}

// ── Gates ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GateKind {
    Lint,
    Test,
}

impl std::fmt::Display for GateKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Lint => "lint",
            Self::Test => "test",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateOutcome {
    Passed,
    Failed,
    TimedOut,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateResult {
    pub kind: GateKind,
    pub outcome: GateOutcome,
    /// Trimmed output, fed back to the next attempt on failure.
    pub diagnostic: String,
    pub command: String,
    pub exit_code: Option<i32>,
    pub elapsed_ms: u64,
}

impl GateResult {
    pub fn passed(&self) -> bool {
        self.outcome == GateOutcome::Passed
    }
}

// ── Attempts ───────────────────────────────────────────────────────

/// Why an attempt did not succeed. Every error raised inside an attempt ends
/// up here; none of them abort the task directly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AttemptFailure {
    Reasoning { message: String },
    SandboxUnavailable { message: String },
    /// The instance broke after it was acquired.
    Sandbox { message: String },
    Gate { gate: GateKind, diagnostic: String },
    /// The task was cancelled after reasoning, before a sandbox was taken.
    Cancelled,
}

impl AttemptFailure {
    /// Text injected into the next attempt.
    pub fn diagnostic(&self) -> &str {
        match self {
            Self::Reasoning { message }
            | Self::SandboxUnavailable { message }
            | Self::Sandbox { message } => message,
            Self::Gate { diagnostic, .. } => diagnostic,
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_sandbox_unavailable(&self) -> bool {
        matches!(self, Self::SandboxUnavailable { .. })
    }
}

impl std::fmt::Display for AttemptFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Reasoning { message } => write!(f, "reasoning failed: {message}"),
            Self::SandboxUnavailable { message } => write!(f, "sandbox unavailable: {message}"),
            Self::Sandbox { message } => write!(f, "sandbox failed: {message}"),
            Self::Gate { gate, .. } => write!(f, "{gate} gate failed"),
            Self::Cancelled => f.write_str("cancelled"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// 0-based.
    pub number: u32,
    pub patch: Option<Patch>,
    pub explanation: Option<String>,
    pub gates: Vec<GateResult>,
    pub failure: Option<AttemptFailure>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl AttemptRecord {
    pub fn succeeded(&self) -> bool {
        self.failure.is_none() && self.gates.iter().all(GateResult::passed)
    }
}

// ── Task state ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Init,
    Planning,
    Linting,
    Testing,
    Succeeded,
    Escalated,
    Cancelled,
    /// Every attempt failed to obtain a sandbox.
    Aborted,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Escalated | Self::Cancelled | Self::Aborted
        )
    }

    pub fn can_transition_to(self, next: Self) -> bool {
        use TaskState::{
            Aborted, Cancelled, Escalated, Init, Linting, Planning, Succeeded, Testing,
        };
        match (self, next) {
            (Init, Planning | Cancelled)
            | (Planning, Linting | Planning | Escalated | Aborted | Cancelled)
            | (Linting, Testing | Planning | Escalated | Aborted | Cancelled)
            | (Testing, Succeeded | Planning | Escalated | Aborted | Cancelled) => true,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Planning => "planning",
            Self::Linting => "linting",
            Self::Testing => "testing",
            Self::Succeeded => "succeeded",
            Self::Escalated => "escalated",
            Self::Cancelled => "cancelled",
            Self::Aborted => "aborted",
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal result of a task run. Always carries the full attempt history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub task_id: TaskId,
    pub state: TaskState,
    pub attempts: Vec<AttemptRecord>,
    pub proposal_url: Option<String>,
    /// Set when both gates passed but filing the proposal failed.
    pub publish_error: Option<String>,
    pub last_diagnostic: Option<String>,
    pub duration_ms: u64,
}

impl TaskOutcome {
    pub fn succeeded(&self) -> bool {
        self.state == TaskState::Succeeded
    }
}

// ── Helpers ────────────────────────────────────────────────────────

/// Longest prefix of `s` with at most `max` characters.
pub fn truncate_chars(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Longest suffix of `s` with at most `max` characters.
pub fn tail_chars(s: &str, max: usize) -> &str {
    let count = s.chars().count();
    if count <= max {
        return s;
    }
    match s.char_indices().nth(count - max) {
        Some((idx, _)) => &s[idx..],
        None => "",
    }
}
