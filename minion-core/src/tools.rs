//! Tool registry handed to the reasoning component.
//!
//! Every tool carries a JSON schema for its arguments. A task never sees the
//! whole registry: [`ToolRegistry::curate`] returns a [`ToolView`] with the
//! filesystem and memory tools plus the tools of the task's domain, and
//! [`ToolView::execute`] refuses anything outside that view.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::debug;

use minion_graphs::FileId;

use crate::config::GatesSection;
use crate::error::ToolError;
use crate::plan::PlanStore;
use crate::publish::render_diff;
use crate::sandbox::{CommandRunner, ExecOutput, shell_quote};
use crate::types::{FileEdit, Patch, TaskId, ToolDomain, tail_chars};

/// Output characters returned from command tools.
const COMMAND_OUTPUT_LIMIT: usize = 4000;
const SEARCH_MATCH_LIMIT: usize = 50;
const COMMAND_TIMEOUT: Duration = Duration::from_secs(300);

// ── Tool parameter types ──────────────────────────────────────────

#[derive(Debug, Deserialize, JsonSchema)]
pub struct PathParams {
    #[schemars(description = "File path relative to the repository root")]
    pub path: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct WriteFileParams {
    #[schemars(description = "File path relative to the repository root")]
    pub path: String,
    #[schemars(description = "Complete new file content")]
    pub content: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ListDirectoryParams {
    #[schemars(description = "Directory relative to the repository root (default: root)")]
    pub path: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct SearchParams {
    #[schemars(description = "Literal text to search for")]
    pub pattern: String,
    #[schemars(description = "Only search files with this extension, e.g. \".py\" (default: .py)")]
    pub file_extension: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct TypeCheckParams {
    #[schemars(description = "Module or file path to type-check")]
    pub module_path: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct RunTestsParams {
    #[schemars(description = "Test file or test id to run")]
    pub test_path: String,
    #[schemars(description = "Verbose output (default: true)")]
    pub verbose: Option<bool>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct CoverageParams {
    #[schemars(description = "Module to measure coverage for")]
    pub module: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct UpdatePlanParams {
    #[schemars(description = "Full markdown content of the new plan")]
    pub content: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct NoParams {}

// ── Registry ──────────────────────────────────────────────────────

/// What a tool does when executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolHandler {
    ReadFile,
    WriteFile,
    ListDirectory,
    SearchCodebase,
    RunLinter,
    RunTypeCheck,
    RunTests,
    RunCoverage,
    GitDiff,
    ReadPlan,
    UpdatePlan,
}

impl ToolHandler {
    /// Handlers that shell out through a [`CommandRunner`].
    pub fn runs_command(self) -> bool {
        matches!(
            self,
            Self::RunLinter | Self::RunTypeCheck | Self::RunTests | Self::RunCoverage
        )
    }
}

#[derive(Debug, Clone)]
pub struct ToolSpec {
    pub name: &'static str,
    pub description: &'static str,
    pub domain: ToolDomain,
    pub handler: ToolHandler,
    pub schema: Value,
}

impl ToolSpec {
    fn new<P: JsonSchema>(
        name: &'static str,
        description: &'static str,
        domain: ToolDomain,
        handler: ToolHandler,
    ) -> Self {
        let mut schema = serde_json::to_value(schemars::schema_for!(P)).unwrap_or_default();
        if let Some(obj) = schema.as_object_mut() {
            obj.remove("$schema");
            obj.remove("title");
        }
        Self {
            name,
            description,
            domain,
            handler,
            schema,
        }
    }

    pub fn capability(&self) -> ToolCapability {
        ToolCapability {
            name: self.name.to_string(),
            description: self.description.to_string(),
            input_schema: self.schema.clone(),
        }
    }
}

/// Function-calling description of one tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCapability {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

#[derive(Debug, Clone)]
pub struct ToolRegistry {
    tools: BTreeMap<&'static str, ToolSpec>,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRegistry {
    /// Registry with every built-in tool.
    pub fn new() -> Self {
        use ToolDomain::{Filesystem, Git, Linting, Memory, Search, Testing};
        use ToolHandler as H;

        let mut registry = Self {
            tools: BTreeMap::new(),
        };
        for spec in [
            ToolSpec::new::<PathParams>(
                "read_file",
                "Read a file from the repository, including edits staged in this attempt.",
                Filesystem,
                H::ReadFile,
            ),
            ToolSpec::new::<WriteFileParams>(
                "write_file",
                "Stage the complete new content of a file as part of the proposed patch.",
                Filesystem,
                H::WriteFile,
            ),
            ToolSpec::new::<ListDirectoryParams>(
                "list_directory",
                "List files and directories at a path.",
                Filesystem,
                H::ListDirectory,
            ),
            ToolSpec::new::<PathParams>(
                "run_python_linter",
                "Run the configured linter on a file and return violations.",
                Linting,
                H::RunLinter,
            ),
            ToolSpec::new::<TypeCheckParams>(
                "run_type_check",
                "Run mypy on a module.",
                Linting,
                H::RunTypeCheck,
            ),
            ToolSpec::new::<RunTestsParams>(
                "run_tests",
                "Run pytest for a test file or test id and return the results.",
                Testing,
                H::RunTests,
            ),
            ToolSpec::new::<CoverageParams>(
                "run_coverage",
                "Run pytest with a coverage report for a module.",
                Testing,
                H::RunCoverage,
            ),
            ToolSpec::new::<NoParams>(
                "git_diff",
                "Unified diff of the edits staged so far against the snapshot.",
                Git,
                H::GitDiff,
            ),
            ToolSpec::new::<SearchParams>(
                "search_codebase",
                "Search for literal text across repository files.",
                Search,
                H::SearchCodebase,
            ),
            ToolSpec::new::<NoParams>(
                "read_plan",
                "Read plan.md to see the task's progress and next steps.",
                Memory,
                H::ReadPlan,
            ),
            ToolSpec::new::<UpdatePlanParams>(
                "update_plan",
                "Overwrite plan.md with the updated approach and progress.",
                Memory,
                H::UpdatePlan,
            ),
        ] {
            registry.register(spec);
        }
        registry
    }

    /// Add or replace a tool.
    pub fn register(&mut self, spec: ToolSpec) {
        self.tools.insert(spec.name, spec);
    }

    pub fn get(&self, name: &str) -> Option<&ToolSpec> {
        self.tools.get(name)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Tools for `domain` plus the filesystem and memory tools.
    pub fn curate(&self, domain: ToolDomain) -> ToolView {
        let tools: Vec<ToolSpec> = self
            .tools
            .values()
            .filter(|t| t.domain == domain || t.domain.is_core())
            .cloned()
            .collect();
        debug!(
            %domain,
            tools = ?tools.iter().map(|t| t.name).collect::<Vec<_>>(),
            "Curated tool view"
        );
        ToolView { domain, tools }
    }
}

// ── Execution ─────────────────────────────────────────────────────

/// Everything a tool may touch while a proposal is being prepared.
pub struct ToolContext {
    pub root: PathBuf,
    pub task_id: TaskId,
    pub plans: Arc<dyn PlanStore>,
    pub gates: GatesSection,
    /// Command tools need somewhere to run; without one they are refused.
    pub runner: Option<Arc<dyn CommandRunner>>,
    staged: Mutex<Patch>,
}

impl std::fmt::Debug for ToolContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolContext")
            .field("root", &self.root)
            .field("task_id", &self.task_id)
            .field("has_runner", &self.runner.is_some())
            .finish_non_exhaustive()
    }
}

impl ToolContext {
    pub fn new(
        root: impl Into<PathBuf>,
        task_id: TaskId,
        plans: Arc<dyn PlanStore>,
        gates: GatesSection,
    ) -> Self {
        Self {
            root: root.into(),
            task_id,
            plans,
            gates,
            runner: None,
            staged: Mutex::new(Patch::default()),
        }
    }

    #[must_use]
    pub fn with_runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.runner = Some(runner);
        self
    }

    /// Edits made through `write_file` so far.
    pub fn staged_patch(&self) -> Patch {
        self.staged
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn stage(&self, edit: FileEdit) {
        self.staged
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(edit);
    }

    fn staged_content(&self, file: &FileId) -> Option<String> {
        self.staged
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .edits()
            .iter()
            .find(|e| &e.path == file)
            .map(|e| e.content.clone())
    }

    fn runner(&self, tool: &str) -> Result<&Arc<dyn CommandRunner>, ToolError> {
        self.runner
            .as_ref()
            .ok_or_else(|| ToolError::NotAvailable(format!("{tool} needs a sandbox")))
    }
}

/// The subset of the registry one task may use.
#[derive(Debug, Clone)]
pub struct ToolView {
    domain: ToolDomain,
    tools: Vec<ToolSpec>,
}

impl ToolView {
    pub fn domain(&self) -> ToolDomain {
        self.domain
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.tools.iter().map(|t| t.name).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.iter().any(|t| t.name == name)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn capabilities(&self) -> Vec<ToolCapability> {
        self.tools.iter().map(ToolSpec::capability).collect()
    }

    /// Drop the command tools when `ctx` has nowhere to run them.
    #[must_use]
    pub fn usable_with(mut self, ctx: &ToolContext) -> Self {
        if ctx.runner.is_none() {
            self.tools.retain(|t| !t.handler.runs_command());
        }
        self
    }

    /// Run `name` with JSON `args`. Tools outside the view are refused.
    pub async fn execute(
        &self,
        name: &str,
        args: Value,
        ctx: &ToolContext,
    ) -> Result<Value, ToolError> {
        let spec = self
            .tools
            .iter()
            .find(|t| t.name == name)
            .ok_or_else(|| ToolError::NotAvailable(name.to_string()))?;
        debug!(tool = name, "Executing tool");

        match spec.handler {
            ToolHandler::ReadFile => {
                let p: PathParams = parse_args(name, args)?;
                let file = checked_file(&p.path)?;
                let content = match ctx.staged_content(&file) {
                    Some(content) => content,
                    None => tokio::fs::read_to_string(file.to_path(&ctx.root))
                        .await
                        .map_err(|e| ToolError::Failed(format!("cannot read {file}: {e}")))?,
                };
                Ok(json!({ "path": file.as_str(), "content": content }))
            }
            ToolHandler::WriteFile => {
                let p: WriteFileParams = parse_args(name, args)?;
                let file = checked_file(&p.path)?;
                let bytes = p.content.len();
                ctx.stage(FileEdit {
                    path: file.clone(),
                    content: p.content,
                });
                Ok(json!({ "path": file.as_str(), "staged": true, "bytes": bytes }))
            }
            ToolHandler::ListDirectory => {
                let p: ListDirectoryParams = parse_args(name, args)?;
                let dir = match p.path.as_deref().filter(|s| !s.is_empty() && *s != ".") {
                    Some(rel) => checked_file(rel)?.to_path(&ctx.root),
                    None => ctx.root.clone(),
                };
                Ok(json!({ "entries": list_directory(&dir)? }))
            }
            ToolHandler::SearchCodebase => {
                let p: SearchParams = parse_args(name, args)?;
                let ext = p.file_extension.unwrap_or_else(|| ".py".to_string());
                let matches = search(&ctx.root, &p.pattern, ext.trim_start_matches('.'));
                Ok(json!({ "matches": matches }))
            }
            ToolHandler::RunLinter => {
                let p: PathParams = parse_args(name, args)?;
                let file = checked_file(&p.path)?;
                let template = &ctx.gates.lint_command;
                let command = if template.contains("{files}") {
                    template.replace("{files}", &shell_quote(file.as_str()))
                } else {
                    format!("{template} {}", shell_quote(file.as_str()))
                };
                run_command(ctx, name, &command).await
            }
            ToolHandler::RunTypeCheck => {
                let p: TypeCheckParams = parse_args(name, args)?;
                let command = format!("mypy {}", shell_quote(&p.module_path));
                run_command(ctx, name, &command).await
            }
            ToolHandler::RunTests => {
                let p: RunTestsParams = parse_args(name, args)?;
                let verbose = if p.verbose.unwrap_or(true) { " -v" } else { "" };
                let command = format!(
                    "python -m pytest {} --tb=short{verbose}",
                    shell_quote(&p.test_path)
                );
                run_command(ctx, name, &command).await
            }
            ToolHandler::RunCoverage => {
                let p: CoverageParams = parse_args(name, args)?;
                let command = format!(
                    "python -m pytest --cov={} --cov-report=term-missing -q",
                    shell_quote(&p.module)
                );
                run_command(ctx, name, &command).await
            }
            ToolHandler::GitDiff => {
                let _: NoParams = parse_args(name, args)?;
                let diff = render_diff(&ctx.root, &ctx.staged_patch());
                Ok(json!({ "diff": diff }))
            }
            ToolHandler::ReadPlan => {
                let _: NoParams = parse_args(name, args)?;
                let plan = ctx
                    .plans
                    .load_plan(&ctx.task_id)
                    .map_err(|e| ToolError::Failed(e.to_string()))?;
                Ok(json!({ "plan": plan.unwrap_or_default() }))
            }
            ToolHandler::UpdatePlan => {
                let p: UpdatePlanParams = parse_args(name, args)?;
                ctx.plans
                    .save_plan(&ctx.task_id, &p.content)
                    .map_err(|e| ToolError::Failed(e.to_string()))?;
                Ok(json!({ "updated": true }))
            }
        }
    }
}

fn parse_args<T: DeserializeOwned>(tool: &str, args: Value) -> Result<T, ToolError> {
    // A missing argument object is the same as an empty one.
    let args = if args.is_null() { json!({}) } else { args };
    serde_json::from_value(args).map_err(|e| ToolError::InvalidArguments {
        tool: tool.to_string(),
        message: e.to_string(),
    })
}

/// Repository-relative path with no parent or root components.
pub(crate) fn checked_file(path: &str) -> Result<FileId, ToolError> {
    let file = FileId::new(path);
    let escapes = file.as_str().is_empty()
        || Path::new(file.as_str())
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
    if escapes {
        return Err(ToolError::PathEscape(path.to_string()));
    }
    Ok(file)
}

fn list_directory(dir: &Path) -> Result<Vec<String>, ToolError> {
    let mut entries = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name == ".git" {
            continue;
        }
        if entry.file_type()?.is_dir() {
            entries.push(format!("{name}/"));
        } else {
            entries.push(name);
        }
    }
    entries.sort();
    Ok(entries)
}

#[derive(Debug, Serialize)]
struct SearchMatch {
    path: String,
    line: usize,
    text: String,
}

fn search(root: &Path, pattern: &str, ext: &str) -> Vec<SearchMatch> {
    let glob_pattern = format!("{}/**/*.{ext}", glob::Pattern::escape(&root.to_string_lossy()));
    let Ok(paths) = glob::glob(&glob_pattern) else {
        return Vec::new();
    };
    let mut matches = Vec::new();
    for path in paths.flatten() {
        let Some(file) = FileId::from_path(root, &path) else {
            continue;
        };
        if file.as_str().starts_with(".git/") {
            continue;
        }
        let Ok(text) = std::fs::read_to_string(&path) else {
            continue;
        };
        for (idx, line) in text.lines().enumerate() {
            if line.contains(pattern) {
                matches.push(SearchMatch {
                    path: file.as_str().to_string(),
                    line: idx + 1,
                    text: line.trim().to_string(),
                });
                if matches.len() >= SEARCH_MATCH_LIMIT {
                    return matches;
                }
            }
        }
    }
    matches
}

async fn run_command(ctx: &ToolContext, tool: &str, command: &str) -> Result<Value, ToolError> {
    let runner = ctx.runner(tool)?;
    let out: ExecOutput = runner
        .run(command, COMMAND_TIMEOUT)
        .await
        .map_err(|e| ToolError::Failed(e.to_string()))?;
    Ok(json!({
        "command": command,
        "exit_code": out.exit_code,
        "timed_out": out.timed_out,
        "stdout": tail_chars(&out.stdout, COMMAND_OUTPUT_LIMIT),
        "stderr": tail_chars(&out.stderr, COMMAND_OUTPUT_LIMIT / 4),
    }))
}
