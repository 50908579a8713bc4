// LLM-backed reasoning: prompt assembly, a bounded tool-call loop and
// response parsing.

use std::fmt::Write as _;
use std::sync::{Mutex, PoisonError};

use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use minion_graphs::FileId;

use crate::error::ReasoningError;
use crate::llm::{CostTracker, LlmProvider, TokenUsage};
use crate::tools::checked_file;
use crate::types::{FileEdit, truncate_chars};

use super::{Proposal, ReasoningClient, ReasoningRequest};

/// Model turns allowed per attempt, tool calls included.
pub const MAX_TOOL_ROUNDS: usize = 8;
/// Diagnostic characters quoted back to the model.
const FEEDBACK_LIMIT: usize = 2000;
const TOOL_RESULT_LIMIT: usize = 6000;
const FALLBACK_CONFIDENCE: f64 = 0.8;

pub const SYSTEM_PROMPT: &str = "You are Minion, an automated software engineer making targeted, \
minimal code changes to fix bugs or implement features.

Rules:
1. Make the smallest change that solves the task. Do not refactor unrelated code.
2. Update plan.md with your approach (update_plan) before writing code.
3. Read a file before editing it. Never guess at file contents.
4. Write production-quality code that follows the existing style.
5. Explain your change in one or two sentences.
6. If you cannot solve the task, say so explicitly in the explanation.

Your patch is linted and the affected tests are run before a human reviews it.";

const RESPONSE_FORMAT: &str = "\n# Response format
Reply with exactly one JSON object and nothing else.

To call a tool:
{\"tool\": \"<name>\", \"arguments\": { ... }}

To finish:
{\"plan\": \"<full updated plan.md>\", \"explanation\": \"<1-2 sentences>\", \
\"confidence\": 0.0-1.0, \"edits\": [{\"path\": \"<repo-relative path>\", \"content\": \"<complete new file content>\"}]}

Files staged with write_file are part of the patch; `edits` may add more.
";

/// Feedback injected after a failed attempt. `attempt` is the 1-based
/// number of the attempt that failed.
pub fn feedback_message(attempt: u32, diagnostic: &str) -> String {
    format!(
        "ATTEMPT {attempt} FAILED.\n\nError output:\n{}\n\nAnalyze the error above carefully. \
         Do NOT repeat the same approach. Update plan.md with your revised strategy, then fix the issue.",
        truncate_chars(diagnostic, FEEDBACK_LIMIT)
    )
}

/// First user message of an attempt.
pub fn build_prompt(request: &ReasoningRequest<'_>) -> String {
    let task = request.task;
    let mut out = String::new();
    let _ = writeln!(
        out,
        "# Task {}\nDomain: {}\nPriority: {}\n\n{}\n",
        task.id,
        task.domain,
        task.priority.as_str(),
        task.description.trim()
    );
    let _ = writeln!(out, "# plan.md\n{}\n", request.plan.trim());

    if let Some(diagnostic) = request.last_diagnostic {
        let _ = writeln!(out, "{}\n", feedback_message(request.attempt, diagnostic));
    }

    out.push_str("# Tools\n");
    for cap in request.tools.capabilities() {
        let _ = writeln!(
            out,
            "- {}: {}\n  arguments: {}",
            cap.name, cap.description, cap.input_schema
        );
    }

    out.push_str("\n# Context\n");
    if !request.bundle.targets.is_empty() {
        let _ = writeln!(
            out,
            "Target files: {}\n",
            request
                .bundle
                .targets
                .iter()
                .map(FileId::as_str)
                .collect::<Vec<_>>()
                .join(", ")
        );
    }
    out.push_str(&request.bundle.render());
    out.push_str(RESPONSE_FORMAT);
    out
}

// ── Client ──────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct LlmReasoningClient {
    provider: Box<dyn LlmProvider>,
    temperature: f64,
    max_rounds: usize,
    costs: Mutex<CostTracker>,
}

impl LlmReasoningClient {
    pub fn new(provider: Box<dyn LlmProvider>, temperature: f64) -> Self {
        Self {
            provider,
            temperature,
            max_rounds: MAX_TOOL_ROUNDS,
            costs: Mutex::new(CostTracker::default()),
        }
    }

    #[must_use]
    pub fn with_max_rounds(mut self, rounds: usize) -> Self {
        self.max_rounds = rounds.max(1);
        self
    }

    /// Usage accumulated over every call made through this client.
    pub fn costs(&self) -> CostTracker {
        self.costs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn record(&self, usage: &TokenUsage) {
        self.costs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .record(usage, self.provider.pricing());
    }
}

#[async_trait::async_trait]
impl ReasoningClient for LlmReasoningClient {
    fn name(&self) -> &str {
        self.provider.name()
    }

    async fn propose(&self, request: ReasoningRequest<'_>) -> Result<Proposal, ReasoningError> {
        let mut transcript = build_prompt(&request);
        let fallback_path = request.bundle.targets.first();

        for round in 0..self.max_rounds {
            let (reply, usage) = self
                .provider
                .call(SYSTEM_PROMPT, &transcript, self.temperature)
                .await?;
            self.record(&usage);
            debug!(
                round,
                input_tokens = usage.input_tokens,
                output_tokens = usage.output_tokens,
                "Reasoning turn"
            );

            match parse_reply(&reply, fallback_path)? {
                Reply::Tool(call) => {
                    let result = match request
                        .tools
                        .execute(&call.tool, call.arguments, request.tool_context)
                        .await
                    {
                        Ok(value) => value.to_string(),
                        Err(e) => {
                            warn!(tool = %call.tool, error = %e, "Tool call failed");
                            json!({ "error": e.to_string() }).to_string()
                        }
                    };
                    let _ = write!(
                        transcript,
                        "\n\n# Your previous reply\n{}\n\n# Tool result: {}\n{}\n",
                        reply.trim(),
                        call.tool,
                        truncate_chars(&result, TOOL_RESULT_LIMIT)
                    );
                }
                Reply::Final(answer) => {
                    let mut patch = request.tool_context.staged_patch();
                    for edit in answer.edits {
                        let path = checked_file(edit.path.as_str())
                            .map_err(|e| ReasoningError::Malformed(e.to_string()))?;
                        patch.push(FileEdit {
                            path,
                            content: edit.content,
                        });
                    }

                    let updated_plan = match answer.plan.filter(|p| !p.trim().is_empty()) {
                        Some(plan) => plan,
                        None => request
                            .tool_context
                            .plans
                            .load_plan(&request.task.id)
                            .ok()
                            .flatten()
                            .unwrap_or_else(|| request.plan.to_string()),
                    };

                    info!(
                        files = patch.len(),
                        rounds = round + 1,
                        provider = self.provider.name(),
                        "Proposal received"
                    );
                    return Proposal {
                        patch,
                        updated_plan,
                        explanation: answer.explanation.unwrap_or_default(),
                        confidence: answer.confidence.map(|c| c.clamp(0.0, 1.0)),
                    }
                    .validate();
                }
            }
        }

        Err(ReasoningError::Malformed(format!(
            "no final answer after {} rounds",
            self.max_rounds
        )))
    }
}

// ── Response parsing ────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ToolCall {
    tool: String,
    #[serde(default)]
    arguments: Value,
}

#[derive(Debug, Default, Deserialize)]
struct FinalAnswer {
    #[serde(default)]
    plan: Option<String>,
    #[serde(default)]
    explanation: Option<String>,
    #[serde(default)]
    confidence: Option<f64>,
    #[serde(default)]
    edits: Vec<FileEdit>,
}

#[derive(Debug)]
enum Reply {
    Tool(ToolCall),
    Final(FinalAnswer),
}

fn parse_reply(text: &str, fallback_path: Option<&FileId>) -> Result<Reply, ReasoningError> {
    if let Some(value) = extract_json(text) {
        return if value.get("tool").is_some() {
            serde_json::from_value(value)
                .map(Reply::Tool)
                .map_err(|e| ReasoningError::Malformed(format!("bad tool call: {e}")))
        } else {
            serde_json::from_value(value)
                .map(Reply::Final)
                .map_err(|e| ReasoningError::Malformed(format!("bad final answer: {e}")))
        };
    }
    parse_text_answer(text, fallback_path).map(Reply::Final).ok_or_else(|| {
        ReasoningError::Malformed(format!(
            "no JSON object or code block in response: {}",
            truncate_chars(text.trim(), 200)
        ))
    })
}

/// The reply as a JSON object, bare or inside a code fence.
fn extract_json(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return value.is_object().then_some(value);
    }
    let body = fenced_block(trimmed, "```json").unwrap_or(trimmed);
    let start = body.find('{')?;
    let end = body.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str::<Value>(&body[start..=end])
        .ok()
        .filter(Value::is_object)
}

/// Contents of the first block opened by `fence`, without its info line.
fn fenced_block<'a>(text: &'a str, fence: &str) -> Option<&'a str> {
    let start = text.find(fence)? + fence.len();
    let rest = &text[start..];
    let rest = rest.split_once('\n').map_or(rest, |(_, body)| body);
    Some(rest.find("```").map_or(rest, |end| &rest[..end]))
}

/// Free-text replies: a code block plus a `File:` or `filepath:` line.
fn parse_text_answer(text: &str, fallback_path: Option<&FileId>) -> Option<FinalAnswer> {
    let code = fenced_block(text, "```python")
        .or_else(|| fenced_block(text, "```"))?
        .trim();
    if code.is_empty() {
        return None;
    }
    let path = text
        .lines()
        .map(str::trim)
        .find_map(|line| {
            line.strip_prefix("File:")
                .or_else(|| line.strip_prefix("filepath:"))
        })
        .map(|p| FileId::new(p.trim().trim_matches('`')))
        .or_else(|| fallback_path.cloned())?;

    Some(FinalAnswer {
        plan: None,
        explanation: Some(truncate_chars(text.trim(), 500).to_string()),
        confidence: Some(FALLBACK_CONFIDENCE),
        edits: vec![FileEdit {
            path,
            content: format!("{code}\n"),
        }],
    })
}
