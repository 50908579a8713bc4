//! Filing reviewable change proposals once both gates have passed.
//!
//! Publishers never merge anything; a human reviews every proposal.

pub mod dry_run;
pub mod github;

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use crate::config::{PublisherKind, PublisherSection};
use crate::error::PublishError;
use crate::reasoning::Proposal;
use crate::types::{Patch, Task};

pub use dry_run::DryRunPublisher;
pub use github::GitHubPublisher;

/// Characters of the task headline used in titles and commit messages.
const TITLE_HEADLINE: usize = 60;

#[async_trait::async_trait]
pub trait ProposalPublisher: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &str;

    /// File the proposal and return where a reviewer can find it.
    async fn publish(&self, task: &Task, proposal: &Proposal) -> Result<String, PublishError>;
}

/// Build the configured publisher.
///
/// `lookup` resolves environment variables (`GITHUB_TOKEN`).
pub fn publisher_from_config<F>(
    section: &PublisherSection,
    repo_root: &Path,
    proposal_dir: PathBuf,
    lookup: F,
) -> Result<Box<dyn ProposalPublisher>, PublishError>
where
    F: Fn(&str) -> Option<String>,
{
    match section.kind {
        PublisherKind::DryRun => Ok(Box::new(DryRunPublisher::new(
            proposal_dir,
            repo_root,
            &section.branch_prefix,
        ))),
        PublisherKind::GitHub => {
            let token = lookup("GITHUB_TOKEN")
                .filter(|t| !t.trim().is_empty())
                .ok_or_else(|| PublishError::Config("GITHUB_TOKEN is not set".to_string()))?;
            let (owner, repo) = match &section.github_repo {
                Some(full) => full
                    .split_once('/')
                    .map(|(o, r)| (o.to_string(), r.to_string()))
                    .ok_or_else(|| {
                        PublishError::Config(format!("github_repo must be owner/repo, got {full}"))
                    })?,
                None => github::detect_github_remote(repo_root)
                    .as_deref()
                    .and_then(github::parse_github_url)
                    .ok_or_else(|| {
                        PublishError::Config(
                            "no GitHub push remote found; set publisher.github_repo".to_string(),
                        )
                    })?,
            };
            Ok(Box::new(GitHubPublisher::new(owner, repo, token, section)))
        }
    }
}

// ── Shared formatting ───────────────────────────────────────────────

/// `<prefix>/<task-id>/<domain>`.
pub fn branch_name(prefix: &str, task: &Task) -> String {
    format!("{}/{}/{}", prefix.trim_end_matches('/'), task.id, task.domain)
}

pub fn proposal_title(task: &Task) -> String {
    format!("[Minion] {}", task.headline(TITLE_HEADLINE))
}

/// Markdown description attached to every proposal.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn proposal_body(task: &Task, proposal: &Proposal, at: DateTime<Utc>) -> String {
    let mut out = String::from("## Minion-Generated PR\n\n");
    let _ = writeln!(out, "**Task ID:** `{}`", task.id);
    let _ = writeln!(out, "**Priority:** {}", task.priority.as_str());
    let _ = writeln!(out, "**Domain:** {}", task.domain);
    let _ = writeln!(out, "**Snapshot:** {}\n", task.snapshot.revision);

    let _ = writeln!(out, "### Issue\n{}\n", task.description.trim());
    let explanation = if proposal.explanation.trim().is_empty() {
        "(no explanation provided)"
    } else {
        proposal.explanation.trim()
    };
    let _ = writeln!(out, "### What Changed\n{explanation}\n");

    out.push_str("### Files Modified\n");
    for edit in proposal.patch.edits() {
        let _ = writeln!(out, "- `{}`", edit.path);
    }
    out.push('\n');

    if let Some(confidence) = proposal.confidence {
        let pct = (confidence.clamp(0.0, 1.0) * 100.0).round() as u32;
        let _ = writeln!(out, "### Confidence\n{pct}% (AI self-assessed)\n");
    }

    out.push_str("### Review Notes\n");
    out.push_str("- Generated automatically by Minion; nothing is merged without review\n");
    out.push_str("- Lint and the affected tests passed in an isolated sandbox\n");
    out.push_str("- Please verify the logic change before merging\n");
    let _ = writeln!(out, "- Completed at: {}", at.format("%Y-%m-%d %H:%M UTC"));
    out
}

/// Unified diff of `patch` against the files under `root`.
pub fn render_diff(root: &Path, patch: &Patch) -> String {
    let mut out = String::new();
    for edit in patch.edits() {
        let old = std::fs::read_to_string(edit.path.to_path(root)).ok();
        let old_header = if old.is_some() {
            format!("a/{}", edit.path)
        } else {
            "/dev/null".to_string()
        };
        let old = old.unwrap_or_default();
        if old == edit.content {
            continue;
        }
        let diff = similar::TextDiff::from_lines(old.as_str(), edit.content.as_str())
            .unified_diff()
            .context_radius(3)
            .header(&old_header, &format!("b/{}", edit.path))
            .to_string();
        out.push_str(&diff);
    }
    out
}
