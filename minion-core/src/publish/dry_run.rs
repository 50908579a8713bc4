// Offline publisher: writes the proposal description and diff to disk.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::info;

use crate::error::PublishError;
use crate::plan::write_atomic;
use crate::reasoning::Proposal;
use crate::types::Task;

use super::{ProposalPublisher, branch_name, proposal_body, proposal_title, render_diff};

pub const PROPOSAL_FILE: &str = "proposal.md";
pub const DIFF_FILE: &str = "changes.diff";

#[derive(Debug, Clone)]
pub struct DryRunPublisher {
    output_dir: PathBuf,
    snapshot_root: PathBuf,
    branch_prefix: String,
}

impl DryRunPublisher {
    pub fn new(output_dir: PathBuf, snapshot_root: &Path, branch_prefix: &str) -> Self {
        Self {
            output_dir,
            snapshot_root: snapshot_root.to_path_buf(),
            branch_prefix: branch_prefix.to_string(),
        }
    }
}

#[async_trait::async_trait]
#[allow(clippy::unnecessary_literal_bound)]
impl ProposalPublisher for DryRunPublisher {
    fn name(&self) -> &str {
        "dry-run"
    }

    async fn publish(&self, task: &Task, proposal: &Proposal) -> Result<String, PublishError> {
        if !task.id.is_path_safe() {
            return Err(PublishError::Config(format!("unsafe task id: {}", task.id)));
        }
        let dir = self.output_dir.join(task.id.as_str());
        let diff = render_diff(&self.snapshot_root, &proposal.patch);

        let mut doc = String::new();
        let _ = writeln!(doc, "# {}\n", proposal_title(task));
        let _ = writeln!(doc, "Branch: `{}`\n", branch_name(&self.branch_prefix, task));
        doc.push_str(&proposal_body(task, proposal, Utc::now()));
        let _ = write!(doc, "\n### Diff\n```diff\n{diff}```\n");

        let proposal_path = dir.join(PROPOSAL_FILE);
        write_atomic(&proposal_path, doc.as_bytes())?;
        write_atomic(&dir.join(DIFF_FILE), diff.as_bytes())?;

        let abs = std::path::absolute(&proposal_path)?;
        info!(task = %task.id, path = %abs.display(), "Proposal written");
        Ok(format!("file://{}", abs.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FileEdit, Patch, RepoSnapshot, TaskId};

    #[tokio::test]
    async fn writes_proposal_and_diff() {
        let repo = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        std::fs::write(repo.path().join("cart.py"), "TOTAL = 1\n").unwrap();

        let task = Task::new(
            "Fix cart total",
            RepoSnapshot {
                root: repo.path().to_path_buf(),
                revision: RepoSnapshot::WORKING_TREE.into(),
            },
        )
        .with_id(TaskId::from("minion-12345678"));
        let proposal = Proposal {
            patch: Patch::new([FileEdit {
                path: "cart.py".into(),
                content: "TOTAL = 2\n".into(),
            }]),
            updated_plan: String::new(),
            explanation: "Bumped the total.".into(),
            confidence: None,
        };

        let publisher = DryRunPublisher::new(out.path().to_path_buf(), repo.path(), "minion");
        let url = publisher.publish(&task, &proposal).await.unwrap();
        assert!(url.starts_with("file://"));
        assert!(url.ends_with("minion-12345678/proposal.md"));

        let doc = std::fs::read_to_string(out.path().join("minion-12345678/proposal.md")).unwrap();
        assert!(doc.starts_with("# [Minion] Fix cart total"));
        assert!(doc.contains("Branch: `minion/minion-12345678/testing`"));
        assert!(doc.contains("+TOTAL = 2"));
        assert!(!doc.contains("### Confidence"));

        let diff = std::fs::read_to_string(out.path().join("minion-12345678/changes.diff")).unwrap();
        assert!(diff.contains("-TOTAL = 1"));
        // The snapshot itself is untouched.
        assert_eq!(
            std::fs::read_to_string(repo.path().join("cart.py")).unwrap(),
            "TOTAL = 1\n"
        );
    }
}
