// Reasoning without credentials: proposes the first target file with its
// current content, so the gates and publishing can be exercised end to end.

use tracing::info;

use crate::error::ReasoningError;
use crate::types::{FileEdit, Patch};

use super::{Proposal, ReasoningClient, ReasoningRequest};

#[derive(Debug, Clone, Copy, Default)]
pub struct SimulatedReasoningClient;

#[async_trait::async_trait]
#[allow(clippy::unnecessary_literal_bound)]
impl ReasoningClient for SimulatedReasoningClient {
    fn name(&self) -> &str {
        "simulated"
    }

    async fn propose(&self, request: ReasoningRequest<'_>) -> Result<Proposal, ReasoningError> {
        let target = request
            .bundle
            .targets
            .first()
            .ok_or_else(|| ReasoningError::Malformed("no target files to propose".to_string()))?;

        let content = match request.bundle.content_of(target) {
            Some(content) => content.to_string(),
            None => tokio::fs::read_to_string(target.to_path(&request.task.snapshot.root))
                .await
                .unwrap_or_default(),
        };
        info!(file = %target, "Simulated proposal (no LLM backend configured)");

        let updated_plan = format!(
            "{}\n- [x] Attempt {}: simulated proposal for `{target}`\n",
            request.plan.trim_end(),
            request.attempt + 1
        );
        Proposal {
            patch: Patch::new([FileEdit {
                path: target.clone(),
                content,
            }]),
            updated_plan,
            explanation: "Simulation mode output. Configure an LLM backend for real code generation."
                .to_string(),
            confidence: Some(0.0),
        }
        .validate()
    }
}
