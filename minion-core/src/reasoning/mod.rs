//! The reasoning boundary: one synchronous propose/respond exchange per
//! attempt. Whatever the component does internally (tool calls, several model
//! turns) stays behind [`ReasoningClient::propose`].

pub mod llm;
pub mod simulated;

use serde::{Deserialize, Serialize};

use crate::context::ContextBundle;
use crate::error::ReasoningError;
use crate::tools::{ToolContext, ToolView};
use crate::types::{Patch, Task};

pub use llm::LlmReasoningClient;
pub use simulated::SimulatedReasoningClient;

/// Everything one attempt hands to the reasoning component.
#[derive(Debug, Clone, Copy)]
pub struct ReasoningRequest<'a> {
    pub task: &'a Task,
    /// 0-based attempt number.
    pub attempt: u32,
    pub bundle: &'a ContextBundle,
    pub plan: &'a str,
    /// Diagnostic of the previous failed attempt only.
    pub last_diagnostic: Option<&'a str>,
    pub tools: &'a ToolView,
    pub tool_context: &'a ToolContext,
}

/// A proposed change plus the component's updated plan memory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proposal {
    pub patch: Patch,
    pub updated_plan: String,
    pub explanation: String,
    /// Self-assessed, 0.0 to 1.0.
    pub confidence: Option<f64>,
}

impl Proposal {
    /// Reject proposals that change nothing.
    pub fn validate(self) -> Result<Self, ReasoningError> {
        if self.patch.is_empty() {
            Err(ReasoningError::EmptyPatch)
        } else {
            Ok(self)
        }
    }
}

#[async_trait::async_trait]
pub trait ReasoningClient: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &str;

    async fn propose(&self, request: ReasoningRequest<'_>) -> Result<Proposal, ReasoningError>;
}
