pub mod providers;

use serde::{Deserialize, Serialize};

use crate::error::LlmError;

/// Tokens consumed by one provider call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// USD per thousand tokens.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pricing {
    pub input_per_1k: f64,
    pub output_per_1k: f64,
}

impl Pricing {
    pub const fn new(input_per_1k: f64, output_per_1k: f64) -> Self {
        Self {
            input_per_1k,
            output_per_1k,
        }
    }

    #[allow(clippy::cast_precision_loss)]
    pub fn cost_of(&self, usage: &TokenUsage) -> f64 {
        usage.input_tokens as f64 / 1000.0 * self.input_per_1k
            + usage.output_tokens as f64 / 1000.0 * self.output_per_1k
    }
}

/// Usage accumulated by one reasoning client, across attempts and tool
/// rounds.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CostTracker {
    pub requests: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub estimated_cost_usd: f64,
}

impl CostTracker {
    pub fn record(&mut self, usage: &TokenUsage, pricing: Pricing) {
        self.requests += 1;
        self.input_tokens += usage.input_tokens;
        self.output_tokens += usage.output_tokens;
        self.estimated_cost_usd += pricing.cost_of(usage);
    }
}

/// A chat-completion backend. One call is one system + user exchange.
#[async_trait::async_trait]
pub trait LlmProvider: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &str;

    fn model_id(&self) -> &str;

    async fn call(
        &self,
        system: &str,
        prompt: &str,
        temperature: f64,
    ) -> Result<(String, TokenUsage), LlmError>;

    /// List price of the configured model.
    fn pricing(&self) -> Pricing;
}
