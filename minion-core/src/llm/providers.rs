// LLM provider implementations: Anthropic, OpenAI, and OpenAI-compatible endpoints.
#![allow(clippy::cast_precision_loss)]

use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::{ReasoningBackend, ReasoningSection};
use crate::error::LlmError;

use super::{LlmProvider, Pricing, TokenUsage};

// ── Anthropic Provider ──────────────────────────────────────────────

#[derive(Debug)]
pub struct AnthropicProvider {
    client: Client,
    api_key: String,
    model: String,
    base_url: String,
    max_tokens: u32,
}

impl AnthropicProvider {
    pub fn new(api_key: String, model: String, max_tokens: u32) -> Self {
        Self {
            client: crate::http::client(),
            api_key,
            model,
            base_url: "https://api.anthropic.com".to_string(),
            max_tokens,
        }
    }

    #[must_use]
    pub fn with_base_url(mut self, url: String) -> Self {
        self.base_url = url;
        self
    }
}

#[derive(Serialize)]
struct AnthropicRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f64,
    system: &'a str,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicContent>,
    usage: AnthropicUsage,
}

#[derive(Deserialize)]
struct AnthropicContent {
    #[serde(default)]
    text: String,
}

#[derive(Deserialize)]
struct AnthropicUsage {
    input_tokens: u64,
    output_tokens: u64,
}

#[async_trait::async_trait]
#[allow(clippy::unnecessary_literal_bound)]
impl LlmProvider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    fn model_id(&self) -> &str {
        &self.model
    }

    async fn call(
        &self,
        system: &str,
        prompt: &str,
        temperature: f64,
    ) -> Result<(String, TokenUsage), LlmError> {
        let url = format!("{}/v1/messages", self.base_url);

        let body = AnthropicRequest {
            model: &self.model,
            max_tokens: self.max_tokens,
            temperature,
            system,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
        };

        debug!(model = %self.model, prompt_chars = prompt.len(), "Calling Anthropic API");

        let resp = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::Network(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let text = resp.text().await.unwrap_or_default();
            return Err(LlmError::ApiError { status, body: text });
        }

        let result: AnthropicResponse = resp
            .json()
            .await
            .map_err(|e| LlmError::Parse(e.to_string()))?;

        let text = result
            .content
            .iter()
            .map(|c| c.text.as_str())
            .collect::<Vec<_>>()
            .join("");

        Ok((
            text,
            TokenUsage {
                input_tokens: result.usage.input_tokens,
                output_tokens: result.usage.output_tokens,
            },
        ))
    }

    fn pricing(&self) -> Pricing {
        if self.model.contains("opus") {
            Pricing::new(0.015, 0.075)
        } else if self.model.contains("haiku") {
            Pricing::new(0.000_25, 0.001_25)
        } else {
            Pricing::new(0.003, 0.015)
        }
    }
}

// ── OpenAI Provider ─────────────────────────────────────────────────

#[derive(Debug)]
pub struct OpenAiProvider {
    client: Client,
    api_key: String,
    model: String,
    base_url: String,
    max_tokens: u32,
}

impl OpenAiProvider {
    pub fn new(api_key: String, model: String, max_tokens: u32) -> Self {
        Self {
            client: crate::http::client(),
            api_key,
            model,
            base_url: "https://api.openai.com".to_string(),
            max_tokens,
        }
    }

    #[must_use]
    pub fn with_base_url(mut self, url: String) -> Self {
        self.base_url = url;
        self
    }
}

#[derive(Serialize)]
struct OpenAiRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f64,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Deserialize)]
struct OpenAiResponse {
    choices: Vec<OpenAiChoice>,
    usage: OpenAiUsage,
}

#[derive(Deserialize)]
struct OpenAiChoice {
    message: OpenAiChoiceMessage,
}

#[derive(Deserialize)]
struct OpenAiChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct OpenAiUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
}

#[async_trait::async_trait]
#[allow(clippy::unnecessary_literal_bound)]
impl LlmProvider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
    }

    fn model_id(&self) -> &str {
        &self.model
    }

    async fn call(
        &self,
        system: &str,
        prompt: &str,
        temperature: f64,
    ) -> Result<(String, TokenUsage), LlmError> {
        let url = format!("{}/v1/chat/completions", self.base_url);

        let body = OpenAiRequest {
            model: &self.model,
            max_tokens: self.max_tokens,
            temperature,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: system,
                },
                ChatMessage {
                    role: "user",
                    content: prompt,
                },
            ],
        };

        debug!(model = %self.model, prompt_chars = prompt.len(), "Calling OpenAI API");

        let resp = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::Network(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let text = resp.text().await.unwrap_or_default();
            return Err(LlmError::ApiError { status, body: text });
        }

        let result: OpenAiResponse = resp
            .json()
            .await
            .map_err(|e| LlmError::Parse(e.to_string()))?;

        let text = result
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();

        Ok((
            text,
            TokenUsage {
                input_tokens: result.usage.prompt_tokens,
                output_tokens: result.usage.completion_tokens,
            },
        ))
    }

    fn pricing(&self) -> Pricing {
        if self.model.contains("gpt-4o") {
            Pricing::new(0.0025, 0.01)
        } else if self.model.contains("gpt-4") {
            Pricing::new(0.03, 0.06)
        } else {
            Pricing::new(0.0015, 0.002)
        }
    }
}

// ── Provider Factory ────────────────────────────────────────────────

/// Create an LLM provider by name.
pub fn create_provider(
    provider: &str,
    model: &str,
    api_key: &str,
    base_url: Option<&str>,
    max_tokens: u32,
) -> Result<Box<dyn LlmProvider>, LlmError> {
    match provider {
        "anthropic" => {
            let mut p = AnthropicProvider::new(api_key.to_string(), model.to_string(), max_tokens);
            if let Some(url) = base_url {
                p = p.with_base_url(url.to_string());
            }
            Ok(Box::new(p))
        }
        "openai" | "custom" => {
            let mut p = OpenAiProvider::new(api_key.to_string(), model.to_string(), max_tokens);
            if let Some(url) = base_url {
                p = p.with_base_url(url.to_string());
            }
            Ok(Box::new(p))
        }
        other => Err(LlmError::Config(format!(
            "Unknown provider: {other}. Use: anthropic, openai, custom"
        ))),
    }
}

/// Resolve the configured backend against the available API keys.
///
/// Returns `None` for simulation: either requested explicitly, or `auto`
/// with neither `ANTHROPIC_API_KEY` nor `OPENAI_API_KEY` set.
pub fn provider_from_config<F>(
    section: &ReasoningSection,
    lookup: F,
) -> Result<Option<Box<dyn LlmProvider>>, LlmError>
where
    F: Fn(&str) -> Option<String>,
{
    let key = |name: &str| lookup(name).filter(|k| !k.trim().is_empty());
    let base_url = section.base_url.as_deref();

    let (name, model, api_key) = match section.backend {
        ReasoningBackend::Simulated => return Ok(None),
        ReasoningBackend::Anthropic => {
            let api_key = key("ANTHROPIC_API_KEY")
                .ok_or_else(|| LlmError::Config("ANTHROPIC_API_KEY is not set".to_string()))?;
            ("anthropic", &section.anthropic_model, api_key)
        }
        ReasoningBackend::OpenAi => {
            let api_key = key("OPENAI_API_KEY")
                .ok_or_else(|| LlmError::Config("OPENAI_API_KEY is not set".to_string()))?;
            ("openai", &section.openai_model, api_key)
        }
        ReasoningBackend::Auto => {
            if let Some(api_key) = key("ANTHROPIC_API_KEY") {
                ("anthropic", &section.anthropic_model, api_key)
            } else if let Some(api_key) = key("OPENAI_API_KEY") {
                ("openai", &section.openai_model, api_key)
            } else {
                info!("No LLM API key found, using simulated reasoning");
                return Ok(None);
            }
        }
    };

    create_provider(name, model, &api_key, base_url, section.max_tokens).map(Some)
}

// ── Tests ───────────────────────────────────────────────────────────
