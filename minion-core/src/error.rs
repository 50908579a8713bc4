use std::time::Duration;

/// Top-level Minion error type.
///
/// Each variant wraps a domain-specific error enum, allowing callers to
/// match on the error source without losing type information. Only
/// configuration errors are fatal; everything raised inside an attempt is
/// turned into feedback or escalation by the orchestrator.
#[derive(thiserror::Error, Debug)]
pub enum MinionError {
    /// Error from the graph engine (walking, parsing, edge bookkeeping).
    #[error("Graph engine error: {0}")]
    Graph(#[from] minion_graphs::GraphError),

    /// Error in configuration parsing or validation.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Error provisioning or driving an isolated execution environment.
    #[error("Sandbox error: {0}")]
    Sandbox(#[from] SandboxError),

    /// The reasoning component failed to produce a usable proposal.
    #[error("Reasoning error: {0}")]
    Reasoning(#[from] ReasoningError),

    /// Error communicating with an LLM provider.
    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    /// Error filing a change proposal.
    #[error("Publish error: {0}")]
    Publish(#[from] PublishError),

    /// Error persisting plan memory or attempt history.
    #[error("Plan store error: {0}")]
    PlanStore(#[from] PlanStoreError),

    /// Error delivering an escalation.
    #[error("Escalation error: {0}")]
    Escalation(#[from] EscalationError),

    /// Error executing a registry tool.
    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    /// The snapshot root is missing or unreadable.
    #[error("Repository error: {0}")]
    Repository(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors in Minion configuration parsing and validation.
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    /// The configuration file does not exist at the expected path.
    #[error("Config file not found: {0}")]
    NotFound(String),

    /// Configuration values are present but semantically invalid.
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// Configuration file syntax could not be parsed (TOML error).
    #[error("Parse error: {0}")]
    Parse(String),
}

/// Errors from the sandbox pool and its backends.
#[derive(thiserror::Error, Debug)]
pub enum SandboxError {
    /// No instance could be handed out within the acquire timeout.
    #[error("Sandbox unavailable: {0}")]
    Unavailable(String),

    /// The backend failed to create an instance.
    #[error("Provisioning failed: {0}")]
    Provision(String),

    /// A command could not be started or its output collected.
    #[error("Exec failed: {0}")]
    Exec(String),

    /// The instance was already destroyed.
    #[error("Sandbox {0} already released")]
    Released(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from the reasoning component. Each one consumes an attempt.
#[derive(thiserror::Error, Debug)]
pub enum ReasoningError {
    #[error("Reasoning timed out after {0:?}")]
    Timeout(Duration),

    /// The response could not be turned into a patch.
    #[error("Malformed response: {0}")]
    Malformed(String),

    #[error("Reasoning returned an empty patch")]
    EmptyPatch,

    #[error("Provider error: {0}")]
    Provider(#[from] LlmError),
}

/// Errors from LLM provider interactions.
#[derive(thiserror::Error, Debug)]
pub enum LlmError {
    /// Network-level failure connecting to the LLM provider.
    #[error("Network error: {0}")]
    Network(String),

    /// LLM API returned a non-success HTTP status.
    #[error("API error (HTTP {status}): {body}")]
    ApiError {
        /// HTTP status code from the provider.
        status: u16,
        /// Response body text.
        body: String,
    },

    /// LLM response could not be parsed into the expected format.
    #[error("Response parse error: {0}")]
    Parse(String),

    /// LLM configuration is missing or invalid (API key, model, etc.).
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Errors filing a change proposal.
#[derive(thiserror::Error, Debug)]
pub enum PublishError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("GitHub API {status}: {body}")]
    Api { status: u16, body: String },

    #[error("Publisher not configured: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(thiserror::Error, Debug)]
pub enum PlanStoreError {
    /// Task ids name directories; ids with separators or dots are refused.
    #[error("Invalid task id: {0}")]
    InvalidTaskId(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(thiserror::Error, Debug)]
pub enum EscalationError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Webhook returned HTTP {0}")]
    Status(u16),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(thiserror::Error, Debug)]
pub enum ToolError {
    /// The tool exists but is not part of the task's curated view.
    #[error("Tool not available for this task: {0}")]
    NotAvailable(String),

    #[error("Invalid arguments for {tool}: {message}")]
    InvalidArguments { tool: String, message: String },

    /// A path argument resolved outside the workspace.
    #[error("Path escapes the workspace: {0}")]
    PathEscape(String),

    #[error("Tool failed: {0}")]
    Failed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience alias for `Result<T, MinionError>`.
pub type Result<T> = std::result::Result<T, MinionError>;
