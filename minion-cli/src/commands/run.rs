use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use clap::Args;
use tokio_util::sync::CancellationToken;

use minion_core::config::{MinionConfig, PublisherKind, ReasoningBackend};
use minion_core::escalation::sink_from_config;
use minion_core::llm::providers::provider_from_config;
use minion_core::plan::FilePlanStore;
use minion_core::progress::{IndicatifReporter, NoopReporter, ProgressReporter};
use minion_core::publish::publisher_from_config;
use minion_core::reasoning::{LlmReasoningClient, ReasoningClient, SimulatedReasoningClient};
use minion_core::sandbox::{PoolSettings, SandboxPool, backend_from_config};
use minion_core::types::{Priority, RepoSnapshot, Task, TaskOutcome, ToolDomain};
use minion_core::TaskRunner;

use super::RepoArgs;

#[derive(Args, Debug)]
pub struct RunArgs {
    #[command(flatten)]
    pub repo: RepoArgs,

    /// Natural-language description of the change
    #[arg(long)]
    pub task: String,

    /// File the change should target (repeatable)
    #[arg(long = "file")]
    pub files: Vec<String>,

    /// Tool domain: filesystem, linting, testing, git, search, memory
    #[arg(long, default_value = "testing")]
    pub domain: ToolDomain,

    /// Priority recorded on the proposal: low, normal, high
    #[arg(long, default_value = "normal")]
    pub priority: Priority,

    /// GitHub login to request as reviewer (repeatable)
    #[arg(long = "reviewer")]
    pub reviewers: Vec<String>,

    /// Override the reasoning backend: auto, anthropic, openai, simulated
    #[arg(long)]
    pub backend: Option<ReasoningBackend>,

    /// Write the proposal to disk instead of opening a pull request
    #[arg(long)]
    pub dry_run: bool,

    /// Print the outcome as JSON
    #[arg(long)]
    pub json: bool,
}

/// A task that ended without a gated proposal.
#[derive(Debug)]
pub struct Unfinished {
    pub task: String,
    pub state: String,
}

impl std::fmt::Display for Unfinished {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Task {} ended {}", self.task, self.state)
    }
}

impl std::error::Error for Unfinished {}

pub async fn run(args: RunArgs, quiet: bool) -> anyhow::Result<()> {
    let root = args.repo.root()?;
    let mut config = args.repo.load_config(&root)?;
    if let Some(backend) = args.backend {
        config.reasoning.backend = backend;
    }
    if args.dry_run {
        config.publisher.kind = PublisherKind::DryRun;
    }

    let snapshot = RepoSnapshot::open(&root).context("Cannot open repository snapshot")?;
    let task = Task::new(args.task.clone(), snapshot)
        .with_files(args.files.iter().map(String::as_str))
        .with_domain(args.domain)
        .with_priority(args.priority)
        .with_reviewers(args.reviewers.clone());

    let lookup = |name: &str| std::env::var(name).ok();
    let provider =
        provider_from_config(&config.reasoning, lookup).context("LLM provider setup failed")?;
    let llm = provider.map(|p| Arc::new(LlmReasoningClient::new(p, config.reasoning.temperature)));
    let reasoning: Arc<dyn ReasoningClient> = match &llm {
        Some(client) => Arc::clone(client) as Arc<dyn ReasoningClient>,
        None => Arc::new(SimulatedReasoningClient),
    };

    let publisher = publisher_from_config(
        &config.publisher,
        &root,
        config.proposal_dir(&root),
        lookup,
    )
    .context("Cannot set up the proposal publisher")?;
    let escalation = sink_from_config(&config.escalation, config.state_dir(&root));
    let plans = Arc::new(FilePlanStore::new(config.state_dir(&root)));

    let pool = SandboxPool::start(
        backend_from_config(&config.sandbox, &root),
        PoolSettings::from(&config.sandbox),
    )?;

    let reporter: Arc<dyn ProgressReporter> = if quiet || args.json {
        Arc::new(NoopReporter)
    } else {
        Arc::new(IndicatifReporter::new())
    };
    let runner = TaskRunner::new(
        config,
        reasoning,
        Arc::clone(&pool),
        Arc::from(publisher),
        escalation,
        plans,
    )
    .context("Invalid config")?
    .with_reporter(Arc::clone(&reporter));

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling after the current step");
            on_signal.cancel();
        }
    });

    let result = runner.run(&task, &cancel).await;
    reporter.finish();
    pool.shutdown().await;
    let outcome = result?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    } else {
        print_outcome(&outcome, &root, runner.config());
        if let Some(client) = &llm {
            let costs = client.costs();
            println!(
                "  LLM: {} requests, {} in / {} out tokens, ~${:.4}",
                costs.requests,
                costs.input_tokens,
                costs.output_tokens,
                costs.estimated_cost_usd
            );
        }
    }

    if outcome.succeeded() {
        Ok(())
    } else {
        Err(Unfinished {
            task: outcome.task_id.to_string(),
            state: outcome.state.to_string(),
        }
        .into())
    }
}

#[allow(clippy::cast_precision_loss)]
fn print_outcome(outcome: &TaskOutcome, root: &Path, config: &MinionConfig) {
    println!("Task {}: {}", outcome.task_id, outcome.state);
    println!("  Attempts: {}", outcome.attempts.len());
    for attempt in &outcome.attempts {
        match &attempt.failure {
            None => println!("    #{} passed", attempt.number + 1),
            Some(failure) => println!("    #{} {failure}", attempt.number + 1),
        }
    }
    if let Some(url) = &outcome.proposal_url {
        println!("  Proposal: {url}");
    }
    if let Some(err) = &outcome.publish_error {
        println!("  Publish failed: {err}");
    }
    if !outcome.succeeded() {
        println!(
            "  History: {}",
            config.state_dir(root).join(outcome.task_id.as_str()).display()
        );
    }
    println!("  Duration: {:.1}s", outcome.duration_ms as f64 / 1000.0);
}
