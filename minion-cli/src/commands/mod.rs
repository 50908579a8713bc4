pub mod affected;
pub mod config;
pub mod context;
pub mod plan;
pub mod run;

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Args, Subcommand};

use minion_core::config::MinionConfig;
use minion_graphs::{DependencyGraph, FileId, GraphBuilder};

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run one task through the gated attempt loop
    Run(run::RunArgs),
    /// Show the ordered context bundle for a set of files
    Context(context::ContextArgs),
    /// List the tests affected by changes to a set of files
    AffectedTests(affected::AffectedArgs),
    /// Show a task's plan memory and attempt history
    Plan(plan::PlanArgs),
    /// Print the effective configuration
    Config(config::ConfigArgs),
}

pub async fn run(cmd: Command, quiet: bool) -> anyhow::Result<()> {
    match cmd {
        Command::Run(args) => run::run(args, quiet).await,
        Command::Context(args) => context::run(args).await,
        Command::AffectedTests(args) => affected::run(args).await,
        Command::Plan(args) => plan::run(args),
        Command::Config(args) => config::run(args),
    }
}

/// Repository and configuration flags shared by every command.
#[derive(Args, Debug)]
pub struct RepoArgs {
    /// Path to the repository snapshot (default: current directory)
    #[arg(long, default_value = ".")]
    pub repo: PathBuf,

    /// Config file (default: <repo>/.minion/config.toml when present)
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl RepoArgs {
    pub fn root(&self) -> anyhow::Result<PathBuf> {
        std::fs::canonicalize(&self.repo)
            .with_context(|| format!("Cannot resolve path: {}", self.repo.display()))
    }

    /// File, then environment, then validation.
    pub fn load_config(&self, root: &Path) -> anyhow::Result<MinionConfig> {
        let mut config = MinionConfig::discover(root, self.config.as_deref())
            .context("Cannot load config")?;
        config
            .apply_env(|name| std::env::var(name).ok())
            .context("Invalid config from environment")?;
        config.validate().context("Invalid config")?;
        Ok(config)
    }
}

/// Build the dependency graph for `root` off the async runtime.
pub async fn build_graph(root: &Path, config: &MinionConfig) -> anyhow::Result<DependencyGraph> {
    let builder = GraphBuilder::new(root, config.graph.files.clone());
    let build = tokio::task::spawn_blocking(move || builder.build())
        .await
        .context("Graph build task failed")?
        .context("Cannot build dependency graph")?;
    if !build.failures.is_empty() {
        tracing::info!(count = build.failures.len(), "Some files were kept without edges");
    }
    Ok(build.graph)
}

/// Resolve user-supplied paths to snapshot files, rejecting unknown ones.
pub fn known_files(
    graph: &DependencyGraph,
    root: &Path,
    paths: &[String],
) -> anyhow::Result<Vec<FileId>> {
    paths
        .iter()
        .map(|p| {
            let path = Path::new(p);
            let id = if path.is_absolute() {
                FileId::from_path(root, path)
                    .with_context(|| format!("{p} is outside {}", root.display()))?
            } else {
                FileId::new(p)
            };
            if !graph.contains(&id) {
                anyhow::bail!("{id} is not a source file of the snapshot");
            }
            Ok(id)
        })
        .collect()
}
