use anyhow::Context;
use clap::Args;

use minion_core::context::{ContextAssembler, ContextLimits};
use minion_graphs::FileId;

use super::{RepoArgs, build_graph, known_files};

#[derive(Args, Debug)]
pub struct ContextArgs {
    #[command(flatten)]
    pub repo: RepoArgs,

    /// Target files, relative to the repository root
    #[arg(required = true)]
    pub files: Vec<String>,

    /// Override the approximate token budget
    #[arg(long)]
    pub budget: Option<usize>,

    /// Print the rendered bundle instead of the listing
    #[arg(long)]
    pub render: bool,

    /// Print the bundle as JSON
    #[arg(long, conflicts_with = "render")]
    pub json: bool,
}

pub async fn run(args: ContextArgs) -> anyhow::Result<()> {
    let root = args.repo.root()?;
    let config = args.repo.load_config(&root)?;
    let graph = build_graph(&root, &config).await?;
    let targets = known_files(&graph, &root, &args.files)?;

    let mut limits = ContextLimits::from(&config.graph);
    if let Some(budget) = args.budget {
        limits.token_budget = budget;
    }
    let bundle = ContextAssembler::new(&graph, &root, limits).assemble(&targets);

    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&bundle).context("Cannot serialize bundle")?
        );
        return Ok(());
    }
    if args.render {
        print!("{}", bundle.render());
        return Ok(());
    }

    println!(
        "Context for {} target(s), ~{} tokens",
        bundle.targets.len(),
        bundle.approx_tokens
    );
    for (i, entry) in bundle.entries.iter().enumerate() {
        let marker = if bundle.targets.contains(&entry.file) { "*" } else { " " };
        let cut = if entry.truncated { " (truncated)" } else { "" };
        println!("  {:>3}. {marker} {}{cut}", i + 1, entry.file);
    }
    if let Some(cycle) = &bundle.cycle {
        println!();
        let files: Vec<&str> = cycle.files.iter().map(FileId::as_str).collect();
        println!("  Partial order: cycle through {}", files.join(" -> "));
    }
    if !bundle.omitted.is_empty() {
        println!();
        println!("  Omitted for budget: {}", bundle.omitted.len());
        for file in &bundle.omitted {
            println!("    {file}");
        }
    }
    Ok(())
}
