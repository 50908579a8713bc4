use clap::Args;

use minion_graphs::{AffectedTests, select_affected_tests};

use super::{RepoArgs, build_graph, known_files};

#[derive(Args, Debug)]
pub struct AffectedArgs {
    #[command(flatten)]
    pub repo: RepoArgs,

    /// Changed files, relative to the repository root
    #[arg(required = true)]
    pub files: Vec<String>,

    /// Override the reverse hop limit
    #[arg(long)]
    pub hops: Option<usize>,
}

pub async fn run(args: AffectedArgs) -> anyhow::Result<()> {
    let root = args.repo.root()?;
    let config = args.repo.load_config(&root)?;
    let graph = build_graph(&root, &config).await?;
    let changed = known_files(&graph, &root, &args.files)?;

    let mut selection = config.graph.test_selection();
    if let Some(hops) = args.hops {
        selection.hop_limit = hops;
    }

    match select_affected_tests(&graph, &changed, &selection) {
        AffectedTests::Selected(tests) => {
            println!("{} affected test file(s)", tests.len());
            for test in &tests {
                println!("  {test}");
            }
        }
        AffectedTests::FullSuite { reason } => {
            println!("Full suite: {reason}");
        }
    }
    Ok(())
}
