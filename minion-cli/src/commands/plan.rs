use anyhow::Context;
use clap::Args;

use minion_core::plan::{FilePlanStore, PlanStore};
use minion_core::types::TaskId;

use super::RepoArgs;

#[derive(Args, Debug)]
pub struct PlanArgs {
    #[command(flatten)]
    pub repo: RepoArgs,

    /// Task id, as printed by `minion run`
    pub task_id: String,

    /// Also list every recorded attempt
    #[arg(long)]
    pub attempts: bool,
}

pub fn run(args: PlanArgs) -> anyhow::Result<()> {
    let root = args.repo.root()?;
    let config = args.repo.load_config(&root)?;
    let store = FilePlanStore::new(config.state_dir(&root));
    let task = TaskId::from(args.task_id);

    let plan = store
        .load_plan(&task)
        .with_context(|| format!("Cannot read plan for {task}"))?;
    let Some(plan) = plan else {
        anyhow::bail!("No plan recorded for {task} under {}", store.root().display());
    };
    print!("{plan}");
    if !plan.ends_with('\n') {
        println!();
    }

    if args.attempts {
        let history = store
            .load_attempts(&task)
            .with_context(|| format!("Cannot read attempts for {task}"))?;
        println!();
        println!("Attempts: {}", history.len());
        for attempt in &history {
            let files = attempt.patch.as_ref().map_or(0, |p| p.len());
            match &attempt.failure {
                None => println!("  #{} passed ({files} file(s))", attempt.number + 1),
                Some(failure) => {
                    println!("  #{} {failure} ({files} file(s))", attempt.number + 1);
                }
            }
        }
    }
    Ok(())
}
