use anyhow::Context;
use clap::Args;

use super::RepoArgs;

#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(flatten)]
    pub repo: RepoArgs,
}

pub fn run(args: ConfigArgs) -> anyhow::Result<()> {
    let root = args.repo.root()?;
    let config = args.repo.load_config(&root)?;
    let text = toml::to_string_pretty(&config).context("Cannot serialize config")?;
    print!("{text}");
    Ok(())
}
