use clap::Parser;

mod commands;

#[derive(Parser, Debug)]
#[command(
    name = "minion",
    version,
    about = "Bounded, gated code-change automation"
)]
struct Cli {
    #[command(subcommand)]
    command: commands::Command,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, global = true)]
    quiet: bool,
}

/// Classify an error into an exit code.
///
/// Exit codes:
///   0 success
///   1 general/unknown error
///   2 configuration error
///   3 repository not found
///   6 LLM provider error
///   9 task ended without a gated proposal (escalated, aborted, cancelled)
fn classify_exit_code(err: &anyhow::Error) -> i32 {
    if err.downcast_ref::<commands::run::Unfinished>().is_some() {
        return 9;
    }

    let lower = format!("{err:#}").to_lowercase();
    if lower.contains("not a directory") || lower.contains("cannot resolve path") {
        3
    } else if lower.contains("llm") || lower.contains("api_key") {
        6
    } else if lower.contains("config") {
        2
    } else {
        1
    }
}

fn main() {
    let cli = Cli::parse();

    let filter = match (cli.quiet, cli.verbose) {
        (true, _) => "error",
        (_, 0) => "warn",
        (_, 1) => "info",
        (_, 2) => "debug",
        _ => "trace",
    };

    minion_core::http::install_crypto_provider();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .init();

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Error: Failed to create runtime: {e}");
            std::process::exit(1);
        }
    };

    match runtime.block_on(commands::run(cli.command, cli.quiet)) {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            eprintln!("Error: {e:#}");
            std::process::exit(classify_exit_code(&e));
        }
    }
}
