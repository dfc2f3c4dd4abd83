use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;

use commands::explain::ExplainArgs;

#[derive(Parser, Debug)]
#[command(name = "rowguard", version, about = "Row-level access control for SQL statements")]
struct Cli {
    /// Path to the configuration file.
    #[arg(
        long,
        short,
        global = true,
        env = "ROWGUARD_CONFIG",
        default_value_os_t = commands::check::default_config_path()
    )]
    config: PathBuf,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Validate the configuration and report rules that can never apply.
    Check,

    /// Show how a statement would be rewritten for a given caller.
    Explain(ExplainArgs),
}

fn main() -> anyhow::Result<()> {
    // Logs go to stderr so `explain --json` output stays parseable.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("ROWGUARD_LOG").unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    tracing::debug!(config = %cli.config.display(), "loaded command line");

    match cli.cmd {
        Command::Check => commands::check::run(&cli.config)?,
        Command::Explain(args) => commands::explain::run(&cli.config, args)?,
    }

    Ok(())
}
