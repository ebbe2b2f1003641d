use clap::{Parser, Subcommand};

mod commands;

use commands::{CheckConfigArgs, ReplayArgs, ShowStateArgs};

#[derive(Parser)]
#[command(name = "riskgate")]
#[command(about = "Risk-gated position lifecycle engine for leveraged perpetuals", long_about = None)]
struct Cli {
    /// Log filter used when RUST_LOG is unset (e.g. "info", "riskgate_execution=debug")
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load, validate and print the effective configuration
    CheckConfig(CheckConfigArgs),
    /// Print persisted position records and the daily entry gate
    ShowState(ShowStateArgs),
    /// Drive the engine through recorded market steps against the paper exchange
    Replay(ReplayArgs),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr; stdout carries the JSON output.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::CheckConfig(args) => commands::run_check_config(&args),
        Commands::ShowState(args) => commands::run_show_state(&args),
        Commands::Replay(args) => commands::run_replay(args).await,
    }
}
