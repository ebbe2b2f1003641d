//! `check-config`: resolve defaults, file and environment into one validated config.

use anyhow::Result;
use clap::Args;
use riskgate_core::{AppConfig, ConfigLoader};
use std::path::PathBuf;

#[derive(Args, Debug)]
pub struct CheckConfigArgs {
    /// Config file (TOML, or JSON by extension)
    #[arg(short, long, default_value = "config/riskgate.toml", env = "RISKGATE_CONFIG")]
    pub config: PathBuf,

    /// Print compact JSON instead of pretty JSON
    #[arg(long)]
    pub compact: bool,
}

/// Loads the config and prints it as JSON.
///
/// # Errors
/// Returns error if the config fails to parse or validate.
pub fn run_check_config(args: &CheckConfigArgs) -> Result<()> {
    let config = ConfigLoader::load(&args.config)?;
    println!("{}", render(&config, args.compact)?);
    Ok(())
}

fn render(config: &AppConfig, compact: bool) -> Result<String> {
    let text = if compact {
        serde_json::to_string(config)?
    } else {
        serde_json::to_string_pretty(config)?
    };
    Ok(text)
}
