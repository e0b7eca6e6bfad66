//! Strata - incremental container image stages
//!
//! CLI entry point that dispatches to subcommands.

use clap::Parser;
use console::style;
use std::process::ExitCode;
use strata::cli::{commands, Cli, Commands};
use strata::config::{Config, ConfigManager};
use strata::error::StrataResult;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {}", style("Error:").red().bold(), e);
            if let Some(hint) = e.hint() {
                eprintln!("{} {}", style("Hint:").yellow(), hint);
            }
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> StrataResult<()> {
    let cli = Cli::parse();

    let config_manager = match cli.config {
        Some(ref path) => ConfigManager::with_path(path.clone()),
        None => ConfigManager::new(),
    };
    let config = config_manager.load().await?;

    init_logging(cli.verbose, &config);

    let json = cli.json;
    match cli.command {
        Commands::Head(args) => commands::head(args, &config, json).await,
        Commands::Tags(args) => commands::tags(args, &config, json).await,
        Commands::Branches(args) => commands::branches(args, &config, json).await,
        Commands::Checksum(args) => commands::checksum(args, &config, json).await,
        Commands::Patch(args) => commands::patch(args, &config, json).await,
        Commands::Archive(args) => commands::archive(args, &config, json).await,
        Commands::MergeCheck(args) => commands::merge_check(args, &config, json).await,
    }
}

/// 0 = warn, 1 = info, 2+ = debug
fn init_logging(verbose: u8, config: &Config) {
    let filter = match verbose {
        0 => EnvFilter::new("strata=warn"),
        1 => EnvFilter::new("strata=info"),
        _ => EnvFilter::new("strata=debug"),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if config.general.log_format == "json" {
        builder.json().init();
    } else {
        builder.without_time().init();
    }
}
