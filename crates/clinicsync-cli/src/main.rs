//! Clinicsync CLI - Clinic billing export to ledger sync
//!
//! Usage:
//!   clinicsync sync --file export.tsv        Sync an export into the ledger
//!   clinicsync sync --file export.tsv --dry-run
//!   clinicsync check --file export.tsv       Parse and classify only
//!   clinicsync config                        Show effective configuration

mod cli;
mod commands;


use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cli::*;

#[tokio::main]
async fn main() -> Result<()> {
    // QB_* credentials and overrides may live in a local .env
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    // Set up logging
    // Priority: RUST_LOG env var > --verbose flag > default (info)
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).compact())
        .init();

    match cli.command {
        Commands::Sync {
            file,
            json,
            dry_run,
            archive_dir,
        } => {
            let options = commands::SyncOptions {
                json,
                dry_run,
                archive_dir,
            };
            commands::cmd_sync(cli.config.as_deref(), &file, &options).await
        }
        Commands::Check { file, json } => commands::cmd_check(cli.config.as_deref(), &file, json),
        Commands::Config => commands::cmd_config(cli.config.as_deref()),
    }
}
