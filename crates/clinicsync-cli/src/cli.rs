//! CLI argument definitions using clap
//!
//! The command implementations are in the `commands` module.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Clinicsync - Push clinic billing exports into the accounting ledger
#[derive(Parser)]
#[command(name = "clinicsync")]
#[command(about = "Sync clinic billing exports into an accounting ledger", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Config override file (defaults to the per-user config if present)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Parse an export and sync it into the ledger
    ///
    /// Credentials come from QB_ACCESS_TOKEN and QB_REALM_ID (a .env file in the
    /// working directory is read too). Re-running the same export is safe.
    Sync {
        /// CSV or TSV export to sync
        #[arg(short, long)]
        file: PathBuf,

        /// Print the per-invoice report as JSON
        #[arg(long)]
        json: bool,

        /// Parse and classify only; make no ledger calls
        #[arg(long)]
        dry_run: bool,

        /// Move the export into <dir>/processed or <dir>/error afterwards
        #[arg(long)]
        archive_dir: Option<PathBuf>,
    },

    /// Parse an export and show how each invoice would be billed
    Check {
        /// CSV or TSV export to check
        #[arg(short, long)]
        file: PathBuf,

        /// Print the plan as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show the effective configuration
    Config,
}
