//! Sync command: parse an export, push it into the ledger, archive the input

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Local;
use clinicsync_core::{
    group_rows, parse_file, plan, AuthProvider, BatchReport, BatchSync, GroupStatus,
    StaticTokenAuth, SyncConfig,
};
use tracing::{info, warn};

use super::{load_config, print_plan};

#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
    pub json: bool,
    pub dry_run: bool,
    pub archive_dir: Option<PathBuf>,
}

pub async fn cmd_sync(config_path: Option<&Path>, file: &Path, options: &SyncOptions) -> Result<()> {
    let (config, source) = load_config(config_path)?;
    info!(config = %source, environment = %config.ledger.environment, "Using configuration");

    if options.dry_run {
        return dry_run(&config, file);
    }

    let auth: Arc<dyn AuthProvider> =
        Arc::new(StaticTokenAuth::from_env().context("Ledger credentials not available")?);

    let report = run_sync(config, auth, file, options).await?;
    print_report(&report, options.json)?;

    if !report.all_succeeded() {
        anyhow::bail!(
            "{} of {} invoice(s) failed{}",
            report.count(GroupStatus::Error),
            report.results.len(),
            if report.success { "" } else { " (batch aborted)" }
        );
    }
    Ok(())
}

/// Sync one file and route it to the archive, if configured
///
/// Parse failures are archived as errors before being returned.
pub async fn run_sync(
    config: SyncConfig,
    auth: Arc<dyn AuthProvider>,
    file: &Path,
    options: &SyncOptions,
) -> Result<BatchReport> {
    let engine = BatchSync::new(config, auth)?;

    let result = engine.sync_file(file).await;
    let succeeded = matches!(&result, Ok(report) if report.all_succeeded());

    if let Some(dir) = &options.archive_dir {
        let archived = archive_input(file, dir, succeeded)?;
        info!(from = %file.display(), to = %archived.display(), "Archived input");
    }

    result.with_context(|| format!("Failed to sync {}", file.display()))
}

fn dry_run(config: &SyncConfig, file: &Path) -> Result<()> {
    let rows = parse_file(file).with_context(|| format!("Failed to parse {}", file.display()))?;
    let groups = group_rows(rows);
    let planned = plan(config, &groups);

    println!("🔍 Dry run: {} invoice(s), no ledger changes made", planned.len());
    print_plan(&planned);
    Ok(())
}

fn print_report(report: &BatchReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    if report.all_succeeded() {
        println!("✅ Sync complete");
    } else if report.success {
        println!("⚠️  Sync finished with errors");
    } else {
        println!("❌ Sync aborted");
    }
    println!();
    println!("{}", report.summary());

    let dispensed: Vec<_> = report
        .results
        .iter()
        .flat_map(|r| r.inventory_adjustments.iter())
        .collect();
    if !dispensed.is_empty() {
        println!();
        println!("💊 Dispensed stock:");
        for adjustment in dispensed {
            println!("   {} x{}", adjustment.item_name, adjustment.quantity);
        }
    }
    Ok(())
}

/// Move `file` into `<dir>/processed/` or `<dir>/error/` with a timestamp prefix
pub fn archive_input(file: &Path, dir: &Path, succeeded: bool) -> Result<PathBuf> {
    let target_dir = dir.join(if succeeded { "processed" } else { "error" });
    fs::create_dir_all(&target_dir)
        .with_context(|| format!("Failed to create {}", target_dir.display()))?;

    let name = file
        .file_name()
        .and_then(|n| n.to_str())
        .with_context(|| format!("Not a file path: {}", file.display()))?;
    let stamp = Local::now().format("%Y%m%d_%H%M%S");
    let target = target_dir.join(format!("{}_{}", stamp, name));

    if fs::rename(file, &target).is_err() {
        // rename fails across filesystems
        warn!(from = %file.display(), to = %target.display(), "Rename failed, copying instead");
        fs::copy(file, &target)
            .with_context(|| format!("Failed to copy {} to {}", file.display(), target.display()))?;
        fs::remove_file(file).with_context(|| format!("Failed to remove {}", file.display()))?;
    }

    Ok(target)
}
