//! Offline check: parse, group and classify without touching the ledger

use std::path::Path;

use anyhow::{Context, Result};
use clinicsync_core::{group_rows, parse_file, plan, PlannedGroup, TransactionKind};

use super::{load_config, truncate};

pub fn cmd_check(config_path: Option<&Path>, file: &Path, json: bool) -> Result<()> {
    let (config, _) = load_config(config_path)?;

    let rows = parse_file(file).with_context(|| format!("Failed to parse {}", file.display()))?;
    let row_count = rows.len();
    let groups = group_rows(rows);
    let planned = plan(&config, &groups);

    if json {
        println!("{}", serde_json::to_string_pretty(&planned)?);
        return Ok(());
    }

    println!(
        "📋 {}: {} rows in {} invoice(s)",
        file.display(),
        row_count,
        planned.len()
    );
    print_plan(&planned);
    Ok(())
}

/// Table of planned documents
pub fn print_plan(planned: &[PlannedGroup]) {
    println!();
    println!(
        "{:<14} {:<14} {:<36} {:>6} {:>12}",
        "Invoice", "Type", "Customer", "Lines", "Total"
    );
    println!("{}", "-".repeat(86));

    for group in planned {
        let kind = match group.kind {
            TransactionKind::Invoice => "invoice",
            TransactionKind::SalesReceipt => "receipt",
        };
        println!(
            "{:<14} {:<14} {:<36} {:>6} {:>12}",
            truncate(&group.invoice, 14),
            kind,
            truncate(&group.customer, 36),
            format!("{}/{}", group.billable_lines, group.rows),
            format!("{:.2}", group.total)
        );
    }

    let invoices = planned
        .iter()
        .filter(|g| g.kind == TransactionKind::Invoice)
        .count();
    let empty = planned.iter().filter(|g| g.billable_lines == 0).count();
    println!();
    println!(
        "   Invoices: {}  Sales receipts: {}  Nothing to bill: {}",
        invoices,
        planned.len() - invoices,
        empty
    );
}
