//! Config command

use std::path::Path;

use anyhow::Result;
use clinicsync_core::config::default_config_path;

use super::load_config;

pub fn cmd_config(config_path: Option<&Path>) -> Result<()> {
    let (config, source) = load_config(config_path)?;

    println!("⚙️  Configuration");
    println!("   Source:        {}", source);
    if let Some(path) = default_config_path() {
        println!("   User override: {}", path.display());
    }
    println!();

    println!("Ledger:");
    println!("   Environment:   {}", config.ledger.environment);
    println!("   API base:      {}", config.ledger.api_base());
    println!("   Timeout:       {}s", config.ledger.timeout.as_secs());
    if let Some(minor) = config.ledger.minor_version {
        println!("   Minor version: {}", minor);
    }
    println!(
        "   Retries:       {} attempts, {}ms..{}ms",
        config.retry.max_attempts,
        config.retry.initial_delay.as_millis(),
        config.retry.max_delay.as_millis()
    );
    println!(
        "   Recovery:      {} attempts, {}ms step",
        config.recovery.attempts,
        config.recovery.delay.as_millis()
    );
    println!();

    println!("Billing:");
    println!("   Tax code:        {}", config.billing.tax_code);
    println!("   Default account: {}", config.billing.default_income_account);
    println!("   Default payment: {}", config.billing.default_payment_method);
    let mut accounts: Vec<_> = config.billing.income_accounts.iter().collect();
    accounts.sort();
    for (category, account) in accounts {
        println!("   {:<24} -> {}", category, account);
    }
    println!();

    println!("Insurers ({}):", config.insurers.len());
    for insurer in &config.insurers {
        match &insurer.display_name {
            Some(display) => println!("   {:<36} -> {}", insurer.name, display),
            None => println!("   {}", insurer.name),
        }
    }

    Ok(())
}
