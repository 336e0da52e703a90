//! CLI command implementations
//!
//! - `sync` - Ledger sync and input archiving
//! - `check` - Offline parse/classify report (also used by `sync --dry-run`)
//! - `config` - Effective configuration display

pub mod check;
pub mod config;
pub mod sync;

pub use check::*;
pub use config::*;
pub use sync::*;

use std::path::Path;

use anyhow::{Context, Result};
use clinicsync_core::{ConfigSource, SyncConfig};
use tracing::debug;

/// Load config from the embedded defaults plus any override, then env
pub fn load_config(override_path: Option<&Path>) -> Result<(SyncConfig, ConfigSource)> {
    let (mut config, source) =
        SyncConfig::load(override_path).context("Failed to load configuration")?;
    config
        .apply_env()
        .context("Invalid ledger settings in environment")?;
    debug!(source = %source, "Configuration loaded");
    Ok((config, source))
}

/// Truncate a string to a maximum number of characters, adding "..." if truncated
pub fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}
