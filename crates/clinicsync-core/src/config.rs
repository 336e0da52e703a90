//! Sync configuration
//!
//! Config is loaded with a two-layer resolution:
//! 1. Embedded defaults (compiled into binary from `config/clinicsync.toml`)
//! 2. An override file layered on top: an explicit path, else
//!    `<data_local_dir>/clinicsync/config.toml` if it exists
//!
//! Override files only need the keys they change. `[[insurers]]` replaces the
//! whole list when present; `[billing.income_accounts]` entries are merged.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};

/// Embedded default config (compiled into binary)
const DEFAULT_CONFIG: &str = include_str!("../../../config/clinicsync.toml");

/// Ledger deployment the API calls go to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Sandbox,
    Production,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sandbox => "sandbox",
            Self::Production => "production",
        }
    }

    pub fn base_url(&self) -> &'static str {
        match self {
            Self::Sandbox => "https://sandbox-quickbooks.api.intuit.com",
            Self::Production => "https://quickbooks.api.intuit.com",
        }
    }
}

impl std::str::FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "sandbox" | "development" | "dev" => Ok(Self::Sandbox),
            "production" | "prod" => Ok(Self::Production),
            _ => Err(format!("Unknown ledger environment: {}", s)),
        }
    }
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct LedgerConfig {
    pub environment: Environment,
    /// Replaces the environment's base URL (mock servers, proxies)
    pub base_url: Option<String>,
    /// Fixed per-request timeout
    pub timeout: Duration,
    pub minor_version: Option<u32>,
}

impl LedgerConfig {
    pub fn api_base(&self) -> String {
        self.base_url
            .as_deref()
            .unwrap_or_else(|| self.environment.base_url())
            .trim_end_matches('/')
            .to_string()
    }
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            environment: Environment::Sandbox,
            base_url: None,
            timeout: Duration::from_secs(30),
            minor_version: None,
        }
    }
}

/// Exponential backoff for transient ledger failures
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts including the first
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            multiplier: 2.0,
        }
    }
}

/// Duplicate-name recovery and version-conflict handling
#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    /// Re-query attempts after a create reports the name already exists
    pub attempts: u32,
    /// Base delay; attempt N waits N × delay
    pub delay: Duration,
    /// Re-read-and-retry rounds on a stale version token
    pub conflict_retries: u32,
    /// Highest numeric suffix tried when disambiguating item names
    pub max_name_suffix: u32,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            attempts: 5,
            delay: Duration::from_millis(1500),
            conflict_retries: 2,
            max_name_suffix: 9,
        }
    }
}

/// Delay inserted between invoice groups to stay under the API rate limit
#[derive(Debug, Clone)]
pub struct PacingConfig {
    pub budget: Duration,
    pub min_delay: Duration,
    pub max_delay: Duration,
}

impl PacingConfig {
    /// budget / group_count, clamped to [min_delay, max_delay]
    pub fn delay_for(&self, group_count: usize) -> Duration {
        let count = group_count.max(1) as u32;
        let raw = self.budget / count;
        raw.clamp(self.min_delay, self.max_delay.max(self.min_delay))
    }
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            budget: Duration::from_secs(40),
            min_delay: Duration::from_millis(250),
            max_delay: Duration::from_millis(800),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BillingConfig {
    /// Zero-VAT tax code applied to every line
    pub tax_code: String,
    pub default_income_account: String,
    /// Normalized category -> income account id
    pub income_accounts: HashMap<String, String>,
    pub default_payment_method: String,
}

impl BillingConfig {
    /// Income account for a service category, falling back to the default
    pub fn income_account_for(&self, category: &str) -> &str {
        self.income_accounts
            .get(&normalize_category(category))
            .map(String::as_str)
            .unwrap_or(self.default_income_account.as_str())
    }
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            tax_code: "6".to_string(),
            default_income_account: "1".to_string(),
            income_accounts: HashMap::new(),
            default_payment_method: "Cash".to_string(),
        }
    }
}

/// Case-fold, `&` -> `and`, collapse whitespace
pub fn normalize_category(category: &str) -> String {
    category
        .to_lowercase()
        .replace('&', " and ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Fields written onto newly created customers
#[derive(Debug, Clone)]
pub struct CustomerDefaults {
    pub email_domain: String,
    pub phone: String,
    pub bill_line1: String,
    pub bill_city: String,
    pub bill_country: String,
    pub bill_subdivision: String,
    pub bill_postal_code: String,
}

impl Default for CustomerDefaults {
    fn default() -> Self {
        Self {
            email_domain: "example.com".to_string(),
            phone: "0712345678".to_string(),
            bill_line1: "N/A".to_string(),
            bill_city: "Nairobi".to_string(),
            bill_country: "Kenya".to_string(),
            bill_subdivision: "KE-110".to_string(),
            bill_postal_code: "00100".to_string(),
        }
    }
}

/// A payer recognised in the payment-mode field
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Insurer {
    /// Token as it appears in the export (matched case-insensitively)
    pub name: String,
    /// Customer display name in the ledger
    pub display_name: Option<String>,
}

impl Insurer {
    pub fn new(name: &str, display_name: Option<&str>) -> Self {
        Self {
            name: name.to_string(),
            display_name: display_name.map(str::to_string),
        }
    }

    pub fn matches(&self, token: &str) -> bool {
        self.name.trim().eq_ignore_ascii_case(token.trim())
    }
}

/// Complete sync configuration
#[derive(Debug, Clone, Default)]
pub struct SyncConfig {
    pub ledger: LedgerConfig,
    pub retry: RetryConfig,
    pub recovery: RecoveryConfig,
    pub pacing: PacingConfig,
    pub billing: BillingConfig,
    pub customer: CustomerDefaults,
    pub insurers: Vec<Insurer>,
}

/// Where the effective configuration came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    Embedded,
    Override(PathBuf),
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Embedded => write!(f, "built-in defaults"),
            Self::Override(p) => write!(f, "{}", p.display()),
        }
    }
}

impl SyncConfig {
    /// The embedded default configuration
    pub fn embedded() -> Result<Self> {
        let mut config = Self::default();
        apply_toml(&mut config, DEFAULT_CONFIG)?;
        Ok(config)
    }

    /// Load embedded defaults plus an override file, if any
    pub fn load(override_path: Option<&Path>) -> Result<(Self, ConfigSource)> {
        let mut config = Self::embedded()?;

        let path = match override_path {
            Some(p) => {
                if !p.exists() {
                    return Err(Error::Config(format!(
                        "Config file not found: {}",
                        p.display()
                    )));
                }
                Some(p.to_path_buf())
            }
            None => default_config_path().filter(|p| p.exists()),
        };

        match path {
            Some(path) => {
                let content = fs::read_to_string(&path)
                    .map_err(|e| Error::Config(format!("Failed to read config: {}", e)))?;
                apply_toml(&mut config, &content)?;
                Ok((config, ConfigSource::Override(path)))
            }
            None => Ok((config, ConfigSource::Embedded)),
        }
    }

    /// Apply QB_ENVIRONMENT / QB_BASE_URL from the process environment
    pub fn apply_env(&mut self) -> Result<()> {
        if let Ok(env) = std::env::var("QB_ENVIRONMENT") {
            self.ledger.environment = env.parse().map_err(Error::Config)?;
        }
        if let Ok(url) = std::env::var("QB_BASE_URL") {
            if !url.trim().is_empty() {
                self.ledger.base_url = Some(url);
            }
        }
        Ok(())
    }
}

/// Default config override path
pub fn default_config_path() -> Option<PathBuf> {
    dirs::data_local_dir().map(|d| d.join("clinicsync").join("config.toml"))
}

/// Raw config structure for TOML parsing
#[derive(Debug, Deserialize)]
struct RawConfig {
    ledger: Option<RawLedger>,
    retry: Option<RawRetry>,
    recovery: Option<RawRecovery>,
    pacing: Option<RawPacing>,
    billing: Option<RawBilling>,
    customer: Option<RawCustomer>,
    insurers: Option<Vec<Insurer>>,
}

#[derive(Debug, Deserialize)]
struct RawLedger {
    environment: Option<String>,
    base_url: Option<String>,
    timeout_secs: Option<u64>,
    minor_version: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct RawRetry {
    max_attempts: Option<u32>,
    initial_delay_ms: Option<u64>,
    max_delay_ms: Option<u64>,
    multiplier: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct RawRecovery {
    attempts: Option<u32>,
    delay_ms: Option<u64>,
    conflict_retries: Option<u32>,
    max_name_suffix: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct RawPacing {
    budget_ms: Option<u64>,
    min_delay_ms: Option<u64>,
    max_delay_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawBilling {
    tax_code: Option<String>,
    default_income_account: Option<String>,
    default_payment_method: Option<String>,
    income_accounts: Option<HashMap<String, String>>,
}

#[derive(Debug, Deserialize)]
struct RawCustomer {
    email_domain: Option<String>,
    phone: Option<String>,
    bill_line1: Option<String>,
    bill_city: Option<String>,
    bill_country: Option<String>,
    bill_subdivision: Option<String>,
    bill_postal_code: Option<String>,
}

/// Layer TOML content over an existing config
fn apply_toml(config: &mut SyncConfig, content: &str) -> Result<()> {
    let raw: RawConfig = toml::from_str(content)
        .map_err(|e| Error::Config(format!("Invalid config TOML: {}", e)))?;

    if let Some(ledger) = raw.ledger {
        if let Some(env) = ledger.environment {
            config.ledger.environment = env.parse().map_err(Error::Config)?;
        }
        if let Some(url) = ledger.base_url {
            config.ledger.base_url = Some(url);
        }
        if let Some(timeout) = ledger.timeout_secs {
            config.ledger.timeout = Duration::from_secs(timeout);
        }
        if let Some(minor) = ledger.minor_version {
            config.ledger.minor_version = Some(minor);
        }
    }

    if let Some(retry) = raw.retry {
        if let Some(attempts) = retry.max_attempts {
            config.retry.max_attempts = attempts.max(1);
        }
        if let Some(ms) = retry.initial_delay_ms {
            config.retry.initial_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = retry.max_delay_ms {
            config.retry.max_delay = Duration::from_millis(ms);
        }
        if let Some(m) = retry.multiplier {
            config.retry.multiplier = m;
        }
    }

    if let Some(recovery) = raw.recovery {
        if let Some(attempts) = recovery.attempts {
            config.recovery.attempts = attempts;
        }
        if let Some(ms) = recovery.delay_ms {
            config.recovery.delay = Duration::from_millis(ms);
        }
        if let Some(n) = recovery.conflict_retries {
            config.recovery.conflict_retries = n;
        }
        if let Some(n) = recovery.max_name_suffix {
            config.recovery.max_name_suffix = n;
        }
    }

    if let Some(pacing) = raw.pacing {
        if let Some(ms) = pacing.budget_ms {
            config.pacing.budget = Duration::from_millis(ms);
        }
        if let Some(ms) = pacing.min_delay_ms {
            config.pacing.min_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = pacing.max_delay_ms {
            config.pacing.max_delay = Duration::from_millis(ms);
        }
    }

    if let Some(billing) = raw.billing {
        if let Some(code) = billing.tax_code {
            config.billing.tax_code = code;
        }
        if let Some(account) = billing.default_income_account {
            config.billing.default_income_account = account;
        }
        if let Some(method) = billing.default_payment_method {
            config.billing.default_payment_method = method;
        }
        if let Some(accounts) = billing.income_accounts {
            for (category, account) in accounts {
                config
                    .billing
                    .income_accounts
                    .insert(normalize_category(&category), account);
            }
        }
    }

    if let Some(customer) = raw.customer {
        let c = &mut config.customer;
        if let Some(v) = customer.email_domain {
            c.email_domain = v;
        }
        if let Some(v) = customer.phone {
            c.phone = v;
        }
        if let Some(v) = customer.bill_line1 {
            c.bill_line1 = v;
        }
        if let Some(v) = customer.bill_city {
            c.bill_city = v;
        }
        if let Some(v) = customer.bill_country {
            c.bill_country = v;
        }
        if let Some(v) = customer.bill_subdivision {
            c.bill_subdivision = v;
        }
        if let Some(v) = customer.bill_postal_code {
            c.bill_postal_code = v;
        }
    }

    if let Some(insurers) = raw.insurers {
        config.insurers = insurers;
    }

    Ok(())
}
