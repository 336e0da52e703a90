//! Clinicsync Core Library
//!
//! Shared functionality for syncing clinic billing exports into an accounting ledger:
//! - Billing export parsing with header synonyms and lenient money/date coercion
//! - Insurance vs cash classification against a configured insurer list
//! - Ledger REST client with retry, response sanitizing and typed faults
//! - Find-or-create resolution for customers, items and payment methods
//! - Invoice upsert with line append, sales receipts with dedup
//! - Sequential batch orchestration with per-invoice outcomes

pub mod auth;
pub mod classify;
pub mod config;
pub mod documents;
pub mod error;
pub mod import;
pub mod ledger;
pub mod models;
pub mod money;
pub mod resolve;
pub mod sync;

/// Test utilities including mock ledger server
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use auth::{AuthProvider, StaticTokenAuth};
pub use classify::Classifier;
pub use config::{ConfigSource, Environment, Insurer, SyncConfig};
pub use documents::{build_lines, DocumentOutcome, DocumentWriter};
pub use error::{Error, Result};
pub use import::{parse_file, parse_reader, parse_str};
pub use ledger::{CreateOutcome, Fault, LedgerClient, Query, RemoteResult, Resource, ResourceType};
pub use models::{
    group_rows, BatchReport, BuiltLines, CustomerIdentity, GroupOutcome, GroupStatus,
    InsuranceFlag, InventoryAdjustment, InvoiceGroup, LineItem, Row, TransactionKind,
};
pub use resolve::{EntityResolver, ItemRef, ResolutionCache};
pub use sync::{plan, BatchSync, PlannedGroup};
