//! Batch orchestration
//!
//! Invoice groups are processed one at a time, in input order. A failing group
//! is recorded and the batch moves on; only batch-fatal errors (authentication)
//! stop it, and then the remaining groups are reported as not attempted.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::auth::AuthProvider;
use crate::classify::Classifier;
use crate::config::SyncConfig;
use crate::documents::{build_lines, DocumentWriter};
use crate::error::Result;
use crate::import::parse_file;
use crate::ledger::LedgerClient;
use crate::models::{
    group_rows, BatchReport, GroupOutcome, GroupStatus, InvoiceGroup, Row, TransactionKind,
};
use crate::resolve::{EntityResolver, ItemRef, ResolutionCache};

/// Drives a batch of invoice groups into the ledger
pub struct BatchSync {
    config: SyncConfig,
    classifier: Classifier,
    resolver: EntityResolver,
    writer: DocumentWriter,
}

impl BatchSync {
    pub fn new(config: SyncConfig, auth: Arc<dyn AuthProvider>) -> Result<Self> {
        let client = LedgerClient::new(&config, auth)?;
        Ok(Self::with_client(config, client))
    }

    pub fn with_client(config: SyncConfig, client: LedgerClient) -> Self {
        Self {
            classifier: Classifier::from_config(&config),
            resolver: EntityResolver::new(client.clone(), &config),
            writer: DocumentWriter::new(client, &config),
            config,
        }
    }

    /// Parse an export and sync it
    ///
    /// Parse and schema errors are returned before any remote call is made.
    pub async fn sync_file(&self, path: &Path) -> Result<BatchReport> {
        let rows = parse_file(path)?;
        Ok(self.sync_rows(rows).await)
    }

    pub async fn sync_rows(&self, rows: Vec<Row>) -> BatchReport {
        let groups = group_rows(rows);
        self.sync_groups(&groups).await
    }

    pub async fn sync_groups(&self, groups: &[InvoiceGroup]) -> BatchReport {
        let mut cache = ResolutionCache::new();
        let mut results = Vec::with_capacity(groups.len());
        let delay = self.config.pacing.delay_for(groups.len());
        let mut fatal: Option<String> = None;

        info!(groups = groups.len(), delay_ms = delay.as_millis() as u64, "Starting batch");

        for group in groups {
            if let Some(reason) = &fatal {
                results.push(GroupOutcome::error(
                    &group.invoice_number,
                    None,
                    format!("not attempted: {}", reason),
                ));
                continue;
            }

            let kind = self.classifier.classify(group);
            match self.process_group(&mut cache, group, kind, delay).await {
                Ok(outcome) => results.push(outcome),
                Err(e) => {
                    error!(invoice = %group.invoice_number, kind = %kind, error = %e, "Invoice failed");
                    if e.is_fatal() {
                        fatal = Some(e.to_string());
                    }
                    results.push(GroupOutcome::error(&group.invoice_number, Some(kind), e.to_string()));
                }
            }
        }

        let report = BatchReport {
            success: fatal.is_none(),
            results,
        };
        info!(
            groups = report.results.len(),
            succeeded = report.count(GroupStatus::Success),
            failed = report.count(GroupStatus::Error),
            success = report.success,
            "Batch finished"
        );
        report
    }

    async fn process_group(
        &self,
        cache: &mut ResolutionCache,
        group: &InvoiceGroup,
        kind: TransactionKind,
        delay: std::time::Duration,
    ) -> Result<GroupOutcome> {
        let invoice = &group.invoice_number;

        if !group.has_billable_rows() {
            warn!(invoice = %invoice, "No billable lines, skipping");
            return Ok(GroupOutcome::skipped(invoice, "no billable lines"));
        }

        let identity = self.classifier.customer_identity(group, kind);
        let customer_id = self.resolver.resolve_customer(cache, &identity).await?;
        info!(invoice = %invoice, kind = %kind, customer = %identity.display_name(), customer_id = %customer_id, "Resolved customer");

        tokio::time::sleep(delay).await;

        let mut items: HashMap<usize, ItemRef> = HashMap::new();
        for (index, row) in group.billable_rows() {
            let item = self
                .resolver
                .resolve_item(cache, &row.service_category, &row.description)
                .await?;
            items.insert(index, item);
        }

        let built = build_lines(group, kind, &items, &self.config.billing.tax_code)?;
        if built.lines.is_empty() {
            return Ok(GroupOutcome::skipped(invoice, "no billable lines"));
        }

        let document = match kind {
            TransactionKind::Invoice => self.writer.upsert_invoice(group, &customer_id, &built).await?,
            TransactionKind::SalesReceipt => {
                let mode = group.first().map(|r| r.payment_mode.as_str()).unwrap_or("");
                let method = self.resolver.resolve_payment_method(cache, mode).await?;
                self.writer
                    .create_receipt(group, &customer_id, &built, method.as_deref())
                    .await?
            }
        };

        let mut outcome = GroupOutcome::success(invoice, kind, document.id);
        outcome.appended_lines = document.appended_lines;
        outcome.inventory_adjustments = built.inventory_adjustments;
        Ok(outcome)
    }
}

/// What a sync would do for one group, without touching the ledger
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlannedGroup {
    pub invoice: String,
    #[serde(rename = "type")]
    pub kind: TransactionKind,
    pub customer: String,
    pub insurer: Option<String>,
    pub rows: usize,
    pub billable_lines: usize,
    pub total: Decimal,
}

/// Classify groups and work out their customers offline
pub fn plan(config: &SyncConfig, groups: &[InvoiceGroup]) -> Vec<PlannedGroup> {
    let classifier = Classifier::from_config(config);
    groups
        .iter()
        .map(|group| {
            let kind = classifier.classify(group);
            PlannedGroup {
                invoice: group.invoice_number.clone(),
                kind,
                customer: classifier
                    .customer_identity(group, kind)
                    .display_name()
                    .to_string(),
                insurer: classifier
                    .extract_insurer(group)
                    .filter(|_| kind == TransactionKind::Invoice)
                    .map(|i| i.name.clone()),
                rows: group.rows.len(),
                billable_lines: group.billable_rows().count(),
                total: group.billable_total(),
            }
        })
        .collect()
}
