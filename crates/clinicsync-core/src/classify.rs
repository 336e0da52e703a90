//! Transaction classification
//!
//! Decides whether an invoice group is billed to an insurer (invoice) or
//! paid at the point of sale (sales receipt).

use tracing::warn;

use crate::config::{Insurer, SyncConfig};
use crate::models::{
    title_case, CustomerIdentity, InsuranceFlag, InvoiceGroup, TransactionKind,
};

/// Classifies invoice groups against the configured insurer list
#[derive(Debug, Clone)]
pub struct Classifier {
    insurers: Vec<Insurer>,
}

impl Classifier {
    pub fn new(insurers: Vec<Insurer>) -> Self {
        Self { insurers }
    }

    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(config.insurers.clone())
    }

    /// First payment-mode token of the first row that names a known insurer
    pub fn extract_insurer(&self, group: &InvoiceGroup) -> Option<&Insurer> {
        let first = group.first()?;
        payment_tokens(&first.payment_mode)
            .find_map(|token| self.insurers.iter().find(|i| i.matches(token)))
    }

    /// Flagged as insurance and an insurer is resolvable
    pub fn is_insurance(&self, group: &InvoiceGroup) -> bool {
        flagged(group) && self.extract_insurer(group).is_some()
    }

    pub fn classify(&self, group: &InvoiceGroup) -> TransactionKind {
        if !flagged(group) {
            return TransactionKind::SalesReceipt;
        }

        if self.extract_insurer(group).is_some() {
            TransactionKind::Invoice
        } else {
            let mode = group.first().map(|r| r.payment_mode.as_str()).unwrap_or("");
            warn!(
                invoice = %group.invoice_number,
                payment_mode = %mode,
                "Insurance flagged but no known insurer found, billing as cash"
            );
            TransactionKind::SalesReceipt
        }
    }

    /// Who the group's document is billed to
    pub fn customer_identity(&self, group: &InvoiceGroup, kind: TransactionKind) -> CustomerIdentity {
        if kind == TransactionKind::Invoice {
            if let Some(insurer) = self.extract_insurer(group) {
                let name = insurer
                    .display_name
                    .clone()
                    .unwrap_or_else(|| title_case(insurer.name.trim()));
                return CustomerIdentity::insurer(&name);
            }
        }

        match group.first() {
            Some(row) => CustomerIdentity::patient(&row.patient_name, &row.patient_id),
            None => CustomerIdentity::patient("", ""),
        }
    }
}

fn flagged(group: &InvoiceGroup) -> bool {
    group.rows.iter().any(|r| r.insurance == InsuranceFlag::Yes)
}

/// Comma-separated payment-mode tokens, trimmed, empties dropped
pub fn payment_tokens(mode: &str) -> impl Iterator<Item = &str> {
    mode.split(',').map(str::trim).filter(|t| !t.is_empty())
}
