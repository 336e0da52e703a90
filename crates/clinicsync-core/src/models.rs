//! Domain models for clinicsync

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Yes/No insurance marker from the export
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum InsuranceFlag {
    Yes,
    #[default]
    No,
}

impl InsuranceFlag {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Yes => "Yes",
            Self::No => "No",
        }
    }

    /// Lenient coercion: anything not recognisably "yes" is "No"
    pub fn coerce(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "yes" | "y" | "true" | "1" => Self::Yes,
            _ => Self::No,
        }
    }
}

impl std::fmt::Display for InsuranceFlag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One billed line from the export, normalized
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    /// 1-based data line in the source file
    pub line: usize,
    pub invoice_number: String,
    pub patient_name: String,
    pub patient_id: String,
    /// "Product / Service" column
    pub service_category: String,
    pub description: String,
    pub quantity: u32,
    pub unit_cost: Decimal,
    /// Authoritative over quantity × unit cost
    pub total_amount: Decimal,
    pub insurance: InsuranceFlag,
    pub payment_mode: String,
    pub service_date: Option<NaiveDate>,
    pub date_of_visit: Option<NaiveDate>,
    pub due_date: Option<NaiveDate>,
    pub terms: String,
    pub location: String,
    pub memo: String,
}

impl Row {
    /// Rows with a positive total produce a document line
    pub fn is_billable(&self) -> bool {
        self.total_amount > Decimal::ZERO
    }
}

/// All rows sharing one invoice number, in input order
#[derive(Debug, Clone, PartialEq)]
pub struct InvoiceGroup {
    pub invoice_number: String,
    pub rows: Vec<Row>,
}

impl InvoiceGroup {
    pub fn first(&self) -> Option<&Row> {
        self.rows.first()
    }

    /// Rows that will become lines, paired with their position in the group
    pub fn billable_rows(&self) -> impl Iterator<Item = (usize, &Row)> {
        self.rows.iter().enumerate().filter(|(_, r)| r.is_billable())
    }

    pub fn has_billable_rows(&self) -> bool {
        self.rows.iter().any(Row::is_billable)
    }

    /// Sum of billable totals
    pub fn billable_total(&self) -> Decimal {
        self.billable_rows().map(|(_, r)| r.total_amount).sum()
    }

    /// Transaction date: service date, else date of visit
    pub fn txn_date(&self) -> Option<NaiveDate> {
        let first = self.first()?;
        first.service_date.or(first.date_of_visit)
    }
}

/// Group rows by invoice number, preserving first-seen order
pub fn group_rows(rows: Vec<Row>) -> Vec<InvoiceGroup> {
    let mut groups: Vec<InvoiceGroup> = Vec::new();
    let mut index: std::collections::HashMap<String, usize> = std::collections::HashMap::new();

    for row in rows {
        if row.invoice_number.is_empty() {
            tracing::warn!(line = row.line, "Row has no invoice number, skipping");
            continue;
        }
        match index.get(&row.invoice_number) {
            Some(&i) => groups[i].rows.push(row),
            None => {
                index.insert(row.invoice_number.clone(), groups.len());
                groups.push(InvoiceGroup {
                    invoice_number: row.invoice_number.clone(),
                    rows: vec![row],
                });
            }
        }
    }

    groups
}

/// Remote document type for a group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    /// Insurance-billed, appendable across uploads
    Invoice,
    /// Cash-pay, paid at the point of sale
    SalesReceipt,
}

impl TransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Invoice => "invoice",
            Self::SalesReceipt => "sales_receipt",
        }
    }
}

impl std::fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Who a group is billed to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CustomerIdentity {
    Patient {
        display_name: String,
        given_name: String,
    },
    Insurer {
        display_name: String,
    },
}

impl CustomerIdentity {
    /// Patient identity: "<Title Name> ID <patient id>"
    pub fn patient(name: &str, patient_id: &str) -> Self {
        let name = title_case(&collapse_whitespace(name));
        let name = if name.is_empty() {
            "Unknown Patient".to_string()
        } else {
            name
        };
        let id = patient_id.trim();
        let id = if id.is_empty() { "UnknownID" } else { id };

        let given_name = name.split_whitespace().next().unwrap_or_default().to_string();
        Self::Patient {
            display_name: collapse_whitespace(&format!("{} ID {}", name, id)),
            given_name,
        }
    }

    pub fn insurer(display_name: &str) -> Self {
        Self::Insurer {
            display_name: collapse_whitespace(display_name),
        }
    }

    /// The sole identity key in the ledger
    pub fn display_name(&self) -> &str {
        match self {
            Self::Patient { display_name, .. } | Self::Insurer { display_name } => display_name,
        }
    }

    pub fn is_insurer(&self) -> bool {
        matches!(self, Self::Insurer { .. })
    }
}

/// One line of a billing document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    pub item_id: String,
    pub quantity: Decimal,
    pub unit_price: Decimal,
    pub amount: Decimal,
    pub description: String,
    pub tax_code: String,
    /// Day the charge was incurred; part of a line's identity when appending
    pub service_date: Option<NaiveDate>,
}

/// Stock movement implied by a dispensed line
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryAdjustment {
    pub item_id: String,
    pub item_name: String,
    pub quantity: u32,
}

/// Output of line building: document lines plus the stock side-output
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BuiltLines {
    pub lines: Vec<LineItem>,
    pub inventory_adjustments: Vec<InventoryAdjustment>,
}

/// Per-group status in a batch report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupStatus {
    Success,
    Error,
    Skipped,
}

impl GroupStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
            Self::Skipped => "skipped",
        }
    }
}

impl std::fmt::Display for GroupStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Result of processing one invoice group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupOutcome {
    pub invoice: String,
    pub status: GroupStatus,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<TransactionKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Lines added to an existing invoice (None for fresh documents)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub appended_lines: Option<usize>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub inventory_adjustments: Vec<InventoryAdjustment>,
}

impl GroupOutcome {
    pub fn success(invoice: &str, kind: TransactionKind, transaction_id: String) -> Self {
        Self {
            invoice: invoice.to_string(),
            status: GroupStatus::Success,
            kind: Some(kind),
            transaction_id: Some(transaction_id),
            error: None,
            appended_lines: None,
            inventory_adjustments: Vec::new(),
        }
    }

    pub fn error(invoice: &str, kind: Option<TransactionKind>, message: String) -> Self {
        Self {
            invoice: invoice.to_string(),
            status: GroupStatus::Error,
            kind,
            transaction_id: None,
            error: Some(message),
            appended_lines: None,
            inventory_adjustments: Vec::new(),
        }
    }

    pub fn skipped(invoice: &str, reason: &str) -> Self {
        Self {
            invoice: invoice.to_string(),
            status: GroupStatus::Skipped,
            kind: None,
            transaction_id: None,
            error: Some(reason.to_string()),
            appended_lines: None,
            inventory_adjustments: Vec::new(),
        }
    }
}

/// Outcome of one batch run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    /// False only when a batch-fatal error occurred
    pub success: bool,
    pub results: Vec<GroupOutcome>,
}

impl BatchReport {
    pub fn count(&self, status: GroupStatus) -> usize {
        self.results.iter().filter(|r| r.status == status).count()
    }

    /// True when every group either succeeded or was skipped
    pub fn all_succeeded(&self) -> bool {
        self.success && self.count(GroupStatus::Error) == 0
    }

    /// Human-readable processing log
    pub fn summary(&self) -> String {
        let mut out = String::new();
        for r in &self.results {
            let kind = r.kind.map(|k| k.as_str()).unwrap_or("-");
            match r.status {
                GroupStatus::Success => {
                    let mut line = format!(
                        "Invoice {}: success ({}) -> {}",
                        r.invoice,
                        kind,
                        r.transaction_id.as_deref().unwrap_or("?")
                    );
                    if let Some(n) = r.appended_lines {
                        line.push_str(&format!(" [{} line(s) appended]", n));
                    }
                    out.push_str(&line);
                }
                GroupStatus::Error => out.push_str(&format!(
                    "Invoice {}: error ({}): {}",
                    r.invoice,
                    kind,
                    r.error.as_deref().unwrap_or("unknown error")
                )),
                GroupStatus::Skipped => out.push_str(&format!(
                    "Invoice {}: skipped: {}",
                    r.invoice,
                    r.error.as_deref().unwrap_or("nothing to bill")
                )),
            }
            out.push('\n');
        }

        out.push_str(&format!(
            "Processed {} invoice(s): {} succeeded, {} failed, {} skipped",
            self.results.len(),
            self.count(GroupStatus::Success),
            self.count(GroupStatus::Error),
            self.count(GroupStatus::Skipped)
        ));
        if !self.success {
            out.push_str(" (batch aborted)");
        }
        out
    }
}

/// Collapse runs of whitespace to single spaces and trim
pub fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Title-case each word: first letter upper, rest lower
///
/// Letters after a non-letter also start a new word ("o'neil" -> "O'Neil").
pub fn title_case(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut prev_is_alpha = false;
    for c in s.chars() {
        if c.is_alphabetic() {
            if prev_is_alpha {
                out.extend(c.to_lowercase());
            } else {
                out.extend(c.to_uppercase());
            }
            prev_is_alpha = true;
        } else {
            out.push(c);
            prev_is_alpha = false;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn row(invoice: &str, total: &str) -> Row {
        Row {
            line: 1,
            invoice_number: invoice.to_string(),
            patient_name: "jane doe".to_string(),
            patient_id: "P1".to_string(),
            service_category: "Consultation".to_string(),
            description: "Consultation".to_string(),
            quantity: 1,
            unit_cost: Decimal::from_str(total).unwrap(),
            total_amount: Decimal::from_str(total).unwrap(),
            insurance: InsuranceFlag::No,
            payment_mode: "Cash".to_string(),
            service_date: None,
            date_of_visit: None,
            due_date: None,
            terms: String::new(),
            location: String::new(),
            memo: String::new(),
        }
    }

    #[test]
    fn test_insurance_flag_coerce() {
        assert_eq!(InsuranceFlag::coerce("YES"), InsuranceFlag::Yes);
        assert_eq!(InsuranceFlag::coerce(" y "), InsuranceFlag::Yes);
        assert_eq!(InsuranceFlag::coerce("true"), InsuranceFlag::Yes);
        assert_eq!(InsuranceFlag::coerce("No"), InsuranceFlag::No);
        assert_eq!(InsuranceFlag::coerce(""), InsuranceFlag::No);
        assert_eq!(InsuranceFlag::coerce("maybe"), InsuranceFlag::No);
    }

    #[test]
    fn test_group_rows_preserves_input_order() {
        let groups = group_rows(vec![
            row("200", "10"),
            row("100", "20"),
            row("200", "30"),
            row("", "40"),
        ]);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].invoice_number, "200");
        assert_eq!(groups[0].rows.len(), 2);
        assert_eq!(groups[1].invoice_number, "100");
    }

    #[test]
    fn test_billable_rows_excludes_zero_totals() {
        let group = InvoiceGroup {
            invoice_number: "1".to_string(),
            rows: vec![row("1", "0"), row("1", "50"), row("1", "-5")],
        };
        let billable: Vec<usize> = group.billable_rows().map(|(i, _)| i).collect();
        assert_eq!(billable, vec![1]);
        assert_eq!(group.billable_total(), Decimal::from(50));
    }

    #[test]
    fn test_patient_identity() {
        let id = CustomerIdentity::patient("  jane   WANJIKU doe ", " 4471 ");
        assert_eq!(id.display_name(), "Jane Wanjiku Doe ID 4471");
        match id {
            CustomerIdentity::Patient { given_name, .. } => assert_eq!(given_name, "Jane"),
            _ => panic!("expected patient"),
        }

        let unknown = CustomerIdentity::patient("", "");
        assert_eq!(unknown.display_name(), "Unknown Patient ID UnknownID");
    }

    #[test]
    fn test_title_case() {
        assert_eq!(title_case("paracetamol 500MG tabs"), "Paracetamol 500Mg Tabs");
        assert_eq!(title_case("x-ray chest"), "X-Ray Chest");
    }

    #[test]
    fn test_report_summary_counts() {
        let report = BatchReport {
            success: true,
            results: vec![
                GroupOutcome::success("1", TransactionKind::Invoice, "55".into()),
                GroupOutcome::error("2", None, "boom".into()),
                GroupOutcome::skipped("3", "no billable lines"),
            ],
        };
        let summary = report.summary();
        assert!(summary.contains("Invoice 1: success (invoice) -> 55"));
        assert!(summary.contains("Invoice 2: error (-): boom"));
        assert!(summary.contains("1 succeeded, 1 failed, 1 skipped"));
        assert!(!report.all_succeeded());
    }

    #[test]
    fn test_outcome_serializes_to_result_shape() {
        let outcome = GroupOutcome::success("1001", TransactionKind::SalesReceipt, "77".into());
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["invoice"], "1001");
        assert_eq!(json["status"], "success");
        assert_eq!(json["type"], "sales_receipt");
        assert_eq!(json["transaction_id"], "77");
        assert!(json.get("error").is_none());
    }
}
