//! Document building and upserting
//!
//! Invoices (insurance) are keyed by invoice number and appended to across
//! uploads, so multi-day stays can arrive in several batches. Sales receipts
//! (cash) are created once per invoice number.

use std::collections::HashMap;
use std::time::Duration;

use backoff::backoff::Backoff;
use chrono::{Local, NaiveDate};
use rust_decimal::Decimal;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::config::{normalize_category, SyncConfig};
use crate::error::{Error, Result};
use crate::ledger::{value_to_string, CreateOutcome, LedgerClient, Query, RemoteResult, Resource, ResourceType};
use crate::models::{
    collapse_whitespace, title_case, BuiltLines, InventoryAdjustment, InvoiceGroup, LineItem,
    TransactionKind,
};
use crate::money::{from_json_value, round_cents, to_json_number};
use crate::resolve::ItemRef;

const MAX_PRIVATE_NOTE: usize = 4000;
const MAX_LINE_DESCRIPTION: usize = 4000;

/// Build document lines for a group
///
/// `items` maps a row's index within the group to its resolved item. Rows with
/// a non-positive total produce no line.
pub fn build_lines(
    group: &InvoiceGroup,
    kind: TransactionKind,
    items: &HashMap<usize, ItemRef>,
    tax_code: &str,
) -> Result<BuiltLines> {
    let mut built = BuiltLines::default();

    for (index, row) in group.rows.iter().enumerate() {
        if !row.is_billable() {
            debug!(
                invoice = %group.invoice_number,
                line = row.line,
                total = %row.total_amount,
                "Skipping non-billable row"
            );
            continue;
        }

        let item = items.get(&index).ok_or_else(|| {
            Error::InvalidData(format!(
                "No item resolved for row {} of invoice {}",
                row.line, group.invoice_number
            ))
        })?;

        let service_date = row.service_date.or(row.date_of_visit);
        let description = if row.description.trim().is_empty() {
            collapse_whitespace(&row.service_category)
        } else {
            collapse_whitespace(&row.description)
        };

        let line = match kind {
            TransactionKind::Invoice => {
                let total = round_cents(row.total_amount);
                let mut parts: Vec<String> = Vec::new();
                if !description.is_empty() {
                    parts.push(description);
                }
                if row.quantity != 1 {
                    parts.push(format!("Qty: {}", row.quantity));
                }
                LineItem {
                    item_id: item.id.clone(),
                    quantity: Decimal::ONE,
                    unit_price: total,
                    amount: total,
                    description: parts.join(" | "),
                    tax_code: tax_code.to_string(),
                    service_date,
                }
            }
            TransactionKind::SalesReceipt => {
                let quantity = Decimal::from(row.quantity);
                let unit_price = if row.unit_cost > Decimal::ZERO {
                    row.unit_cost
                } else {
                    round_cents(row.total_amount / quantity)
                };
                LineItem {
                    item_id: item.id.clone(),
                    quantity,
                    unit_price,
                    amount: round_cents(quantity * unit_price),
                    description,
                    tax_code: tax_code.to_string(),
                    service_date,
                }
            }
        };
        built.lines.push(line);

        if normalize_category(&row.service_category) == "pharmacy" {
            built.inventory_adjustments.push(InventoryAdjustment {
                item_id: item.id.clone(),
                item_name: item.name.clone(),
                quantity: row.quantity,
            });
        }
    }

    Ok(built)
}

/// JSON body for one sales line
pub fn line_json(line: &LineItem, line_num: u32) -> Value {
    let description: String = line.description.chars().take(MAX_LINE_DESCRIPTION).collect();
    let mut detail = json!({
        "ItemRef": { "value": line.item_id },
        "Qty": to_json_number(line.quantity),
        "UnitPrice": to_json_number(line.unit_price),
        "TaxCodeRef": { "value": line.tax_code },
    });
    if let (Some(date), Some(map)) = (line.service_date, detail.as_object_mut()) {
        map.insert("ServiceDate".into(), json!(format_date(date)));
    }

    json!({
        "LineNum": line_num,
        "DetailType": "SalesItemLineDetail",
        "Amount": to_json_number(line.amount),
        "Description": description,
        "SalesItemLineDetail": detail,
    })
}

/// Identity of a line for append dedup: item, amount, quantity, description, service date
type LineKey = (String, String, String, String, String);

fn key_of(item_id: &str, amount: Decimal, quantity: Decimal, description: &str, service_date: &str) -> LineKey {
    (
        item_id.to_string(),
        round_cents(amount).normalize().to_string(),
        quantity.normalize().to_string(),
        collapse_whitespace(description),
        service_date.trim().to_string(),
    )
}

fn existing_line_key(line: &Value) -> Option<LineKey> {
    let detail = line.get("SalesItemLineDetail")?;
    let item_id = value_to_string(&detail["ItemRef"]["value"]);
    let description = line.get("Description").and_then(Value::as_str).unwrap_or("");
    Some(key_of(
        &item_id,
        from_json_value(&line["Amount"]),
        from_json_value(&detail["Qty"]),
        description,
        &value_to_string(&detail["ServiceDate"]),
    ))
}

fn new_line_key(line: &LineItem) -> LineKey {
    let description: String = line.description.chars().take(MAX_LINE_DESCRIPTION).collect();
    let service_date = line.service_date.map(format_date).unwrap_or_default();
    key_of(&line.item_id, line.amount, line.quantity, &description, &service_date)
}

/// Highest line number already used on a document
fn max_line_number(lines: &[Value]) -> u32 {
    lines
        .iter()
        .flat_map(|l| [&l["Id"], &l["LineNum"]])
        .filter_map(|v| value_to_string(v).parse::<u32>().ok())
        .max()
        .unwrap_or(0)
}

/// Merge new lines into an existing document's lines
///
/// Lines already present (counted as a multiset) are not appended again. New
/// lines are numbered after the current maximum. Returns the merged list and
/// how many lines were appended.
pub fn plan_append(existing: &[Value], new_lines: &[LineItem]) -> (Vec<Value>, usize) {
    let mut present: HashMap<LineKey, usize> = HashMap::new();
    for key in existing.iter().filter_map(existing_line_key) {
        *present.entry(key).or_insert(0) += 1;
    }

    let mut merged: Vec<Value> = existing.to_vec();
    let mut next = max_line_number(existing);
    let mut appended = 0;

    for line in new_lines {
        if let Some(count) = present.get_mut(&new_line_key(line)) {
            if *count > 0 {
                *count -= 1;
                continue;
            }
        }
        next += 1;
        merged.push(line_json(line, next));
        appended += 1;
    }

    (merged, appended)
}

/// What happened to a group's document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentOutcome {
    pub id: String,
    /// Lines appended to an existing invoice; `None` for new documents
    pub appended_lines: Option<usize>,
    /// A document for this invoice number was already in the ledger
    pub already_existed: bool,
}

/// Writes invoices and sales receipts
#[derive(Debug, Clone)]
pub struct DocumentWriter {
    client: LedgerClient,
    conflict_retries: u32,
}

impl DocumentWriter {
    pub fn new(client: LedgerClient, config: &SyncConfig) -> Self {
        Self {
            client,
            conflict_retries: config.recovery.conflict_retries,
        }
    }

    async fn find_by_doc_number(&self, resource_type: ResourceType, number: &str) -> Result<Option<Resource>> {
        let query = Query::select(resource_type)
            .where_eq("DocNumber", number)
            .max_results(2);
        self.client.query_one(&query).await
    }

    /// Create the invoice, or append new lines to the existing one
    pub async fn upsert_invoice(
        &self,
        group: &InvoiceGroup,
        customer_id: &str,
        built: &BuiltLines,
    ) -> Result<DocumentOutcome> {
        let number = &group.invoice_number;

        let Some(mut existing) = self.find_by_doc_number(ResourceType::Invoice, number).await? else {
            let payload = document_payload(group, TransactionKind::Invoice, customer_id, built, None);
            let created = self.create(ResourceType::Invoice, number, &payload).await?;
            info!(invoice = %number, id = %created.id(), lines = built.lines.len(), "Created invoice");
            return Ok(DocumentOutcome {
                id: created.id(),
                appended_lines: None,
                already_existed: false,
            });
        };

        let mut attempt = 0;
        loop {
            let (merged, appended) = plan_append(existing.lines(), &built.lines);
            if appended == 0 {
                info!(invoice = %number, id = %existing.id(), "Invoice already has every line, nothing to append");
                return Ok(DocumentOutcome {
                    id: existing.id(),
                    appended_lines: Some(0),
                    already_existed: true,
                });
            }

            let id = existing.id();
            let result = self
                .client
                .update(ResourceType::Invoice, &id, &existing.sync_token(), &json!({ "Line": merged }))
                .await;

            match result {
                Ok(updated) => {
                    info!(invoice = %number, id = %updated.id(), appended, "Appended lines to invoice");
                    return Ok(DocumentOutcome {
                        id: updated.id(),
                        appended_lines: Some(appended),
                        already_existed: true,
                    });
                }
                Err(Error::Conflict { .. }) if attempt < self.conflict_retries => {
                    attempt += 1;
                    warn!(invoice = %number, id = %id, attempt, "Stale invoice version, re-reading");
                    existing = match self.client.read(ResourceType::Invoice, &id).await? {
                        RemoteResult::Ok(fresh) => fresh,
                        RemoteResult::Fault(fault) => return Err(fault.into_error(400)),
                        RemoteResult::Empty => {
                            return Err(Error::InvalidData(format!("Invoice {} vanished on re-read", id)))
                        }
                    };
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Create a sales receipt unless one already exists for the invoice number
    pub async fn create_receipt(
        &self,
        group: &InvoiceGroup,
        customer_id: &str,
        built: &BuiltLines,
        payment_method_id: Option<&str>,
    ) -> Result<DocumentOutcome> {
        let number = &group.invoice_number;

        if let Some(existing) = self.find_by_doc_number(ResourceType::SalesReceipt, number).await? {
            info!(invoice = %number, id = %existing.id(), "Sales receipt already exists, not creating another");
            return Ok(DocumentOutcome {
                id: existing.id(),
                appended_lines: None,
                already_existed: true,
            });
        }

        let payload = document_payload(
            group,
            TransactionKind::SalesReceipt,
            customer_id,
            built,
            payment_method_id,
        );
        let created = self.create(ResourceType::SalesReceipt, number, &payload).await?;
        info!(invoice = %number, id = %created.id(), lines = built.lines.len(), "Created sales receipt");
        Ok(DocumentOutcome {
            id: created.id(),
            appended_lines: None,
            already_existed: false,
        })
    }

    /// POST a new document; after a transient failure, look it up by number
    /// before posting again, since the failed attempt may have committed
    async fn create(&self, resource_type: ResourceType, number: &str, payload: &Value) -> Result<Resource> {
        let mut backoff = self.client.backoff();
        let mut attempt = 1;

        loop {
            match self.client.create_once(resource_type, payload).await {
                Ok(CreateOutcome::Created(resource)) => return Ok(resource),
                Ok(CreateOutcome::AlreadyExists(fault)) => return Err(fault.into_error(400)),
                Ok(CreateOutcome::Failed(e)) => return Err(e),
                Err(e) if e.is_transient() => {
                    warn!(
                        resource = %resource_type,
                        invoice = %number,
                        attempt,
                        error = %e,
                        "Create failed, checking whether it landed"
                    );
                    if let Some(landed) = self.find_by_doc_number(resource_type, number).await? {
                        info!(resource = %resource_type, invoice = %number, id = %landed.id(), "Failed create had landed");
                        return Ok(landed);
                    }
                    if attempt >= self.client.max_attempts() {
                        return Err(e);
                    }
                    let delay = backoff.next_backoff().unwrap_or(Duration::ZERO);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Full body for a new invoice or sales receipt
pub fn document_payload(
    group: &InvoiceGroup,
    kind: TransactionKind,
    customer_id: &str,
    built: &BuiltLines,
    payment_method_id: Option<&str>,
) -> Value {
    let lines: Vec<Value> = built
        .lines
        .iter()
        .zip(1..)
        .map(|(line, n)| line_json(line, n))
        .collect();

    let patient = group
        .first()
        .map(|r| title_case(&collapse_whitespace(&r.patient_name)))
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| "Unknown Patient".to_string());

    let mut payload = json!({
        "DocNumber": group.invoice_number,
        "CustomerRef": { "value": customer_id },
        "TxnDate": format_date(group.txn_date().unwrap_or_else(|| Local::now().date_naive())),
        "Line": lines,
        "CustomerMemo": { "value": format!("Medical service for {}", patient) },
    });

    if let Some(map) = payload.as_object_mut() {
        if kind == TransactionKind::Invoice {
            if let Some(due) = group.first().and_then(|r| r.due_date) {
                map.insert("DueDate".into(), json!(format_date(due)));
            }
        }

        if let Some(method) = payment_method_id {
            map.insert("PaymentMethodRef".into(), json!({ "value": method }));
        }

        if let Some(note) = private_note(group, &built.inventory_adjustments) {
            map.insert("PrivateNote".into(), json!(note));
        }
    }

    payload
}

/// Row memo plus a summary of dispensed stock
fn private_note(group: &InvoiceGroup, adjustments: &[InventoryAdjustment]) -> Option<String> {
    let mut parts = Vec::new();

    if let Some(memo) = group.first().map(|r| r.memo.trim()).filter(|m| !m.is_empty()) {
        parts.push(memo.to_string());
    }

    if !adjustments.is_empty() {
        let dispensed: Vec<String> = adjustments
            .iter()
            .map(|a| format!("{} x{}", a.item_name, a.quantity))
            .collect();
        parts.push(format!("Inventory: {}", dispensed.join("; ")));
    }

    if parts.is_empty() {
        None
    } else {
        Some(parts.join("\n").chars().take(MAX_PRIVATE_NOTE).collect())
    }
}

fn format_date(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}
