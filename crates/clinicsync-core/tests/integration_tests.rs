//! Integration tests for clinicsync-core
//!
//! These tests exercise the full parse → classify → resolve → write workflow
//! against the in-process mock ledger.

use clinicsync_core::{
    ledger::ResourceType,
    models::{GroupStatus, TransactionKind},
    parse_str,
    test_utils::{fast_config, MockLedgerServer},
    BatchSync, Error, LedgerClient, SyncConfig,
};
use serde_json::Value;

/// Three invoices: insured (CIC), cash (MPESA), insured (Jubilee)
fn three_invoice_export() -> &'static str {
    "Invoice No.\tPatient Name\tPatient ID\tProduct / Service\tDescription\tIs Insurance?\tMode of Payment\tQuantity\tUnit Cost\tTotal Amount\tService Date\n\
     1001\tjane doe\t4471\tConsultation\t\tYes\tCIC,\t1\t1500\t1,500.00\t2025-01-15\n\
     1001\tjane doe\t4471\tPharmacy\tAmoxicillin 500mg\tYes\tCIC,\t3\t100.00\t330.00\t2025-01-15\n\
     1002\tjohn kamau\t88\tLaboratory\tMalaria test\tNo\tMPESA\t1\t800\t800\t2025-01-15\n\
     1002\tjohn kamau\t88\tConsultation\tReview\tNo\tMPESA\t1\t0\t0\t2025-01-15\n\
     1003\tann wanjiru\t91\tConsultation\t\tYes\tJUBILEE INSURANCE\t1\t2000\t2000\t2025-01-16\n"
}

fn sync(server: &MockLedgerServer) -> BatchSync {
    let config = fast_config(&server.url());
    let client = LedgerClient::new(&config, server.auth()).unwrap();
    BatchSync::with_client(config, client)
}

fn lines_of(doc: &Value) -> Vec<&Value> {
    doc["Line"]
        .as_array()
        .map(|lines| {
            lines
                .iter()
                .filter(|l| l["DetailType"] == "SalesItemLineDetail")
                .collect()
        })
        .unwrap_or_default()
}

// =============================================================================
// End-to-end sync
// =============================================================================

#[tokio::test]
async fn test_full_sync_workflow() {
    let server = MockLedgerServer::start().await;
    let rows = parse_str(three_invoice_export()).unwrap();
    assert_eq!(rows.len(), 5);

    let report = sync(&server).sync_rows(rows).await;

    assert!(report.success);
    assert!(report.all_succeeded());
    let kinds: Vec<_> = report.results.iter().map(|r| r.kind).collect();
    assert_eq!(
        kinds,
        vec![
            Some(TransactionKind::Invoice),
            Some(TransactionKind::SalesReceipt),
            Some(TransactionKind::Invoice),
        ]
    );

    assert_eq!(server.count(ResourceType::Invoice), 2);
    assert_eq!(server.count(ResourceType::SalesReceipt), 1);

    // insurers are the invoice customers, the cash patient the receipt customer
    let cic = server
        .find(ResourceType::Customer, "DisplayName", "Cic Insurance Ltd")
        .expect("CIC customer");
    assert_eq!(cic["CompanyName"], "Cic Insurance Ltd");
    assert!(server
        .find(ResourceType::Customer, "DisplayName", "John Kamau ID 88")
        .is_some());

    let invoice = server
        .find(ResourceType::Invoice, "DocNumber", "1001")
        .unwrap();
    assert_eq!(invoice["CustomerRef"]["value"], cic["Id"]);
    assert_eq!(invoice["TxnDate"], "2025-01-15");
    assert_eq!(invoice["CustomerMemo"]["value"], "Medical service for Jane Doe");
    assert_eq!(lines_of(&invoice).len(), 2);

    let receipt = server
        .find(ResourceType::SalesReceipt, "DocNumber", "1002")
        .unwrap();
    // zero-total review row is not billed
    assert_eq!(lines_of(&receipt).len(), 1);
    assert!(receipt["PaymentMethodRef"]["value"].is_string());

    let summary = report.summary();
    assert!(summary.contains("3 succeeded, 0 failed, 0 skipped"));
}

#[tokio::test]
async fn test_insurance_line_shape() {
    let server = MockLedgerServer::start().await;
    let rows = parse_str(three_invoice_export()).unwrap();
    sync(&server).sync_rows(rows).await;

    let invoice = server
        .find(ResourceType::Invoice, "DocNumber", "1001")
        .unwrap();
    let pharmacy = lines_of(&invoice)
        .into_iter()
        .find(|l| {
            l["Description"]
                .as_str()
                .is_some_and(|d| d.contains("Amoxicillin"))
        })
        .expect("pharmacy line");

    let detail = &pharmacy["SalesItemLineDetail"];
    assert_eq!(detail["Qty"], 1.0);
    assert_eq!(detail["UnitPrice"], 330.0);
    assert_eq!(pharmacy["Amount"], 330.0);
    assert!(pharmacy["Description"]
        .as_str()
        .unwrap()
        .contains("Qty: 3"));
    assert_eq!(detail["TaxCodeRef"]["value"], "6");

    // dispensed stock is recorded in the private note
    assert!(invoice["PrivateNote"]
        .as_str()
        .unwrap()
        .contains("Amoxicillin 500Mg x3"));
}

#[tokio::test]
async fn test_partial_failure_keeps_batch_successful() {
    let server = MockLedgerServer::start().await;
    // group 2's customer can never be created or found
    server.reject_create("John Kamau ID 88");

    let rows = parse_str(three_invoice_export()).unwrap();
    let report = sync(&server).sync_rows(rows).await;

    assert!(report.success);
    assert!(!report.all_succeeded());
    let statuses: Vec<(&str, GroupStatus)> = report
        .results
        .iter()
        .map(|r| (r.invoice.as_str(), r.status))
        .collect();
    assert_eq!(
        statuses,
        vec![
            ("1001", GroupStatus::Success),
            ("1002", GroupStatus::Error),
            ("1003", GroupStatus::Success),
        ]
    );
    assert!(report.results[1]
        .error
        .as_deref()
        .unwrap()
        .contains("Reconciliation"));
    assert_eq!(server.count(ResourceType::SalesReceipt), 0);
}

#[tokio::test]
async fn test_auth_failure_aborts_batch() {
    let server = MockLedgerServer::start().await;
    server.reject_tokens(true);

    let rows = parse_str(three_invoice_export()).unwrap();
    let report = sync(&server).sync_rows(rows).await;

    assert!(!report.success);
    assert_eq!(report.count(GroupStatus::Error), 3);
    assert!(report.results[1]
        .error
        .as_deref()
        .unwrap()
        .starts_with("not attempted"));
    // only the first group's customer lookup reached the server
    assert_eq!(server.request_count(), 1);
    assert!(report.summary().ends_with("(batch aborted)"));
}

// =============================================================================
// Idempotence across re-runs
// =============================================================================

#[tokio::test]
async fn test_rerun_creates_nothing_new() {
    let server = MockLedgerServer::start().await;
    let engine = sync(&server);

    let first = engine
        .sync_rows(parse_str(three_invoice_export()).unwrap())
        .await;
    let second = engine
        .sync_rows(parse_str(three_invoice_export()).unwrap())
        .await;

    assert!(second.all_succeeded());
    assert_eq!(server.count(ResourceType::Invoice), 2);
    assert_eq!(server.count(ResourceType::SalesReceipt), 1);
    assert_eq!(server.count(ResourceType::Customer), 3);

    // same documents reported both times
    for (a, b) in first.results.iter().zip(&second.results) {
        assert_eq!(a.transaction_id, b.transaction_id);
    }
    // invoices already had every line: no update calls
    assert_eq!(server.update_count(), 0);
    assert_eq!(second.results[0].appended_lines, Some(0));

    let invoice = server
        .find(ResourceType::Invoice, "DocNumber", "1001")
        .unwrap();
    assert_eq!(lines_of(&invoice).len(), 2);
}

#[tokio::test]
async fn test_later_upload_appends_to_invoice() {
    let server = MockLedgerServer::start().await;
    let engine = sync(&server);
    let header = "Invoice No.,Patient Name,Patient ID,Product / Service,Description,Is Insurance?,Mode of Payment,Quantity,Unit Cost,Total Amount,Service Date\n";

    let day_one = format!(
        "{}7001,peter otieno,12,Inpatient,Ward day 1,Yes,CIC,1,3000,3000,2025-03-01\n",
        header
    );
    let day_two = format!(
        "{}7001,peter otieno,12,Inpatient,Ward day 1,Yes,CIC,1,3000,3000,2025-03-01\n\
         7001,peter otieno,12,Inpatient,Ward day 2,Yes,CIC,1,3000,3000,2025-03-02\n\
         7001,peter otieno,12,Laboratory,Urinalysis,Yes,CIC,1,450,450,2025-03-02\n",
        header
    );

    let first = engine.sync_rows(parse_str(&day_one).unwrap()).await;
    let second = engine.sync_rows(parse_str(&day_two).unwrap()).await;

    assert!(first.all_succeeded() && second.all_succeeded());
    assert_eq!(server.count(ResourceType::Invoice), 1);
    assert_eq!(second.results[0].appended_lines, Some(2));
    assert_eq!(first.results[0].transaction_id, second.results[0].transaction_id);

    let invoice = server
        .find(ResourceType::Invoice, "DocNumber", "7001")
        .unwrap();
    let lines = lines_of(&invoice);
    assert_eq!(lines.len(), 3);
    let ids: Vec<String> = lines
        .iter()
        .map(|l| l["Id"].as_str().unwrap_or_default().to_string())
        .collect();
    assert_eq!(ids, vec!["1", "2", "3"]);
    assert_eq!(invoice["SyncToken"], "1");
}

#[tokio::test]
async fn test_daily_charge_on_a_new_day_is_appended() {
    let server = MockLedgerServer::start().await;
    let engine = sync(&server);
    let header = "Invoice No.,Patient Name,Patient ID,Product / Service,Description,Is Insurance?,Mode of Payment,Quantity,Unit Cost,Total Amount,Service Date\n";
    let bed_day = |date: &str| {
        format!("7101,peter otieno,12,Inpatient,Bed charges,Yes,CIC,1,3000,3000,{}\n", date)
    };

    let first = engine
        .sync_rows(parse_str(&format!("{}{}", header, bed_day("2025-03-01"))).unwrap())
        .await;
    let second = engine
        .sync_rows(
            parse_str(&format!("{}{}{}", header, bed_day("2025-03-01"), bed_day("2025-03-02")))
                .unwrap(),
        )
        .await;

    assert!(first.all_succeeded() && second.all_succeeded());
    // the re-uploaded day dedups, the new day does not
    assert_eq!(second.results[0].appended_lines, Some(1));

    let invoice = server
        .find(ResourceType::Invoice, "DocNumber", "7101")
        .unwrap();
    let dates: Vec<&str> = lines_of(&invoice)
        .iter()
        .filter_map(|l| l["SalesItemLineDetail"]["ServiceDate"].as_str())
        .collect();
    assert_eq!(dates, vec!["2025-03-01", "2025-03-02"]);
}

#[tokio::test]
async fn test_stale_invoice_is_reread_and_retried() {
    let server = MockLedgerServer::start().await;
    let engine = sync(&server);
    let header = "Invoice No.,Patient Name,Patient ID,Product / Service,Description,Is Insurance?,Mode of Payment,Quantity,Unit Cost,Total Amount\n";

    engine
        .sync_rows(parse_str(&format!("{}8001,amy,1,Consultation,Visit,Yes,CIC,1,500,500\n", header)).unwrap())
        .await;

    server.stale_next_updates(1);
    let report = engine
        .sync_rows(
            parse_str(&format!(
                "{}8001,amy,1,Consultation,Visit,Yes,CIC,1,500,500\n8001,amy,1,Radiology,Chest X-ray,Yes,CIC,1,2500,2500\n",
                header
            ))
            .unwrap(),
        )
        .await;

    assert!(report.all_succeeded());
    assert_eq!(report.results[0].appended_lines, Some(1));
    assert_eq!(server.update_count(), 2);
}

// =============================================================================
// Ledger quirks
// =============================================================================

#[tokio::test]
async fn test_survives_transient_errors_and_null_numbers() {
    let server = MockLedgerServer::start().await;
    server.null_numeric_fields(true);
    server.fail_next(2, 503);

    let rows = parse_str(three_invoice_export()).unwrap();
    let report = sync(&server).sync_rows(rows).await;

    assert!(report.all_succeeded());
    assert_eq!(server.count(ResourceType::Invoice), 2);
}

#[tokio::test]
async fn test_lost_create_response_does_not_duplicate_documents() {
    let server = MockLedgerServer::start().await;
    // both documents commit but the client only sees a 503
    server.lose_next_document_responses(2);

    let rows = parse_str(three_invoice_export()).unwrap();
    let report = sync(&server).sync_rows(rows).await;

    assert!(report.all_succeeded());
    assert_eq!(server.count(ResourceType::Invoice), 2);
    assert_eq!(server.count(ResourceType::SalesReceipt), 1);
    assert_eq!(server.create_count(ResourceType::Invoice), 2);
    assert_eq!(server.create_count(ResourceType::SalesReceipt), 1);
}

#[tokio::test]
async fn test_alphanumeric_invoice_numbers() {
    let server = MockLedgerServer::start().await;
    let engine = sync(&server);
    let export = "Invoice No.,Patient Name,Patient ID,Product / Service,Description,Is Insurance?,Mode of Payment,Quantity,Unit Cost,Total Amount\n\
                  INV-0'42,amy,1,Consultation,Visit,No,Cash,1,500,500\n";

    engine.sync_rows(parse_str(export).unwrap()).await;
    let second = engine.sync_rows(parse_str(export).unwrap()).await;

    assert!(second.all_succeeded());
    assert_eq!(server.count(ResourceType::SalesReceipt), 1);
    assert!(server
        .find(ResourceType::SalesReceipt, "DocNumber", "INV-0'42")
        .is_some());
}

#[tokio::test]
async fn test_group_without_billable_rows_is_skipped() {
    let server = MockLedgerServer::start().await;
    let export = "Invoice No.,Patient Name,Total Amount\n9001,amy,0\n9001,amy,--\n";

    let report = sync(&server).sync_rows(parse_str(export).unwrap()).await;

    assert!(report.success);
    assert_eq!(report.results[0].status, GroupStatus::Skipped);
    assert_eq!(server.request_count(), 0);
}

#[tokio::test]
async fn test_export_without_invoice_column_makes_no_ledger_calls() {
    let server = MockLedgerServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("export.csv");
    std::fs::write(&path, "Patient Name,Description,Total Amount\namy,Visit,500\n").unwrap();

    let result = sync(&server).sync_file(&path).await;

    assert!(matches!(result, Err(Error::Schema(_))));
    assert_eq!(server.request_count(), 0);
}

#[test]
fn test_embedded_config_loads() {
    let config = SyncConfig::embedded().unwrap();
    assert_eq!(config.billing.tax_code, "6");
    assert!(config.insurers.iter().any(|i| i.matches("CIC")));
}
