//! Billing export parser
//!
//! Reads the clinic's tab- or comma-delimited export into normalized [`Row`]s:
//! trailing empty fields and blank lines are dropped, headers are matched
//! against a synonym table, missing columns are injected with defaults, and
//! money/quantity/date/flag fields are coerced.

use std::collections::HashMap;
use std::io::Read;
use std::path::Path;

use chrono::{NaiveDate, NaiveDateTime};
use csv::{ReaderBuilder, StringRecord, Trim};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::models::{InsuranceFlag, Row};
use crate::money::{parse_money, parse_quantity};

/// Canonical export columns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    InvoiceNumber,
    PatientId,
    PatientName,
    DateOfVisit,
    DueDate,
    TermsOfPayment,
    Location,
    Memo,
    ServiceCategory,
    Description,
    IsInsurance,
    ModeOfPayment,
    Quantity,
    UnitCost,
    TotalAmount,
    ServiceDate,
}

impl Field {
    /// Columns every parsed table must end up with
    pub const REQUIRED: [Field; 12] = [
        Field::PatientId,
        Field::InvoiceNumber,
        Field::PatientName,
        Field::DateOfVisit,
        Field::ServiceCategory,
        Field::Description,
        Field::IsInsurance,
        Field::ModeOfPayment,
        Field::Quantity,
        Field::UnitCost,
        Field::TotalAmount,
        Field::ServiceDate,
    ];

    pub fn canonical(&self) -> &'static str {
        match self {
            Self::InvoiceNumber => "Invoice No.",
            Self::PatientId => "Patient ID",
            Self::PatientName => "Patient Name",
            Self::DateOfVisit => "Date of Visit",
            Self::DueDate => "Due Date",
            Self::TermsOfPayment => "Terms of Payment",
            Self::Location => "Location",
            Self::Memo => "Memo",
            Self::ServiceCategory => "Product / Service",
            Self::Description => "Description",
            Self::IsInsurance => "Is Insurance?",
            Self::ModeOfPayment => "Mode of Payment",
            Self::Quantity => "Quantity",
            Self::UnitCost => "Unit Cost",
            Self::TotalAmount => "Total Amount",
            Self::ServiceDate => "Service Date",
        }
    }

    /// Match a raw header, ignoring case and all whitespace
    pub fn from_header(header: &str) -> Option<Self> {
        let folded = fold_header(header);
        let field = match folded.as_str() {
            "invoiceno." | "invoiceno" | "invoicenumber" | "invoice#" | "invoice" | "invno" => {
                Self::InvoiceNumber
            }
            "patientid" | "patientno." | "patientno" | "patientnumber" => Self::PatientId,
            "patientname" | "patient" => Self::PatientName,
            "dateofvisit" | "visitdate" => Self::DateOfVisit,
            "duedate" => Self::DueDate,
            "termsofpayment" | "terms" | "paymentterms" => Self::TermsOfPayment,
            "location" | "branch" => Self::Location,
            "memo" | "notes" => Self::Memo,
            "product/service" | "productservice" | "product" | "service" | "servicecategory"
            | "category" => Self::ServiceCategory,
            "description" | "itemdescription" => Self::Description,
            "isinsurance?" | "isinsurance" | "insurance" | "insured" => Self::IsInsurance,
            "modeofpayment" | "paymentmode" | "paymentmethod" => Self::ModeOfPayment,
            "quantity" | "qty" => Self::Quantity,
            "unitcost" | "unitprice" | "rate" | "price" => Self::UnitCost,
            "totalamount" | "total" | "amount" | "linetotal" => Self::TotalAmount,
            "servicedate" | "dateofservice" => Self::ServiceDate,
            _ => return None,
        };
        Some(field)
    }

    /// Value injected when the column is absent
    ///
    /// The invoice number is the grouping key, so it has no default.
    pub fn default_value(&self) -> Option<&'static str> {
        match self {
            Self::InvoiceNumber => None,
            Self::Quantity => Some("1"),
            Self::UnitCost | Self::TotalAmount => Some("0.00"),
            _ => Some(""),
        }
    }
}

impl std::fmt::Display for Field {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.canonical())
    }
}

/// Lowercase, drop whitespace and trailing `,`/`;` junk
fn fold_header(header: &str) -> String {
    header
        .trim()
        .trim_end_matches([',', ';'])
        .chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(char::to_lowercase)
        .collect()
}

/// Where a canonical field's value comes from
#[derive(Debug, Clone, PartialEq, Eq)]
enum ColumnSource {
    Index(usize),
    Injected(&'static str),
}

/// Mapping from canonical fields to input columns
#[derive(Debug, Default)]
struct ColumnMap {
    columns: HashMap<Field, ColumnSource>,
}

impl ColumnMap {
    fn from_headers(headers: &[String]) -> Self {
        let mut columns = HashMap::new();
        let mut unmapped = Vec::new();

        for (i, header) in headers.iter().enumerate() {
            match Field::from_header(header) {
                Some(field) => {
                    columns.entry(field).or_insert(ColumnSource::Index(i));
                }
                None => unmapped.push(header.as_str()),
            }
        }

        if columns.is_empty() {
            warn!("No column mapping applied, check header format");
        } else if !unmapped.is_empty() {
            debug!(?unmapped, "Ignoring unrecognized columns");
        }

        Self { columns }
    }

    /// Add defaults for required columns the export didn't have
    fn inject_missing(&mut self) {
        let missing: Vec<Field> = Field::REQUIRED
            .iter()
            .copied()
            .filter(|f| !self.columns.contains_key(f))
            .collect();

        if missing.is_empty() {
            return;
        }

        let names: Vec<&str> = missing.iter().map(Field::canonical).collect();
        warn!(missing = ?names, "Missing columns, adding with defaults");

        for field in missing {
            if let Some(default) = field.default_value() {
                self.columns.insert(field, ColumnSource::Injected(default));
            }
        }
    }

    fn ensure_required(&self) -> Result<()> {
        for field in Field::REQUIRED {
            if !self.columns.contains_key(&field) {
                return Err(Error::Schema(format!(
                    "Required column '{}' is missing",
                    field
                )));
            }
        }
        Ok(())
    }

    fn value<'a>(&self, field: Field, fields: &'a [String]) -> &'a str {
        match self.columns.get(&field) {
            Some(ColumnSource::Index(i)) => fields.get(*i).map(String::as_str).unwrap_or(""),
            Some(ColumnSource::Injected(default)) => default,
            None => "",
        }
    }
}

/// Parse an export file from disk
pub fn parse_file(path: &Path) -> Result<Vec<Row>> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_lowercase)
        .unwrap_or_default();
    if !matches!(ext.as_str(), "csv" | "tsv" | "txt") {
        return Err(Error::Parse(format!(
            "Unsupported file type: {}",
            path.display()
        )));
    }

    info!(file = %path.display(), "Starting parse");
    let file = std::fs::File::open(path)?;
    parse_reader(file)
}

/// Parse an export from any reader
pub fn parse_reader<R: Read>(mut reader: R) -> Result<Vec<Row>> {
    let mut bytes = Vec::new();
    reader.read_to_end(&mut bytes)?;
    let text = String::from_utf8(bytes)
        .map_err(|e| Error::Parse(format!("Export is not valid UTF-8: {}", e)))?;
    parse_str(&text)
}

/// Parse export text
pub fn parse_str(text: &str) -> Result<Vec<Row>> {
    let text = text.trim_start_matches('\u{feff}');
    let delimiter = detect_delimiter(text);
    check_quoting(text, delimiter)?;

    let mut rdr = ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(Trim::All)
        .delimiter(delimiter)
        .from_reader(text.as_bytes());

    let mut header: Option<ColumnMap> = None;
    let mut rows = Vec::new();

    for result in rdr.records() {
        let record = result.map_err(|e| Error::Parse(format!("Malformed export: {}", e)))?;
        let line = record.position().map(|p| p.line() as usize).unwrap_or(0);

        let fields = clean_record(&record);
        if fields.is_empty() {
            continue;
        }

        match header {
            None => {
                let mut columns = ColumnMap::from_headers(&fields);
                columns.inject_missing();
                columns.ensure_required()?;
                header = Some(columns);
            }
            Some(ref columns) => rows.push(build_row(columns, &fields, line)),
        }
    }

    if header.is_none() {
        warn!("Export is empty after cleaning");
    } else if rows.is_empty() {
        warn!("No data rows found after parsing");
    } else {
        info!(rows = rows.len(), "Successfully parsed export");
    }

    Ok(rows)
}

/// Tab if the header line has one, otherwise comma
fn detect_delimiter(text: &str) -> u8 {
    let header = text
        .lines()
        .find(|l| !l.trim().is_empty())
        .unwrap_or_default();
    if header.contains('\t') {
        b'\t'
    } else {
        b','
    }
}

/// A quoted field that is never closed swallows the rest of the file
///
/// Only a quote at the start of a field opens one. Quotes inside unquoted text
/// (`Bandage 4" crepe`) are literal, as the csv reader treats them.
fn check_quoting(text: &str, delimiter: u8) -> Result<()> {
    let delimiter = char::from(delimiter);
    let mut in_quotes = false;
    let mut field_start = true;
    let mut opened_on = 0;
    let mut line = 1;
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        if in_quotes {
            match c {
                '"' if chars.peek() == Some(&'"') => {
                    chars.next();
                }
                '"' => in_quotes = false,
                '\n' => line += 1,
                _ => {}
            }
            continue;
        }

        match c {
            '"' if field_start => {
                in_quotes = true;
                opened_on = line;
            }
            '\n' => line += 1,
            _ => {}
        }
        field_start = c == delimiter || c == '\n' || c == '\r';
    }

    if in_quotes {
        return Err(Error::Parse(format!(
            "Quoted field opened on line {} is never closed",
            opened_on
        )));
    }
    Ok(())
}

/// Drop trailing empty fields left by `,,,,,` padding
fn clean_record(record: &StringRecord) -> Vec<String> {
    let mut fields: Vec<String> = record.iter().map(str::to_string).collect();
    while fields.last().is_some_and(|f| f.trim().is_empty()) {
        fields.pop();
    }
    fields
}

fn build_row(columns: &ColumnMap, fields: &[String], line: usize) -> Row {
    let get = |field: Field| columns.value(field, fields).trim().to_string();

    let service_category = get(Field::ServiceCategory);
    let mut description = get(Field::Description);
    if service_category == "Consultation" && description.is_empty() {
        description = "Consultation".to_string();
    }

    Row {
        line,
        invoice_number: get(Field::InvoiceNumber),
        patient_name: get(Field::PatientName),
        patient_id: get(Field::PatientId),
        service_category,
        description,
        quantity: parse_quantity(&get(Field::Quantity)),
        unit_cost: parse_money(&get(Field::UnitCost)),
        total_amount: parse_money(&get(Field::TotalAmount)),
        insurance: InsuranceFlag::coerce(&get(Field::IsInsurance)),
        payment_mode: get(Field::ModeOfPayment)
            .trim_end_matches(',')
            .trim()
            .to_string(),
        service_date: parse_date_field(&get(Field::ServiceDate), line),
        date_of_visit: parse_date_field(&get(Field::DateOfVisit), line),
        due_date: parse_date_field(&get(Field::DueDate), line),
        terms: get(Field::TermsOfPayment),
        location: get(Field::Location),
        memo: get(Field::Memo),
    }
}

fn parse_date_field(raw: &str, line: usize) -> Option<NaiveDate> {
    if raw.is_empty() {
        return None;
    }
    let date = parse_date(raw);
    if date.is_none() {
        warn!(line, value = %raw, "Unparsable date, leaving empty");
    }
    date
}

/// Parse a date string in the formats clinic exports use
///
/// Month-first wins when a slash date is ambiguous.
pub fn parse_date(s: &str) -> Option<NaiveDate> {
    let s = s.trim();

    let formats = [
        "%Y-%m-%d", // 2025-01-15
        "%m/%d/%Y", // 01/15/2025
        "%m/%d/%y", // 01/15/25
        "%d/%m/%Y", // 15/01/2025
        "%Y/%m/%d", // 2025/01/15
        "%m-%d-%Y", // 01-15-2025
        "%d-%m-%Y", // 15-01-2025
        "%d-%b-%Y", // 15-Jan-2025
        "%d %b %Y", // 15 Jan 2025
        "%b %d, %Y", // Jan 15, 2025
        "%d %B %Y", // 15 January 2025
    ];
    for fmt in formats {
        if let Ok(date) = NaiveDate::parse_from_str(s, fmt) {
            return Some(date);
        }
    }

    let datetime_formats = [
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M:%S",
        "%m/%d/%Y %H:%M",
        "%m/%d/%Y %H:%M:%S",
    ];
    for fmt in datetime_formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(dt.date());
        }
    }

    None
}
