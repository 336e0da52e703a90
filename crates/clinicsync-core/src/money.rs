//! Money and quantity normalization
//!
//! Billing exports carry amounts like `"1,234.50 KES"`, `" 200 "` or `"--"`.
//! Everything outside `[0-9.-]` is dropped before parsing, and anything that
//! still fails to parse becomes `0.00` rather than an error.

use std::str::FromStr;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use tracing::warn;

/// Keep only digits, `.` and `-`
fn strip_numeric(s: &str) -> String {
    s.chars()
        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
        .collect()
}

/// Two-decimal zero, the fallback for every unparsable amount
pub fn zero() -> Decimal {
    Decimal::new(0, 2)
}

/// Parse a monetary value, never failing
pub fn parse_money(raw: &str) -> Decimal {
    let stripped = strip_numeric(raw);
    if stripped.is_empty() || stripped == "." || stripped == "-" {
        return zero();
    }

    match Decimal::from_str(&stripped) {
        Ok(value) => value,
        Err(_) => {
            warn!(value = %raw, "Failed to parse money, using 0.00");
            zero()
        }
    }
}

/// Parse a quantity; non-positive or unparsable values become 1
pub fn parse_quantity(raw: &str) -> u32 {
    let stripped = strip_numeric(raw);
    let value = match Decimal::from_str(&stripped) {
        Ok(v) => v.trunc(),
        Err(_) => return 1,
    };

    if value <= Decimal::ZERO {
        return 1;
    }
    value.to_u32().unwrap_or(1)
}

/// Round to cents, halves away from zero
pub fn round_cents(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// Render a decimal as a JSON number for ledger payloads
///
/// The decimal text is kept as-is (`330.00` stays `330.00`), never rounded
/// through a float.
pub fn to_json_number(value: Decimal) -> serde_json::Value {
    match serde_json::Number::from_str(&value.to_string()) {
        Ok(n) => serde_json::Value::Number(n),
        Err(e) => {
            warn!(value = %value, error = %e, "Decimal not representable as JSON, sending as float");
            value
                .to_f64()
                .and_then(serde_json::Number::from_f64)
                .map(serde_json::Value::Number)
                .unwrap_or_else(|| serde_json::Value::from(0))
        }
    }
}

/// Read a JSON number (or numeric string) back into a decimal
pub fn from_json_value(value: &serde_json::Value) -> Decimal {
    match value {
        serde_json::Value::Number(n) => Decimal::from_str(&n.to_string())
            .or_else(|_| n.as_f64().map(Decimal::try_from).unwrap_or(Ok(Decimal::ZERO)))
            .unwrap_or(Decimal::ZERO),
        serde_json::Value::String(s) => parse_money(s),
        _ => Decimal::ZERO,
    }
}
