//! Response sanitizing
//!
//! The ledger returns `null` for numeric fields inconsistently. Known numeric
//! keys are coerced to `0` everywhere in a response before anything reads it.

use serde_json::Value;

/// Keys whose `null` values become `0`
pub const NUMERIC_FIELDS: &[&str] = &[
    "Id",
    "SyncToken",
    "Balance",
    "BalanceWithJobs",
    "TotalAmt",
    "LineNum",
    "Amount",
    "Qty",
    "UnitPrice",
    "Taxable",
];

/// Recursively replace nulls in numeric fields with `0`
pub fn sanitize(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for (key, v) in map.iter_mut() {
                if v.is_null() && NUMERIC_FIELDS.contains(&key.as_str()) {
                    *v = Value::from(0);
                } else {
                    sanitize(v);
                }
            }
        }
        Value::Array(items) => items.iter_mut().for_each(sanitize),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_nulls_in_numeric_fields_become_zero() {
        let mut body = json!({
            "Invoice": {
                "Id": "12",
                "Balance": null,
                "TotalAmt": null,
                "CustomerMemo": null,
                "Line": [
                    {"Id": "1", "LineNum": null, "Amount": null,
                     "SalesItemLineDetail": {"Qty": null, "UnitPrice": null}}
                ]
            }
        });
        sanitize(&mut body);

        let invoice = &body["Invoice"];
        assert_eq!(invoice["Id"], "12");
        assert_eq!(invoice["Balance"], 0);
        assert_eq!(invoice["TotalAmt"], 0);
        // not a numeric field
        assert!(invoice["CustomerMemo"].is_null());

        let line = &invoice["Line"][0];
        assert_eq!(line["LineNum"], 0);
        assert_eq!(line["Amount"], 0);
        assert_eq!(line["SalesItemLineDetail"]["Qty"], 0);
        assert_eq!(line["SalesItemLineDetail"]["UnitPrice"], 0);
    }
}
