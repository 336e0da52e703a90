//! Query builder for the ledger's SQL-like filter syntax

use super::ResourceType;

/// `SELECT * FROM <Entity> WHERE <Field> = '<value>' [AND ...] MAXRESULTS n`
///
/// Every string literal is quoted, including invoice numbers, so alphanumeric
/// values filter the same way numeric ones do. Booleans are bare.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    resource: ResourceType,
    /// Field and rendered right-hand side
    conditions: Vec<(String, String)>,
    max_results: Option<u32>,
}

impl Query {
    pub fn select(resource: ResourceType) -> Self {
        Self {
            resource,
            conditions: Vec::new(),
            max_results: None,
        }
    }

    /// Add an equality condition on a top-level field
    pub fn where_eq(mut self, field: &str, value: &str) -> Self {
        self.conditions
            .push((field.to_string(), format!("'{}'", escape_literal(value))));
        self
    }

    pub fn where_bool(mut self, field: &str, value: bool) -> Self {
        self.conditions.push((field.to_string(), value.to_string()));
        self
    }

    pub fn max_results(mut self, n: u32) -> Self {
        self.max_results = Some(n);
        self
    }

    pub fn resource(&self) -> ResourceType {
        self.resource
    }

    pub fn to_sql(&self) -> String {
        let mut sql = format!("SELECT * FROM {}", self.resource.entity());

        for (i, (field, value)) in self.conditions.iter().enumerate() {
            sql.push_str(if i == 0 { " WHERE " } else { " AND " });
            sql.push_str(&format!("{} = {}", field, value));
        }

        if let Some(n) = self.max_results {
            sql.push_str(&format!(" MAXRESULTS {}", n));
        }
        sql
    }
}

impl std::fmt::Display for Query {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_sql())
    }
}

/// Escape a string literal: `'` becomes `''`
pub fn escape_literal(value: &str) -> String {
    value.replace('\'', "''")
}
