//! Typed ledger responses
//!
//! Raw JSON bodies are decoded exactly once, here, into [`RemoteResult`].

use serde_json::Value;

use super::sanitize::sanitize;
use super::ResourceType;
use crate::error::Error;

/// A ledger entity with its sanitized JSON body
#[derive(Debug, Clone, PartialEq)]
pub struct Resource {
    pub resource_type: ResourceType,
    pub body: Value,
}

impl Resource {
    pub fn new(resource_type: ResourceType, body: Value) -> Self {
        Self {
            resource_type,
            body,
        }
    }

    pub fn id(&self) -> String {
        value_to_string(&self.body["Id"])
    }

    /// Optimistic-concurrency version token
    pub fn sync_token(&self) -> String {
        value_to_string(&self.body["SyncToken"])
    }

    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.body.get(key).and_then(Value::as_str)
    }

    /// `{"value": "..."}` reference fields such as `IncomeAccountRef`
    pub fn ref_value(&self, key: &str) -> Option<String> {
        self.body
            .get(key)
            .map(|r| value_to_string(&r["value"]))
            .filter(|v| !v.is_empty())
    }

    /// Document lines, empty for non-document resources
    pub fn lines(&self) -> &[Value] {
        self.body
            .get("Line")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

/// Structured error reported inside a ledger response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fault {
    pub code: String,
    pub message: String,
    pub detail: String,
}

impl Fault {
    pub const DUPLICATE_NAME: &'static str = "6240";
    pub const STALE_OBJECT: &'static str = "5010";

    /// Name-uniqueness violation: code and message are both checked
    pub fn is_duplicate(&self) -> bool {
        self.code == Self::DUPLICATE_NAME || self.mentions("duplicate name")
    }

    pub fn is_stale(&self) -> bool {
        self.code == Self::STALE_OBJECT || self.mentions("stale object")
    }

    fn mentions(&self, needle: &str) -> bool {
        self.message.to_lowercase().contains(needle) || self.detail.to_lowercase().contains(needle)
    }

    /// Read the first error out of a `Fault` object (either key casing)
    pub fn from_body(body: &Value) -> Option<Self> {
        let fault = get_ci(body, "Fault")?;
        let first = get_ci(fault, "Error")
            .and_then(Value::as_array)
            .and_then(|errors| errors.first());

        let fault = match first {
            Some(e) => Self {
                code: get_ci(e, "code").map(value_to_string).unwrap_or_default(),
                message: get_ci(e, "Message").map(value_to_string).unwrap_or_default(),
                detail: get_ci(e, "Detail").map(value_to_string).unwrap_or_default(),
            },
            None => Self {
                code: String::new(),
                message: get_ci(fault, "type")
                    .map(value_to_string)
                    .unwrap_or_else(|| "Unknown fault".to_string()),
                detail: String::new(),
            },
        };
        Some(fault)
    }

    pub fn into_error(self, status: u16) -> Error {
        Error::Remote {
            status,
            code: self.code,
            message: if self.detail.is_empty() {
                self.message
            } else {
                format!("{}: {}", self.message, self.detail)
            },
        }
    }
}

impl std::fmt::Display for Fault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)?;
        if !self.detail.is_empty() {
            write!(f, ": {}", self.detail)?;
        }
        Ok(())
    }
}

/// One decoded ledger response
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteResult {
    Ok(Resource),
    Fault(Fault),
    Empty,
}

impl RemoteResult {
    /// Decode a single-entity response (create, update, read)
    pub fn decode(resource_type: ResourceType, mut body: Value) -> Self {
        sanitize(&mut body);

        if let Some(fault) = Fault::from_body(&body) {
            return Self::Fault(fault);
        }

        match body.get_mut(resource_type.entity()).map(Value::take) {
            Some(entity @ Value::Object(_)) => Self::Ok(Resource::new(resource_type, entity)),
            _ => Self::Empty,
        }
    }
}

/// Decode a query response into its entities
pub fn decode_query(
    resource_type: ResourceType,
    mut body: Value,
) -> std::result::Result<Vec<Resource>, Fault> {
    sanitize(&mut body);

    if let Some(fault) = Fault::from_body(&body) {
        return Err(fault);
    }

    let entities = body
        .get_mut("QueryResponse")
        .and_then(|q| q.get_mut(resource_type.entity()))
        .map(Value::take);

    Ok(match entities {
        Some(Value::Array(items)) => items
            .into_iter()
            .filter(Value::is_object)
            .map(|v| Resource::new(resource_type, v))
            .collect(),
        Some(v @ Value::Object(_)) => vec![Resource::new(resource_type, v)],
        _ => Vec::new(),
    })
}

/// Result of a create call
#[derive(Debug)]
pub enum CreateOutcome {
    Created(Resource),
    /// Name-uniqueness violation; the caller should re-query
    AlreadyExists(Fault),
    Failed(Error),
}

/// Case-insensitive key lookup
fn get_ci<'a>(value: &'a Value, key: &str) -> Option<&'a Value> {
    let map = value.as_object()?;
    map.get(key).or_else(|| {
        map.iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v)
    })
}

/// Ids and tokens arrive as strings or (after sanitizing) numbers
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        _ => String::new(),
    }
}
