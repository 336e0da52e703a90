//! Remote ledger client
//!
//! All HTTP interaction with the accounting API goes through [`LedgerClient`]:
//! - Bearer auth from an [`AuthProvider`], company-scoped paths
//! - Transient failures (timeouts, 408, 429, 5xx) retried with exponential backoff
//! - Responses sanitized and decoded once into [`RemoteResult`]
//! - Faults classified into duplicate, stale and generic remote errors

mod query;
mod sanitize;
mod types;

pub use query::{escape_literal, Query};
pub use sanitize::{sanitize, NUMERIC_FIELDS};
pub use types::{decode_query, value_to_string, CreateOutcome, Fault, RemoteResult, Resource};

use std::sync::Arc;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use reqwest::{Client, Method, StatusCode};
use secrecy::ExposeSecret;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::auth::AuthProvider;
use crate::config::{RetryConfig, SyncConfig};
use crate::error::{Error, Result};

/// Entity kinds the sync touches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceType {
    Customer,
    Item,
    Invoice,
    SalesReceipt,
    PaymentMethod,
}

impl ResourceType {
    /// Entity key in request/response bodies and queries
    pub fn entity(&self) -> &'static str {
        match self {
            Self::Customer => "Customer",
            Self::Item => "Item",
            Self::Invoice => "Invoice",
            Self::SalesReceipt => "SalesReceipt",
            Self::PaymentMethod => "PaymentMethod",
        }
    }

    /// Path segment under the company base path
    pub fn endpoint(&self) -> &'static str {
        match self {
            Self::Customer => "customer",
            Self::Item => "item",
            Self::Invoice => "invoice",
            Self::SalesReceipt => "salesreceipt",
            Self::PaymentMethod => "paymentmethod",
        }
    }

    pub fn from_endpoint(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "customer" => Some(Self::Customer),
            "item" => Some(Self::Item),
            "invoice" => Some(Self::Invoice),
            "salesreceipt" => Some(Self::SalesReceipt),
            "paymentmethod" => Some(Self::PaymentMethod),
            _ => None,
        }
    }
}

impl std::fmt::Display for ResourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.entity())
    }
}

/// HTTP client for one ledger company
#[derive(Clone)]
pub struct LedgerClient {
    http_client: Client,
    base_url: String,
    minor_version: Option<u32>,
    retry: RetryConfig,
    auth: Arc<dyn AuthProvider>,
}

impl LedgerClient {
    pub fn new(config: &SyncConfig, auth: Arc<dyn AuthProvider>) -> Result<Self> {
        let http_client = Client::builder()
            .timeout(config.ledger.timeout)
            .build()?;

        Ok(Self {
            http_client,
            base_url: config.ledger.api_base(),
            minor_version: config.ledger.minor_version,
            retry: config.retry.clone(),
            auth,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/v3/company/{}/{}",
            self.base_url,
            self.auth.realm_id(),
            path
        )
    }

    /// Run a query; failures degrade to an empty result set
    ///
    /// Authentication errors still propagate since nothing else can succeed.
    pub async fn query(&self, query: &Query) -> Result<Vec<Resource>> {
        let sql = query.to_sql();
        debug!(query = %sql, "Ledger query");

        let result = self
            .send(Method::GET, "query", &[("query", sql.clone())], None)
            .await;

        match result {
            Ok((_, body)) => match decode_query(query.resource(), body) {
                Ok(resources) => Ok(resources),
                Err(fault) => {
                    warn!(query = %sql, fault = %fault, "Query fault, treating as not found");
                    Ok(Vec::new())
                }
            },
            Err(e @ Error::Auth(_)) => Err(e),
            Err(e) => {
                warn!(query = %sql, error = %e, "Query failed, treating as not found");
                Ok(Vec::new())
            }
        }
    }

    /// First match of a query; extra matches are logged
    pub async fn query_one(&self, query: &Query) -> Result<Option<Resource>> {
        let mut resources = self.query(query).await?;
        if resources.len() > 1 {
            warn!(
                query = %query,
                matches = resources.len(),
                "Multiple matches for an exact lookup, using the first"
            );
        }
        Ok(if resources.is_empty() {
            None
        } else {
            Some(resources.swap_remove(0))
        })
    }

    /// Fetch one entity by id
    pub async fn read(&self, resource_type: ResourceType, id: &str) -> Result<RemoteResult> {
        let path = format!("{}/{}", resource_type.endpoint(), id);
        let (_, body) = self.send(Method::GET, &path, &[], None).await?;
        Ok(RemoteResult::decode(resource_type, body))
    }

    /// Create an entity
    ///
    /// Name-uniqueness faults come back as [`CreateOutcome::AlreadyExists`].
    /// Authentication errors and exhausted retries are returned as `Err`.
    /// Only use this for entities with a unique name: a retried POST whose
    /// first attempt landed is caught by the duplicate-name fault.
    pub async fn create(&self, resource_type: ResourceType, payload: &Value) -> Result<CreateOutcome> {
        self.create_with_attempts(resource_type, payload, self.retry.max_attempts)
            .await
    }

    /// Create with a single POST, never retried
    ///
    /// For documents, where a repeated POST after a timeout could commit twice.
    /// Callers check whether a transient failure actually landed before trying
    /// again.
    pub async fn create_once(&self, resource_type: ResourceType, payload: &Value) -> Result<CreateOutcome> {
        self.create_with_attempts(resource_type, payload, 1).await
    }

    async fn create_with_attempts(
        &self,
        resource_type: ResourceType,
        payload: &Value,
        max_attempts: u32,
    ) -> Result<CreateOutcome> {
        let (status, body) = match self
            .send_with_attempts(Method::POST, resource_type.endpoint(), &[], Some(payload), max_attempts)
            .await
        {
            Ok(r) => r,
            Err(e) if e.is_fatal() || e.is_transient() => return Err(e),
            Err(e) => return Ok(CreateOutcome::Failed(e)),
        };

        Ok(match RemoteResult::decode(resource_type, body) {
            RemoteResult::Ok(resource) => {
                debug!(resource = %resource_type, id = %resource.id(), "Created");
                CreateOutcome::Created(resource)
            }
            RemoteResult::Fault(fault) if fault.is_duplicate() => {
                debug!(resource = %resource_type, fault = %fault, "Create hit duplicate name");
                CreateOutcome::AlreadyExists(fault)
            }
            RemoteResult::Fault(fault) => CreateOutcome::Failed(fault.into_error(status)),
            RemoteResult::Empty => CreateOutcome::Failed(Error::InvalidData(format!(
                "Empty response creating {}",
                resource_type
            ))),
        })
    }

    /// Sparse update carrying the caller's fields plus id and version token
    pub async fn update(
        &self,
        resource_type: ResourceType,
        id: &str,
        sync_token: &str,
        fields: &Value,
    ) -> Result<Resource> {
        let mut payload = json!({
            "Id": id,
            "SyncToken": sync_token,
            "sparse": true,
        });
        if let (Some(target), Some(source)) = (payload.as_object_mut(), fields.as_object()) {
            for (k, v) in source {
                target.insert(k.clone(), v.clone());
            }
        }

        let (status, body) = self
            .send(Method::POST, resource_type.endpoint(), &[], Some(&payload))
            .await?;

        match RemoteResult::decode(resource_type, body) {
            RemoteResult::Ok(resource) => Ok(resource),
            RemoteResult::Fault(fault) if fault.is_stale() => Err(Error::Conflict {
                resource: resource_type.to_string(),
                id: id.to_string(),
                message: fault.to_string(),
            }),
            RemoteResult::Fault(fault) => Err(fault.into_error(status)),
            RemoteResult::Empty => Err(Error::InvalidData(format!(
                "Empty response updating {} {}",
                resource_type, id
            ))),
        }
    }

    /// Send with retries on transient failures
    async fn send(
        &self,
        method: Method,
        path: &str,
        params: &[(&str, String)],
        body: Option<&Value>,
    ) -> Result<(u16, Value)> {
        self.send_with_attempts(method, path, params, body, self.retry.max_attempts)
            .await
    }

    async fn send_with_attempts(
        &self,
        method: Method,
        path: &str,
        params: &[(&str, String)],
        body: Option<&Value>,
        max_attempts: u32,
    ) -> Result<(u16, Value)> {
        let mut backoff = self.backoff();
        let mut attempt = 1;

        loop {
            match self.send_once(method.clone(), path, params, body).await {
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    let delay = backoff.next_backoff().unwrap_or(self.retry.max_delay);
                    warn!(
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient ledger error, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) if e.is_transient() => {
                    return Err(match e {
                        Error::Http(err) => Error::Transient {
                            status: err.status().map(|s| s.as_u16()),
                            message: format!("{} (after {} attempts)", err, attempt),
                        },
                        other => other,
                    })
                }
                other => return other,
            }
        }
    }

    /// Attempts allowed for one logical request
    pub fn max_attempts(&self) -> u32 {
        self.retry.max_attempts
    }

    /// Retry spacing shared by every caller that retries ledger requests
    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            current_interval: self.retry.initial_delay,
            initial_interval: self.retry.initial_delay,
            multiplier: self.retry.multiplier,
            max_interval: self.retry.max_delay,
            randomization_factor: 0.25,
            max_elapsed_time: None,
            ..Default::default()
        }
    }

    async fn send_once(
        &self,
        method: Method,
        path: &str,
        params: &[(&str, String)],
        body: Option<&Value>,
    ) -> Result<(u16, Value)> {
        let token = self.auth.valid_access_token().await?;

        let mut request = self
            .http_client
            .request(method, self.url(path))
            .bearer_auth(token.expose_secret())
            .header(reqwest::header::ACCEPT, "application/json");

        let mut query: Vec<(&str, String)> = params.to_vec();
        if let Some(v) = self.minor_version {
            query.push(("minorversion", v.to_string()));
        }
        if !query.is_empty() {
            request = request.query(&query);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;

        classify_status(status, &text)?;

        let value = if text.trim().is_empty() {
            Value::Null
        } else {
            match serde_json::from_str(&text) {
                Ok(v) => v,
                Err(e) if status.is_success() => return Err(Error::Json(e)),
                Err(_) => {
                    return Err(Error::Remote {
                        status: status.as_u16(),
                        code: String::new(),
                        message: truncate(&text, 200),
                    })
                }
            }
        };

        if !status.is_success() && Fault::from_body(&value).is_none() {
            return Err(Error::Remote {
                status: status.as_u16(),
                code: String::new(),
                message: truncate(&text, 200),
            });
        }

        Ok((status.as_u16(), value))
    }
}

impl std::fmt::Debug for LedgerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LedgerClient")
            .field("base_url", &self.base_url)
            .field("realm_id", &self.auth.realm_id())
            .finish()
    }
}

/// Map auth and retryable statuses before the body is inspected
fn classify_status(status: StatusCode, body: &str) -> Result<()> {
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(Error::Auth(format!(
            "Ledger rejected credentials ({}): {}",
            status.as_u16(),
            truncate(body, 200)
        )));
    }
    if status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
    {
        return Err(Error::Transient {
            status: Some(status.as_u16()),
            message: truncate(body, 200),
        });
    }
    Ok(())
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max).collect();
        format!("{}...", cut)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{fast_config, MockLedgerServer};
    use secrecy::SecretString;

    fn client(server: &MockLedgerServer) -> LedgerClient {
        let config = fast_config(&server.url());
        LedgerClient::new(&config, server.auth()).unwrap()
    }

    #[test]
    fn test_resource_type_endpoints() {
        assert_eq!(ResourceType::SalesReceipt.entity(), "SalesReceipt");
        assert_eq!(ResourceType::SalesReceipt.endpoint(), "salesreceipt");
        assert_eq!(
            ResourceType::from_endpoint("PaymentMethod"),
            Some(ResourceType::PaymentMethod)
        );
        assert_eq!(ResourceType::from_endpoint("bill"), None);
    }

    #[test]
    fn test_classify_status() {
        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED, ""),
            Err(Error::Auth(_))
        ));
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, ""),
            Err(Error::Transient { status: Some(429), .. })
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_GATEWAY, ""),
            Err(Error::Transient { status: Some(502), .. })
        ));
        assert!(classify_status(StatusCode::BAD_REQUEST, "").is_ok());
        assert!(classify_status(StatusCode::OK, "").is_ok());
    }

    #[tokio::test]
    async fn test_create_then_query() {
        let server = MockLedgerServer::start().await;
        let client = client(&server);

        let outcome = client
            .create(ResourceType::Customer, &json!({"DisplayName": "Mary O'Neil ID 7"}))
            .await
            .unwrap();
        let created = match outcome {
            CreateOutcome::Created(r) => r,
            other => panic!("unexpected {:?}", other),
        };

        let query = Query::select(ResourceType::Customer).where_eq("DisplayName", "Mary O'Neil ID 7");
        let found = client.query_one(&query).await.unwrap().unwrap();
        assert_eq!(found.id(), created.id());
    }

    #[tokio::test]
    async fn test_duplicate_create_is_already_exists() {
        let server = MockLedgerServer::start().await;
        server.seed(ResourceType::Customer, json!({"DisplayName": "CIC Insurance"}));
        let client = client(&server);

        let outcome = client
            .create(ResourceType::Customer, &json!({"DisplayName": "CIC Insurance"}))
            .await
            .unwrap();
        match outcome {
            CreateOutcome::AlreadyExists(fault) => assert_eq!(fault.code, "6240"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let server = MockLedgerServer::start().await;
        server.fail_next(2, 503);
        let client = client(&server);

        let outcome = client
            .create(ResourceType::Item, &json!({"Name": "Consultation"}))
            .await
            .unwrap();
        assert!(matches!(outcome, CreateOutcome::Created(_)));
        assert_eq!(server.count(ResourceType::Item), 1);
    }

    #[tokio::test]
    async fn test_retries_exhausted_is_transient_error() {
        let server = MockLedgerServer::start().await;
        server.fail_next(10, 503);
        let client = client(&server);

        let err = client
            .create(ResourceType::Item, &json!({"Name": "Consultation"}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Transient { status: Some(503), .. }));
        assert_eq!(server.count(ResourceType::Item), 0);
    }

    #[tokio::test]
    async fn test_create_once_does_not_retry() {
        let server = MockLedgerServer::start().await;
        server.fail_next(1, 503);
        let client = client(&server);

        let err = client
            .create_once(ResourceType::SalesReceipt, &json!({"DocNumber": "1002", "Line": []}))
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert_eq!(server.request_count(), 1);
        assert_eq!(server.count(ResourceType::SalesReceipt), 0);
    }

    #[tokio::test]
    async fn test_query_failure_degrades_to_empty() {
        let server = MockLedgerServer::start().await;
        server.fail_next(10, 500);
        let client = client(&server);

        let query = Query::select(ResourceType::Customer).where_eq("DisplayName", "Anyone");
        assert!(client.query(&query).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_auth_failure_propagates_from_query() {
        let server = MockLedgerServer::start().await;
        server.reject_tokens(true);
        let client = client(&server);

        let query = Query::select(ResourceType::Customer).where_eq("DisplayName", "Anyone");
        let err = client.query(&query).await.unwrap_err();
        assert!(matches!(err, Error::Auth(_)));
    }

    #[tokio::test]
    async fn test_empty_token_never_reaches_server() {
        let server = MockLedgerServer::start().await;
        let config = fast_config(&server.url());
        let auth = Arc::new(crate::auth::StaticTokenAuth::new(
            SecretString::new(String::new()),
            "123",
        ));
        let client = LedgerClient::new(&config, auth).unwrap();

        let query = Query::select(ResourceType::Item).where_eq("Name", "X");
        assert!(matches!(client.query(&query).await, Err(Error::Auth(_))));
        assert_eq!(server.request_count(), 0);
    }

    #[tokio::test]
    async fn test_update_with_stale_token_is_conflict() {
        let server = MockLedgerServer::start().await;
        let id = server.seed(ResourceType::Invoice, json!({"DocNumber": "1001", "Line": []}));
        let client = client(&server);

        let err = client
            .update(ResourceType::Invoice, &id, "99", &json!({"Line": []}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict { .. }));

        let updated = client
            .update(ResourceType::Invoice, &id, "0", &json!({"PrivateNote": "x"}))
            .await
            .unwrap();
        assert_eq!(updated.sync_token(), "1");
        assert_eq!(updated.str_field("PrivateNote"), Some("x"));
        assert_eq!(updated.str_field("DocNumber"), Some("1001"));
    }

    #[tokio::test]
    async fn test_null_numeric_fields_are_sanitized() {
        let server = MockLedgerServer::start().await;
        let id = server.seed(ResourceType::Customer, json!({"DisplayName": "Jane Doe ID 1"}));
        server.null_numeric_fields(true);
        let client = client(&server);

        match client.read(ResourceType::Customer, &id).await.unwrap() {
            RemoteResult::Ok(r) => assert_eq!(r.body["Balance"], 0),
            other => panic!("unexpected {:?}", other),
        }
    }
}
