//! Test utilities for clinicsync-core
//!
//! This module provides a mock ledger server: an in-memory company that speaks
//! enough of the accounting API for the sync engine, with knobs for the
//! failure modes the engine has to survive.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{
    extract::{Json, Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use secrecy::SecretString;
use serde_json::{json, Value};
use tokio::sync::oneshot;

use crate::auth::{AuthProvider, StaticTokenAuth};
use crate::config::SyncConfig;
use crate::ledger::{value_to_string, ResourceType};

pub const MOCK_TOKEN: &str = "mock-token";
pub const MOCK_REALM: &str = "mock-realm";

/// Config pointed at a mock server with near-zero delays
pub fn fast_config(base_url: &str) -> SyncConfig {
    let mut config = SyncConfig::embedded().unwrap();
    config.ledger.base_url = Some(base_url.to_string());
    config.ledger.timeout = Duration::from_secs(5);
    config.ledger.minor_version = None;
    config.retry.max_attempts = 3;
    config.retry.initial_delay = Duration::from_millis(1);
    config.retry.max_delay = Duration::from_millis(2);
    config.recovery.attempts = 3;
    config.recovery.delay = Duration::from_millis(1);
    config.pacing.budget = Duration::ZERO;
    config.pacing.min_delay = Duration::ZERO;
    config.pacing.max_delay = Duration::ZERO;
    config
}

#[derive(Debug)]
struct StoredEntity {
    body: Value,
    /// Queries this entity stays invisible to (eventual consistency)
    hidden_for: u32,
}

#[derive(Debug, Default)]
struct LedgerState {
    entities: HashMap<ResourceType, Vec<StoredEntity>>,
    next_id: u64,
    requests: usize,
    creates: HashMap<ResourceType, usize>,
    updates: usize,
    fail_remaining: u32,
    fail_status: u16,
    query_lag: u32,
    rejected_names: HashSet<String>,
    reject_tokens: bool,
    null_numeric: bool,
    stale_updates: u32,
    lost_document_responses: u32,
}

impl LedgerState {
    fn next_id(&mut self) -> String {
        self.next_id += 1;
        self.next_id.to_string()
    }

    fn insert(&mut self, resource_type: ResourceType, mut body: Value, hidden_for: u32) -> Value {
        let id = self.next_id();
        if let Some(map) = body.as_object_mut() {
            map.insert("Id".into(), json!(id));
            map.insert("SyncToken".into(), json!("0"));
            if resource_type == ResourceType::Customer {
                map.entry("Balance").or_insert(json!(0));
                map.entry("BalanceWithJobs").or_insert(json!(0));
            }
            map.entry("Active").or_insert(json!(true));
        }
        if is_document(resource_type) {
            number_lines(&mut body);
        }
        self.entities
            .entry(resource_type)
            .or_default()
            .push(StoredEntity {
                body: body.clone(),
                hidden_for,
            });
        body
    }

    fn get_mut(&mut self, resource_type: ResourceType, id: &str) -> Option<&mut StoredEntity> {
        self.entities
            .get_mut(&resource_type)?
            .iter_mut()
            .find(|e| value_to_string(&e.body["Id"]) == id)
    }

    fn name_taken(&self, resource_type: ResourceType, name: &str) -> bool {
        let Some(field) = name_field(resource_type) else {
            return false;
        };
        self.entities
            .get(&resource_type)
            .map(|list| list.iter().any(|e| e.body[field].as_str() == Some(name)))
            .unwrap_or(false)
    }

    fn render(&self, resource_type: ResourceType, body: &Value) -> Value {
        let mut body = body.clone();
        if self.null_numeric {
            if let Some(map) = body.as_object_mut() {
                let keys: &[&str] = match resource_type {
                    ResourceType::Customer => &["Balance", "BalanceWithJobs"],
                    ResourceType::Invoice | ResourceType::SalesReceipt => &["TotalAmt", "Balance"],
                    _ => &[],
                };
                for key in keys {
                    map.insert((*key).to_string(), Value::Null);
                }
            }
        }
        body
    }
}

type Shared = Arc<Mutex<LedgerState>>;

/// Mock ledger server for tests
pub struct MockLedgerServer {
    addr: SocketAddr,
    state: Shared,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl MockLedgerServer {
    /// Start the mock server on an available port
    pub async fn start() -> Self {
        let state: Shared = Arc::new(Mutex::new(LedgerState {
            fail_status: 503,
            ..Default::default()
        }));

        let app = Router::new()
            .route(
                "/v3/company/:realm/:entity",
                get(handle_query).post(handle_post),
            )
            .route("/v3/company/:realm/:entity/:id", get(handle_read))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    shutdown_rx.await.ok();
                })
                .await
                .unwrap();
        });

        Self {
            addr,
            state,
            shutdown_tx: Some(shutdown_tx),
        }
    }

    /// Get the base URL for this mock server
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Credentials the server accepts
    pub fn auth(&self) -> Arc<dyn AuthProvider> {
        Arc::new(StaticTokenAuth::new(
            SecretString::new(MOCK_TOKEN.to_string()),
            MOCK_REALM,
        ))
    }

    /// Insert an entity directly, visible immediately; returns its id
    pub fn seed(&self, resource_type: ResourceType, body: Value) -> String {
        let mut state = self.state.lock().unwrap();
        let stored = state.insert(resource_type, body, 0);
        value_to_string(&stored["Id"])
    }

    pub fn entities(&self, resource_type: ResourceType) -> Vec<Value> {
        let state = self.state.lock().unwrap();
        state
            .entities
            .get(&resource_type)
            .map(|list| list.iter().map(|e| e.body.clone()).collect())
            .unwrap_or_default()
    }

    pub fn count(&self, resource_type: ResourceType) -> usize {
        self.entities(resource_type).len()
    }

    /// First entity whose string field equals `value`
    pub fn find(&self, resource_type: ResourceType, field: &str, value: &str) -> Option<Value> {
        self.entities(resource_type)
            .into_iter()
            .find(|e| e[field].as_str() == Some(value))
    }

    /// Answer the next `n` requests with `status`
    pub fn fail_next(&self, n: u32, status: u16) {
        let mut state = self.state.lock().unwrap();
        state.fail_remaining = n;
        state.fail_status = status;
    }

    /// Hide newly created entities from the next `n` matching queries
    pub fn set_query_lag(&self, n: u32) {
        self.state.lock().unwrap().query_lag = n;
    }

    /// Creates with this name report a duplicate but never store anything
    pub fn reject_create(&self, name: &str) {
        self.state
            .lock()
            .unwrap()
            .rejected_names
            .insert(name.to_string());
    }

    /// Answer every request with 401
    pub fn reject_tokens(&self, reject: bool) {
        self.state.lock().unwrap().reject_tokens = reject;
    }

    /// Return null for balance and total fields
    pub fn null_numeric_fields(&self, enabled: bool) {
        self.state.lock().unwrap().null_numeric = enabled;
    }

    /// The next `n` invoice/receipt creates are stored, but answered with 503
    /// (as if the response timed out after the commit)
    pub fn lose_next_document_responses(&self, n: u32) {
        self.state.lock().unwrap().lost_document_responses = n;
    }

    /// The next `n` updates find a newer version (as if edited concurrently)
    pub fn stale_next_updates(&self, n: u32) {
        self.state.lock().unwrap().stale_updates = n;
    }

    pub fn request_count(&self) -> usize {
        self.state.lock().unwrap().requests
    }

    pub fn create_count(&self, resource_type: ResourceType) -> usize {
        let state = self.state.lock().unwrap();
        state.creates.get(&resource_type).copied().unwrap_or(0)
    }

    pub fn update_count(&self) -> usize {
        self.state.lock().unwrap().updates
    }

    /// Stop the mock server
    pub fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for MockLedgerServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn name_field(resource_type: ResourceType) -> Option<&'static str> {
    match resource_type {
        ResourceType::Customer => Some("DisplayName"),
        ResourceType::Item | ResourceType::PaymentMethod => Some("Name"),
        ResourceType::Invoice | ResourceType::SalesReceipt => None,
    }
}

fn is_document(resource_type: ResourceType) -> bool {
    matches!(
        resource_type,
        ResourceType::Invoice | ResourceType::SalesReceipt
    )
}

/// Give lines ids and recompute the document total
fn number_lines(body: &mut Value) {
    let mut total = 0.0;
    if let Some(lines) = body.get_mut("Line").and_then(Value::as_array_mut) {
        let mut next = lines
            .iter()
            .filter_map(|l| value_to_string(&l["Id"]).parse::<u64>().ok())
            .max()
            .unwrap_or(0);
        for line in lines.iter_mut() {
            if value_to_string(&line["Id"]).is_empty() {
                next += 1;
                let id = value_to_string(&line["LineNum"])
                    .parse::<u64>()
                    .ok()
                    .filter(|n| *n >= next)
                    .unwrap_or(next);
                next = id;
                line["Id"] = json!(id.to_string());
            }
            if line["DetailType"] == "SalesItemLineDetail" {
                total += line["Amount"].as_f64().unwrap_or(0.0);
            }
        }
    }
    if let Some(map) = body.as_object_mut() {
        map.insert("TotalAmt".into(), json!(total));
    }
}

fn fault(status: StatusCode, code: &str, message: &str, detail: &str) -> Response {
    (
        status,
        Json(json!({
            "Fault": {
                "Error": [{ "Message": message, "Detail": detail, "code": code }],
                "type": "ValidationFault"
            },
            "time": "2025-01-15T10:00:00.000-08:00"
        })),
    )
        .into_response()
}

fn entity_response(resource_type: ResourceType, body: Value) -> Response {
    let mut map = serde_json::Map::new();
    map.insert(resource_type.entity().to_string(), body);
    map.insert("time".into(), json!("2025-01-15T10:00:00.000-08:00"));
    (StatusCode::OK, Json(Value::Object(map))).into_response()
}

/// Count the request, then apply auth and scripted failures
fn gate(state: &mut LedgerState, headers: &HeaderMap) -> Option<Response> {
    state.requests += 1;

    let bearer = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(|v| v == format!("Bearer {}", MOCK_TOKEN))
        .unwrap_or(false);
    if state.reject_tokens || !bearer {
        return Some(
            (
                StatusCode::UNAUTHORIZED,
                Json(json!({
                    "fault": {
                        "error": [{ "message": "message=AuthenticationFailed", "code": "3200" }],
                        "type": "AUTHENTICATION"
                    }
                })),
            )
                .into_response(),
        );
    }

    if state.fail_remaining > 0 {
        state.fail_remaining -= 1;
        let status =
            StatusCode::from_u16(state.fail_status).unwrap_or(StatusCode::SERVICE_UNAVAILABLE);
        return Some((status, "Service temporarily unavailable").into_response());
    }

    None
}

async fn handle_query(
    State(state): State<Shared>,
    Path((_realm, entity)): Path<(String, String)>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    let mut state = state.lock().unwrap();
    if let Some(rejection) = gate(&mut state, &headers) {
        return rejection;
    }

    if entity != "query" {
        return fault(StatusCode::BAD_REQUEST, "4000", "Unsupported operation", &entity);
    }

    let sql = params.get("query").cloned().unwrap_or_default();
    let Some(parsed) = parse_query(&sql) else {
        return fault(StatusCode::BAD_REQUEST, "4000", "Error parsing query", &sql);
    };
    let Some(resource_type) = ResourceType::from_endpoint(&parsed.entity) else {
        return fault(StatusCode::BAD_REQUEST, "4001", "Invalid entity", &parsed.entity);
    };

    let mut matches = Vec::new();
    if let Some(list) = state.entities.get_mut(&resource_type) {
        for stored in list.iter_mut() {
            let hit = parsed
                .conditions
                .iter()
                .all(|(field, value)| value_to_string(&stored.body[field.as_str()]) == *value);
            if !hit {
                continue;
            }
            if stored.hidden_for > 0 {
                stored.hidden_for -= 1;
                continue;
            }
            matches.push(stored.body.clone());
        }
    }
    if let Some(n) = parsed.max_results {
        matches.truncate(n);
    }

    let rendered: Vec<Value> = matches
        .iter()
        .map(|b| state.render(resource_type, b))
        .collect();

    let mut query_response = serde_json::Map::new();
    if !rendered.is_empty() {
        query_response.insert("startPosition".into(), json!(1));
        query_response.insert("maxResults".into(), json!(rendered.len()));
        query_response.insert(resource_type.entity().to_string(), Value::Array(rendered));
    }
    let response = json!({
        "QueryResponse": Value::Object(query_response),
        "time": "2025-01-15T10:00:00.000-08:00"
    });
    (StatusCode::OK, Json(response)).into_response()
}

async fn handle_read(
    State(state): State<Shared>,
    Path((_realm, entity, id)): Path<(String, String, String)>,
    headers: HeaderMap,
) -> Response {
    let mut state = state.lock().unwrap();
    if let Some(rejection) = gate(&mut state, &headers) {
        return rejection;
    }

    let Some(resource_type) = ResourceType::from_endpoint(&entity) else {
        return fault(StatusCode::BAD_REQUEST, "4001", "Invalid entity", &entity);
    };

    match state.get_mut(resource_type, &id).map(|e| e.body.clone()) {
        Some(body) => {
            let rendered = state.render(resource_type, &body);
            entity_response(resource_type, rendered)
        }
        None => fault(StatusCode::BAD_REQUEST, "610", "Object Not Found", &id),
    }
}

async fn handle_post(
    State(state): State<Shared>,
    Path((_realm, entity)): Path<(String, String)>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let mut state = state.lock().unwrap();
    if let Some(rejection) = gate(&mut state, &headers) {
        return rejection;
    }

    let Some(resource_type) = ResourceType::from_endpoint(&entity) else {
        return fault(StatusCode::BAD_REQUEST, "4001", "Invalid entity", &entity);
    };

    if body.get("Id").is_some() {
        update_entity(&mut state, resource_type, body)
    } else {
        create_entity(&mut state, resource_type, body)
    }
}

fn create_entity(state: &mut LedgerState, resource_type: ResourceType, body: Value) -> Response {
    *state.creates.entry(resource_type).or_insert(0) += 1;

    if let Some(field) = name_field(resource_type) {
        let name = body[field].as_str().unwrap_or_default().to_string();
        if state.rejected_names.contains(&name) || state.name_taken(resource_type, &name) {
            return fault(
                StatusCode::BAD_REQUEST,
                "6240",
                "Duplicate Name Exists Error",
                "The name supplied already exists.",
            );
        }
    }

    let lag = state.query_lag;
    let stored = state.insert(resource_type, body, lag);

    if is_document(resource_type) && state.lost_document_responses > 0 {
        state.lost_document_responses -= 1;
        return (StatusCode::SERVICE_UNAVAILABLE, "Upstream timed out").into_response();
    }

    let rendered = state.render(resource_type, &stored);
    entity_response(resource_type, rendered)
}

fn update_entity(state: &mut LedgerState, resource_type: ResourceType, body: Value) -> Response {
    state.updates += 1;

    let id = value_to_string(&body["Id"]);
    let token = value_to_string(&body["SyncToken"]);
    let stale = if state.stale_updates > 0 {
        state.stale_updates -= 1;
        true
    } else {
        false
    };

    let Some(stored) = state.get_mut(resource_type, &id) else {
        return fault(StatusCode::BAD_REQUEST, "610", "Object Not Found", &id);
    };

    let current: u64 = value_to_string(&stored.body["SyncToken"]).parse().unwrap_or(0);
    if stale {
        // someone else edited it first
        stored.body["SyncToken"] = json!((current + 1).to_string());
        return fault(
            StatusCode::BAD_REQUEST,
            "5010",
            "Stale Object Error",
            "You and another user were working on the same thing.",
        );
    }
    if token != current.to_string() {
        return fault(
            StatusCode::BAD_REQUEST,
            "5010",
            "Stale Object Error",
            "You and another user were working on the same thing.",
        );
    }

    if let (Some(target), Some(source)) = (stored.body.as_object_mut(), body.as_object()) {
        for (k, v) in source {
            if k != "sparse" && k != "SyncToken" {
                target.insert(k.clone(), v.clone());
            }
        }
    }
    stored.body["SyncToken"] = json!((current + 1).to_string());
    if is_document(resource_type) {
        number_lines(&mut stored.body);
    }

    let updated = stored.body.clone();
    let rendered = state.render(resource_type, &updated);
    entity_response(resource_type, rendered)
}

struct ParsedQuery {
    entity: String,
    conditions: Vec<(String, String)>,
    max_results: Option<usize>,
}

/// Parse `SELECT * FROM E [WHERE f = 'v' [AND ...]] [MAXRESULTS n]`
fn parse_query(sql: &str) -> Option<ParsedQuery> {
    let sql = sql.trim();
    let rest = strip_keyword(sql, "SELECT * FROM ")?;
    let (entity, mut rest) = split_word(rest);
    let mut conditions = Vec::new();
    let mut max_results = None;

    if let Some(after) = strip_keyword(rest, "WHERE ") {
        rest = after;
        loop {
            let (field, after) = split_until(rest, |c| c == '=' || c.is_whitespace());
            let after = after.trim_start().strip_prefix('=')?.trim_start();
            let (value, after) = match read_literal(after) {
                Some(quoted) => quoted,
                None => {
                    // bare `true` / `false` / numbers
                    let (word, after) = split_word(after);
                    if word.is_empty() || word.starts_with('\'') {
                        return None;
                    }
                    (word.to_string(), after)
                }
            };
            conditions.push((field.to_string(), value));
            rest = after.trim_start();
            match strip_keyword(rest, "AND ") {
                Some(next) => rest = next,
                None => break,
            }
        }
    }

    if let Some(after) = strip_keyword(rest, "MAXRESULTS ") {
        let (n, after) = split_word(after);
        max_results = Some(n.parse().ok()?);
        rest = after;
    }

    if !rest.trim().is_empty() {
        return None;
    }

    Some(ParsedQuery {
        entity: entity.to_string(),
        conditions,
        max_results,
    })
}

fn strip_keyword<'a>(s: &'a str, keyword: &str) -> Option<&'a str> {
    let s = s.trim_start();
    let head = s.get(..keyword.len())?;
    if head.eq_ignore_ascii_case(keyword) {
        Some(s[keyword.len()..].trim_start())
    } else {
        None
    }
}

fn split_word(s: &str) -> (&str, &str) {
    split_until(s.trim_start(), char::is_whitespace)
}

fn split_until(s: &str, stop: impl Fn(char) -> bool) -> (&str, &str) {
    match s.find(stop) {
        Some(i) => (&s[..i], &s[i..]),
        None => (s, ""),
    }
}

/// Read a `'...'` literal where `''` is an escaped quote
fn read_literal(s: &str) -> Option<(String, &str)> {
    let mut chars = s.strip_prefix('\'')?.char_indices().peekable();
    let body = &s[1..];
    let mut value = String::new();

    while let Some((i, c)) = chars.next() {
        if c == '\'' {
            if matches!(chars.peek(), Some((_, '\''))) {
                chars.next();
                value.push('\'');
            } else {
                return Some((value, &body[i + 1..]));
            }
        } else {
            value.push(c);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_query() {
        let q = parse_query(
            "SELECT * FROM Customer WHERE DisplayName = 'Mary O''Neil ID 7' AND Active = 'true' MAXRESULTS 2",
        )
        .unwrap();
        assert_eq!(q.entity, "Customer");
        assert_eq!(
            q.conditions,
            vec![
                ("DisplayName".to_string(), "Mary O'Neil ID 7".to_string()),
                ("Active".to_string(), "true".to_string()),
            ]
        );
        assert_eq!(q.max_results, Some(2));

        let q = parse_query("SELECT * FROM Item WHERE Name = 'X-Ray' AND Active = true MAXRESULTS 2").unwrap();
        assert_eq!(q.conditions[1], ("Active".to_string(), "true".to_string()));

        let q = parse_query("select * from Item").unwrap();
        assert_eq!(q.entity, "Item");
        assert!(q.conditions.is_empty());

        assert!(parse_query("SELECT * FROM Item WHERE Name = 'unterminated").is_none());
    }

    #[tokio::test]
    async fn test_mock_server_starts() {
        let server = MockLedgerServer::start().await;
        let id = server.seed(ResourceType::Item, json!({"Name": "Consultation"}));
        assert_eq!(id, "1");
        assert!(server.find(ResourceType::Item, "Name", "Consultation").is_some());
        assert!(server.url().starts_with("http://127.0.0.1:"));
    }
}
