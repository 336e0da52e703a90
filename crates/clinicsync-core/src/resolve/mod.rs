//! Entity resolution
//!
//! Find-or-create for customers, items and payment methods:
//! 1. Exact-match query; a hit is reused
//! 2. Otherwise create
//! 3. A duplicate-name fault on create means a concurrent or not-yet-indexed
//!    entity exists, so re-query with linearly growing delays until it shows up
//!
//! Resolved ids are kept in a [`ResolutionCache`] that lives for one batch run.

mod customers;
mod items;
mod payment_methods;

pub use customers::{customer_email, customer_payload};
pub use items::{item_name_candidates, sanitize_item_name, ItemRef, MAX_ITEM_NAME};
pub use payment_methods::{payment_method_name, MAX_PAYMENT_METHOD_NAME};

use std::collections::HashMap;

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::{BillingConfig, CustomerDefaults, RecoveryConfig, SyncConfig};
use crate::error::{Error, Result};
use crate::ledger::{CreateOutcome, LedgerClient, Query, Resource, ResourceType};

/// Ids resolved during one batch run, never persisted
#[derive(Debug, Default)]
pub struct ResolutionCache {
    customers: HashMap<String, String>,
    items: HashMap<(String, String), ItemRef>,
    payment_methods: HashMap<String, String>,
}

impl ResolutionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn customer(&self, display_name: &str) -> Option<&str> {
        self.customers.get(display_name).map(String::as_str)
    }

    pub fn item(&self, base_name: &str, account: &str) -> Option<&ItemRef> {
        self.items.get(&(base_name.to_string(), account.to_string()))
    }

    pub fn payment_method(&self, name: &str) -> Option<&str> {
        self.payment_methods.get(name).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.customers.len() + self.items.len() + self.payment_methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Resolves ledger ids for the entities a document references
#[derive(Debug, Clone)]
pub struct EntityResolver {
    client: LedgerClient,
    recovery: RecoveryConfig,
    billing: BillingConfig,
    customer_defaults: CustomerDefaults,
}

impl EntityResolver {
    pub fn new(client: LedgerClient, config: &SyncConfig) -> Self {
        Self {
            client,
            recovery: config.recovery.clone(),
            billing: config.billing.clone(),
            customer_defaults: config.customer.clone(),
        }
    }

    /// Exact lookup on one field
    async fn find(&self, resource_type: ResourceType, field: &str, value: &str) -> Result<Option<Resource>> {
        self.client.query_one(&lookup(resource_type, field, value)).await
    }

    /// Create, falling back to re-querying when the name already exists
    async fn create_or_recover(
        &self,
        resource_type: ResourceType,
        field: &str,
        value: &str,
        payload: &Value,
    ) -> Result<Resource> {
        match self.client.create(resource_type, payload).await? {
            CreateOutcome::Created(resource) => {
                info!(resource = %resource_type, name = %value, id = %resource.id(), "Created");
                Ok(resource)
            }
            CreateOutcome::AlreadyExists(fault) => {
                debug!(resource = %resource_type, name = %value, fault = %fault, "Name exists, re-querying");
                self.recover(&lookup(resource_type, field, value), value).await
            }
            CreateOutcome::Failed(e) => Err(e),
        }
    }

    /// Re-run `query` until an entity reported as existing becomes visible
    async fn recover(&self, query: &Query, value: &str) -> Result<Resource> {
        let resource_type = query.resource();
        for attempt in 1..=self.recovery.attempts {
            tokio::time::sleep(self.recovery.delay * attempt).await;

            if let Some(resource) = self.client.query_one(query).await? {
                debug!(resource = %resource_type, name = %value, attempt, "Recovered existing entity");
                return Ok(resource);
            }
            warn!(
                resource = %resource_type,
                name = %value,
                attempt,
                "Existing entity not visible yet"
            );
        }

        Err(Error::Reconciliation(format!(
            "{} '{}' reported as existing but not found after {} attempts",
            resource_type, value, self.recovery.attempts
        )))
    }

    /// Find-or-create keyed on one name field
    async fn find_or_create(
        &self,
        resource_type: ResourceType,
        field: &str,
        value: &str,
        payload: &Value,
    ) -> Result<Resource> {
        if let Some(existing) = self.find(resource_type, field, value).await? {
            debug!(resource = %resource_type, name = %value, id = %existing.id(), "Found existing");
            return Ok(existing);
        }
        self.create_or_recover(resource_type, field, value, payload).await
    }
}

/// Exact match on one name field, at most two results
fn lookup(resource_type: ResourceType, field: &str, value: &str) -> Query {
    Query::select(resource_type)
        .where_eq(field, value)
        .max_results(2)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CustomerIdentity;
    use crate::test_utils::{fast_config, MockLedgerServer};
    use serde_json::json;

    fn resolver(server: &MockLedgerServer) -> EntityResolver {
        let config = fast_config(&server.url());
        let client = LedgerClient::new(&config, server.auth()).unwrap();
        EntityResolver::new(client, &config)
    }

    #[tokio::test]
    async fn test_resolve_customer_is_idempotent() {
        let server = MockLedgerServer::start().await;
        let resolver = resolver(&server);
        let mut cache = ResolutionCache::new();
        let identity = CustomerIdentity::patient("jane doe", "4471");

        let first = resolver.resolve_customer(&mut cache, &identity).await.unwrap();
        let second = resolver.resolve_customer(&mut cache, &identity).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(server.count(ResourceType::Customer), 1);

        // a fresh run finds it by query instead of creating again
        let mut fresh = ResolutionCache::new();
        let third = resolver.resolve_customer(&mut fresh, &identity).await.unwrap();
        assert_eq!(first, third);
        assert_eq!(server.create_count(ResourceType::Customer), 1);
    }

    #[tokio::test]
    async fn test_duplicate_recovered_after_index_lag() {
        let server = MockLedgerServer::start().await;
        let config = fast_config(&server.url());
        let client = LedgerClient::new(&config, server.auth()).unwrap();

        // another process created the name; the index hasn't caught up yet
        server.set_query_lag(2);
        let created = client
            .create(ResourceType::Customer, &json!({"DisplayName": "Madison Insurance"}))
            .await
            .unwrap();
        let created_id = match created {
            CreateOutcome::Created(r) => r.id(),
            other => panic!("unexpected {:?}", other),
        };
        server.set_query_lag(0);

        let resolver = EntityResolver::new(client, &config);
        let mut cache = ResolutionCache::new();
        let id = resolver
            .resolve_customer(&mut cache, &CustomerIdentity::insurer("Madison Insurance"))
            .await
            .unwrap();

        assert_eq!(id, created_id);
        assert_eq!(server.count(ResourceType::Customer), 1);
        // the resolver's own create hit the duplicate fault
        assert_eq!(server.create_count(ResourceType::Customer), 2);
    }

    #[tokio::test]
    async fn test_unrecoverable_duplicate_is_reconciliation_error() {
        let server = MockLedgerServer::start().await;
        server.reject_create("Ghost Patient ID 1");
        let resolver = resolver(&server);
        let mut cache = ResolutionCache::new();

        let err = resolver
            .resolve_customer(&mut cache, &CustomerIdentity::patient("ghost patient", "1"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Reconciliation(_)));
        assert!(!err.is_fatal());
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_item_with_other_income_account_gets_suffix() {
        let server = MockLedgerServer::start().await;
        server.seed(
            ResourceType::Item,
            json!({"Name": "Amoxicillin", "IncomeAccountRef": {"value": "80"}}),
        );
        let resolver = resolver(&server);
        let mut cache = ResolutionCache::new();

        let item = resolver
            .resolve_item(&mut cache, "Pharmacy", "amoxicillin")
            .await
            .unwrap();
        assert_eq!(item.name, "Amoxicillin 2");

        let stored = server.find(ResourceType::Item, "Name", "Amoxicillin 2").unwrap();
        assert_eq!(stored["IncomeAccountRef"]["value"], "81");
        assert_eq!(stored["Type"], "Service");

        // cached for the rest of the run
        let again = resolver
            .resolve_item(&mut cache, "Pharmacy", "Amoxicillin")
            .await
            .unwrap();
        assert_eq!(again, item);
        assert_eq!(server.create_count(ResourceType::Item), 1);
    }

    #[tokio::test]
    async fn test_inactive_item_name_is_skipped() {
        let server = MockLedgerServer::start().await;
        server.seed(
            ResourceType::Item,
            json!({"Name": "Malaria Test", "IncomeAccountRef": {"value": "82"}, "Active": false}),
        );
        let resolver = resolver(&server);
        let mut cache = ResolutionCache::new();

        let item = resolver
            .resolve_item(&mut cache, "Laboratory", "malaria test")
            .await
            .unwrap();

        // the inactive item is neither reused nor blocks resolution
        assert_eq!(item.name, "Malaria Test 2");
        let stored = server.find(ResourceType::Item, "Name", "Malaria Test 2").unwrap();
        assert_eq!(item.id, stored["Id"].as_str().unwrap());
        assert_eq!(server.count(ResourceType::Item), 2);
    }

    #[tokio::test]
    async fn test_item_with_matching_account_is_reused() {
        let server = MockLedgerServer::start().await;
        let id = server.seed(
            ResourceType::Item,
            json!({"Name": "Full Blood Count", "IncomeAccountRef": {"value": "82"}}),
        );
        let resolver = resolver(&server);
        let mut cache = ResolutionCache::new();

        let item = resolver
            .resolve_item(&mut cache, "Laboratory", "full blood count")
            .await
            .unwrap();
        assert_eq!(item.id, id);
        assert_eq!(server.create_count(ResourceType::Item), 0);
    }

    #[tokio::test]
    async fn test_payment_method_resolution() {
        let server = MockLedgerServer::start().await;
        let resolver = resolver(&server);
        let mut cache = ResolutionCache::new();

        let mpesa = resolver
            .resolve_payment_method(&mut cache, "mpesa, cash")
            .await
            .unwrap();
        assert!(mpesa.is_some());
        let stored = server.find(ResourceType::PaymentMethod, "Name", "MPESA").unwrap();
        assert_eq!(stored["Type"], "NON_CREDIT_CARD");

        // empty mode falls back to the configured default
        resolver.resolve_payment_method(&mut cache, "").await.unwrap();
        assert!(server.find(ResourceType::PaymentMethod, "Name", "Cash").is_some());
    }

    #[tokio::test]
    async fn test_unresolvable_payment_method_is_omitted() {
        let server = MockLedgerServer::start().await;
        server.reject_create("Cheque Book");
        let resolver = resolver(&server);
        let mut cache = ResolutionCache::new();

        let method = resolver
            .resolve_payment_method(&mut cache, "cheque book")
            .await
            .unwrap();
        assert_eq!(method, None);
    }
}
