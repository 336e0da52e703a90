use std::sync::OnceLock;

use regex::Regex;
use serde_json::{json, Value};
use tracing::debug;

use super::{EntityResolver, ResolutionCache};
use crate::config::CustomerDefaults;
use crate::error::Result;
use crate::ledger::ResourceType;
use crate::models::CustomerIdentity;

const MAX_EMAIL_LOCAL: usize = 60;

impl EntityResolver {
    /// Customer id for an identity; display name is the only key
    pub async fn resolve_customer(
        &self,
        cache: &mut ResolutionCache,
        identity: &CustomerIdentity,
    ) -> Result<String> {
        let name = identity.display_name();
        if let Some(id) = cache.customer(name) {
            debug!(customer = %name, id = %id, "Customer cache hit");
            return Ok(id.to_string());
        }

        let payload = customer_payload(identity, &self.customer_defaults);
        let customer = self
            .find_or_create(ResourceType::Customer, "DisplayName", name, &payload)
            .await?;

        let id = customer.id();
        cache.customers.insert(name.to_string(), id.clone());
        Ok(id)
    }
}

/// Body for a new customer
pub fn customer_payload(identity: &CustomerIdentity, defaults: &CustomerDefaults) -> Value {
    let name = identity.display_name();
    let mut payload = json!({
        "DisplayName": name,
        "PrimaryEmailAddr": { "Address": customer_email(name, &defaults.email_domain) },
        "PrimaryPhone": { "FreeFormNumber": defaults.phone },
        "BillAddr": {
            "Line1": defaults.bill_line1,
            "City": defaults.bill_city,
            "Country": defaults.bill_country,
            "CountrySubDivisionCode": defaults.bill_subdivision,
            "PostalCode": defaults.bill_postal_code,
        },
        "Taxable": false,
    });

    if let Some(map) = payload.as_object_mut() {
        match identity {
            CustomerIdentity::Insurer { display_name } => {
                map.insert("CompanyName".into(), json!(display_name));
            }
            CustomerIdentity::Patient { given_name, .. } => {
                map.insert("GivenName".into(), json!(given_name));
            }
        }
    }
    payload
}

/// Runs of anything but lowercase letters and digits
fn separator_runs() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[^a-z0-9]+").expect("valid regex"))
}

/// Deterministic placeholder address derived from the display name
pub fn customer_email(display_name: &str, domain: &str) -> String {
    let lowered = display_name.to_lowercase();
    let dotted = separator_runs().replace_all(&lowered, ".");

    let local: String = dotted.trim_matches('.').chars().take(MAX_EMAIL_LOCAL).collect();
    let local = local.trim_end_matches('.');
    let local = if local.is_empty() { "customer" } else { local };

    format!("{}@{}", local, domain)
}
