use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::{EntityResolver, ResolutionCache};
use crate::error::{Error, Result};
use crate::ledger::{CreateOutcome, Query, Resource, ResourceType};
use crate::models::{collapse_whitespace, title_case};

/// Ledger limit on item names
pub const MAX_ITEM_NAME: usize = 100;
const MAX_ITEM_DESCRIPTION: usize = 4000;

/// A resolved catalog item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemRef {
    pub id: String,
    pub name: String,
}

impl EntityResolver {
    /// Item for a billed line, posting to the category's income account
    ///
    /// An existing item with the right name but a different income account is
    /// not reused; a numeric suffix is appended until a usable name is found.
    pub async fn resolve_item(
        &self,
        cache: &mut ResolutionCache,
        category: &str,
        free_text_name: &str,
    ) -> Result<ItemRef> {
        let base = sanitize_item_name(if free_text_name.trim().is_empty() {
            category
        } else {
            free_text_name
        });
        let account = self.billing.income_account_for(category).to_string();

        if let Some(item) = cache.item(&base, &account) {
            return Ok(item.clone());
        }

        for name in item_name_candidates(&base, self.recovery.max_name_suffix) {
            let payload = item_payload(&name, category, &account);
            let query = active_item(&name);

            let candidate = match self.client.query_one(&query).await? {
                Some(existing) => existing,
                None => match self.client.create(ResourceType::Item, &payload).await? {
                    CreateOutcome::Created(item) => {
                        debug!(item = %name, id = %item.id(), account = %account, "Created item");
                        item
                    }
                    CreateOutcome::AlreadyExists(_) => match self.recover(&query, &name).await {
                        Ok(item) => item,
                        Err(Error::Reconciliation(_)) => {
                            // names stay unique across inactive items too
                            warn!(item = %name, "Name is held by an inactive item, trying another name");
                            continue;
                        }
                        Err(e) => return Err(e),
                    },
                    CreateOutcome::Failed(e) => return Err(e),
                },
            };

            if account_matches(&candidate, &account) {
                let item = ItemRef {
                    id: candidate.id(),
                    name,
                };
                cache.items.insert((base, account), item.clone());
                return Ok(item);
            }

            warn!(
                item = %name,
                existing_account = ?candidate.ref_value("IncomeAccountRef"),
                wanted_account = %account,
                "Item exists under a different income account, trying another name"
            );
        }

        Err(Error::Reconciliation(format!(
            "No usable item name for '{}' with income account {}",
            base, account
        )))
    }
}

/// Exact name match among active items
fn active_item(name: &str) -> Query {
    Query::select(ResourceType::Item)
        .where_eq("Name", name)
        .where_bool("Active", true)
        .max_results(2)
}

fn account_matches(item: &Resource, account: &str) -> bool {
    item.ref_value("IncomeAccountRef").as_deref() == Some(account)
}

fn item_payload(name: &str, category: &str, account: &str) -> Value {
    let description: String = category.trim().chars().take(MAX_ITEM_DESCRIPTION).collect();
    json!({
        "Name": name,
        "Type": "Service",
        "IncomeAccountRef": { "value": account },
        "Description": description,
        "Taxable": false,
    })
}

/// Names to try in order: the base, then "<base> 2" .. "<base> N"
pub fn item_name_candidates(base: &str, max_suffix: u32) -> Vec<String> {
    let mut names = vec![base.to_string()];
    for n in 2..=max_suffix {
        let suffix = format!(" {}", n);
        let keep = MAX_ITEM_NAME.saturating_sub(suffix.len());
        let stem: String = base.chars().take(keep).collect();
        names.push(format!("{}{}", stem.trim_end(), suffix));
    }
    names
}

/// Item names keep letters, digits and ` .-_`; everything else becomes a space
pub fn sanitize_item_name(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, ' ' | '.' | '-' | '_') {
                c
            } else {
                ' '
            }
        })
        .collect();

    let name = title_case(&collapse_whitespace(&cleaned));
    let name: String = name.chars().take(MAX_ITEM_NAME).collect();
    let name = name.trim_end().to_string();

    if name.is_empty() {
        "Medical Service".to_string()
    } else {
        name
    }
}
