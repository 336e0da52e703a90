use serde_json::json;
use tracing::warn;

use super::{EntityResolver, ResolutionCache};
use crate::classify::payment_tokens;
use crate::error::Result;
use crate::ledger::ResourceType;
use crate::models::{collapse_whitespace, title_case};

/// Ledger limit on payment method names
pub const MAX_PAYMENT_METHOD_NAME: usize = 31;

impl EntityResolver {
    /// Payment method for a receipt, from the first payment-mode token
    ///
    /// Returns `None` when the method can't be resolved; the receipt is then
    /// created without a method reference. Authentication errors still propagate.
    pub async fn resolve_payment_method(
        &self,
        cache: &mut ResolutionCache,
        payment_mode: &str,
    ) -> Result<Option<String>> {
        let token = payment_tokens(payment_mode)
            .next()
            .unwrap_or(self.billing.default_payment_method.as_str());
        let name = payment_method_name(token);
        if name.is_empty() {
            return Ok(None);
        }

        if let Some(id) = cache.payment_method(&name) {
            return Ok(Some(id.to_string()));
        }

        let payload = json!({
            "Name": name,
            "Type": "NON_CREDIT_CARD",
        });

        match self
            .find_or_create(ResourceType::PaymentMethod, "Name", &name, &payload)
            .await
        {
            Ok(method) => {
                let id = method.id();
                cache.payment_methods.insert(name, id.clone());
                Ok(Some(id))
            }
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                warn!(payment_method = %name, error = %e, "Could not resolve payment method, omitting");
                Ok(None)
            }
        }
    }
}

/// Canonical payment method name for a payment-mode token
pub fn payment_method_name(token: &str) -> String {
    let token = collapse_whitespace(token);
    let name = match token.to_lowercase().as_str() {
        "cash" => "Cash".to_string(),
        "check" | "cheque" => "Check".to_string(),
        "credit card" => "Credit Card".to_string(),
        "debit card" => "Debit Card".to_string(),
        "mpesa" | "m-pesa" => "MPESA".to_string(),
        _ => title_case(&token),
    };
    name.chars()
        .take(MAX_PAYMENT_METHOD_NAME)
        .collect::<String>()
        .trim_end()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payment_method_name() {
        assert_eq!(payment_method_name("CASH"), "Cash");
        assert_eq!(payment_method_name(" mpesa "), "MPESA");
        assert_eq!(payment_method_name("credit   card"), "Credit Card");
        assert_eq!(payment_method_name("bank transfer"), "Bank Transfer");
        assert_eq!(payment_method_name(""), "");
        assert_eq!(
            payment_method_name(&"x".repeat(40)).chars().count(),
            MAX_PAYMENT_METHOD_NAME
        );
    }
}
