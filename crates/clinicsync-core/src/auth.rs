//! Access token capability
//!
//! Token acquisition and refresh live outside this crate. The sync engine only
//! needs a currently valid bearer token and the company (realm) id it belongs to.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};

use crate::error::{Error, Result};

#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// A bearer token valid for the next request; refresh failures are `Error::Auth`
    async fn valid_access_token(&self) -> Result<SecretString>;

    /// Company id every API path is scoped to
    fn realm_id(&self) -> &str;
}

/// An already-issued token, e.g. from the environment
pub struct StaticTokenAuth {
    token: SecretString,
    realm_id: String,
}

impl StaticTokenAuth {
    pub fn new(token: SecretString, realm_id: &str) -> Self {
        Self {
            token,
            realm_id: realm_id.trim().to_string(),
        }
    }

    /// Read QB_ACCESS_TOKEN and QB_REALM_ID
    pub fn from_env() -> Result<Self> {
        let token = std::env::var("QB_ACCESS_TOKEN")
            .map_err(|_| Error::Auth("QB_ACCESS_TOKEN is not set".into()))?;
        let realm = std::env::var("QB_REALM_ID")
            .map_err(|_| Error::Auth("QB_REALM_ID is not set".into()))?;
        if realm.trim().is_empty() {
            return Err(Error::Auth("QB_REALM_ID is empty".into()));
        }
        Ok(Self::new(SecretString::new(token), &realm))
    }
}

impl std::fmt::Debug for StaticTokenAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticTokenAuth")
            .field("realm_id", &self.realm_id)
            .field("token", &"[redacted]")
            .finish()
    }
}

#[async_trait]
impl AuthProvider for StaticTokenAuth {
    async fn valid_access_token(&self) -> Result<SecretString> {
        if self.token.expose_secret().trim().is_empty() {
            return Err(Error::Auth("Access token is empty".into()));
        }
        Ok(self.token.clone())
    }

    fn realm_id(&self) -> &str {
        &self.realm_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_token() {
        let auth = StaticTokenAuth::new(SecretString::new("abc".into()), " 9130 ");
        assert_eq!(auth.realm_id(), "9130");
        let token = auth.valid_access_token().await.unwrap();
        assert_eq!(token.expose_secret(), "abc");
    }

    #[tokio::test]
    async fn test_empty_token_is_auth_error() {
        let auth = StaticTokenAuth::new(SecretString::new("  ".into()), "9130");
        let err = auth.valid_access_token().await.unwrap_err();
        assert!(matches!(err, Error::Auth(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_debug_redacts_token() {
        let auth = StaticTokenAuth::new(SecretString::new("s3cret".into()), "1");
        assert!(!format!("{:?}", auth).contains("s3cret"));
    }
}
