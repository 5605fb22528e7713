use serde::{Deserialize, Serialize};

use crate::{
    dispatcher::DEFAULT_API_VERSION,
    error::{AccessError, AccessResult},
    page::validate_page_size,
};

/// Settings a client is built from, besides its collaborators.
///
/// Deserializable so that applications can keep it next to their own configuration:
///
/// ```ignore
/// let config: ClientConfig = serde_json::from_str(r#"{
///     "account_endpoint": "https://account.documents.example.com",
///     "default_page_size": 100
/// }"#)?;
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    pub account_endpoint: String,
    #[serde(default = "default_api_version")]
    pub api_version: String,
    #[serde(default)]
    pub default_page_size: Option<u32>,
}

fn default_api_version() -> String {
    DEFAULT_API_VERSION.to_string()
}

impl ClientConfig {
    pub fn new(account_endpoint: impl Into<String>) -> Self {
        Self {
            account_endpoint: account_endpoint.into(),
            api_version: default_api_version(),
            default_page_size: None,
        }
    }

    /// Checks the settings and returns the endpoint without a trailing slash.
    pub fn validate(&self) -> AccessResult<String> {
        let endpoint = self.account_endpoint.trim().trim_end_matches('/');
        if endpoint.is_empty() {
            return Err(AccessError::NotConfigured("account endpoint is empty".into()));
        }
        if self.api_version.trim().is_empty() {
            return Err(AccessError::NotConfigured("api version is empty".into()));
        }
        if let Some(size) = self.default_page_size {
            validate_page_size(size)?;
        }

        Ok(endpoint.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_json() {
        let config: ClientConfig =
            serde_json::from_str(r#"{ "account_endpoint": "https://acct.example.com/" }"#).unwrap();

        assert_eq!(config.api_version, DEFAULT_API_VERSION);
        assert_eq!(config.default_page_size, None);
        assert_eq!(config.validate().unwrap(), "https://acct.example.com");
    }

    #[test]
    fn test_validate_rejects_bad_settings() {
        assert!(matches!(
            ClientConfig::new("  ").validate(),
            Err(AccessError::NotConfigured(_))
        ));

        let mut config = ClientConfig::new("https://acct.example.com");
        config.default_page_size = Some(0);
        assert!(matches!(config.validate(), Err(AccessError::InvalidArgument(_))));
    }
}
