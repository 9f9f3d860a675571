//! API key lookup for speech backends.

use async_trait::async_trait;

use crate::config::SharedConfig;
use crate::error::SessionError;

/// Source of backend credentials.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// API key for `provider_id`, or `None` when none is configured.
    async fn api_key(&self, provider_id: &str) -> anyhow::Result<Option<String>>;
}

/// Environment variable consulted when a provider sets no `api_key_env`.
/// `deepgram` -> `DEEPGRAM_API_KEY`
pub fn default_env_var(provider_id: &str) -> String {
    format!("{}_API_KEY", provider_id.to_uppercase().replace('-', "_"))
}

/// Inline `api_key` first, then `api_key_env`, then the default variable.
#[async_trait]
impl CredentialProvider for SharedConfig {
    async fn api_key(&self, provider_id: &str) -> anyhow::Result<Option<String>> {
        let settings = self.get().provider_settings(provider_id);
        if let Some(key) = settings.api_key.filter(|k| !k.trim().is_empty()) {
            return Ok(Some(key));
        }

        let key = settings
            .api_key_env
            .into_iter()
            .chain(std::iter::once(default_env_var(provider_id)))
            .find_map(|var| std::env::var(var).ok().filter(|k| !k.trim().is_empty()));
        Ok(key)
    }
}

/// Fetch the key for `provider_id` or fail with a user-facing error.
pub(crate) async fn require_api_key(
    credentials: &dyn CredentialProvider,
    provider_id: &str,
) -> Result<String, SessionError> {
    match credentials.api_key(provider_id).await {
        Ok(Some(key)) => Ok(key),
        Ok(None) => Err(SessionError::MissingCredential {
            provider: provider_id.to_string(),
            env_var: default_env_var(provider_id),
        }),
        Err(e) => Err(SessionError::Credential(format!("{e:#}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, ProviderSettings};

    fn shared_with(provider_id: &str, settings: ProviderSettings) -> SharedConfig {
        let mut config = Config::default();
        config.providers.insert(provider_id.to_string(), settings);
        SharedConfig::new(config)
    }

    #[test]
    fn test_default_env_var() {
        assert_eq!(default_env_var("deepgram"), "DEEPGRAM_API_KEY");
        assert_eq!(default_env_var("my-backend"), "MY_BACKEND_API_KEY");
    }

    #[tokio::test]
    async fn test_inline_key_wins() {
        let shared = shared_with(
            "dictaflow-test",
            ProviderSettings {
                api_key: Some("inline-key".to_string()),
                api_key_env: Some("DICTAFLOW_TEST_NEVER_SET_1".to_string()),
                ..ProviderSettings::default()
            },
        );

        let key = shared.api_key("dictaflow-test").await.unwrap();
        assert_eq!(key.as_deref(), Some("inline-key"));
    }

    #[tokio::test]
    async fn test_missing_key_is_none() {
        let shared = shared_with(
            "dictaflow-test",
            ProviderSettings {
                api_key: Some("   ".to_string()),
                api_key_env: Some("DICTAFLOW_TEST_NEVER_SET_2".to_string()),
                ..ProviderSettings::default()
            },
        );

        assert_eq!(shared.api_key("dictaflow-test").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_require_api_key_reports_missing_provider() {
        let shared = shared_with(
            "dictaflow-test",
            ProviderSettings {
                api_key_env: Some("DICTAFLOW_TEST_NEVER_SET_3".to_string()),
                ..ProviderSettings::default()
            },
        );

        let err = require_api_key(&shared, "dictaflow-test").await.unwrap_err();
        assert!(matches!(err, SessionError::MissingCredential { ref provider, .. } if provider == "dictaflow-test"));
        assert!(err.to_string().contains("DICTAFLOW_TEST_API_KEY"));
    }
}
