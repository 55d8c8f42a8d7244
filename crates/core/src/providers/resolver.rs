use crate::config::{PipelineConfig, ProviderProfile};
use crate::error::{ConfigError, PipelineError};
use crate::models::ProviderConfig;
use crate::traits::ProviderResolver;
use async_trait::async_trait;
use std::sync::Arc;
use url::Url;

type EnvLookup = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Resolves providers from config profiles, reading credentials from the environment.
pub struct StaticProviderResolver {
    profiles: Vec<ProviderProfile>,
    env: EnvLookup,
}

impl StaticProviderResolver {
    pub fn new(profiles: Vec<ProviderProfile>) -> Self {
        Self::with_env(profiles, |key| std::env::var(key).ok())
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(config.providers.clone())
    }

    pub fn with_env(
        profiles: Vec<ProviderProfile>,
        env: impl Fn(&str) -> Option<String> + Send + Sync + 'static,
    ) -> Self {
        Self {
            profiles,
            env: Arc::new(env),
        }
    }
}

#[async_trait]
impl ProviderResolver for StaticProviderResolver {
    async fn resolve(&self, name: &str) -> Result<ProviderConfig, PipelineError> {
        let profile = self
            .profiles
            .iter()
            .find(|profile| profile.name.eq_ignore_ascii_case(name.trim()))
            .ok_or_else(|| PipelineError::UnknownProvider(name.to_string()))?;

        let endpoint = Url::parse(&profile.endpoint).map_err(ConfigError::from)?;
        let credential = profile
            .credential_env
            .as_deref()
            .and_then(|key| (self.env)(key))
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());

        Ok(ProviderConfig {
            name: profile.name.clone(),
            endpoint,
            credential,
            model: profile.model.clone(),
            shape: profile.shape,
            chunking: profile.chunking,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn profiles_resolve_with_environment_credentials() -> Result<(), Box<dyn std::error::Error>> {
        let resolver = StaticProviderResolver::with_env(ProviderProfile::builtin(), |key| {
            (key == "GEMINI_API_KEY").then(|| "g-key".to_string())
        });

        let gemini = resolver.resolve("Gemini").await?;
        assert_eq!(gemini.credential.as_deref(), Some("g-key"));
        assert_eq!(gemini.chunking.max_chunks(), Some(1));

        let openai = resolver.resolve("openai").await?;
        assert_eq!(openai.credential, None);
        Ok(())
    }

    #[tokio::test]
    async fn unknown_provider_is_reported() {
        let resolver = StaticProviderResolver::with_env(ProviderProfile::builtin(), |_| None);
        assert!(matches!(
            resolver.resolve("claude-local").await,
            Err(PipelineError::UnknownProvider(name)) if name == "claude-local"
        ));
    }
}
