use crate::chunking::ChunkingPolicy;
use crate::error::ConfigError;
use crate::models::ResponseShape;
use crate::structure::StructureOptions;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds, DurationSeconds};
use std::path::Path;
use std::time::Duration;

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// A document whose last liveness signal is older than this is paused at
    /// the next dispatch checkpoint.
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(rename = "pause_after_inactive_secs")]
    pub pause_after_inactive: Duration,

    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(rename = "section_timeout_secs")]
    pub section_timeout: Duration,

    pub max_document_units: usize,
    pub default_provider: String,
    pub structure: StructureOptions,
    pub retry: RetryConfig,
    pub caps: ExtractionCaps,
    pub concurrency: ConcurrencyConfig,
    pub providers: Vec<ProviderProfile>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            pause_after_inactive: Duration::from_secs(60),
            section_timeout: Duration::from_secs(280),
            max_document_units: 2_000_000,
            default_provider: "openai".to_string(),
            structure: StructureOptions::default(),
            retry: RetryConfig::default(),
            caps: ExtractionCaps::default(),
            concurrency: ConcurrencyConfig::default(),
            providers: ProviderProfile::builtin(),
        }
    }
}

impl PipelineConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    pub fn profile(&self, name: &str) -> Option<&ProviderProfile> {
        self.providers
            .iter()
            .find(|profile| profile.name.eq_ignore_ascii_case(name))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.concurrency.max_concurrent_calls == 0
            || self.concurrency.max_concurrent_sections == 0
        {
            return Err(ConfigError::Invalid(
                "concurrency limits must be at least 1".to_string(),
            ));
        }
        if self.max_document_units == 0 {
            return Err(ConfigError::Invalid(
                "max_document_units must be positive".to_string(),
            ));
        }
        for profile in &self.providers {
            profile
                .chunking
                .validate()
                .map_err(|error| ConfigError::Invalid(format!("provider {}: {error}", profile.name)))?;
            url::Url::parse(&profile.endpoint)?;
        }
        if self.profile(&self.default_provider).is_none() {
            return Err(ConfigError::Invalid(format!(
                "default provider {} has no profile",
                self.default_provider
            )));
        }
        Ok(())
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,

    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "base_delay_ms")]
    pub base_delay: Duration,

    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "max_delay_ms")]
    pub max_delay: Duration,

    /// Upper bound applied to a server supplied `Retry-After`.
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(rename = "max_retry_after_secs")]
    pub max_retry_after: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1_000),
            max_delay: Duration::from_millis(10_000),
            max_retry_after: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ExtractionCaps {
    pub max_entities: usize,
    pub max_relations: usize,
}

impl Default for ExtractionCaps {
    fn default() -> Self {
        Self {
            max_entities: 10,
            max_relations: 12,
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrencyConfig {
    pub max_concurrent_calls: usize,
    pub max_concurrent_sections: usize,

    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(rename = "request_timeout_secs")]
    pub request_timeout: Duration,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            max_concurrent_calls: 8,
            max_concurrent_sections: 4,
            request_timeout: Duration::from_secs(60),
        }
    }
}

/// A named provider as written in the config file. The credential itself is
/// looked up from `credential_env` when the profile is resolved.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProviderProfile {
    pub name: String,
    pub endpoint: String,
    pub model: String,
    pub shape: ResponseShape,
    #[serde(default)]
    pub credential_env: Option<String>,
    pub chunking: ChunkingPolicy,
}

impl ProviderProfile {
    pub fn builtin() -> Vec<Self> {
        vec![
            Self {
                name: "openai".to_string(),
                endpoint: "https://api.openai.com/v1".to_string(),
                model: "gpt-4o-mini".to_string(),
                shape: ResponseShape::OpenaiChat,
                credential_env: Some("LLM_API_KEY".to_string()),
                chunking: ChunkingPolicy::EvenSplit {
                    unit_budget: 30_000,
                    max_chunks: None,
                },
            },
            Self {
                name: "gemini".to_string(),
                endpoint: "https://generativelanguage.googleapis.com".to_string(),
                model: "gemini-2.0-flash".to_string(),
                shape: ResponseShape::Gemini,
                credential_env: Some("GEMINI_API_KEY".to_string()),
                chunking: ChunkingPolicy::EvenSplit {
                    unit_budget: 200_000,
                    max_chunks: Some(1),
                },
            },
        ]
    }
}
