use crate::models::{DocumentStatus, SectionStatus};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("pdf parse error: {0}")]
    PdfParse(String),

    #[error("path has no file name: {0}")]
    MissingFileName(String),

    #[error("outline parse error: {0}")]
    Outline(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum StructureError {
    #[error("document text is empty")]
    EmptyDocument,

    #[error("no usable structure found: the document has no bookmarks, table of contents, headings or chapter markers")]
    NoStructuralSignal,

    #[error("invalid page offset table: {0}")]
    InvalidPageOffsets(String),

    #[error("regex error: {0}")]
    Regex(#[from] regex::Error),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChunkError {
    #[error("invalid chunking config: {0}")]
    InvalidConfig(String),

    #[error("section of {units} units needs {required} chunks but the policy allows {allowed}")]
    BudgetExceeded {
        units: usize,
        required: usize,
        allowed: usize,
    },
}

#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("provider returned status {status}: {message}")]
    Status {
        status: u16,
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("provider response had no content: {0}")]
    EmptyResponse(String),
}

impl ProviderError {
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Auth failures and permanent client errors are not worth a backoff.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Status { status, .. } => matches!(status, 408 | 409 | 425 | 429 | 500..=599),
            Self::Transport(_) | Self::EmptyResponse(_) => true,
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        self.status() == Some(429)
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Status { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    pub fn category(&self) -> FailureCategory {
        FailureCategory::classify(self.status(), &self.to_string())
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(error: reqwest::Error) -> Self {
        match error.status() {
            Some(status) => Self::Status {
                status: status.as_u16(),
                message: error.to_string(),
                retry_after: None,
            },
            None => Self::Transport(error.to_string()),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("response is not valid JSON: {0}")]
    Json(String),

    #[error("response does not match the extraction schema: {0}")]
    Schema(String),
}

/// User-facing failure buckets for a chunk that exhausted its attempts.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum FailureCategory {
    Authentication,
    RateLimited,
    QuotaExhausted,
    ServiceError,
}

impl FailureCategory {
    const AUTH_HINTS: [&'static str; 7] = [
        "unauthorized",
        "invalid api key",
        "invalid_api_key",
        "incorrect api key",
        "api key not valid",
        "permission denied",
        "authentication",
    ];
    const QUOTA_HINTS: [&'static str; 5] = [
        "insufficient_quota",
        "quota exceeded",
        "billing",
        "exceeded your current",
        "credit balance",
    ];
    const RATE_HINTS: [&'static str; 5] = [
        "rate limit",
        "rate_limit",
        "too many requests",
        "resource_exhausted",
        "resource has been exhausted",
    ];

    pub fn classify(status: Option<u16>, message: &str) -> Self {
        let lowered = message.to_lowercase();
        let mentions = |hints: &[&str]| hints.iter().any(|hint| lowered.contains(hint));

        // Only account-level wording is exhausted quota. A 429 asking to
        // "check quota" is still a rate limit.
        if matches!(status, Some(401 | 403)) || mentions(&Self::AUTH_HINTS) {
            Self::Authentication
        } else if mentions(&Self::QUOTA_HINTS) {
            Self::QuotaExhausted
        } else if status == Some(429) || mentions(&Self::RATE_HINTS) {
            Self::RateLimited
        } else {
            Self::ServiceError
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Authentication => "authentication",
            Self::RateLimited => "rate-limited",
            Self::QuotaExhausted => "quota-exhausted",
            Self::ServiceError => "service-error",
        }
    }

    pub fn user_message(&self) -> &'static str {
        match self {
            Self::Authentication => "The provider rejected the configured API key.",
            Self::RateLimited => "The provider is rate limiting requests, try again later.",
            Self::QuotaExhausted => "The provider account has run out of quota.",
            Self::ServiceError => "The provider failed to return a usable extraction.",
        }
    }
}

impl fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FailureKind {
    Provider,
    Validation,
}

#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq)]
#[error("{category} after {attempts} attempt(s): {detail}")]
pub struct ExtractionFailure {
    pub kind: FailureKind,
    pub category: FailureCategory,
    pub detail: String,
    pub attempts: u32,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("{kind} already exists: {id}")]
    Conflict { kind: &'static str, id: String },

    #[error("store backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GraphEditError {
    #[error("node not found: {0}")]
    NodeNotFound(String),

    #[error("node name must not be empty")]
    EmptyName,
}

/// A join that arrived after its section was already settled elsewhere.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("stale join for section {section_id}: section is already {current:?}")]
pub struct StaleJoin {
    pub section_id: String,
    pub current: SectionStatus,
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Structure(#[from] StructureError),

    #[error("document has {units} units which exceeds the limit of {limit}")]
    SizeLimit { units: usize, limit: usize },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Graph(#[from] GraphEditError),

    #[error("document not found: {0}")]
    DocumentNotFound(String),

    #[error("section not found: {0}")]
    SectionNotFound(String),

    #[error("unknown provider: {0}")]
    UnknownProvider(String),

    #[error("document cannot move from {from:?} to {to:?}")]
    InvalidTransition {
        from: DocumentStatus,
        to: DocumentStatus,
    },
}

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;
