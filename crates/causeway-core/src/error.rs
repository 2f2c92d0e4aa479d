//! Error types for Causeway

use thiserror::Error;

/// Result type alias using Causeway's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Causeway error types with helpful messages and suggestions
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors (E001-E099)
    #[error("Invalid configuration for `{field}`: {reason}")]
    InvalidConfig { field: String, reason: String },

    #[error("Malformed concept identifier '{0}': expected one letter followed by 7 digits (e.g. C0020538)")]
    InvalidConceptId(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    // Network / LLM errors (E100-E199)
    #[error("Network error: {0}. Check connectivity to the similarity service.")]
    NetworkError(#[from] reqwest::Error),

    #[error("LLM API error: {0}")]
    LLMError(String),

    #[error("Rate limited. Waiting {0} seconds before retry.")]
    RateLimited(u64),

    #[error("Similarity judgment failed: {0}")]
    JudgmentFailed(String),

    #[error("Call timed out after {0} seconds")]
    Timeout(u64),

    // Predication store errors (E400-E499)
    #[error("Predication store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Predication query failed: {0}")]
    QueryFailed(String),

    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),

    // Persistence errors (E500-E599)
    #[error("Artifact format error: {0}")]
    ArtifactFormat(String),

    #[error("Binary encoding error: {0}")]
    Encoding(#[from] bincode::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Cache error: {0}")]
    CacheError(String),

    // Internal defects (E900-E999)
    #[error("Invariant violated: {0}")]
    InvariantViolation(String),

    #[error("{0}")]
    Other(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Shorthand for a configuration error on a named field
    pub fn invalid_config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Get error code for this error type
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidConfig { .. } => "E001",
            Self::InvalidConceptId(_) => "E002",
            Self::ConfigError(_) => "E003",
            Self::NetworkError(_) => "E100",
            Self::LLMError(_) => "E101",
            Self::RateLimited(_) => "E102",
            Self::JudgmentFailed(_) => "E103",
            Self::Timeout(_) => "E104",
            Self::StoreUnavailable(_) => "E400",
            Self::QueryFailed(_) => "E401",
            Self::DatabaseError(_) => "E402",
            Self::ArtifactFormat(_) => "E500",
            Self::Encoding(_) => "E501",
            Self::Serialization(_) => "E502",
            Self::CacheError(_) => "E503",
            Self::InvariantViolation(_) => "E900",
            Self::Other(_) | Self::Io(_) => "E9999",
        }
    }

    /// Get suggestion for how to fix this error
    pub fn suggestion(&self) -> Option<String> {
        match self {
            Self::InvalidConfig { field, .. } => {
                Some(format!("causeway config get {}", field))
            }
            Self::InvalidConceptId(_) => {
                Some("Concept identifiers look like C0020538".to_string())
            }
            Self::StoreUnavailable(_) => {
                Some("Check the [database] section and CAUSEWAY_DB_PASSWORD".to_string())
            }
            Self::LLMError(_) => Some("Set CAUSEWAY_API_KEY or OPENROUTER_API_KEY".to_string()),
            Self::InvariantViolation(_) => {
                Some("This is a bug; please report it with the run metrics".to_string())
            }
            _ => None,
        }
    }

    /// Whether the error is a configuration problem that should fail fast
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::InvalidConfig { .. } | Self::InvalidConceptId(_) | Self::ConfigError(_)
        )
    }

    /// Whether retrying the same operation may succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::NetworkError(_)
                | Self::RateLimited(_)
                | Self::Timeout(_)
                | Self::JudgmentFailed(_)
                | Self::LLMError(_)
                | Self::StoreUnavailable(_)
                | Self::QueryFailed(_)
        )
    }
}
