use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("Feature schema mismatch: model expects {expected:?}, pipeline provides {actual:?}")]
    SchemaMismatch { expected: Vec<String>, actual: Vec<String> },

    #[error("Invalid configuration: {reason}")]
    Config { reason: String },

    #[error("Model unavailable: {reason}")]
    ModelUnavailable { reason: String },

    #[error("No feature row for policy '{policy_id}'")]
    PolicyNotFound { policy_id: String },

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PipelineError {
    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation { field: field.into(), reason: reason.into() }
    }

    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config { reason: reason.into() }
    }

    /// Stable tag for request/response callers.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation { .. }       => "validation",
            Self::SchemaMismatch { .. }   => "schema_mismatch",
            Self::Config { .. }           => "config",
            Self::ModelUnavailable { .. } => "model_unavailable",
            Self::PolicyNotFound { .. }   => "policy_not_found",
            Self::Database(_)             => "database",
            Self::Serialization(_)        => "serialization",
            Self::Io(_)                   => "io",
            Self::Other(_)                => "internal",
        }
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;
