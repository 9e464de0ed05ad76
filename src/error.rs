//! Error types for the retrieval core.
//!
//! Read paths degrade to empty results at the documented points only; every
//! other failure propagates to the caller as one of these variants.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Malformed text or record; never retried
    #[error("Invalid input: {reason}")]
    InvalidInput { reason: String },

    #[error("Vector dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// A persistence, vector-index or generation call failed
    #[error("{collaborator} unavailable: {message}")]
    Unavailable {
        collaborator: &'static str,
        message: String,
    },

    #[error("{kind} '{id}' not found")]
    NotFound { kind: &'static str, id: String },

    /// Both generation tiers exhausted their retries
    #[error("Text generation unavailable after trying {models:?}: {last_error}")]
    ModelOverloaded {
        models: Vec<String>,
        last_error: String,
    },

    /// Non-transient generation failure
    #[error("Text generation failed with {model}: {message}")]
    Generation { model: String, message: String },

    /// The bug row was written but its vector was not
    #[error("Bug {bug_id} was saved but could not be indexed (run `fixforge reindex`): {message}")]
    IndexWrite { bug_id: String, message: String },

    /// A batch upsert stopped part way; rows already written stay written
    #[error("Upsert into {table} failed after {written} rows: {message}")]
    PartialUpsert {
        table: String,
        written: usize,
        message: String,
    },

    #[error("Operation cancelled")]
    Cancelled,

    /// A row from the store did not match the typed record
    #[error("Failed to decode {kind} row: {message}")]
    Decode { kind: &'static str, message: String },

    #[error("Embedding model error: {0}")]
    Model(String),
}

impl Error {
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidInput {
            reason: reason.into(),
        }
    }

    pub fn unavailable(collaborator: &'static str, message: impl ToString) -> Self {
        Self::Unavailable {
            collaborator,
            message: message.to_string(),
        }
    }

    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Stable identifier for `--json` error output
    pub fn status_code(&self) -> &'static str {
        match self {
            Self::InvalidInput { .. } | Self::DimensionMismatch { .. } => "invalid_input",
            Self::Unavailable { .. } => "collaborator_unavailable",
            Self::NotFound { .. } => "not_found",
            Self::ModelOverloaded { .. } => "service_unavailable",
            Self::Generation { .. } => "generation_failed",
            Self::IndexWrite { .. } => "index_write_failed",
            Self::PartialUpsert { .. } => "partial_upsert",
            Self::Cancelled => "cancelled",
            Self::Decode { .. } => "decode_error",
            Self::Model(_) => "model_error",
        }
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }

    /// Whether running the same command again later may succeed
    pub fn is_retryable(&self) -> bool {
        self.is_unavailable() || matches!(self, Self::ModelOverloaded { .. })
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Self::unavailable("sqlite", err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(Error::invalid("x").status_code(), "invalid_input");
        assert_eq!(
            Error::DimensionMismatch {
                expected: 384,
                actual: 3
            }
            .status_code(),
            "invalid_input"
        );
        assert_eq!(Error::not_found("bug", "FF-1").status_code(), "not_found");
        assert_eq!(Error::Cancelled.status_code(), "cancelled");
    }

    #[test]
    fn test_display_messages() {
        let err = Error::DimensionMismatch {
            expected: 384,
            actual: 12,
        };
        assert_eq!(
            err.to_string(),
            "Vector dimension mismatch: expected 384, got 12"
        );

        let err = Error::not_found("bug", "FF-deadbeef");
        assert_eq!(err.to_string(), "bug 'FF-deadbeef' not found");
    }

    #[test]
    fn test_retryable_errors() {
        assert!(Error::unavailable("endee", "connection refused").is_retryable());
        assert!(Error::ModelOverloaded {
            models: vec!["models/gemini-1.5-pro-latest".into()],
            last_error: "503".into(),
        }
        .is_retryable());
        assert!(!Error::invalid("bad").is_retryable());
        assert!(!Error::Cancelled.is_retryable());
    }
}
