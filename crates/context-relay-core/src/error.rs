//! Typed error kinds surfaced to callers.
//!
//! Every kind maps to one HTTP status and one machine-readable code. The
//! application layer renders them into the uniform JSON error envelope.

use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelayError {
    /// Malformed input. `fields` maps a field name to its problems.
    #[error("{message}")]
    Validation {
        message: String,
        fields: BTreeMap<String, Vec<String>>,
    },

    #[error("{0}")]
    Authentication(String),

    #[error("{0}")]
    Authorization(String),

    /// Unknown prompt name/version or other missing resource.
    #[error("{0}")]
    NotFound(String),

    /// Request rejected by the rate limiter.
    #[error("rate limit exceeded, retry after {retry_after}s")]
    RateLimited { retry_after: u64 },

    #[error("{0}")]
    Internal(String),
}

impl RelayError {
    /// A validation error for a single field.
    pub fn invalid_field(field: &str, problem: impl Into<String>) -> Self {
        let problem = problem.into();
        let mut fields = BTreeMap::new();
        fields.insert(field.to_string(), vec![problem.clone()]);
        Self::Validation {
            message: format!("{field}: {problem}"),
            fields,
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn status(&self) -> u16 {
        match self {
            Self::Validation { .. } => 400,
            Self::Authentication(_) => 401,
            Self::Authorization(_) => 403,
            Self::NotFound(_) => 404,
            Self::RateLimited { .. } => 429,
            Self::Internal(_) => 500,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "validation_error",
            Self::Authentication(_) => "unauthorized",
            Self::Authorization(_) => "forbidden",
            Self::NotFound(_) => "not_found",
            Self::RateLimited { .. } => "rate_limited",
            Self::Internal(_) => "internal_error",
        }
    }
}

impl From<anyhow::Error> for RelayError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(format!("{err:#}"))
    }
}
