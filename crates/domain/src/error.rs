//! Domain error types.

use common::Provider;
use session_store::StoreError;
use thiserror::Error;

/// A webhook body that cannot be reduced to the event vocabulary.
///
/// The webhook path acknowledges these anyway; they are logged, never
/// retried.
#[derive(Debug, Error)]
pub enum NormalizationError {
    /// The body is not JSON of the expected shape.
    #[error("Malformed {provider} payload: {source}")]
    Malformed {
        provider: Provider,
        #[source]
        source: serde_json::Error,
    },

    /// A correlation id or event id is absent.
    #[error("Missing field `{field}` in {provider} payload")]
    MissingField {
        provider: Provider,
        field: &'static str,
    },
}

impl NormalizationError {
    pub(crate) fn missing(provider: Provider, field: &'static str) -> Self {
        NormalizationError::MissingField { provider, field }
    }
}

/// Errors that can occur during domain operations.
#[derive(Debug, Error)]
pub enum DomainError {
    /// An error occurred in the session store.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// A webhook payload could not be normalized.
    #[error("Normalization error: {0}")]
    Normalization(#[from] NormalizationError),
}

/// Result type for domain operations.
pub type Result<T> = std::result::Result<T, DomainError>;
