//! API error types with HTTP response mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use reconciliation::{
    MagicLinkError, ProviderCallError, ProvisioningError, ReconcileError, SessionError,
};
use session_store::StoreError;

use crate::signature::SignatureError;

/// API-level error type that maps to HTTP responses.
///
/// Bodies are `{"error": "..."}`. Internal and provider failures are logged
/// in full and answered with a generic message.
#[derive(Debug)]
pub enum ApiError {
    /// Missing or invalid caller credentials, or a bad webhook signature.
    Unauthorized(String),
    /// The caller may not do this.
    Forbidden(String),
    /// Resource not found.
    NotFound(String),
    /// Bad request from the client.
    BadRequest(String),
    /// The request conflicts with current state.
    Conflict(String),
    /// The resource existed but is no longer usable.
    Gone(String),
    /// An upstream provider failed or timed out.
    Upstream(ProviderCallError),
    /// Internal server error.
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Gone(msg) => (StatusCode::GONE, msg),
            ApiError::Upstream(err) => {
                tracing::error!(error = %err, "provider call failed");
                let status = match err {
                    ProviderCallError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
                    _ => StatusCode::BAD_GATEWAY,
                };
                (status, "upstream provider unavailable".to_string())
            }
            ApiError::Internal(msg) => {
                tracing::error!(error = %msg, "internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal server error".to_string(),
                )
            }
        };

        let body = serde_json::json!({ "error": message });
        (status, axum::Json(body)).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict(msg) => ApiError::Conflict(msg),
            StoreError::NotFound { .. } => ApiError::NotFound(err.to_string()),
            StoreError::StaleStatus { .. } => ApiError::Conflict(err.to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<SessionError> for ApiError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::NotFound(_) | SessionError::UserNotFound(_) => {
                ApiError::NotFound(err.to_string())
            }
            SessionError::Forbidden(_) => ApiError::Forbidden(err.to_string()),
            SessionError::Validation(msg) => ApiError::BadRequest(msg),
            SessionError::AgreementLocked(..) | SessionError::MissingCompanyInfo(_) => {
                ApiError::Conflict(err.to_string())
            }
            SessionError::Provider(err) => ApiError::Upstream(err),
            SessionError::Store(err) => err.into(),
        }
    }
}

impl From<ProvisioningError> for ApiError {
    fn from(err: ProvisioningError) -> Self {
        match err {
            ProvisioningError::SessionNotFound(_) | ProvisioningError::UserNotFound(_) => {
                ApiError::NotFound(err.to_string())
            }
            ProvisioningError::Forbidden(_) => ApiError::Forbidden(err.to_string()),
            ProvisioningError::MissingCompanyInfo(_) | ProvisioningError::StateConflict(_) => {
                ApiError::Conflict(err.to_string())
            }
            ProvisioningError::StepFailed { source, .. } => ApiError::Upstream(source),
            ProvisioningError::Store(err) => err.into(),
        }
    }
}

impl From<MagicLinkError> for ApiError {
    fn from(err: MagicLinkError) -> Self {
        match err {
            MagicLinkError::NotFound | MagicLinkError::ContactUnavailable => {
                ApiError::NotFound(err.to_string())
            }
            MagicLinkError::NoLinkedContact(_) => ApiError::NotFound(err.to_string()),
            MagicLinkError::Expired => ApiError::Gone(err.to_string()),
            MagicLinkError::UsageExceeded | MagicLinkError::Forbidden(_) => {
                ApiError::Forbidden(err.to_string())
            }
            MagicLinkError::InvalidRequest(msg) => ApiError::BadRequest(msg),
            MagicLinkError::Store(err) => err.into(),
        }
    }
}

impl From<ReconcileError> for ApiError {
    fn from(err: ReconcileError) -> Self {
        ApiError::Internal(err.to_string())
    }
}

impl From<SignatureError> for ApiError {
    fn from(err: SignatureError) -> Self {
        ApiError::Unauthorized(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::SessionId;

    fn status(err: impl Into<ApiError>) -> StatusCode {
        err.into().into_response().status()
    }

    #[test]
    fn test_magic_link_statuses() {
        assert_eq!(status(MagicLinkError::NotFound), StatusCode::NOT_FOUND);
        assert_eq!(status(MagicLinkError::Expired), StatusCode::GONE);
        assert_eq!(status(MagicLinkError::UsageExceeded), StatusCode::FORBIDDEN);
        assert_eq!(status(MagicLinkError::ContactUnavailable), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_provider_failures_are_gateway_errors() {
        assert_eq!(
            status(ProvisioningError::StepFailed {
                step: "sales_order",
                source: ProviderCallError::Timeout {
                    operation: "crm.create_sales_order",
                    timeout_ms: 5000,
                },
            }),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            status(SessionError::Provider(ProviderCallError::Rejected {
                operation: "signature.create_envelope_signing_url",
                reason: "template missing".to_string(),
            })),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn test_session_statuses() {
        let id = SessionId::new();
        assert_eq!(status(SessionError::NotFound(id)), StatusCode::NOT_FOUND);
        assert_eq!(
            status(SessionError::Validation("bad".to_string())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status(SessionError::AgreementLocked(id, common::AgreementStatus::Completed)),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status(StoreError::Conflict("duplicate".to_string())),
            StatusCode::CONFLICT
        );
    }

    #[test]
    fn test_bad_signature_is_unauthorized() {
        assert_eq!(status(SignatureError::Mismatch), StatusCode::UNAUTHORIZED);
    }
}
