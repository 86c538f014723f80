//! Reconciliation error types.

use common::{SessionId, UserId};
use domain::DomainError;
use session_store::StoreError;
use thiserror::Error;

/// A call to an external provider that did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderCallError {
    /// The call did not finish within the configured bound.
    #[error("{operation} timed out after {timeout_ms} ms")]
    Timeout {
        operation: &'static str,
        timeout_ms: u64,
    },

    /// The provider answered and refused (4xx-equivalent).
    #[error("{operation} rejected: {reason}")]
    Rejected {
        operation: &'static str,
        reason: String,
    },

    /// The provider could not be reached or failed (5xx-equivalent).
    #[error("{operation} unavailable: {reason}")]
    Unavailable {
        operation: &'static str,
        reason: String,
    },
}

/// Errors from a provisioning run.
///
/// A failed run leaves the session in its last successful sub-state and is
/// safe to re-run.
#[derive(Debug, Error)]
pub enum ProvisioningError {
    #[error("Checkout session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("Not allowed to provision session {0}")]
    Forbidden(SessionId),

    #[error("User not found: {0}")]
    UserNotFound(UserId),

    /// Step 1 needs the company profile.
    #[error("Company info missing for session {0}")]
    MissingCompanyInfo(SessionId),

    /// A provisioning step failed at the provider.
    #[error("Provisioning step '{step}' failed: {source}")]
    StepFailed {
        step: &'static str,
        #[source]
        source: ProviderCallError,
    },

    /// Stored state changed underneath the run in a way it cannot reconcile.
    #[error("State conflict: {0}")]
    StateConflict(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl ProvisioningError {
    /// The step label used in metrics, if the failure belongs to a step.
    pub fn step(&self) -> Option<&'static str> {
        match self {
            ProvisioningError::StepFailed { step, .. } => Some(step),
            _ => None,
        }
    }
}

/// Infrastructure failures on the webhook path.
///
/// Business outcomes (duplicates, orphans, conflicts) are not errors; they
/// are reported through `WebhookOutcome`.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Domain error: {0}")]
    Domain(#[from] DomainError),
}

/// Magic-link issue and redemption failures.
#[derive(Debug, Error)]
pub enum MagicLinkError {
    /// The owner has no CRM contact yet.
    #[error("No linked CRM contact for user {0}")]
    NoLinkedContact(UserId),

    /// Only portal users issue links for their own contact.
    #[error("Not allowed to issue signup links as {0}")]
    Forbidden(String),

    #[error("Invalid link request: {0}")]
    InvalidRequest(String),

    #[error("Signup link not found")]
    NotFound,

    #[error("Signup link expired")]
    Expired,

    #[error("Signup link usage limit reached")]
    UsageExceeded,

    /// The CRM could not return the contact; the detail stays in the logs.
    #[error("Contact not found or access denied")]
    ContactUnavailable,

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Errors from the interactive session operations.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Checkout session not found: {0}")]
    NotFound(SessionId),

    #[error("User not found: {0}")]
    UserNotFound(UserId),

    #[error("Not allowed: {0}")]
    Forbidden(String),

    #[error("Validation error: {0}")]
    Validation(String),

    /// Company info and the agreement are frozen once the agreement is terminal.
    #[error("Agreement for session {0} is already {1}")]
    AgreementLocked(SessionId, common::AgreementStatus),

    #[error("Company info missing for session {0}")]
    MissingCompanyInfo(SessionId),

    #[error("Provider call failed: {0}")]
    Provider(#[from] ProviderCallError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}
