//! Reconciliation layer for the onboarding flow.
//!
//! This crate ties the pure domain logic to storage and the external
//! providers:
//! - [`Reconciler`]: the webhook pipeline (normalize, admit, apply)
//! - [`ProvisioningOrchestrator`]: the re-enterable CRM provisioning chain
//! - [`MagicLinkIssuer`]: signup-link issue and atomic redemption
//! - [`SessionService`]: the interactive checkout operations
//!
//! Provider collaborators sit behind the traits in [`services`]; every call
//! to one is bounded by a timeout.

pub mod error;
pub mod magic_link;
pub mod orchestrator;
pub mod reconciler;
pub mod services;
pub mod sessions;
pub mod timeout;
mod transition;

pub use error::{
    MagicLinkError, ProviderCallError, ProvisioningError, ReconcileError, SessionError,
};
pub use magic_link::{ContactSnapshot, IssueLinkRequest, IssuedLink, MagicLinkIssuer, RelatedIncludes};
pub use orchestrator::{OrchestratorConfig, ProvisioningOrchestrator, ProvisioningOutcome};
pub use reconciler::{Reconciler, WebhookOutcome};
pub use sessions::{
    CreateSessionRequest, PaymentRefresh, ProvisioningReport, SessionDetails, SessionService,
};
pub use timeout::DEFAULT_PROVIDER_TIMEOUT;
