//! Shared types used across the onboarding reconciler crates.

mod money;
mod provider;
mod status;
mod types;

pub use money::Money;
pub use provider::{Provider, UnknownProvider};
pub use status::{AgreementStatus, SessionStatus, UnknownStatus};
pub use types::{ContactId, EnvelopeId, SessionId, UserId};
