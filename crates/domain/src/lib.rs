//! Domain layer for the onboarding reconciler.
//!
//! This crate holds the pure logic:
//! - The normalized event vocabulary and the per-provider Event Normalizer
//! - Session and agreement state machines as decision functions
//! - The Idempotency Guard over the event ledger
//! - The explicit caller [`Identity`]

pub mod error;
pub mod events;
pub mod identity;
pub mod idempotency;
pub mod machine;
pub mod normalizer;

pub use error::{DomainError, NormalizationError, Result};
pub use events::{Correlation, EventKind, NormalizedEvent};
pub use identity::Identity;
pub use idempotency::{Admission, IdempotencyGuard};
pub use machine::{AgreementDecision, SessionDecision, SessionGuards, SessionTrigger};
pub use normalizer::normalize;
