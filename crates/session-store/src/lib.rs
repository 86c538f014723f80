//! Durable state for the onboarding reconciler.
//!
//! Three storage concerns live here, each behind its own trait:
//! - [`SessionStore`]: checkout sessions and their one-to-one sub-records
//! - [`EventLedger`]: the idempotency ledger of admitted webhook events
//! - [`SignupLinkStore`]: magic-link codes with atomic redemption
//!
//! [`InMemorySessionStore`] backs tests and the default server; the
//! [`PostgresSessionStore`] relies on unique constraints and conditional
//! updates for every atomicity guarantee.

pub mod error;
pub mod memory;
pub mod postgres;
pub mod records;
pub mod store;

pub use error::{Result, StoreError};
pub use memory::{
    InMemorySessionStore, OP_ACQUIRE_LEASE, OP_TRANSITION_AGREEMENT, OP_TRANSITION_SESSION,
    PausedCall,
};
pub use postgres::PostgresSessionStore;
pub use records::{
    AgreementRecord, CheckoutSession, CompanyInfo, CompanyInfoFields, NewCheckoutSession,
    NewProcessedEvent, NewSignupLink, ProcessedEvent, RedemptionOutcome, SalesOrder, SignupLink,
    User, ZohoAccountLink,
};
pub use store::{EventLedger, SessionStore, SignupLinkStore, Store};
