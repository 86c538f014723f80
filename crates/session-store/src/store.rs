use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{AgreementStatus, ContactId, EnvelopeId, Provider, SessionId, SessionStatus, UserId};

use crate::{
    AgreementRecord, CheckoutSession, CompanyInfo, CompanyInfoFields, NewCheckoutSession,
    NewProcessedEvent, NewSignupLink, ProcessedEvent, RedemptionOutcome, Result, SalesOrder,
    SignupLink, User, ZohoAccountLink,
};

/// Storage for checkout sessions and their one-to-one sub-records.
///
/// Status changes are compare-and-set: the update only lands if the row
/// still holds `expected`, otherwise `StoreError::StaleStatus` is returned
/// and the caller re-reads. All implementations must be thread-safe.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn create_user(&self, email: &str, name: Option<&str>) -> Result<User>;

    async fn get_user(&self, user_id: UserId) -> Result<Option<User>>;

    /// Creates a session in `pending` together with its sales-order row
    /// (external id unset).
    ///
    /// Fails with `Conflict` if the payment reference is already bound to
    /// another session.
    async fn create_session(&self, new: NewCheckoutSession) -> Result<CheckoutSession>;

    async fn get_session(&self, session_id: SessionId) -> Result<Option<CheckoutSession>>;

    async fn find_session_by_payment_reference(
        &self,
        reference: &str,
    ) -> Result<Option<CheckoutSession>>;

    /// Returns the user's sessions, newest first.
    async fn list_sessions_for_user(&self, user_id: UserId) -> Result<Vec<CheckoutSession>>;

    async fn transition_session_status(
        &self,
        session_id: SessionId,
        expected: SessionStatus,
        next: SessionStatus,
    ) -> Result<CheckoutSession>;

    async fn record_card_summary(&self, session_id: SessionId, card_last4: &str) -> Result<()>;

    async fn upsert_company_info(
        &self,
        session_id: SessionId,
        fields: CompanyInfoFields,
    ) -> Result<CompanyInfo>;

    async fn get_company_info(&self, session_id: SessionId) -> Result<Option<CompanyInfo>>;

    /// Creates or replaces the session's agreement row with a fresh
    /// `pending` envelope.
    ///
    /// Fails with `Conflict` if the envelope id belongs to another session.
    async fn upsert_agreement(
        &self,
        session_id: SessionId,
        provider: &str,
        envelope_id: &EnvelopeId,
    ) -> Result<AgreementRecord>;

    async fn get_agreement_by_envelope(
        &self,
        envelope_id: &EnvelopeId,
    ) -> Result<Option<AgreementRecord>>;

    async fn get_agreement_for_session(
        &self,
        session_id: SessionId,
    ) -> Result<Option<AgreementRecord>>;

    /// Compare-and-set on the agreement status. Moving into `completed`
    /// stamps `completed_at` with `at` if it is not already set.
    async fn transition_agreement_status(
        &self,
        envelope_id: &EnvelopeId,
        expected: AgreementStatus,
        next: AgreementStatus,
        at: DateTime<Utc>,
    ) -> Result<AgreementRecord>;

    async fn get_sales_order(&self, session_id: SessionId) -> Result<Option<SalesOrder>>;

    /// Populates the CRM sales-order id. Setting the same id again is a
    /// no-op; a different id is a `Conflict`.
    async fn set_sales_order_external_id(
        &self,
        session_id: SessionId,
        external_id: &str,
    ) -> Result<SalesOrder>;

    async fn get_account_link(&self, user_id: UserId) -> Result<Option<ZohoAccountLink>>;

    /// Creates the user's CRM link, or updates the contact id on the existing one.
    async fn upsert_account_link(
        &self,
        user_id: UserId,
        contact_id: &ContactId,
    ) -> Result<ZohoAccountLink>;

    /// Counts an attempt at a provisioning step and returns the running total.
    async fn record_step_attempt(&self, session_id: SessionId, step: &str) -> Result<u32>;

    /// Atomically takes the per-session provisioning lease if it is free or
    /// expired at `now`. Returns false when another holder owns it.
    async fn try_acquire_provisioning_lease(
        &self,
        session_id: SessionId,
        holder: &str,
        now: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<bool>;

    /// Releases the lease if `holder` still owns it.
    async fn release_provisioning_lease(&self, session_id: SessionId, holder: &str) -> Result<()>;
}

/// The idempotency ledger.
#[async_trait]
pub trait EventLedger: Send + Sync {
    /// Inserts the (provider, external event id) pair.
    ///
    /// Returns true if this call inserted it, false if it was already
    /// present. The check is the storage engine's atomic insert, never a
    /// read-then-write.
    async fn record_processed_event(&self, event: NewProcessedEvent) -> Result<bool>;

    async fn get_processed_event(
        &self,
        provider: Provider,
        external_event_id: &str,
    ) -> Result<Option<ProcessedEvent>>;

    /// Removes the pair so a later delivery of the same event is admitted
    /// again. Removing an absent pair is not an error.
    async fn forget_processed_event(
        &self,
        provider: Provider,
        external_event_id: &str,
    ) -> Result<()>;
}

/// Storage for magic-link codes.
#[async_trait]
pub trait SignupLinkStore: Send + Sync {
    async fn create_signup_link(&self, new: NewSignupLink) -> Result<SignupLink>;

    async fn get_signup_link(
        &self,
        contact_id: &ContactId,
        login_code: &str,
    ) -> Result<Option<SignupLink>>;

    /// Validates and consumes one use of a link in a single atomic step,
    /// so concurrent redemptions cannot both pass the limit check.
    async fn redeem_signup_link(
        &self,
        contact_id: &ContactId,
        login_code: &str,
        now: DateTime<Utc>,
    ) -> Result<RedemptionOutcome>;
}

/// Everything the reconciler needs from storage.
pub trait Store: SessionStore + EventLedger + SignupLinkStore {}

// Blanket implementation for all backends providing the three traits
impl<T: SessionStore + EventLedger + SignupLinkStore + ?Sized> Store for T {}
