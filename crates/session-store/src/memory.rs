use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{AgreementStatus, ContactId, EnvelopeId, Provider, SessionId, SessionStatus, UserId};
use tokio::sync::{RwLock, oneshot};

use crate::records::decide_redemption;
use crate::{
    AgreementRecord, CheckoutSession, CompanyInfo, CompanyInfoFields, EventLedger,
    NewCheckoutSession, NewProcessedEvent, NewSignupLink, ProcessedEvent, RedemptionOutcome,
    Result, SalesOrder, SessionStore, SignupLink, SignupLinkStore, StoreError, User,
    ZohoAccountLink,
};

#[derive(Debug, Clone)]
struct Lease {
    holder: String,
    until: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct MemoryState {
    users: HashMap<UserId, User>,
    sessions: HashMap<SessionId, CheckoutSession>,
    company_infos: HashMap<SessionId, CompanyInfo>,
    agreements: HashMap<SessionId, AgreementRecord>,
    sales_orders: HashMap<SessionId, SalesOrder>,
    account_links: HashMap<UserId, ZohoAccountLink>,
    processed_events: HashMap<(Provider, String), ProcessedEvent>,
    step_attempts: HashMap<(SessionId, String), u32>,
    leases: HashMap<SessionId, Lease>,
    signup_links: HashMap<(ContactId, String), SignupLink>,
    armed_failures: HashSet<&'static str>,
    pause_points: HashMap<&'static str, PausePoint>,
}

#[derive(Debug)]
struct PausePoint {
    reached: oneshot::Sender<()>,
    resume: oneshot::Receiver<()>,
}

impl PausePoint {
    async fn hold(self) {
        let _ = self.reached.send(());
        let _ = self.resume.await;
    }
}

/// Handle on a call parked by [`InMemorySessionStore::pause_next`].
#[derive(Debug)]
pub struct PausedCall {
    /// Resolves once the call has reached the pause point.
    pub reached: oneshot::Receiver<()>,
    /// Send (or drop) to let the call continue.
    pub resume: oneshot::Sender<()>,
}

impl MemoryState {
    fn session_mut(&mut self, session_id: SessionId) -> Result<&mut CheckoutSession> {
        self.sessions
            .get_mut(&session_id)
            .ok_or_else(|| StoreError::not_found("checkout session", session_id))
    }

    fn take_failure(&mut self, operation: &'static str) -> Result<()> {
        if self.armed_failures.remove(operation) {
            return Err(StoreError::Database(sqlx::Error::PoolTimedOut));
        }
        Ok(())
    }
}

/// Operation names accepted by [`InMemorySessionStore::fail_next`] and
/// [`InMemorySessionStore::pause_next`].
pub const OP_TRANSITION_SESSION: &str = "transition_session_status";
pub const OP_TRANSITION_AGREEMENT: &str = "transition_agreement_status";
pub const OP_ACQUIRE_LEASE: &str = "try_acquire_provisioning_lease";

/// In-memory store implementation for testing and single-process runs.
///
/// Every operation runs under one write lock, which gives the same
/// per-row atomicity the PostgreSQL implementation gets from its
/// constraints and conditional updates.
#[derive(Clone, Default)]
pub struct InMemorySessionStore {
    state: Arc<RwLock<MemoryState>>,
}

impl InMemorySessionStore {
    /// Creates a new empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of admitted webhook events.
    pub async fn processed_event_count(&self) -> usize {
        self.state.read().await.processed_events.len()
    }

    /// Makes the next call to `operation` fail as if the database were
    /// unreachable. The failure fires once.
    pub async fn fail_next(&self, operation: &'static str) {
        self.state.write().await.armed_failures.insert(operation);
    }

    /// Parks the next call to `operation` before it touches any state,
    /// until the returned handle resumes it.
    pub async fn pause_next(&self, operation: &'static str) -> PausedCall {
        let (reached_tx, reached_rx) = oneshot::channel();
        let (resume_tx, resume_rx) = oneshot::channel();
        self.state.write().await.pause_points.insert(
            operation,
            PausePoint {
                reached: reached_tx,
                resume: resume_rx,
            },
        );
        PausedCall {
            reached: reached_rx,
            resume: resume_tx,
        }
    }

    async fn hold_if_paused(&self, operation: &'static str) {
        let pause = self.state.write().await.pause_points.remove(operation);
        if let Some(pause) = pause {
            pause.hold().await;
        }
    }

    /// Clears all records.
    pub async fn clear(&self) {
        *self.state.write().await = MemoryState::default();
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn create_user(&self, email: &str, name: Option<&str>) -> Result<User> {
        let mut state = self.state.write().await;
        if state.users.values().any(|u| u.email == email) {
            return Err(StoreError::Conflict(format!("email already registered: {email}")));
        }
        let user = User {
            id: UserId::new(),
            email: email.to_string(),
            name: name.map(str::to_string),
            created_at: Utc::now(),
        };
        state.users.insert(user.id, user.clone());
        Ok(user)
    }

    async fn get_user(&self, user_id: UserId) -> Result<Option<User>> {
        Ok(self.state.read().await.users.get(&user_id).cloned())
    }

    async fn create_session(&self, new: NewCheckoutSession) -> Result<CheckoutSession> {
        let mut state = self.state.write().await;

        if let Some(reference) = &new.payment_reference
            && state
                .sessions
                .values()
                .any(|s| s.payment_reference.as_ref() == Some(reference))
        {
            return Err(StoreError::Conflict(format!(
                "payment reference already bound: {reference}"
            )));
        }

        let now = Utc::now();
        let session = CheckoutSession {
            id: SessionId::new(),
            user_id: new.user_id,
            status: SessionStatus::Pending,
            module: new.module,
            card_last4: None,
            payment_reference: new.payment_reference,
            created_at: now,
            updated_at: now,
        };
        let sales_order = SalesOrder {
            session_id: session.id,
            external_id: None,
            amount: new.amount,
            currency: new.currency,
            created_at: now,
            updated_at: now,
        };

        state.sessions.insert(session.id, session.clone());
        state.sales_orders.insert(session.id, sales_order);
        Ok(session)
    }

    async fn get_session(&self, session_id: SessionId) -> Result<Option<CheckoutSession>> {
        Ok(self.state.read().await.sessions.get(&session_id).cloned())
    }

    async fn find_session_by_payment_reference(
        &self,
        reference: &str,
    ) -> Result<Option<CheckoutSession>> {
        let state = self.state.read().await;
        Ok(state
            .sessions
            .values()
            .find(|s| s.payment_reference.as_deref() == Some(reference))
            .cloned())
    }

    async fn list_sessions_for_user(&self, user_id: UserId) -> Result<Vec<CheckoutSession>> {
        let state = self.state.read().await;
        let mut sessions: Vec<_> = state
            .sessions
            .values()
            .filter(|s| s.user_id == user_id)
            .cloned()
            .collect();
        sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(sessions)
    }

    async fn transition_session_status(
        &self,
        session_id: SessionId,
        expected: SessionStatus,
        next: SessionStatus,
    ) -> Result<CheckoutSession> {
        let mut state = self.state.write().await;
        state.take_failure(OP_TRANSITION_SESSION)?;
        let session = state.session_mut(session_id)?;

        if session.status != expected {
            return Err(StoreError::StaleStatus {
                entity: "checkout session",
                id: session_id.to_string(),
                expected: expected.to_string(),
                actual: session.status.to_string(),
            });
        }

        session.status = next;
        session.updated_at = Utc::now();
        Ok(session.clone())
    }

    async fn record_card_summary(&self, session_id: SessionId, card_last4: &str) -> Result<()> {
        let mut state = self.state.write().await;
        let session = state.session_mut(session_id)?;
        session.card_last4 = Some(card_last4.to_string());
        session.updated_at = Utc::now();
        Ok(())
    }

    async fn upsert_company_info(
        &self,
        session_id: SessionId,
        fields: CompanyInfoFields,
    ) -> Result<CompanyInfo> {
        let mut state = self.state.write().await;
        if !state.sessions.contains_key(&session_id) {
            return Err(StoreError::not_found("checkout session", session_id));
        }

        let now = Utc::now();
        let info = state
            .company_infos
            .entry(session_id)
            .and_modify(|info| {
                info.fields = fields.clone();
                info.updated_at = now;
            })
            .or_insert_with(|| CompanyInfo {
                session_id,
                fields,
                created_at: now,
                updated_at: now,
            });
        Ok(info.clone())
    }

    async fn get_company_info(&self, session_id: SessionId) -> Result<Option<CompanyInfo>> {
        Ok(self.state.read().await.company_infos.get(&session_id).cloned())
    }

    async fn upsert_agreement(
        &self,
        session_id: SessionId,
        provider: &str,
        envelope_id: &EnvelopeId,
    ) -> Result<AgreementRecord> {
        let mut state = self.state.write().await;
        if !state.sessions.contains_key(&session_id) {
            return Err(StoreError::not_found("checkout session", session_id));
        }
        if state
            .agreements
            .values()
            .any(|a| &a.envelope_id == envelope_id && a.session_id != session_id)
        {
            return Err(StoreError::Conflict(format!(
                "envelope already bound to another session: {envelope_id}"
            )));
        }

        let now = Utc::now();
        let created_at = state
            .agreements
            .get(&session_id)
            .map(|a| a.created_at)
            .unwrap_or(now);
        let record = AgreementRecord {
            session_id,
            provider: provider.to_string(),
            envelope_id: envelope_id.clone(),
            status: AgreementStatus::Pending,
            completed_at: None,
            created_at,
            updated_at: now,
        };
        state.agreements.insert(session_id, record.clone());
        Ok(record)
    }

    async fn get_agreement_by_envelope(
        &self,
        envelope_id: &EnvelopeId,
    ) -> Result<Option<AgreementRecord>> {
        let state = self.state.read().await;
        Ok(state
            .agreements
            .values()
            .find(|a| &a.envelope_id == envelope_id)
            .cloned())
    }

    async fn get_agreement_for_session(
        &self,
        session_id: SessionId,
    ) -> Result<Option<AgreementRecord>> {
        Ok(self.state.read().await.agreements.get(&session_id).cloned())
    }

    async fn transition_agreement_status(
        &self,
        envelope_id: &EnvelopeId,
        expected: AgreementStatus,
        next: AgreementStatus,
        at: DateTime<Utc>,
    ) -> Result<AgreementRecord> {
        let mut state = self.state.write().await;
        state.take_failure(OP_TRANSITION_AGREEMENT)?;
        let record = state
            .agreements
            .values_mut()
            .find(|a| &a.envelope_id == envelope_id)
            .ok_or_else(|| StoreError::not_found("agreement", envelope_id))?;

        if record.status != expected {
            return Err(StoreError::StaleStatus {
                entity: "agreement",
                id: envelope_id.to_string(),
                expected: expected.to_string(),
                actual: record.status.to_string(),
            });
        }

        record.status = next;
        if next == AgreementStatus::Completed && record.completed_at.is_none() {
            record.completed_at = Some(at);
        }
        record.updated_at = at;
        Ok(record.clone())
    }

    async fn get_sales_order(&self, session_id: SessionId) -> Result<Option<SalesOrder>> {
        Ok(self.state.read().await.sales_orders.get(&session_id).cloned())
    }

    async fn set_sales_order_external_id(
        &self,
        session_id: SessionId,
        external_id: &str,
    ) -> Result<SalesOrder> {
        let mut state = self.state.write().await;
        let order = state
            .sales_orders
            .get_mut(&session_id)
            .ok_or_else(|| StoreError::not_found("sales order", session_id))?;

        match order.external_id.as_deref() {
            Some(existing) if existing == external_id => {}
            Some(existing) => {
                return Err(StoreError::Conflict(format!(
                    "sales order for {session_id} already provisioned as {existing}"
                )));
            }
            None => {
                order.external_id = Some(external_id.to_string());
                order.updated_at = Utc::now();
            }
        }
        Ok(order.clone())
    }

    async fn get_account_link(&self, user_id: UserId) -> Result<Option<ZohoAccountLink>> {
        Ok(self.state.read().await.account_links.get(&user_id).cloned())
    }

    async fn upsert_account_link(
        &self,
        user_id: UserId,
        contact_id: &ContactId,
    ) -> Result<ZohoAccountLink> {
        let mut state = self.state.write().await;
        let now = Utc::now();
        let link = state
            .account_links
            .entry(user_id)
            .and_modify(|link| {
                link.contact_id = contact_id.clone();
                link.updated_at = now;
            })
            .or_insert_with(|| ZohoAccountLink {
                user_id,
                contact_id: contact_id.clone(),
                access_token: None,
                refresh_token: None,
                token_expires_at: None,
                created_at: now,
                updated_at: now,
            });
        Ok(link.clone())
    }

    async fn record_step_attempt(&self, session_id: SessionId, step: &str) -> Result<u32> {
        let mut state = self.state.write().await;
        let attempts = state
            .step_attempts
            .entry((session_id, step.to_string()))
            .or_insert(0);
        *attempts += 1;
        Ok(*attempts)
    }

    async fn try_acquire_provisioning_lease(
        &self,
        session_id: SessionId,
        holder: &str,
        now: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<bool> {
        self.hold_if_paused(OP_ACQUIRE_LEASE).await;
        let mut state = self.state.write().await;
        if !state.sessions.contains_key(&session_id) {
            return Err(StoreError::not_found("checkout session", session_id));
        }

        if let Some(lease) = state.leases.get(&session_id)
            && lease.until > now
            && lease.holder != holder
        {
            return Ok(false);
        }

        state.leases.insert(
            session_id,
            Lease {
                holder: holder.to_string(),
                until,
            },
        );
        Ok(true)
    }

    async fn release_provisioning_lease(&self, session_id: SessionId, holder: &str) -> Result<()> {
        let mut state = self.state.write().await;
        if state
            .leases
            .get(&session_id)
            .is_some_and(|lease| lease.holder == holder)
        {
            state.leases.remove(&session_id);
        }
        Ok(())
    }
}

#[async_trait]
impl EventLedger for InMemorySessionStore {
    async fn record_processed_event(&self, event: NewProcessedEvent) -> Result<bool> {
        let mut state = self.state.write().await;
        let key = (event.provider, event.external_event_id.clone());
        if state.processed_events.contains_key(&key) {
            return Ok(false);
        }
        state.processed_events.insert(
            key,
            ProcessedEvent {
                provider: event.provider,
                external_event_id: event.external_event_id,
                event_kind: event.event_kind,
                received_at: Utc::now(),
            },
        );
        Ok(true)
    }

    async fn get_processed_event(
        &self,
        provider: Provider,
        external_event_id: &str,
    ) -> Result<Option<ProcessedEvent>> {
        let state = self.state.read().await;
        Ok(state
            .processed_events
            .get(&(provider, external_event_id.to_string()))
            .cloned())
    }

    async fn forget_processed_event(
        &self,
        provider: Provider,
        external_event_id: &str,
    ) -> Result<()> {
        self.state
            .write()
            .await
            .processed_events
            .remove(&(provider, external_event_id.to_string()));
        Ok(())
    }
}

#[async_trait]
impl SignupLinkStore for InMemorySessionStore {
    async fn create_signup_link(&self, new: NewSignupLink) -> Result<SignupLink> {
        let mut state = self.state.write().await;
        let key = (new.contact_id.clone(), new.login_code.clone());
        if state.signup_links.contains_key(&key) {
            return Err(StoreError::Conflict("login code collision".to_string()));
        }
        let link = SignupLink {
            contact_id: new.contact_id,
            login_code: new.login_code,
            created_by: new.created_by,
            expires_at: new.expires_at,
            max_uses: new.max_uses,
            usage_count: 0,
            is_active: true,
            created_at: Utc::now(),
        };
        state.signup_links.insert(key, link.clone());
        Ok(link)
    }

    async fn get_signup_link(
        &self,
        contact_id: &ContactId,
        login_code: &str,
    ) -> Result<Option<SignupLink>> {
        let state = self.state.read().await;
        Ok(state
            .signup_links
            .get(&(contact_id.clone(), login_code.to_string()))
            .cloned())
    }

    async fn redeem_signup_link(
        &self,
        contact_id: &ContactId,
        login_code: &str,
        now: DateTime<Utc>,
    ) -> Result<RedemptionOutcome> {
        let mut state = self.state.write().await;
        let Some(link) = state
            .signup_links
            .get_mut(&(contact_id.clone(), login_code.to_string()))
        else {
            return Ok(RedemptionOutcome::NotFound);
        };

        let (outcome, write) = decide_redemption(link, now);
        if let Some(updated) = write {
            *link = updated;
        }
        Ok(outcome)
    }
}
