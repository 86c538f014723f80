//! Provisioning orchestrator.
//!
//! Provisions a paid, signed session into the CRM in three steps:
//! 1. contact upsert (update through the owner's account link, else create)
//! 2. sales order creation
//! 3. session completion
//!
//! Each step's own completion marker decides whether it runs: the session
//! status and account link for step 1, the sales order's external id for
//! step 2. A failed run leaves the session at its last completed step and
//! can simply be run again.

use std::time::{Duration, Instant};

use chrono::Utc;
use common::{AgreementStatus, ContactId, SessionId, SessionStatus};
use domain::{Identity, SessionGuards, SessionTrigger};
use serde::Serialize;
use session_store::{CheckoutSession, CompanyInfoFields, Store, User, ZohoAccountLink};
use uuid::Uuid;

use crate::error::{ProviderCallError, ProvisioningError};
use crate::services::crm::{OP_CREATE_CONTACT, OP_CREATE_SALES_ORDER, OP_GET_CONTACT, OP_UPDATE_CONTACT};
use crate::services::{ContactFields, CrmService, SalesOrderRequest};
use crate::timeout::{DEFAULT_PROVIDER_TIMEOUT, bounded};
use crate::transition::{TriggerResult, apply_trigger};

pub const STEP_CONTACT_UPSERT: &str = "contact_upsert";
pub const STEP_SALES_ORDER: &str = "sales_order";
pub const STEP_COMPLETE_SESSION: &str = "complete_session";

/// Result of a provisioning run that did not fail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ProvisioningOutcome {
    /// This run finished the chain.
    Completed,
    /// The session was already completed; nothing was called.
    AlreadyComplete,
    /// Another run holds the session's lease.
    InProgress,
    /// Payment or signature is still outstanding.
    NotReady { reason: String },
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Bound on each CRM call.
    pub provider_timeout: Duration,
    /// How long a run may hold the session lease before others may take it.
    pub lease_duration: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            provider_timeout: DEFAULT_PROVIDER_TIMEOUT,
            lease_duration: Duration::from_secs(60),
        }
    }
}

/// Drives the provisioning chain for one session at a time.
#[derive(Debug, Clone)]
pub struct ProvisioningOrchestrator<S, C> {
    store: S,
    crm: C,
    config: OrchestratorConfig,
}

impl<S, C> ProvisioningOrchestrator<S, C>
where
    S: Store,
    C: CrmService,
{
    pub fn new(store: S, crm: C, config: OrchestratorConfig) -> Self {
        Self { store, crm, config }
    }

    pub fn crm(&self) -> &C {
        &self.crm
    }

    /// Runs whatever part of the chain is still outstanding for `session_id`.
    #[tracing::instrument(skip_all, fields(session_id = %session_id, identity = %identity))]
    pub async fn run(
        &self,
        identity: Identity,
        session_id: SessionId,
    ) -> Result<ProvisioningOutcome, ProvisioningError> {
        metrics::counter!("provisioning_runs_total").increment(1);
        let started = Instant::now();

        let session = self
            .store
            .get_session(session_id)
            .await?
            .ok_or(ProvisioningError::SessionNotFound(session_id))?;

        if !identity.may_provision(session.user_id) {
            return Err(ProvisioningError::Forbidden(session_id));
        }
        if session.status == SessionStatus::Completed {
            return Ok(ProvisioningOutcome::AlreadyComplete);
        }

        // Each run gets its own holder so two runs in one process still exclude each other.
        let holder = format!("provisioning-{}", Uuid::new_v4());
        let now = Utc::now();
        let until = now
            + chrono::Duration::from_std(self.config.lease_duration)
                .unwrap_or_else(|_| chrono::Duration::seconds(60));
        if !self
            .store
            .try_acquire_provisioning_lease(session_id, &holder, now, until)
            .await?
        {
            tracing::info!("provisioning already in progress");
            return Ok(ProvisioningOutcome::InProgress);
        }

        let result = self.run_leased(session_id).await;

        if let Err(err) = self
            .store
            .release_provisioning_lease(session_id, &holder)
            .await
        {
            tracing::warn!(error = %err, "failed to release provisioning lease");
        }

        metrics::histogram!("provisioning_duration_seconds")
            .record(started.elapsed().as_secs_f64());

        match &result {
            Ok(outcome) => tracing::info!(?outcome, "provisioning run finished"),
            Err(err) => {
                let step = err.step().unwrap_or("none");
                metrics::counter!("provisioning_failures_total", "step" => step).increment(1);
                tracing::error!(
                    alert = "provisioning_failed",
                    step,
                    error = %err,
                    "provisioning run failed, session left at its last completed step"
                );
            }
        }

        result
    }

    /// Re-reads the session under the lease; another run may have moved it
    /// on since the caller's first read.
    async fn run_leased(
        &self,
        session_id: SessionId,
    ) -> Result<ProvisioningOutcome, ProvisioningError> {
        let session = self
            .store
            .get_session(session_id)
            .await?
            .ok_or(ProvisioningError::SessionNotFound(session_id))?;
        if session.status == SessionStatus::Completed {
            return Ok(ProvisioningOutcome::AlreadyComplete);
        }
        self.run_steps(session).await
    }

    async fn run_steps(
        &self,
        session: CheckoutSession,
    ) -> Result<ProvisioningOutcome, ProvisioningError> {
        let session_id = session.id;
        let mut status = session.status;

        if !status.is_paid() {
            return Ok(ProvisioningOutcome::NotReady {
                reason: format!("session is {status}"),
            });
        }

        let agreement_completed = self
            .store
            .get_agreement_for_session(session_id)
            .await?
            .is_some_and(|agreement| agreement.status == AgreementStatus::Completed);
        if !agreement_completed {
            return Ok(ProvisioningOutcome::NotReady {
                reason: "agreement not completed".to_string(),
            });
        }

        let user = self
            .store
            .get_user(session.user_id)
            .await?
            .ok_or(ProvisioningError::UserNotFound(session.user_id))?;
        let company = self.store.get_company_info(session_id).await?;
        let mut link = self.store.get_account_link(user.id).await?;

        if status == SessionStatus::PaymentCompleted {
            tracing::info!(step = STEP_CONTACT_UPSERT, "provisioning step started");
            let company = company
                .as_ref()
                .ok_or(ProvisioningError::MissingCompanyInfo(session_id))?;

            let attempts = self
                .store
                .record_step_attempt(session_id, STEP_CONTACT_UPSERT)
                .await?;
            if attempts > 1 && link.is_none() {
                tracing::warn!(
                    alert = "duplicate_side_effect",
                    step = STEP_CONTACT_UPSERT,
                    attempts,
                    "possible duplicate side effect: contact create retried without a recorded link"
                );
            }

            let contact_id = self
                .upsert_contact(session_id, &user, &company.fields, link.as_ref())
                .await?;
            link = Some(self.store.upsert_account_link(user.id, &contact_id).await?);

            let guards = SessionGuards {
                company_info_exists: true,
                account_link_exists: true,
                agreement_completed,
            };
            status = self
                .advance(session_id, SessionTrigger::ContactProvisioned, &guards)
                .await?;
        }

        if status == SessionStatus::ContactCreated {
            tracing::info!(step = STEP_SALES_ORDER, "provisioning step started");
            let contact_id = link
                .as_ref()
                .map(|link| link.contact_id.clone())
                .ok_or_else(|| {
                    ProvisioningError::StateConflict(format!(
                        "session {session_id} has a contact but its owner has no account link"
                    ))
                })?;

            let sales_order = self.store.get_sales_order(session_id).await?.ok_or_else(|| {
                ProvisioningError::StateConflict(format!("session {session_id} has no sales order row"))
            })?;

            if sales_order.external_id.is_none() {
                let attempts = self
                    .store
                    .record_step_attempt(session_id, STEP_SALES_ORDER)
                    .await?;
                if attempts > 1 {
                    tracing::warn!(
                        alert = "duplicate_side_effect",
                        step = STEP_SALES_ORDER,
                        attempts,
                        "possible duplicate side effect: sales order create retried"
                    );
                }

                let request = SalesOrderRequest::for_session(
                    session_id,
                    session.module.as_deref(),
                    contact_id,
                    sales_order.amount,
                    &sales_order.currency,
                );
                let external_id = self
                    .call(STEP_SALES_ORDER, OP_CREATE_SALES_ORDER, self.crm.create_sales_order(request))
                    .await?;
                self.store
                    .set_sales_order_external_id(session_id, &external_id)
                    .await?;
                tracing::info!(sales_order_id = %external_id, "crm sales order created");
            }

            let guards = SessionGuards {
                company_info_exists: company.is_some(),
                account_link_exists: true,
                agreement_completed,
            };
            status = self
                .advance(session_id, SessionTrigger::SalesOrderProvisioned, &guards)
                .await?;
        }

        if status == SessionStatus::SalesOrderCreated {
            tracing::info!(step = STEP_COMPLETE_SESSION, "provisioning step started");
            let guards = SessionGuards {
                company_info_exists: company.is_some(),
                account_link_exists: link.is_some(),
                agreement_completed,
            };
            status = self
                .advance(session_id, SessionTrigger::AgreementCompleted, &guards)
                .await?;
        }

        match status {
            SessionStatus::Completed => Ok(ProvisioningOutcome::Completed),
            other => Err(ProvisioningError::StateConflict(format!(
                "session {session_id} ended the run in {other}"
            ))),
        }
    }

    async fn upsert_contact(
        &self,
        session_id: SessionId,
        user: &User,
        company: &CompanyInfoFields,
        link: Option<&ZohoAccountLink>,
    ) -> Result<ContactId, ProvisioningError> {
        let fields = ContactFields::for_session(session_id, company, user);

        if let Some(link) = link {
            let existing = self
                .call(STEP_CONTACT_UPSERT, OP_GET_CONTACT, self.crm.get_contact(&link.contact_id))
                .await?;
            if existing.is_some() {
                self.call(
                    STEP_CONTACT_UPSERT,
                    OP_UPDATE_CONTACT,
                    self.crm.update_contact(&link.contact_id, fields),
                )
                .await?;
                tracing::info!(contact_id = %link.contact_id, "crm contact updated");
                return Ok(link.contact_id.clone());
            }
            tracing::warn!(
                contact_id = %link.contact_id,
                "linked crm contact no longer exists, creating a new one"
            );
        }

        let contact_id = self
            .call(STEP_CONTACT_UPSERT, OP_CREATE_CONTACT, self.crm.create_contact(fields))
            .await?;
        tracing::info!(contact_id = %contact_id, "crm contact created");
        Ok(contact_id)
    }

    async fn call<T>(
        &self,
        step: &'static str,
        operation: &'static str,
        call: impl Future<Output = Result<T, ProviderCallError>>,
    ) -> Result<T, ProvisioningError> {
        bounded(operation, self.config.provider_timeout, call)
            .await
            .map_err(|source| ProvisioningError::StepFailed { step, source })
    }

    async fn advance(
        &self,
        session_id: SessionId,
        trigger: SessionTrigger,
        guards: &SessionGuards,
    ) -> Result<SessionStatus, ProvisioningError> {
        match apply_trigger(&self.store, session_id, trigger, guards).await? {
            TriggerResult::Applied { to, .. } => Ok(to),
            TriggerResult::Unchanged(current) => Ok(current),
            TriggerResult::Blocked(reason) => Err(ProvisioningError::StateConflict(format!(
                "{trigger} blocked: {reason}"
            ))),
            TriggerResult::Conflict(current) => Err(ProvisioningError::StateConflict(format!(
                "{trigger} cannot apply to a {current} session"
            ))),
            TriggerResult::Missing => Err(ProvisioningError::SessionNotFound(session_id)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{EnvelopeId, Money, Provider, UserId};
    use session_store::{InMemorySessionStore, NewCheckoutSession, OP_ACQUIRE_LEASE, SessionStore};

    use crate::services::{InMemoryCrmService, InjectedFailure};

    struct Fixture {
        store: InMemorySessionStore,
        crm: InMemoryCrmService,
        orchestrator: ProvisioningOrchestrator<InMemorySessionStore, InMemoryCrmService>,
        owner: UserId,
        session_id: SessionId,
    }

    async fn paid_and_signed() -> Fixture {
        let store = InMemorySessionStore::new();
        let crm = InMemoryCrmService::new();
        let user = store
            .create_user("ada@example.com", Some("Ada Lovelace"))
            .await
            .unwrap();
        let session = store
            .create_session(NewCheckoutSession {
                user_id: user.id,
                module: Some("Inventory".to_string()),
                payment_reference: Some("pi_1".to_string()),
                amount: Money::from_cents(49_900),
                currency: "USD".to_string(),
            })
            .await
            .unwrap();
        store
            .upsert_company_info(
                session.id,
                CompanyInfoFields {
                    company_name: "Acme".to_string(),
                    contact_name: "Ada Lovelace".to_string(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        store
            .transition_session_status(session.id, SessionStatus::Pending, SessionStatus::PaymentCompleted)
            .await
            .unwrap();
        let envelope = EnvelopeId::new("env-1");
        store
            .upsert_agreement(session.id, "DocuSign", &envelope)
            .await
            .unwrap();
        store
            .transition_agreement_status(
                &envelope,
                AgreementStatus::Pending,
                AgreementStatus::Completed,
                Utc::now(),
            )
            .await
            .unwrap();

        let orchestrator =
            ProvisioningOrchestrator::new(store.clone(), crm.clone(), OrchestratorConfig::default());
        Fixture {
            store,
            crm,
            orchestrator,
            owner: user.id,
            session_id: session.id,
        }
    }

    #[tokio::test]
    async fn test_full_run_then_already_complete() {
        let f = paid_and_signed().await;
        let identity = Identity::Provider(Provider::DocuSign);

        let outcome = f.orchestrator.run(identity, f.session_id).await.unwrap();
        assert_eq!(outcome, ProvisioningOutcome::Completed);
        assert_eq!(f.crm.contacts_created(), 1);
        assert_eq!(f.crm.sales_order_count(), 1);

        let session = f.store.get_session(f.session_id).await.unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Completed);
        let order = f.store.get_sales_order(f.session_id).await.unwrap().unwrap();
        assert!(order.external_id.is_some());

        let again = f.orchestrator.run(identity, f.session_id).await.unwrap();
        assert_eq!(again, ProvisioningOutcome::AlreadyComplete);
        assert_eq!(f.crm.contacts_created(), 1);
        assert_eq!(f.crm.sales_order_count(), 1);
    }

    #[tokio::test]
    async fn test_sales_order_failure_then_rerun_skips_contact() {
        let f = paid_and_signed().await;
        let identity = Identity::User(f.owner);
        f.crm.set_failure(
            OP_CREATE_SALES_ORDER,
            Some(InjectedFailure::Unavailable("crm down".to_string())),
        );

        let err = f.orchestrator.run(identity, f.session_id).await.unwrap_err();
        assert_eq!(err.step(), Some(STEP_SALES_ORDER));
        let session = f.store.get_session(f.session_id).await.unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::ContactCreated);

        f.crm.set_failure(OP_CREATE_SALES_ORDER, None);
        let outcome = f.orchestrator.run(identity, f.session_id).await.unwrap();
        assert_eq!(outcome, ProvisioningOutcome::Completed);
        assert_eq!(f.crm.contacts_created(), 1);
        assert_eq!(f.crm.contact_updates(), 0);
        assert_eq!(f.crm.sales_order_count(), 1);
    }

    #[tokio::test]
    async fn test_other_users_may_not_provision() {
        let f = paid_and_signed().await;
        let err = f
            .orchestrator
            .run(Identity::User(UserId::new()), f.session_id)
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisioningError::Forbidden(_)));
        assert_eq!(f.crm.contacts_created(), 0);
    }

    #[tokio::test]
    async fn test_held_lease_reports_in_progress() {
        let f = paid_and_signed().await;
        let now = Utc::now();
        assert!(
            f.store
                .try_acquire_provisioning_lease(
                    f.session_id,
                    "other-run",
                    now,
                    now + chrono::Duration::seconds(30)
                )
                .await
                .unwrap()
        );

        let outcome = f
            .orchestrator
            .run(Identity::Operator, f.session_id)
            .await
            .unwrap();
        assert_eq!(outcome, ProvisioningOutcome::InProgress);
        assert_eq!(f.crm.contacts_created(), 0);
    }

    #[tokio::test]
    async fn test_run_completed_while_waiting_for_lease_calls_nothing() {
        let f = paid_and_signed().await;
        let paused = f.store.pause_next(OP_ACQUIRE_LEASE).await;

        let orchestrator = f.orchestrator.clone();
        let session_id = f.session_id;
        let late =
            tokio::spawn(async move { orchestrator.run(Identity::Operator, session_id).await });
        paused.reached.await.unwrap();

        let first = f
            .orchestrator
            .run(Identity::Operator, f.session_id)
            .await
            .unwrap();
        assert_eq!(first, ProvisioningOutcome::Completed);

        paused.resume.send(()).unwrap();
        let late = late.await.unwrap().unwrap();
        assert_eq!(late, ProvisioningOutcome::AlreadyComplete);

        assert_eq!(f.crm.contacts_created(), 1);
        assert_eq!(f.crm.contact_updates(), 0);
        assert_eq!(f.crm.sales_order_count(), 1);
    }

    #[tokio::test]
    async fn test_unsigned_session_is_not_ready() {
        let store = InMemorySessionStore::new();
        let user = store.create_user("bo@example.com", None).await.unwrap();
        let session = store
            .create_session(NewCheckoutSession {
                user_id: user.id,
                module: None,
                payment_reference: None,
                amount: Money::from_cents(100),
                currency: "USD".to_string(),
            })
            .await
            .unwrap();
        store
            .transition_session_status(session.id, SessionStatus::Pending, SessionStatus::PaymentCompleted)
            .await
            .unwrap();

        let orchestrator = ProvisioningOrchestrator::new(
            store,
            InMemoryCrmService::new(),
            OrchestratorConfig::default(),
        );
        let outcome = orchestrator.run(Identity::Operator, session.id).await.unwrap();
        assert_eq!(
            outcome,
            ProvisioningOutcome::NotReady {
                reason: "agreement not completed".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_existing_link_updates_contact() {
        let f = paid_and_signed().await;
        let contact = ContactId::new("zcrm-existing");
        f.crm.insert_contact(
            contact.clone(),
            ContactFields {
                first_name: None,
                last_name: "Lovelace".to_string(),
                email: "ada@example.com".to_string(),
                phone: None,
                company: None,
                mailing_street: None,
                mailing_city: None,
                mailing_state: None,
                mailing_zip: None,
                mailing_country: "US".to_string(),
                industry: None,
                description: None,
                lead_source: None,
            },
        );
        f.store.upsert_account_link(f.owner, &contact).await.unwrap();

        let outcome = f
            .orchestrator
            .run(Identity::Operator, f.session_id)
            .await
            .unwrap();
        assert_eq!(outcome, ProvisioningOutcome::Completed);
        assert_eq!(f.crm.contacts_created(), 0);
        assert_eq!(f.crm.contact_updates(), 1);
        let (_, order) = &f.crm.sales_orders()[0];
        assert_eq!(order.contact_id, contact);
    }
}
