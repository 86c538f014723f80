//! Interactive checkout-session operations.
//!
//! Everything here acts for an explicit [`Identity`]; a user only ever sees
//! or changes their own sessions.

use std::time::Duration;

use common::{AgreementStatus, Money, SessionId, SessionStatus};
use domain::{Identity, SessionGuards, SessionTrigger};
use serde::{Deserialize, Serialize};
use session_store::{
    AgreementRecord, CheckoutSession, CompanyInfo, CompanyInfoFields, NewCheckoutSession,
    SalesOrder, Store, User,
};

use crate::error::{ProvisioningError, SessionError};
use crate::orchestrator::{ProvisioningOrchestrator, ProvisioningOutcome};
use crate::services::billing::{OP_CREATE_INVOICE, OP_GET_PAYMENT_STATUS};
use crate::services::signature::OP_CREATE_ENVELOPE;
use crate::services::{
    BillingService, CrmService, EnvelopeRequest, InvoiceRequest, PaymentState, SignatureService,
    SigningUrl,
};
use crate::timeout::bounded;
use crate::transition::apply_trigger;

pub const DEFAULT_CURRENCY: &str = "USD";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    pub module: Option<String>,
    pub amount_cents: i64,
    #[serde(default)]
    pub currency: Option<String>,
    /// Payment-intent id from the card flow; an invoice is raised when absent.
    #[serde(default)]
    pub payment_reference: Option<String>,
}

/// A session with its one-to-one sub-records.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDetails {
    pub session: CheckoutSession,
    pub company_info: Option<CompanyInfo>,
    pub agreement: Option<AgreementRecord>,
    pub sales_order: Option<SalesOrder>,
}

/// How a provisioning run started on the caller's behalf went.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ProvisioningReport {
    Finished(ProvisioningOutcome),
    Failed {
        step: Option<&'static str>,
        error: String,
    },
}

/// Result of [`SessionService::refresh_payment_status`].
#[derive(Debug, Clone, Serialize)]
pub struct PaymentRefresh {
    #[serde(flatten)]
    pub details: SessionDetails,
    /// Set when the refresh confirmed payment on a signed session.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provisioning: Option<ProvisioningReport>,
}

pub struct SessionService<S, C, Sg, B> {
    store: S,
    orchestrator: ProvisioningOrchestrator<S, C>,
    signature: Sg,
    billing: B,
    provider_timeout: Duration,
}

impl<S, C, Sg, B> SessionService<S, C, Sg, B>
where
    S: Store + Clone,
    C: CrmService,
    Sg: SignatureService,
    B: BillingService,
{
    pub fn new(
        store: S,
        orchestrator: ProvisioningOrchestrator<S, C>,
        signature: Sg,
        billing: B,
        provider_timeout: Duration,
    ) -> Self {
        Self {
            store,
            orchestrator,
            signature,
            billing,
            provider_timeout,
        }
    }

    pub async fn create_user(&self, email: &str, name: Option<&str>) -> Result<User, SessionError> {
        let email = email.trim();
        if email.is_empty() || !email.contains('@') {
            return Err(SessionError::Validation("a valid email is required".to_string()));
        }
        let name = name.map(str::trim).filter(|name| !name.is_empty());
        Ok(self.store.create_user(email, name).await?)
    }

    #[tracing::instrument(skip_all, fields(identity = %identity))]
    pub async fn create_session(
        &self,
        identity: Identity,
        request: CreateSessionRequest,
    ) -> Result<CheckoutSession, SessionError> {
        let user_id = identity
            .user_id()
            .ok_or_else(|| SessionError::Forbidden("only users start checkout".to_string()))?;
        let user = self
            .store
            .get_user(user_id)
            .await?
            .ok_or(SessionError::UserNotFound(user_id))?;

        let amount = Money::from_cents(request.amount_cents);
        if !amount.is_positive() {
            return Err(SessionError::Validation("amount must be positive".to_string()));
        }
        let currency = request
            .currency
            .filter(|c| !c.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_CURRENCY.to_string());

        let payment_reference = match request.payment_reference.filter(|r| !r.trim().is_empty()) {
            Some(reference) => reference,
            None => {
                let invoice = bounded(
                    OP_CREATE_INVOICE,
                    self.provider_timeout,
                    self.billing.create_invoice(InvoiceRequest {
                        customer_email: user.email.clone(),
                        customer_name: user.name.clone(),
                        description: request
                            .module
                            .clone()
                            .unwrap_or_else(|| "Zoho Integration".to_string()),
                        amount,
                        currency: currency.clone(),
                    }),
                )
                .await?;
                tracing::info!(invoice_id = %invoice.id, "invoice raised for checkout");
                invoice.id
            }
        };

        let session = self
            .store
            .create_session(NewCheckoutSession {
                user_id,
                module: request.module,
                payment_reference: Some(payment_reference),
                amount,
                currency,
            })
            .await?;
        tracing::info!(session_id = %session.id, "checkout session created");
        Ok(session)
    }

    pub async fn get_session(
        &self,
        identity: Identity,
        session_id: SessionId,
    ) -> Result<SessionDetails, SessionError> {
        let session = self.owned_session(identity, session_id).await?;
        self.details(session).await
    }

    pub async fn list_sessions(&self, identity: Identity) -> Result<Vec<SessionDetails>, SessionError> {
        let user_id = identity
            .user_id()
            .ok_or_else(|| SessionError::Forbidden("only users list sessions".to_string()))?;

        let sessions = self.store.list_sessions_for_user(user_id).await?;
        let mut details = Vec::with_capacity(sessions.len());
        for session in sessions {
            details.push(self.details(session).await?);
        }
        Ok(details)
    }

    /// Creates or replaces the company profile until the agreement is signed.
    #[tracing::instrument(skip_all, fields(session_id = %session_id))]
    pub async fn upsert_company_info(
        &self,
        identity: Identity,
        session_id: SessionId,
        fields: CompanyInfoFields,
    ) -> Result<CompanyInfo, SessionError> {
        if fields.company_name.trim().is_empty() || fields.contact_name.trim().is_empty() {
            return Err(SessionError::Validation(
                "companyName and contactName are required".to_string(),
            ));
        }

        self.owned_session(identity, session_id).await?;
        if let Some(agreement) = self.store.get_agreement_for_session(session_id).await? {
            if agreement.status == AgreementStatus::Completed {
                return Err(SessionError::AgreementLocked(session_id, agreement.status));
            }
        }

        Ok(self.store.upsert_company_info(session_id, fields).await?)
    }

    /// Creates the agreement envelope and returns the embedded signing URL.
    #[tracing::instrument(skip_all, fields(session_id = %session_id))]
    pub async fn initiate_signing(
        &self,
        identity: Identity,
        session_id: SessionId,
        return_url: Option<String>,
    ) -> Result<SigningUrl, SessionError> {
        let session = self.owned_session(identity, session_id).await?;
        if matches!(session.status, SessionStatus::Cancelled | SessionStatus::Refunded) {
            return Err(SessionError::Validation(format!(
                "session is {}",
                session.status
            )));
        }

        let company = self
            .store
            .get_company_info(session_id)
            .await?
            .ok_or(SessionError::MissingCompanyInfo(session_id))?;
        if let Some(agreement) = self.store.get_agreement_for_session(session_id).await? {
            if agreement.status.is_terminal() {
                return Err(SessionError::AgreementLocked(session_id, agreement.status));
            }
        }

        let user = self
            .store
            .get_user(session.user_id)
            .await?
            .ok_or(SessionError::UserNotFound(session.user_id))?;

        let signing = bounded(
            OP_CREATE_ENVELOPE,
            self.provider_timeout,
            self.signature.create_envelope_signing_url(EnvelopeRequest {
                session_id,
                signer_name: company.fields.contact_name.clone(),
                signer_email: company.fields.email.clone().unwrap_or(user.email),
                company_name: company.fields.company_name.clone(),
                module: session.module.clone(),
                return_url,
            }),
        )
        .await?;

        self.store
            .upsert_agreement(session_id, self.signature.provider_name(), &signing.envelope_id)
            .await?;
        tracing::info!(envelope_id = %signing.envelope_id, "agreement envelope created");
        Ok(signing)
    }

    /// Re-runs the provisioning chain by hand.
    pub async fn provision(
        &self,
        identity: Identity,
        session_id: SessionId,
    ) -> Result<ProvisioningOutcome, ProvisioningError> {
        self.orchestrator.run(identity, session_id).await
    }

    /// Asks billing whether a pending session has been paid and applies the
    /// confirmation if so. Covers payment webhooks that never arrived.
    #[tracing::instrument(skip_all, fields(session_id = %session_id))]
    pub async fn refresh_payment_status(
        &self,
        identity: Identity,
        session_id: SessionId,
    ) -> Result<PaymentRefresh, SessionError> {
        let session = self.owned_session(identity, session_id).await?;
        let mut provisioning = None;

        if session.status == SessionStatus::Pending {
            if let Some(reference) = session.payment_reference.as_deref() {
                let state = bounded(
                    OP_GET_PAYMENT_STATUS,
                    self.provider_timeout,
                    self.billing.get_payment_status(reference),
                )
                .await?;

                if state == PaymentState::Paid {
                    apply_trigger(
                        &self.store,
                        session_id,
                        SessionTrigger::PaymentConfirmed,
                        &SessionGuards::default(),
                    )
                    .await?;

                    let signed = self
                        .store
                        .get_agreement_for_session(session_id)
                        .await?
                        .is_some_and(|a| a.status == AgreementStatus::Completed);
                    if signed {
                        provisioning = Some(self.provision_after_refresh(session_id).await);
                    }
                }
            }
        }

        let session = self
            .store
            .get_session(session_id)
            .await?
            .ok_or(SessionError::NotFound(session_id))?;
        Ok(PaymentRefresh {
            details: self.details(session).await?,
            provisioning,
        })
    }

    async fn provision_after_refresh(&self, session_id: SessionId) -> ProvisioningReport {
        match self.orchestrator.run(Identity::Operator, session_id).await {
            Ok(outcome) => ProvisioningReport::Finished(outcome),
            Err(err) => {
                tracing::warn!(
                    error = %err,
                    step = err.step().unwrap_or("none"),
                    "payment confirmed by refresh but provisioning failed, left for a manual re-run"
                );
                ProvisioningReport::Failed {
                    step: err.step(),
                    error: err.to_string(),
                }
            }
        }
    }

    async fn owned_session(
        &self,
        identity: Identity,
        session_id: SessionId,
    ) -> Result<CheckoutSession, SessionError> {
        match self.store.get_session(session_id).await? {
            // Other users' sessions look absent.
            Some(session) if identity.may_access(session.user_id) => Ok(session),
            _ => Err(SessionError::NotFound(session_id)),
        }
    }

    async fn details(&self, session: CheckoutSession) -> Result<SessionDetails, SessionError> {
        let company_info = self.store.get_company_info(session.id).await?;
        let agreement = self.store.get_agreement_for_session(session.id).await?;
        let sales_order = self.store.get_sales_order(session.id).await?;
        Ok(SessionDetails {
            session,
            company_info,
            agreement,
            sales_order,
        })
    }
}
