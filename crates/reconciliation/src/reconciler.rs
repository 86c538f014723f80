//! The webhook pipeline: normalize, admit, apply.
//!
//! Every delivery that got past authenticity verification is acknowledged.
//! Business problems (malformed payloads, orphans, conflicts, failed
//! provisioning) come back as a [`WebhookOutcome`] and an operator log line;
//! only infrastructure failures are errors. An error releases the event's
//! ledger entry, so the provider's retry is applied rather than reported as
//! a duplicate.

use chrono::Utc;
use common::{AgreementStatus, EnvelopeId, Provider, SessionId};
use domain::machine::agreement::{self, AgreementDecision};
use domain::{Admission, EventKind, IdempotencyGuard, Identity, NormalizedEvent, SessionGuards, SessionTrigger};
use serde::Serialize;
use session_store::{Store, StoreError};

use crate::error::ReconcileError;
use crate::orchestrator::{ProvisioningOrchestrator, ProvisioningOutcome};
use crate::services::CrmService;
use crate::transition::{TriggerResult, apply_trigger};

const MAX_AGREEMENT_CAS_ATTEMPTS: usize = 3;

/// How a delivered webhook was handled. All of these are acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookOutcome {
    /// State changed.
    Applied,
    /// Valid, but nothing to change.
    NoOp,
    /// The event id was already in the ledger.
    Duplicate,
    /// An event type the reconciler does not act on.
    Ignored,
    /// Payload could not be normalized.
    Invalid,
    /// No local record matches the correlation id.
    Orphaned,
    /// The event contradicts recorded state.
    Conflict,
    /// State was recorded but the provisioning run it triggered failed.
    ProvisioningFailed,
}

impl WebhookOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookOutcome::Applied => "applied",
            WebhookOutcome::NoOp => "no_op",
            WebhookOutcome::Duplicate => "duplicate",
            WebhookOutcome::Ignored => "ignored",
            WebhookOutcome::Invalid => "invalid",
            WebhookOutcome::Orphaned => "orphaned",
            WebhookOutcome::Conflict => "conflict",
            WebhookOutcome::ProvisioningFailed => "provisioning_failed",
        }
    }
}

impl std::fmt::Display for WebhookOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Applies verified provider webhooks to local state.
#[derive(Debug, Clone)]
pub struct Reconciler<S, C> {
    store: S,
    guard: IdempotencyGuard<S>,
    orchestrator: ProvisioningOrchestrator<S, C>,
}

impl<S, C> Reconciler<S, C>
where
    S: Store + Clone,
    C: CrmService,
{
    pub fn new(store: S, orchestrator: ProvisioningOrchestrator<S, C>) -> Self {
        Self {
            guard: IdempotencyGuard::new(store.clone()),
            store,
            orchestrator,
        }
    }

    /// Handles one raw webhook body whose signature has already been checked.
    #[tracing::instrument(skip_all, fields(provider = %provider))]
    pub async fn handle_webhook(
        &self,
        provider: Provider,
        raw: &[u8],
    ) -> Result<WebhookOutcome, ReconcileError> {
        let result = self.process(provider, raw).await;
        let label = match &result {
            Ok(outcome) => outcome.as_str(),
            Err(_) => "error",
        };
        metrics::counter!(
            "webhook_events_total",
            "provider" => provider.as_str(),
            "outcome" => label
        )
        .increment(1);
        result
    }

    async fn process(
        &self,
        provider: Provider,
        raw: &[u8],
    ) -> Result<WebhookOutcome, ReconcileError> {
        let event = match domain::normalize(provider, raw) {
            Ok(event) => event,
            Err(err) => {
                tracing::warn!(error = %err, "malformed webhook payload acknowledged");
                return Ok(WebhookOutcome::Invalid);
            }
        };

        if let EventKind::Unhandled { event_type } = &event.kind {
            tracing::info!(event_type = %event_type, event_id = %event.event_id, "unhandled event type acknowledged");
            return Ok(WebhookOutcome::Ignored);
        }

        match self
            .guard
            .admit(provider, &event.event_id, event.name())
            .await?
        {
            Admission::AlreadyProcessed => return Ok(WebhookOutcome::Duplicate),
            Admission::Admitted => {}
        }

        tracing::info!(event_id = %event.event_id, kind = event.name(), "webhook event admitted");
        let result = self.apply(&event).await;
        if result.is_err()
            && let Err(err) = self.guard.release(provider, &event.event_id).await
        {
            tracing::error!(
                alert = "ledger_release_failed",
                event_id = %event.event_id,
                error = %err,
                "failed event stays in the ledger, retries will be dropped"
            );
        }
        result
    }

    /// Applies an admitted event. Exposed for replaying ledger entries.
    pub async fn apply(&self, event: &NormalizedEvent) -> Result<WebhookOutcome, ReconcileError> {
        match &event.kind {
            EventKind::PaymentSucceeded {
                payment_reference,
                card_last4,
                ..
            } => {
                self.on_payment_confirmed(event, payment_reference, card_last4.as_deref())
                    .await
            }
            EventKind::InvoicePaid { invoice_id, .. } => {
                self.on_payment_confirmed(event, invoice_id, None).await
            }
            EventKind::PaymentFailed {
                payment_reference,
                reason,
            } => self.on_payment_failed(event, payment_reference, reason.as_deref()).await,
            EventKind::AgreementSent { envelope_id }
            | EventKind::AgreementPartiallySigned { envelope_id }
            | EventKind::AgreementCompleted { envelope_id }
            | EventKind::AgreementDeclined { envelope_id }
            | EventKind::AgreementVoided { envelope_id } => {
                let Some(reported) = event.kind.agreement_status() else {
                    return Ok(WebhookOutcome::Ignored);
                };
                self.on_agreement(event, envelope_id, reported).await
            }
            EventKind::InvoiceVoided { invoice_id } => {
                self.on_absorbing(event, invoice_id, SessionTrigger::InvoiceVoided)
                    .await
            }
            EventKind::RefundIssued { payment_reference } => {
                self.on_absorbing(event, payment_reference, SessionTrigger::RefundIssued)
                    .await
            }
            EventKind::Unhandled { .. } => Ok(WebhookOutcome::Ignored),
        }
    }

    async fn on_payment_confirmed(
        &self,
        event: &NormalizedEvent,
        reference: &str,
        card_last4: Option<&str>,
    ) -> Result<WebhookOutcome, ReconcileError> {
        let Some(session) = self.store.find_session_by_payment_reference(reference).await? else {
            return Ok(orphaned(event, "payment_reference", reference));
        };

        if let Some(last4) = card_last4 {
            self.store.record_card_summary(session.id, last4).await?;
        }

        let result = apply_trigger(
            &self.store,
            session.id,
            SessionTrigger::PaymentConfirmed,
            &SessionGuards::default(),
        )
        .await?;

        match result {
            TriggerResult::Applied { .. } => {
                // Signature may have finished before the payment landed.
                let signed = self
                    .store
                    .get_agreement_for_session(session.id)
                    .await?
                    .is_some_and(|agreement| agreement.status == AgreementStatus::Completed);
                if signed {
                    return Ok(self.provision(event.provider, session.id).await);
                }
                Ok(WebhookOutcome::Applied)
            }
            other => Ok(session_outcome(event, session.id, other)),
        }
    }

    async fn on_payment_failed(
        &self,
        event: &NormalizedEvent,
        reference: &str,
        reason: Option<&str>,
    ) -> Result<WebhookOutcome, ReconcileError> {
        let Some(session) = self.store.find_session_by_payment_reference(reference).await? else {
            return Ok(orphaned(event, "payment_reference", reference));
        };
        tracing::warn!(
            session_id = %session.id,
            payment_reference = reference,
            reason = reason.unwrap_or("unknown"),
            status = %session.status,
            "payment failed"
        );
        Ok(WebhookOutcome::NoOp)
    }

    async fn on_agreement(
        &self,
        event: &NormalizedEvent,
        envelope_id: &EnvelopeId,
        reported: AgreementStatus,
    ) -> Result<WebhookOutcome, ReconcileError> {
        let at = event.occurred_at.unwrap_or_else(Utc::now);
        let mut last_race = None;

        for _ in 0..MAX_AGREEMENT_CAS_ATTEMPTS {
            let Some(record) = self.store.get_agreement_by_envelope(envelope_id).await? else {
                return Ok(orphaned(event, "envelope_id", envelope_id.as_str()));
            };

            let next = match agreement::decide(record.status, reported) {
                AgreementDecision::Advance(next) => next,
                AgreementDecision::NoOp => {
                    tracing::debug!(
                        envelope_id = %envelope_id,
                        current = %record.status,
                        %reported,
                        "agreement report does not advance, ignored"
                    );
                    return Ok(WebhookOutcome::NoOp);
                }
                AgreementDecision::Conflict { current, reported } => {
                    tracing::warn!(
                        alert = "state_conflict",
                        provider = %event.provider,
                        event_id = %event.event_id,
                        envelope_id = %envelope_id,
                        session_id = %record.session_id,
                        %current,
                        %reported,
                        "agreement already terminal with a different status"
                    );
                    return Ok(WebhookOutcome::Conflict);
                }
            };

            match self
                .store
                .transition_agreement_status(envelope_id, record.status, next, at)
                .await
            {
                Ok(updated) => {
                    tracing::info!(
                        envelope_id = %envelope_id,
                        session_id = %updated.session_id,
                        from = %record.status,
                        to = %updated.status,
                        "agreement status advanced"
                    );
                    if next == AgreementStatus::Completed {
                        return self.after_signature(event, updated.session_id).await;
                    }
                    return Ok(WebhookOutcome::Applied);
                }
                Err(err @ StoreError::StaleStatus { .. }) => last_race = Some(err),
                Err(err) => return Err(err.into()),
            }
        }

        tracing::warn!(
            envelope_id = %envelope_id,
            "agreement kept changing, leaving the report for redelivery"
        );
        Err(last_race
            .unwrap_or_else(|| StoreError::Conflict(format!("agreement {envelope_id} kept changing")))
            .into())
    }

    async fn after_signature(
        &self,
        event: &NormalizedEvent,
        session_id: SessionId,
    ) -> Result<WebhookOutcome, ReconcileError> {
        let Some(session) = self.store.get_session(session_id).await? else {
            return Ok(orphaned(event, "session_id", &session_id.to_string()));
        };

        if session.status.is_paid() {
            return Ok(self.provision(event.provider, session_id).await);
        }

        tracing::info!(
            session_id = %session_id,
            status = %session.status,
            "agreement completed, provisioning waits for payment"
        );
        Ok(WebhookOutcome::Applied)
    }

    async fn on_absorbing(
        &self,
        event: &NormalizedEvent,
        reference: &str,
        trigger: SessionTrigger,
    ) -> Result<WebhookOutcome, ReconcileError> {
        let Some(session) = self.store.find_session_by_payment_reference(reference).await? else {
            return Ok(orphaned(event, "payment_reference", reference));
        };

        let result = apply_trigger(&self.store, session.id, trigger, &SessionGuards::default()).await?;
        Ok(session_outcome(event, session.id, result))
    }

    async fn provision(&self, provider: Provider, session_id: SessionId) -> WebhookOutcome {
        match self
            .orchestrator
            .run(Identity::Provider(provider), session_id)
            .await
        {
            Ok(ProvisioningOutcome::NotReady { reason }) => {
                tracing::info!(session_id = %session_id, reason = %reason, "provisioning not ready");
                WebhookOutcome::Applied
            }
            Ok(_) => WebhookOutcome::Applied,
            // The orchestrator already raised the alert.
            Err(_) => WebhookOutcome::ProvisioningFailed,
        }
    }
}

fn orphaned(event: &NormalizedEvent, key: &'static str, value: &str) -> WebhookOutcome {
    tracing::error!(
        alert = "orphaned_event",
        provider = %event.provider,
        event_id = %event.event_id,
        kind = event.name(),
        correlation_key = key,
        correlation_id = value,
        "no local record for webhook event"
    );
    WebhookOutcome::Orphaned
}

fn session_outcome(
    event: &NormalizedEvent,
    session_id: SessionId,
    result: TriggerResult,
) -> WebhookOutcome {
    match result {
        TriggerResult::Applied { .. } => WebhookOutcome::Applied,
        TriggerResult::Unchanged(_) => WebhookOutcome::NoOp,
        TriggerResult::Missing => orphaned(event, "session_id", &session_id.to_string()),
        TriggerResult::Blocked(reason) => {
            tracing::warn!(
                alert = "state_conflict",
                provider = %event.provider,
                event_id = %event.event_id,
                session_id = %session_id,
                reason,
                "session transition blocked"
            );
            WebhookOutcome::Conflict
        }
        TriggerResult::Conflict(current) => {
            tracing::warn!(
                alert = "state_conflict",
                provider = %event.provider,
                event_id = %event.event_id,
                session_id = %session_id,
                %current,
                kind = event.name(),
                "event cannot apply to session"
            );
            WebhookOutcome::Conflict
        }
    }
}
