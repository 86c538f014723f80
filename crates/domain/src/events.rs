//! The internal event vocabulary.
//!
//! Every provider webhook is reduced to a [`NormalizedEvent`] before it
//! reaches the state machines. Nothing past the normalizer sees raw
//! provider JSON.

use chrono::{DateTime, Utc};
use common::{AgreementStatus, EnvelopeId, Money, Provider};
use serde::{Deserialize, Serialize};

/// A provider webhook reduced to the internal vocabulary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedEvent {
    /// Provider that delivered the webhook.
    pub provider: Provider,

    /// Provider-assigned event id, the idempotency key.
    pub event_id: String,

    /// When the provider says the event happened, if it says.
    pub occurred_at: Option<DateTime<Utc>>,

    /// What happened.
    pub kind: EventKind,
}

/// What a normalized event reports, with its correlation id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum EventKind {
    /// A card payment settled.
    PaymentSucceeded {
        payment_reference: String,
        amount: Option<Money>,
        card_last4: Option<String>,
    },

    /// A card payment attempt failed or was abandoned.
    PaymentFailed {
        payment_reference: String,
        reason: Option<String>,
    },

    AgreementSent { envelope_id: EnvelopeId },

    /// One recipient signed; others may still be outstanding.
    AgreementPartiallySigned { envelope_id: EnvelopeId },

    AgreementCompleted { envelope_id: EnvelopeId },

    AgreementDeclined { envelope_id: EnvelopeId },

    AgreementVoided { envelope_id: EnvelopeId },

    /// A billing invoice was paid in full.
    InvoicePaid {
        invoice_id: String,
        amount: Option<Money>,
    },

    InvoiceVoided { invoice_id: String },

    /// Money went back to the customer. Correlates on the payment intent
    /// or the invoice, whichever the session was created with.
    RefundIssued { payment_reference: String },

    /// A well-formed event the reconciler does not act on.
    Unhandled { event_type: String },
}

/// How an event finds its local record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Correlation<'a> {
    Envelope(&'a EnvelopeId),
    PaymentReference(&'a str),
}

impl EventKind {
    /// Returns the vocabulary name, as recorded in the ledger.
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::PaymentSucceeded { .. } => "PaymentSucceeded",
            EventKind::PaymentFailed { .. } => "PaymentFailed",
            EventKind::AgreementSent { .. } => "AgreementSent",
            EventKind::AgreementPartiallySigned { .. } => "AgreementPartiallySigned",
            EventKind::AgreementCompleted { .. } => "AgreementCompleted",
            EventKind::AgreementDeclined { .. } => "AgreementDeclined",
            EventKind::AgreementVoided { .. } => "AgreementVoided",
            EventKind::InvoicePaid { .. } => "InvoicePaid",
            EventKind::InvoiceVoided { .. } => "InvoiceVoided",
            EventKind::RefundIssued { .. } => "RefundIssued",
            EventKind::Unhandled { .. } => "Unhandled",
        }
    }

    pub fn correlation(&self) -> Option<Correlation<'_>> {
        match self {
            EventKind::PaymentSucceeded {
                payment_reference, ..
            }
            | EventKind::PaymentFailed {
                payment_reference, ..
            }
            | EventKind::RefundIssued { payment_reference } => {
                Some(Correlation::PaymentReference(payment_reference))
            }
            EventKind::InvoicePaid { invoice_id, .. } | EventKind::InvoiceVoided { invoice_id } => {
                Some(Correlation::PaymentReference(invoice_id))
            }
            EventKind::AgreementSent { envelope_id }
            | EventKind::AgreementPartiallySigned { envelope_id }
            | EventKind::AgreementCompleted { envelope_id }
            | EventKind::AgreementDeclined { envelope_id }
            | EventKind::AgreementVoided { envelope_id } => Some(Correlation::Envelope(envelope_id)),
            EventKind::Unhandled { .. } => None,
        }
    }

    /// The agreement status an envelope event reports, if it is one.
    pub fn agreement_status(&self) -> Option<AgreementStatus> {
        match self {
            EventKind::AgreementSent { .. } => Some(AgreementStatus::Sent),
            EventKind::AgreementPartiallySigned { .. } => Some(AgreementStatus::PartiallySigned),
            EventKind::AgreementCompleted { .. } => Some(AgreementStatus::Completed),
            EventKind::AgreementDeclined { .. } => Some(AgreementStatus::Declined),
            EventKind::AgreementVoided { .. } => Some(AgreementStatus::Voided),
            _ => None,
        }
    }

    pub fn is_unhandled(&self) -> bool {
        matches!(self, EventKind::Unhandled { .. })
    }
}

impl NormalizedEvent {
    pub fn name(&self) -> &'static str {
        self.kind.name()
    }
}
