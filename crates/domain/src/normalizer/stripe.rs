use chrono::DateTime;
use common::{Money, Provider};
use serde::Deserialize;

use super::{parse, required};
use crate::{EventKind, NormalizationError, NormalizedEvent};

const PROVIDER: Provider = Provider::Stripe;

#[derive(Debug, Deserialize)]
struct StripeEvent {
    id: Option<String>,
    #[serde(rename = "type")]
    event_type: Option<String>,
    created: Option<i64>,
    #[serde(default)]
    data: StripeData,
}

#[derive(Debug, Default, Deserialize)]
struct StripeData {
    #[serde(default)]
    object: StripeObject,
}

/// The fields we read from payment intents and charges.
#[derive(Debug, Default, Deserialize)]
struct StripeObject {
    id: Option<String>,
    amount: Option<i64>,
    amount_received: Option<i64>,
    payment_intent: Option<String>,
    failure_message: Option<String>,
    last_payment_error: Option<LastPaymentError>,
    payment_method_details: Option<PaymentMethodDetails>,
    charges: Option<ChargeList>,
}

#[derive(Debug, Deserialize)]
struct LastPaymentError {
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PaymentMethodDetails {
    card: Option<CardDetails>,
}

#[derive(Debug, Deserialize)]
struct CardDetails {
    last4: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChargeList {
    #[serde(default)]
    data: Vec<StripeObject>,
}

impl StripeObject {
    fn card_last4(&self) -> Option<String> {
        self.payment_method_details
            .as_ref()
            .and_then(|details| details.card.as_ref())
            .and_then(|card| card.last4.clone())
            .or_else(|| {
                self.charges
                    .as_ref()
                    .and_then(|charges| charges.data.first())
                    .and_then(StripeObject::card_last4)
            })
    }
}

pub(super) fn normalize(raw: &[u8]) -> Result<NormalizedEvent, NormalizationError> {
    let event: StripeEvent = parse(PROVIDER, raw)?;
    let event_id = required(PROVIDER, "id", event.id)?;
    let event_type = required(PROVIDER, "type", event.event_type)?;
    let object = event.data.object;

    let kind = match event_type.as_str() {
        "payment_intent.succeeded" => EventKind::PaymentSucceeded {
            amount: object
                .amount_received
                .or(object.amount)
                .map(Money::from_cents),
            card_last4: object.card_last4(),
            payment_reference: required(PROVIDER, "data.object.id", object.id)?,
        },
        "payment_intent.payment_failed" | "payment_intent.canceled" => EventKind::PaymentFailed {
            reason: object
                .last_payment_error
                .and_then(|e| e.message)
                .or_else(|| (event_type == "payment_intent.canceled").then(|| "canceled".to_string())),
            payment_reference: required(PROVIDER, "data.object.id", object.id)?,
        },
        "charge.succeeded" => EventKind::PaymentSucceeded {
            amount: object.amount.map(Money::from_cents),
            card_last4: object.card_last4(),
            payment_reference: required(
                PROVIDER,
                "data.object.payment_intent",
                object.payment_intent,
            )?,
        },
        "charge.failed" => EventKind::PaymentFailed {
            reason: object.failure_message,
            payment_reference: required(
                PROVIDER,
                "data.object.payment_intent",
                object.payment_intent,
            )?,
        },
        "charge.refunded" => EventKind::RefundIssued {
            payment_reference: required(
                PROVIDER,
                "data.object.payment_intent",
                object.payment_intent,
            )?,
        },
        _ => EventKind::Unhandled { event_type },
    };

    Ok(NormalizedEvent {
        provider: PROVIDER,
        event_id,
        occurred_at: event.created.and_then(|secs| DateTime::from_timestamp(secs, 0)),
        kind,
    })
}
