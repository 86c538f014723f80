use chrono::{DateTime, Utc};
use common::{Money, Provider};
use serde::Deserialize;

use super::{parse, required};
use crate::{EventKind, NormalizationError, NormalizedEvent};

const PROVIDER: Provider = Provider::ZohoBilling;

#[derive(Debug, Deserialize)]
struct ZohoEvent {
    event_id: Option<String>,
    event_type: Option<String>,
    event_time: Option<String>,
    #[serde(default)]
    data: ZohoData,
}

#[derive(Debug, Default, Deserialize)]
struct ZohoData {
    id: Option<String>,
    invoice_id: Option<String>,
    /// Decimal currency units, as the billing API reports them.
    amount: Option<f64>,
}

fn to_money(amount: f64) -> Money {
    Money::from_cents((amount * 100.0).round() as i64)
}

pub(super) fn normalize(raw: &[u8]) -> Result<NormalizedEvent, NormalizationError> {
    let event: ZohoEvent = parse(PROVIDER, raw)?;
    let event_type = required(PROVIDER, "event_type", event.event_type)?;
    let data = event.data;

    // Older payloads carry no event id; the (type, record) pair identifies them.
    let event_id = match event.event_id.filter(|id| !id.is_empty()) {
        Some(id) => id,
        None => {
            let record = data.id.as_deref().filter(|id| !id.is_empty());
            let record = record.ok_or_else(|| NormalizationError::missing(PROVIDER, "event_id"))?;
            format!("{event_type}:{record}")
        }
    };

    let kind = match event_type.as_str() {
        "invoice.paid" => EventKind::InvoicePaid {
            invoice_id: required(PROVIDER, "data.id", data.id)?,
            amount: data.amount.map(to_money),
        },
        "invoice.voided" => EventKind::InvoiceVoided {
            invoice_id: required(PROVIDER, "data.id", data.id)?,
        },
        "refund.created" => EventKind::RefundIssued {
            payment_reference: required(PROVIDER, "data.invoice_id", data.invoice_id)?,
        },
        _ => EventKind::Unhandled { event_type },
    };

    Ok(NormalizedEvent {
        provider: PROVIDER,
        event_id,
        occurred_at: event
            .event_time
            .and_then(|ts| DateTime::parse_from_rfc3339(&ts).ok())
            .map(|ts| ts.with_timezone(&Utc)),
        kind,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn body(value: serde_json::Value) -> Vec<u8> {
        serde_json::to_vec(&value).unwrap()
    }

    #[test]
    fn test_invoice_paid() {
        let raw = body(json!({
            "event_id": "zb-1",
            "event_type": "invoice.paid",
            "data": {"id": "inv-1", "amount": 499.0}
        }));
        let event = normalize(&raw).unwrap();
        assert_eq!(event.event_id, "zb-1");
        assert_eq!(
            event.kind,
            EventKind::InvoicePaid {
                invoice_id: "inv-1".to_string(),
                amount: Some(Money::from_cents(49900)),
            }
        );
    }

    #[test]
    fn test_event_id_falls_back_to_type_and_record() {
        let raw = body(json!({"event_type": "invoice.voided", "data": {"id": "inv-7"}}));
        let event = normalize(&raw).unwrap();
        assert_eq!(event.event_id, "invoice.voided:inv-7");
        assert_eq!(
            event.kind,
            EventKind::InvoiceVoided {
                invoice_id: "inv-7".to_string()
            }
        );
    }

    #[test]
    fn test_refund_correlates_on_invoice() {
        let raw = body(json!({
            "event_id": "zb-2",
            "event_type": "refund.created",
            "data": {"id": "rf-1", "invoice_id": "inv-1", "payment_id": "pay-1", "amount": 10.5}
        }));
        assert_eq!(
            normalize(&raw).unwrap().kind,
            EventKind::RefundIssued {
                payment_reference: "inv-1".to_string()
            }
        );
    }

    #[test]
    fn test_refund_without_invoice_is_error() {
        let raw = body(json!({
            "event_id": "zb-3",
            "event_type": "refund.created",
            "data": {"id": "rf-1", "payment_id": "pay-1"}
        }));
        assert!(matches!(
            normalize(&raw).unwrap_err(),
            NormalizationError::MissingField {
                field: "data.invoice_id",
                ..
            }
        ));
    }

    #[test]
    fn test_payment_created_is_unhandled() {
        let raw = body(json!({
            "event_id": "zb-4",
            "event_type": "payment.created",
            "data": {"id": "pay-1", "invoice_id": "inv-1"}
        }));
        assert!(normalize(&raw).unwrap().kind.is_unhandled());
    }
}
