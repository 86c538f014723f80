use chrono::{DateTime, Utc};
use common::{EnvelopeId, Provider};
use serde::Deserialize;
use sha2::{Digest, Sha256};

use super::{parse, required};
use crate::{EventKind, NormalizationError, NormalizedEvent};

const PROVIDER: Provider = Provider::DocuSign;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DocuSignEvent {
    event: Option<String>,
    event_id: Option<String>,
    generated_date_time: Option<String>,
    #[serde(default)]
    data: DocuSignData,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DocuSignData {
    envelope_id: Option<String>,
}

/// Connect payloads do not always carry an event id; byte-identical
/// redeliveries then share the body digest.
fn body_digest(raw: &[u8]) -> String {
    hex::encode(Sha256::digest(raw))
}

pub(super) fn normalize(raw: &[u8]) -> Result<NormalizedEvent, NormalizationError> {
    let event: DocuSignEvent = parse(PROVIDER, raw)?;
    let event_type = required(PROVIDER, "event", event.event)?;
    let event_id = event
        .event_id
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| body_digest(raw));

    let envelope = |value: Option<String>| -> Result<EnvelopeId, NormalizationError> {
        required(PROVIDER, "data.envelopeId", value).map(EnvelopeId::new)
    };

    let envelope_id = event.data.envelope_id;
    let kind = match event_type.as_str() {
        "envelope-sent" => EventKind::AgreementSent {
            envelope_id: envelope(envelope_id)?,
        },
        "recipient-completed" => EventKind::AgreementPartiallySigned {
            envelope_id: envelope(envelope_id)?,
        },
        "envelope-completed" => EventKind::AgreementCompleted {
            envelope_id: envelope(envelope_id)?,
        },
        "envelope-declined" => EventKind::AgreementDeclined {
            envelope_id: envelope(envelope_id)?,
        },
        "envelope-voided" => EventKind::AgreementVoided {
            envelope_id: envelope(envelope_id)?,
        },
        _ => EventKind::Unhandled { event_type },
    };

    Ok(NormalizedEvent {
        provider: PROVIDER,
        event_id,
        occurred_at: event
            .generated_date_time
            .and_then(|ts| DateTime::parse_from_rfc3339(&ts).ok())
            .map(|ts| ts.with_timezone(&Utc)),
        kind,
    })
}
