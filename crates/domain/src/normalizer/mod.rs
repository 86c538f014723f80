//! Event Normalizer: provider webhook bodies to [`NormalizedEvent`].
//!
//! Pure mapping. Authenticity of the body is checked by the webhook entry
//! point before anything here runs. Unrecognized event types become
//! [`EventKind::Unhandled`](crate::EventKind::Unhandled) rather than errors.

mod docusign;
mod stripe;
mod zoho_billing;

use common::Provider;
use serde::de::DeserializeOwned;

use crate::{NormalizationError, NormalizedEvent};

/// Normalizes a raw webhook body from `provider`.
pub fn normalize(provider: Provider, raw: &[u8]) -> Result<NormalizedEvent, NormalizationError> {
    match provider {
        Provider::Stripe => stripe::normalize(raw),
        Provider::DocuSign => docusign::normalize(raw),
        Provider::ZohoBilling => zoho_billing::normalize(raw),
    }
}

fn parse<T: DeserializeOwned>(provider: Provider, raw: &[u8]) -> Result<T, NormalizationError> {
    serde_json::from_slice(raw).map_err(|source| NormalizationError::Malformed { provider, source })
}

/// Treats empty strings as absent.
fn required(
    provider: Provider,
    field: &'static str,
    value: Option<String>,
) -> Result<String, NormalizationError> {
    value
        .filter(|v| !v.is_empty())
        .ok_or_else(|| NormalizationError::missing(provider, field))
}
