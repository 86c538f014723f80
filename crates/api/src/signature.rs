//! Provider webhook signature verification.
//!
//! All three providers sign with HMAC-SHA256; they differ in what is signed
//! and how the digest is encoded in the header.

use axum::http::HeaderMap;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use common::Provider;
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;

use crate::config::WebhookSecrets;

type HmacSha256 = Hmac<Sha256>;

pub const STRIPE_SIGNATURE_HEADER: &str = "stripe-signature";
pub const DOCUSIGN_SIGNATURE_HEADER: &str = "x-docusign-signature-1";
pub const ZOHO_SIGNATURE_HEADER: &str = "x-zoho-webhook-signature";

/// Maximum age of a Stripe signature timestamp, in seconds.
pub const STRIPE_TOLERANCE_SECS: u64 = 300;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("no webhook secret configured for {0}")]
    NotConfigured(Provider),

    #[error("missing {0} header")]
    MissingHeader(&'static str),

    #[error("malformed signature header")]
    Malformed,

    #[error("signature timestamp outside tolerance")]
    Expired,

    #[error("signature mismatch")]
    Mismatch,
}

fn digest(secret: &SecretString, parts: &[&[u8]]) -> Vec<u8> {
    // HMAC takes keys of any length.
    let mut mac = match HmacSha256::new_from_slice(secret.expose_secret().as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return Vec::new(),
    };
    for part in parts {
        mac.update(part);
    }
    mac.finalize().into_bytes().to_vec()
}

fn matches(expected: &[u8], provided: &[u8]) -> bool {
    !expected.is_empty() && bool::from(expected.ct_eq(provided))
}

/// Verifies a `stripe-signature: t=<unix>,v1=<hex>[,v1=<hex>...]` header.
pub fn verify_stripe(
    secret: &SecretString,
    header: &str,
    body: &[u8],
    now: i64,
) -> Result<(), SignatureError> {
    let mut timestamp = None;
    let mut candidates = Vec::new();
    for item in header.split(',') {
        match item.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse::<i64>().ok(),
            Some(("v1", value)) => candidates.push(value),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or(SignatureError::Malformed)?;
    if candidates.is_empty() {
        return Err(SignatureError::Malformed);
    }
    if now.abs_diff(timestamp) > STRIPE_TOLERANCE_SECS {
        return Err(SignatureError::Expired);
    }

    let expected = digest(secret, &[timestamp.to_string().as_bytes(), b".", body]);
    let valid = candidates
        .iter()
        .filter_map(|candidate| hex::decode(candidate).ok())
        .any(|provided| matches(&expected, &provided));
    if valid {
        Ok(())
    } else {
        Err(SignatureError::Mismatch)
    }
}

/// Verifies a base64 HMAC of the body, as DocuSign Connect sends it.
pub fn verify_docusign(secret: &SecretString, header: &str, body: &[u8]) -> Result<(), SignatureError> {
    let provided = BASE64
        .decode(header.trim())
        .map_err(|_| SignatureError::Malformed)?;
    if matches(&digest(secret, &[body]), &provided) {
        Ok(())
    } else {
        Err(SignatureError::Mismatch)
    }
}

/// Verifies a hex HMAC of the body, as Zoho Billing sends it.
pub fn verify_zoho(secret: &SecretString, header: &str, body: &[u8]) -> Result<(), SignatureError> {
    let provided = hex::decode(header.trim()).map_err(|_| SignatureError::Malformed)?;
    if matches(&digest(secret, &[body]), &provided) {
        Ok(())
    } else {
        Err(SignatureError::Mismatch)
    }
}

/// Header value a Stripe client would send for `body` at `timestamp`.
pub fn stripe_signature_header(secret: &SecretString, timestamp: i64, body: &[u8]) -> String {
    let mac = digest(secret, &[timestamp.to_string().as_bytes(), b".", body]);
    format!("t={timestamp},v1={}", hex::encode(mac))
}

pub fn docusign_signature_header(secret: &SecretString, body: &[u8]) -> String {
    BASE64.encode(digest(secret, &[body]))
}

pub fn zoho_signature_header(secret: &SecretString, body: &[u8]) -> String {
    hex::encode(digest(secret, &[body]))
}

/// Checks inbound webhooks against the configured provider secrets.
#[derive(Debug, Clone, Default)]
pub struct WebhookVerifier {
    secrets: WebhookSecrets,
}

impl WebhookVerifier {
    pub fn new(secrets: WebhookSecrets) -> Self {
        Self { secrets }
    }

    pub fn verify(
        &self,
        provider: Provider,
        headers: &HeaderMap,
        body: &[u8],
        now: i64,
    ) -> Result<(), SignatureError> {
        let (secret, header_name) = match provider {
            Provider::Stripe => (&self.secrets.stripe, STRIPE_SIGNATURE_HEADER),
            Provider::DocuSign => (&self.secrets.docusign, DOCUSIGN_SIGNATURE_HEADER),
            Provider::ZohoBilling => (&self.secrets.zoho_billing, ZOHO_SIGNATURE_HEADER),
        };
        let secret = secret
            .as_ref()
            .ok_or(SignatureError::NotConfigured(provider))?;
        let header = headers
            .get(header_name)
            .ok_or(SignatureError::MissingHeader(header_name))?
            .to_str()
            .map_err(|_| SignatureError::Malformed)?;

        match provider {
            Provider::Stripe => verify_stripe(secret, header, body, now),
            Provider::DocuSign => verify_docusign(secret, header, body),
            Provider::ZohoBilling => verify_zoho(secret, header, body),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secret() -> SecretString {
        SecretString::from("whsec_test".to_string())
    }

    const BODY: &[u8] = br#"{"id":"evt_1"}"#;

    #[test]
    fn test_stripe_round_trip_and_tolerance() {
        let header = stripe_signature_header(&secret(), 1_700_000_000, BODY);
        assert_eq!(verify_stripe(&secret(), &header, BODY, 1_700_000_100), Ok(()));
        assert_eq!(
            verify_stripe(&secret(), &header, BODY, 1_700_000_000 + 301),
            Err(SignatureError::Expired)
        );
        assert_eq!(
            verify_stripe(&secret(), &header, b"{}", 1_700_000_000),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn test_stripe_extreme_timestamps_are_expired() {
        for timestamp in [i64::MIN, i64::MAX] {
            let header = format!("t={timestamp},v1={}", "00".repeat(32));
            assert_eq!(
                verify_stripe(&secret(), &header, BODY, 1_700_000_000),
                Err(SignatureError::Expired)
            );
        }
        let header = format!("t=0,v1={}", "00".repeat(32));
        assert_eq!(
            verify_stripe(&secret(), &header, BODY, i64::MIN),
            Err(SignatureError::Expired)
        );
    }

    #[test]
    fn test_stripe_accepts_any_matching_v1() {
        let good = stripe_signature_header(&secret(), 1_700_000_000, BODY);
        let v1 = good.split_once(",v1=").map(|(_, v)| v.to_string()).unwrap();
        let header = format!("t=1700000000,v1={},v1={v1}", "00".repeat(32));
        assert_eq!(verify_stripe(&secret(), &header, BODY, 1_700_000_000), Ok(()));
    }

    #[test]
    fn test_stripe_malformed_header() {
        assert_eq!(
            verify_stripe(&secret(), "v1=abcd", BODY, 0),
            Err(SignatureError::Malformed)
        );
        assert_eq!(
            verify_stripe(&secret(), "t=12", BODY, 12),
            Err(SignatureError::Malformed)
        );
    }

    #[test]
    fn test_docusign_and_zoho() {
        let docusign = docusign_signature_header(&secret(), BODY);
        assert_eq!(verify_docusign(&secret(), &docusign, BODY), Ok(()));
        assert_eq!(
            verify_docusign(&SecretString::from("other".to_string()), &docusign, BODY),
            Err(SignatureError::Mismatch)
        );

        let zoho = zoho_signature_header(&secret(), BODY);
        assert_eq!(verify_zoho(&secret(), &zoho, BODY), Ok(()));
        assert_eq!(
            verify_zoho(&secret(), "not-hex", BODY),
            Err(SignatureError::Malformed)
        );
    }

    #[test]
    fn test_unconfigured_provider_is_rejected() {
        let verifier = WebhookVerifier::new(WebhookSecrets {
            stripe: Some(secret()),
            ..Default::default()
        });
        let headers = HeaderMap::new();
        assert_eq!(
            verifier.verify(Provider::DocuSign, &headers, BODY, 0),
            Err(SignatureError::NotConfigured(Provider::DocuSign))
        );
        assert_eq!(
            verifier.verify(Provider::Stripe, &headers, BODY, 0),
            Err(SignatureError::MissingHeader(STRIPE_SIGNATURE_HEADER))
        );
    }
}
