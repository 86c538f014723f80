//! Signature-provider collaborator.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use common::{EnvelopeId, SessionId};
use serde::{Deserialize, Serialize};

use super::{InjectedFailure, lock};
use crate::ProviderCallError;

pub const OP_CREATE_ENVELOPE: &str = "signature.create_envelope_signing_url";

/// Template fields for the service agreement envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvelopeRequest {
    pub session_id: SessionId,
    pub signer_name: String,
    pub signer_email: String,
    pub company_name: String,
    pub module: Option<String>,
    /// Where the provider sends the signer after signing.
    pub return_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SigningUrl {
    pub url: String,
    pub envelope_id: EnvelopeId,
}

#[async_trait]
pub trait SignatureService: Send + Sync {
    /// Provider name recorded on the agreement row.
    fn provider_name(&self) -> &'static str;

    /// Creates an envelope from the template and returns the embedded signing URL.
    async fn create_envelope_signing_url(
        &self,
        request: EnvelopeRequest,
    ) -> Result<SigningUrl, ProviderCallError>;
}

#[derive(Debug, Default)]
struct InMemorySignatureState {
    envelopes: HashMap<EnvelopeId, EnvelopeRequest>,
    next_id: u32,
    failure: Option<InjectedFailure>,
}

/// In-memory signature provider.
#[derive(Debug, Clone, Default)]
pub struct InMemorySignatureService {
    state: Arc<Mutex<InMemorySignatureState>>,
}

impl InMemorySignatureService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failure(&self, failure: Option<InjectedFailure>) {
        lock(&self.state).failure = failure;
    }

    pub fn envelope_count(&self) -> usize {
        lock(&self.state).envelopes.len()
    }
}

#[async_trait]
impl SignatureService for InMemorySignatureService {
    fn provider_name(&self) -> &'static str {
        "DocuSign"
    }

    async fn create_envelope_signing_url(
        &self,
        request: EnvelopeRequest,
    ) -> Result<SigningUrl, ProviderCallError> {
        let failure = lock(&self.state).failure.clone();
        if let Some(failure) = failure {
            failure.apply(OP_CREATE_ENVELOPE).await?;
        }

        let mut state = lock(&self.state);
        state.next_id += 1;
        let envelope_id = EnvelopeId::new(format!("env-{:04}", state.next_id));
        let url = format!("https://signing.example.test/envelopes/{envelope_id}/recipient");
        state.envelopes.insert(envelope_id.clone(), request);

        Ok(SigningUrl { url, envelope_id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> EnvelopeRequest {
        EnvelopeRequest {
            session_id: SessionId::new(),
            signer_name: "Ada Lovelace".to_string(),
            signer_email: "ada@example.com".to_string(),
            company_name: "Acme".to_string(),
            module: None,
            return_url: None,
        }
    }

    #[tokio::test]
    async fn test_envelopes_get_distinct_ids() {
        let service = InMemorySignatureService::new();
        let a = service.create_envelope_signing_url(request()).await.unwrap();
        let b = service.create_envelope_signing_url(request()).await.unwrap();
        assert_ne!(a.envelope_id, b.envelope_id);
        assert!(a.url.contains(a.envelope_id.as_str()));
        assert_eq!(service.envelope_count(), 2);
    }

    #[tokio::test]
    async fn test_rejection() {
        let service = InMemorySignatureService::new();
        service.set_failure(Some(InjectedFailure::Reject("template missing".to_string())));
        assert!(matches!(
            service.create_envelope_signing_url(request()).await,
            Err(ProviderCallError::Rejected { .. })
        ));
    }
}
