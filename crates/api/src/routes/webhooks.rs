//! Provider webhook endpoints.
//!
//! Each handler verifies the provider signature over the raw body before
//! anything is parsed. Business outcomes (duplicates, orphans, conflicts)
//! are acknowledged with 200 so the provider stops redelivering; only
//! infrastructure failures answer 5xx and invite a retry.

use std::sync::Arc;

use axum::Json;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use common::Provider;
use reconciliation::WebhookOutcome;
use serde::Serialize;
use session_store::Store;

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct WebhookAck {
    pub received: bool,
    pub outcome: WebhookOutcome,
}

/// POST /webhooks/stripe
pub async fn stripe<S: Store + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookAck>, ApiError> {
    receive(&state, Provider::Stripe, &headers, &body).await
}

/// POST /webhooks/docusign
pub async fn docusign<S: Store + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookAck>, ApiError> {
    receive(&state, Provider::DocuSign, &headers, &body).await
}

/// POST /webhooks/zoho-billing
pub async fn zoho_billing<S: Store + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookAck>, ApiError> {
    receive(&state, Provider::ZohoBilling, &headers, &body).await
}

#[tracing::instrument(skip_all, fields(provider = %provider))]
async fn receive<S: Store + Clone>(
    state: &AppState<S>,
    provider: Provider,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<Json<WebhookAck>, ApiError> {
    if let Err(err) = state
        .verifier
        .verify(provider, headers, body, chrono::Utc::now().timestamp())
    {
        tracing::warn!(error = %err, alert = "webhook_rejected", "webhook signature rejected");
        metrics::counter!("webhook_rejected_total", "provider" => provider.as_str()).increment(1);
        return Err(err.into());
    }

    let outcome = state.reconciler.handle_webhook(provider, body).await?;
    Ok(Json(WebhookAck {
        received: true,
        outcome,
    }))
}
