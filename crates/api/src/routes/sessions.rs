//! Checkout-session endpoints.

use std::sync::Arc;

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use common::SessionId;
use reconciliation::{CreateSessionRequest, PaymentRefresh, ProvisioningOutcome, SessionDetails};
use reconciliation::services::SigningUrl;
use serde::Deserialize;
use session_store::{CheckoutSession, CompanyInfo, CompanyInfoFields, Store};

use super::identity::Caller;
use super::json_or_default;
use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiateSigningRequest {
    #[serde(default)]
    pub return_url: Option<String>,
}

fn parse_session_id(raw: &str) -> Result<SessionId, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::BadRequest(format!("Invalid session id: {raw}")))
}

/// POST /sessions
#[tracing::instrument(skip_all)]
pub async fn create<S: Store + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Caller(identity): Caller,
    Json(req): Json<CreateSessionRequest>,
) -> Result<(StatusCode, Json<CheckoutSession>), ApiError> {
    let session = state.sessions.create_session(identity, req).await?;
    Ok((StatusCode::CREATED, Json(session)))
}

/// GET /sessions
pub async fn list<S: Store + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Caller(identity): Caller,
) -> Result<Json<Vec<SessionDetails>>, ApiError> {
    Ok(Json(state.sessions.list_sessions(identity).await?))
}

/// GET /sessions/{id}
pub async fn get<S: Store + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Caller(identity): Caller,
    Path(id): Path<String>,
) -> Result<Json<SessionDetails>, ApiError> {
    let session_id = parse_session_id(&id)?;
    Ok(Json(state.sessions.get_session(identity, session_id).await?))
}

/// PUT /sessions/{id}/company-info
pub async fn upsert_company_info<S: Store + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Caller(identity): Caller,
    Path(id): Path<String>,
    Json(fields): Json<CompanyInfoFields>,
) -> Result<Json<CompanyInfo>, ApiError> {
    let session_id = parse_session_id(&id)?;
    let info = state
        .sessions
        .upsert_company_info(identity, session_id, fields)
        .await?;
    Ok(Json(info))
}

/// POST /sessions/{id}/agreement
pub async fn initiate_signing<S: Store + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Caller(identity): Caller,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<SigningUrl>, ApiError> {
    let session_id = parse_session_id(&id)?;
    let req: InitiateSigningRequest = json_or_default(&body)?;
    let signing = state
        .sessions
        .initiate_signing(identity, session_id, req.return_url)
        .await?;
    Ok(Json(signing))
}

/// POST /sessions/{id}/provision
pub async fn provision<S: Store + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Caller(identity): Caller,
    Path(id): Path<String>,
) -> Result<Json<ProvisioningOutcome>, ApiError> {
    let session_id = parse_session_id(&id)?;
    Ok(Json(state.sessions.provision(identity, session_id).await?))
}

/// POST /sessions/{id}/refresh-payment
pub async fn refresh_payment<S: Store + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Caller(identity): Caller,
    Path(id): Path<String>,
) -> Result<Json<PaymentRefresh>, ApiError> {
    let session_id = parse_session_id(&id)?;
    let refresh = state
        .sessions
        .refresh_payment_status(identity, session_id)
        .await?;
    Ok(Json(refresh))
}
