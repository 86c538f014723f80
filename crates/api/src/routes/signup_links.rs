//! Magic-link issue and redemption.

use std::sync::Arc;

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use common::ContactId;
use reconciliation::{ContactSnapshot, IssueLinkRequest, IssuedLink, RelatedIncludes};
use serde::{Deserialize, Serialize};
use session_store::Store;

use super::identity::Caller;
use super::json_or_default;
use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct CrmDataResponse {
    pub success: bool,
    pub data: ContactSnapshot,
}

/// Include flags as they arrive on the query string. Only the exact value
/// `true` switches a record set on; any other value leaves it off.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncludeParams {
    include_sales_orders: Option<String>,
    include_deals: Option<String>,
    include_tasks: Option<String>,
    include_notes: Option<String>,
}

fn flag(value: Option<&str>) -> bool {
    value == Some("true")
}

impl From<IncludeParams> for RelatedIncludes {
    fn from(params: IncludeParams) -> Self {
        Self {
            include_sales_orders: flag(params.include_sales_orders.as_deref()),
            include_deals: flag(params.include_deals.as_deref()),
            include_tasks: flag(params.include_tasks.as_deref()),
            include_notes: flag(params.include_notes.as_deref()),
        }
    }
}

/// POST /signup-links
pub async fn issue<S: Store + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Caller(identity): Caller,
    body: Bytes,
) -> Result<(StatusCode, Json<IssuedLink>), ApiError> {
    let req: IssueLinkRequest = json_or_default(&body)?;
    let issued = state.magic_links.issue(identity, req).await?;
    Ok((StatusCode::CREATED, Json(issued)))
}

/// GET /crm-data/{contactId}/{loginCode}
///
/// The login code is the only credential; no user header is read.
pub async fn crm_data<S: Store + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Path((contact_id, login_code)): Path<(String, String)>,
    Query(params): Query<IncludeParams>,
) -> Result<Json<CrmDataResponse>, ApiError> {
    let snapshot = state
        .magic_links
        .redeem(&ContactId::new(contact_id), &login_code, params.into())
        .await?;
    Ok(Json(CrmDataResponse {
        success: true,
        data: snapshot,
    }))
}
