//! Magic-link issue and redemption.
//!
//! A link grants read access to one CRM contact without a login. The store
//! validates and consumes a use in one atomic step; only then is the CRM read.

use std::time::Duration;

use chrono::Utc;
use common::ContactId;
use domain::Identity;
use rand::Rng;
use rand::distr::Alphanumeric;
use serde::{Deserialize, Serialize};
use session_store::{NewSignupLink, RedemptionOutcome, SignupLink, Store};

use crate::error::MagicLinkError;
use crate::services::crm::{OP_GET_CONTACT, OP_SEARCH_RELATED};
use crate::services::{CrmContact, CrmService, RelatedModule};
use crate::timeout::bounded;

pub const LOGIN_CODE_LEN: usize = 24;
pub const DEFAULT_EXPIRES_IN_HOURS: i64 = 24;
pub const DEFAULT_MAX_USES: u32 = 1;
const MAX_EXPIRES_IN_HOURS: i64 = 24 * 30;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssueLinkRequest {
    pub expires_in_hours: Option<i64>,
    pub max_uses: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IssuedLink {
    pub signup_link: SignupLink,
    pub magic_link: String,
}

/// Which related record sets a redemption returns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelatedIncludes {
    #[serde(default)]
    pub include_sales_orders: bool,
    #[serde(default)]
    pub include_deals: bool,
    #[serde(default)]
    pub include_tasks: bool,
    #[serde(default)]
    pub include_notes: bool,
}

impl RelatedIncludes {
    pub fn all() -> Self {
        Self {
            include_sales_orders: true,
            include_deals: true,
            include_tasks: true,
            include_notes: true,
        }
    }
}

/// Live CRM view returned by a redemption.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactSnapshot {
    pub contact: CrmContact,
    pub sales_orders: Vec<serde_json::Value>,
    pub deals: Vec<serde_json::Value>,
    pub tasks: Vec<serde_json::Value>,
    pub notes: Vec<serde_json::Value>,
}

#[derive(Debug, Clone)]
pub struct MagicLinkIssuer<S, C> {
    store: S,
    crm: C,
    base_url: String,
    provider_timeout: Duration,
}

impl<S, C> MagicLinkIssuer<S, C>
where
    S: Store,
    C: CrmService,
{
    pub fn new(store: S, crm: C, base_url: impl Into<String>, provider_timeout: Duration) -> Self {
        Self {
            store,
            crm,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            provider_timeout,
        }
    }

    /// Issues a link for the caller's own CRM contact.
    #[tracing::instrument(skip_all, fields(identity = %identity))]
    pub async fn issue(
        &self,
        identity: Identity,
        request: IssueLinkRequest,
    ) -> Result<IssuedLink, MagicLinkError> {
        let user_id = identity
            .user_id()
            .ok_or_else(|| MagicLinkError::Forbidden(identity.to_string()))?;

        let hours = request.expires_in_hours.unwrap_or(DEFAULT_EXPIRES_IN_HOURS);
        if !(1..=MAX_EXPIRES_IN_HOURS).contains(&hours) {
            return Err(MagicLinkError::InvalidRequest(format!(
                "expiresInHours must be between 1 and {MAX_EXPIRES_IN_HOURS}"
            )));
        }
        let max_uses = request.max_uses.unwrap_or(DEFAULT_MAX_USES);
        if max_uses == 0 {
            return Err(MagicLinkError::InvalidRequest(
                "maxUses must be at least 1".to_string(),
            ));
        }

        let link = self
            .store
            .get_account_link(user_id)
            .await?
            .ok_or(MagicLinkError::NoLinkedContact(user_id))?;

        let now = Utc::now();
        let signup_link = self
            .store
            .create_signup_link(NewSignupLink {
                contact_id: link.contact_id.clone(),
                login_code: generate_login_code(),
                created_by: user_id,
                expires_at: now + chrono::Duration::hours(hours),
                max_uses,
            })
            .await?;

        let magic_link = format!(
            "{}/crm-data/{}/{}",
            self.base_url, signup_link.contact_id, signup_link.login_code
        );
        tracing::info!(
            contact_id = %signup_link.contact_id,
            expires_at = %signup_link.expires_at,
            max_uses,
            "signup link issued"
        );

        Ok(IssuedLink {
            signup_link,
            magic_link,
        })
    }

    /// Consumes one use of a link and returns the contact's live CRM data.
    ///
    /// The use is consumed even when the CRM read that follows fails.
    #[tracing::instrument(skip_all, fields(contact_id = %contact_id))]
    pub async fn redeem(
        &self,
        contact_id: &ContactId,
        login_code: &str,
        includes: RelatedIncludes,
    ) -> Result<ContactSnapshot, MagicLinkError> {
        let outcome = self
            .store
            .redeem_signup_link(contact_id, login_code, Utc::now())
            .await?;

        let link = match outcome {
            RedemptionOutcome::Redeemed(link) => link,
            RedemptionOutcome::NotFound => {
                record_redemption("not_found");
                return Err(MagicLinkError::NotFound);
            }
            RedemptionOutcome::Expired { deactivated } => {
                if deactivated {
                    tracing::info!("expired signup link deactivated");
                }
                record_redemption("expired");
                return Err(MagicLinkError::Expired);
            }
            RedemptionOutcome::UsageExceeded => {
                record_redemption("usage_exceeded");
                return Err(MagicLinkError::UsageExceeded);
            }
        };

        let contact = match bounded(
            OP_GET_CONTACT,
            self.provider_timeout,
            self.crm.get_contact(contact_id),
        )
        .await
        {
            Ok(Some(contact)) => contact,
            Ok(None) => {
                tracing::warn!("crm has no contact for a valid signup link");
                record_redemption("contact_unavailable");
                return Err(MagicLinkError::ContactUnavailable);
            }
            Err(err) => {
                tracing::warn!(error = %err, "crm contact lookup failed");
                record_redemption("contact_unavailable");
                return Err(MagicLinkError::ContactUnavailable);
            }
        };

        let snapshot = ContactSnapshot {
            contact,
            sales_orders: self
                .related(includes.include_sales_orders, RelatedModule::SalesOrders, contact_id)
                .await,
            deals: self
                .related(includes.include_deals, RelatedModule::Deals, contact_id)
                .await,
            tasks: self
                .related(includes.include_tasks, RelatedModule::Tasks, contact_id)
                .await,
            notes: self
                .related(includes.include_notes, RelatedModule::Notes, contact_id)
                .await,
        };

        record_redemption("redeemed");
        tracing::info!(
            usage_count = link.usage_count,
            max_uses = link.max_uses,
            "signup link redeemed"
        );
        Ok(snapshot)
    }

    // Lookup failures degrade to an empty list.
    async fn related(
        &self,
        wanted: bool,
        module: RelatedModule,
        contact_id: &ContactId,
    ) -> Vec<serde_json::Value> {
        if !wanted {
            return Vec::new();
        }
        let criteria = module.criteria(contact_id);
        match bounded(
            OP_SEARCH_RELATED,
            self.provider_timeout,
            self.crm.search_related(module, &criteria),
        )
        .await
        {
            Ok(records) => records,
            Err(err) => {
                tracing::warn!(module = module.api_name(), error = %err, "related record lookup failed");
                Vec::new()
            }
        }
    }
}

fn record_redemption(outcome: &'static str) {
    metrics::counter!("signup_link_redemptions_total", "outcome" => outcome).increment(1);
}

/// A 24-character alphanumeric code from the thread-local CSPRNG.
pub fn generate_login_code() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(LOGIN_CODE_LEN)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_login_code_shape() {
        let a = generate_login_code();
        let b = generate_login_code();
        assert_eq!(a.len(), LOGIN_CODE_LEN);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(a, b);
    }

    #[test]
    fn test_includes_default_to_false() {
        let includes: RelatedIncludes =
            serde_json::from_str(r#"{"includeDeals":true}"#).unwrap();
        assert!(includes.include_deals);
        assert!(!includes.include_sales_orders);
        assert!(!includes.include_tasks);
        assert!(!includes.include_notes);
    }
}
