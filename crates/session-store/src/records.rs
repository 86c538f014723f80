//! Persisted record types.

use chrono::{DateTime, Utc};
use common::{AgreementStatus, ContactId, EnvelopeId, Money, Provider, SessionId, SessionStatus, UserId};
use serde::{Deserialize, Serialize};

/// A portal user. Supplies fallback contact details for the CRM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub email: String,
    pub name: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Input for creating a checkout session.
#[derive(Debug, Clone)]
pub struct NewCheckoutSession {
    pub user_id: UserId,
    pub module: Option<String>,
    /// Payment-intent id or invoice id that payment webhooks correlate on.
    pub payment_reference: Option<String>,
    pub amount: Money,
    pub currency: String,
}

/// One checkout attempt by a user. Never deleted; only its status moves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckoutSession {
    pub id: SessionId,
    pub user_id: UserId,
    pub status: SessionStatus,
    pub module: Option<String>,
    pub card_last4: Option<String>,
    pub payment_reference: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Free-form business contact and address fields captured after payment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompanyInfoFields {
    pub company_name: String,
    pub contact_name: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub zip_code: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub industry: Option<String>,
    #[serde(default)]
    pub company_size: Option<String>,
}

/// Company profile attached one-to-one to a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompanyInfo {
    pub session_id: SessionId,
    #[serde(flatten)]
    pub fields: CompanyInfoFields,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Signature status of the session's agreement envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgreementRecord {
    pub session_id: SessionId,
    pub provider: String,
    pub envelope_id: EnvelopeId,
    pub status: AgreementStatus,
    /// Set exactly once, on the transition into `completed`.
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Local mirror of the CRM sales order for a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SalesOrder {
    pub session_id: SessionId,
    /// CRM sales-order id; populated once provisioning succeeds, never overwritten.
    pub external_id: Option<String>,
    pub amount: Money,
    pub currency: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Link between a portal user and their CRM contact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZohoAccountLink {
    pub user_id: UserId,
    pub contact_id: ContactId,
    #[serde(skip_serializing)]
    pub access_token: Option<String>,
    #[serde(skip_serializing)]
    pub refresh_token: Option<String>,
    pub token_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for recording a webhook event in the idempotency ledger.
#[derive(Debug, Clone)]
pub struct NewProcessedEvent {
    pub provider: Provider,
    pub external_event_id: String,
    pub event_kind: String,
}

/// An admitted webhook event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessedEvent {
    pub provider: Provider,
    pub external_event_id: String,
    pub event_kind: String,
    pub received_at: DateTime<Utc>,
}

/// Input for creating a magic link.
#[derive(Debug, Clone)]
pub struct NewSignupLink {
    pub contact_id: ContactId,
    pub login_code: String,
    pub created_by: UserId,
    pub expires_at: DateTime<Utc>,
    pub max_uses: u32,
}

/// A time-boxed, usage-limited access code for a CRM contact's data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignupLink {
    pub contact_id: ContactId,
    pub login_code: String,
    pub created_by: UserId,
    pub expires_at: DateTime<Utc>,
    pub max_uses: u32,
    pub usage_count: u32,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl SignupLink {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    pub fn is_exhausted(&self) -> bool {
        self.usage_count >= self.max_uses
    }
}

/// Result of an atomic redemption attempt.
///
/// Checks run in this order: missing record, expiry, usage limit, inactive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedemptionOutcome {
    /// The counter was incremented; carries the updated link.
    Redeemed(SignupLink),
    NotFound,
    /// The link expired; `deactivated` is true only for the call that flipped `is_active`.
    Expired { deactivated: bool },
    UsageExceeded,
}

/// Decides a redemption against the current row and returns the row to write back, if any.
///
/// Shared by both backends so the rule order cannot drift between them.
pub(crate) fn decide_redemption(
    link: &SignupLink,
    now: DateTime<Utc>,
) -> (RedemptionOutcome, Option<SignupLink>) {
    if link.is_expired_at(now) {
        if link.is_active {
            let mut updated = link.clone();
            updated.is_active = false;
            return (RedemptionOutcome::Expired { deactivated: true }, Some(updated));
        }
        return (RedemptionOutcome::Expired { deactivated: false }, None);
    }

    if link.is_exhausted() {
        return (RedemptionOutcome::UsageExceeded, None);
    }

    if !link.is_active {
        return (RedemptionOutcome::NotFound, None);
    }

    let mut updated = link.clone();
    updated.usage_count += 1;
    if updated.is_exhausted() {
        updated.is_active = false;
    }
    (RedemptionOutcome::Redeemed(updated.clone()), Some(updated))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn link(max_uses: u32, usage_count: u32, expires_in: Duration) -> SignupLink {
        let now = Utc::now();
        SignupLink {
            contact_id: ContactId::new("zc-1"),
            login_code: "code".to_string(),
            created_by: UserId::new(),
            expires_at: now + expires_in,
            max_uses,
            usage_count,
            is_active: true,
            created_at: now,
        }
    }

    #[test]
    fn test_redeem_increments_and_deactivates_at_limit() {
        let l = link(1, 0, Duration::hours(1));
        let (outcome, write) = decide_redemption(&l, Utc::now());
        let updated = write.unwrap();
        assert_eq!(updated.usage_count, 1);
        assert!(!updated.is_active);
        assert_eq!(outcome, RedemptionOutcome::Redeemed(updated));
    }

    #[test]
    fn test_exhausted_link_reports_usage_exceeded_even_when_inactive() {
        let mut l = link(2, 2, Duration::hours(1));
        l.is_active = false;
        let (outcome, write) = decide_redemption(&l, Utc::now());
        assert_eq!(outcome, RedemptionOutcome::UsageExceeded);
        assert!(write.is_none());
    }

    #[test]
    fn test_expiry_flips_active_once() {
        let l = link(5, 0, Duration::seconds(-1));
        let (outcome, write) = decide_redemption(&l, Utc::now());
        assert_eq!(outcome, RedemptionOutcome::Expired { deactivated: true });
        let flipped = write.unwrap();
        assert!(!flipped.is_active);

        let (outcome, write) = decide_redemption(&flipped, Utc::now());
        assert_eq!(outcome, RedemptionOutcome::Expired { deactivated: false });
        assert!(write.is_none());
    }

    #[test]
    fn test_company_info_fields_use_camel_case() {
        let json = r#"{"companyName":"Acme","contactName":"Ada Lovelace","zipCode":"94107"}"#;
        let fields: CompanyInfoFields = serde_json::from_str(json).unwrap();
        assert_eq!(fields.company_name, "Acme");
        assert_eq!(fields.zip_code.as_deref(), Some("94107"));
        assert!(fields.email.is_none());
    }
}
