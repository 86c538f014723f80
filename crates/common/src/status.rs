//! Lifecycle statuses shared by the store and the state machines.

use serde::{Deserialize, Serialize};

/// The status of a checkout session.
///
/// State transitions:
/// ```text
/// Pending ──► PaymentCompleted ──► ContactCreated ──► SalesOrderCreated ──► Completed
///    │               │                   │                    │               │
///    └───────────────┴───────────────────┴────────────────────┴──► Cancelled  │
///    └─────────────────────── any except Refunded ───────────────────────────┴──► Refunded
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Checkout started, payment not yet confirmed.
    #[default]
    Pending,

    /// Payment confirmed by the payment or billing provider.
    PaymentCompleted,

    /// CRM contact created or updated for the owner.
    ContactCreated,

    /// CRM sales order created.
    SalesOrderCreated,

    /// Paid, signed and provisioned (terminal state).
    Completed,

    /// Invoice voided before completion (terminal state).
    Cancelled,

    /// Payment refunded (terminal state).
    Refunded,
}

impl SessionStatus {
    /// Position along the happy path, `None` for the absorbing failure statuses.
    pub fn progress(&self) -> Option<u8> {
        match self {
            SessionStatus::Pending => Some(0),
            SessionStatus::PaymentCompleted => Some(1),
            SessionStatus::ContactCreated => Some(2),
            SessionStatus::SalesOrderCreated => Some(3),
            SessionStatus::Completed => Some(4),
            SessionStatus::Cancelled | SessionStatus::Refunded => None,
        }
    }

    /// Returns true once payment has been confirmed and the session is still on the happy path.
    pub fn is_paid(&self) -> bool {
        matches!(self.progress(), Some(p) if p >= 1)
    }

    /// Returns true if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::Cancelled | SessionStatus::Refunded
        )
    }

    /// Returns the status name as stored.
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Pending => "pending",
            SessionStatus::PaymentCompleted => "payment_completed",
            SessionStatus::ContactCreated => "contact_created",
            SessionStatus::SalesOrderCreated => "sales_order_created",
            SessionStatus::Completed => "completed",
            SessionStatus::Cancelled => "cancelled",
            SessionStatus::Refunded => "refunded",
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(SessionStatus::Pending),
            "payment_completed" => Ok(SessionStatus::PaymentCompleted),
            "contact_created" => Ok(SessionStatus::ContactCreated),
            "sales_order_created" => Ok(SessionStatus::SalesOrderCreated),
            "completed" => Ok(SessionStatus::Completed),
            "cancelled" => Ok(SessionStatus::Cancelled),
            "refunded" => Ok(SessionStatus::Refunded),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// The status of an agreement envelope at the signature provider.
///
/// Statuses advance monotonically by severity:
/// ```text
/// Pending(0) < Sent(1) < PartiallySigned(2) < Completed | Declined | Voided (3)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AgreementStatus {
    /// Envelope created, not yet reported as sent.
    #[default]
    Pending,

    /// Envelope delivered to recipients.
    Sent,

    /// At least one recipient has signed.
    PartiallySigned,

    /// All recipients signed (terminal state).
    Completed,

    /// A recipient declined (terminal state).
    Declined,

    /// The sender voided the envelope (terminal state).
    Voided,
}

impl AgreementStatus {
    /// Severity rank used for monotonic advancement.
    pub fn severity(&self) -> u8 {
        match self {
            AgreementStatus::Pending => 0,
            AgreementStatus::Sent => 1,
            AgreementStatus::PartiallySigned => 2,
            AgreementStatus::Completed | AgreementStatus::Declined | AgreementStatus::Voided => 3,
        }
    }

    /// Returns true if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.severity() == 3
    }

    /// Returns the status name as stored.
    pub fn as_str(&self) -> &'static str {
        match self {
            AgreementStatus::Pending => "pending",
            AgreementStatus::Sent => "sent",
            AgreementStatus::PartiallySigned => "partially_signed",
            AgreementStatus::Completed => "completed",
            AgreementStatus::Declined => "declined",
            AgreementStatus::Voided => "voided",
        }
    }
}

impl std::fmt::Display for AgreementStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AgreementStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(AgreementStatus::Pending),
            "sent" => Ok(AgreementStatus::Sent),
            "partially_signed" => Ok(AgreementStatus::PartiallySigned),
            "completed" => Ok(AgreementStatus::Completed),
            "declined" => Ok(AgreementStatus::Declined),
            "voided" => Ok(AgreementStatus::Voided),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// Returned when a stored status string is not recognized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownStatus(pub String);

impl std::fmt::Display for UnknownStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unknown status: {}", self.0)
    }
}

impl std::error::Error for UnknownStatus {}
