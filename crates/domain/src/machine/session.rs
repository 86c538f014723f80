//! Session state machine.
//!
//! A pure function of (current status, trigger, guards). Persisting the
//! result is the caller's job, as a compare-and-set on the current status.

use common::SessionStatus;
use serde::{Deserialize, Serialize};

/// Something that can move a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionTrigger {
    /// Card payment or invoice settled.
    PaymentConfirmed,
    /// CRM contact upserted for the owner.
    ContactProvisioned,
    /// CRM sales order created.
    SalesOrderProvisioned,
    /// The session's agreement reached `completed`.
    AgreementCompleted,
    InvoiceVoided,
    RefundIssued,
}

impl SessionTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionTrigger::PaymentConfirmed => "PaymentConfirmed",
            SessionTrigger::ContactProvisioned => "ContactProvisioned",
            SessionTrigger::SalesOrderProvisioned => "SalesOrderProvisioned",
            SessionTrigger::AgreementCompleted => "AgreementCompleted",
            SessionTrigger::InvoiceVoided => "InvoiceVoided",
            SessionTrigger::RefundIssued => "RefundIssued",
        }
    }
}

impl std::fmt::Display for SessionTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Facts about the session's sub-records that gate transitions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionGuards {
    pub company_info_exists: bool,
    pub account_link_exists: bool,
    pub agreement_completed: bool,
}

/// What applying a trigger to a session should do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionDecision {
    /// Move to the given status.
    Advance(SessionStatus),
    /// Already at or past the target; nothing to write.
    NoOp,
    /// The transition is legal but its precondition does not hold yet.
    GuardFailed(&'static str),
    /// The trigger cannot apply to this status.
    Conflict {
        current: SessionStatus,
        trigger: SessionTrigger,
    },
}

/// Decides how `trigger` moves a session currently in `current`.
pub fn decide(
    current: SessionStatus,
    trigger: SessionTrigger,
    guards: &SessionGuards,
) -> SessionDecision {
    use SessionStatus::*;

    let conflict = SessionDecision::Conflict { current, trigger };

    match trigger {
        SessionTrigger::PaymentConfirmed => match current {
            Pending => SessionDecision::Advance(PaymentCompleted),
            Cancelled | Refunded => conflict,
            _ => SessionDecision::NoOp,
        },
        SessionTrigger::ContactProvisioned => match current {
            PaymentCompleted if guards.company_info_exists => SessionDecision::Advance(ContactCreated),
            PaymentCompleted => SessionDecision::GuardFailed("company info missing"),
            ContactCreated | SalesOrderCreated | Completed => SessionDecision::NoOp,
            Pending | Cancelled | Refunded => conflict,
        },
        SessionTrigger::SalesOrderProvisioned => match current {
            ContactCreated if guards.account_link_exists => {
                SessionDecision::Advance(SalesOrderCreated)
            }
            ContactCreated => SessionDecision::GuardFailed("account link missing"),
            SalesOrderCreated | Completed => SessionDecision::NoOp,
            Pending | PaymentCompleted | Cancelled | Refunded => conflict,
        },
        SessionTrigger::AgreementCompleted => match current {
            SalesOrderCreated if guards.agreement_completed => SessionDecision::Advance(Completed),
            SalesOrderCreated => SessionDecision::GuardFailed("agreement not completed"),
            // Provisioning has not caught up yet; it finishes the session later.
            Pending | PaymentCompleted | ContactCreated | Completed => SessionDecision::NoOp,
            Cancelled | Refunded => conflict,
        },
        SessionTrigger::InvoiceVoided => match current {
            Cancelled => SessionDecision::NoOp,
            Completed | Refunded => conflict,
            _ => SessionDecision::Advance(Cancelled),
        },
        SessionTrigger::RefundIssued => match current {
            Refunded => SessionDecision::NoOp,
            _ => SessionDecision::Advance(Refunded),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use SessionStatus::*;

    const ALL: [SessionStatus; 7] = [
        Pending,
        PaymentCompleted,
        ContactCreated,
        SalesOrderCreated,
        Completed,
        Cancelled,
        Refunded,
    ];

    fn all_guards() -> SessionGuards {
        SessionGuards {
            company_info_exists: true,
            account_link_exists: true,
            agreement_completed: true,
        }
    }

    #[test]
    fn test_happy_path() {
        let guards = all_guards();
        let steps = [
            (Pending, SessionTrigger::PaymentConfirmed, PaymentCompleted),
            (PaymentCompleted, SessionTrigger::ContactProvisioned, ContactCreated),
            (ContactCreated, SessionTrigger::SalesOrderProvisioned, SalesOrderCreated),
            (SalesOrderCreated, SessionTrigger::AgreementCompleted, Completed),
        ];
        for (current, trigger, next) in steps {
            assert_eq!(decide(current, trigger, &guards), SessionDecision::Advance(next));
        }
    }

    #[test]
    fn test_guards_block_advancement() {
        let none = SessionGuards::default();
        assert!(matches!(
            decide(PaymentCompleted, SessionTrigger::ContactProvisioned, &none),
            SessionDecision::GuardFailed(_)
        ));
        assert!(matches!(
            decide(ContactCreated, SessionTrigger::SalesOrderProvisioned, &none),
            SessionDecision::GuardFailed(_)
        ));
        assert!(matches!(
            decide(SalesOrderCreated, SessionTrigger::AgreementCompleted, &none),
            SessionDecision::GuardFailed(_)
        ));
    }

    #[test]
    fn test_repeated_payment_is_noop() {
        let guards = all_guards();
        for status in [PaymentCompleted, ContactCreated, SalesOrderCreated, Completed] {
            assert_eq!(
                decide(status, SessionTrigger::PaymentConfirmed, &guards),
                SessionDecision::NoOp
            );
        }
    }

    #[test]
    fn test_agreement_before_provisioning_waits() {
        let guards = all_guards();
        assert_eq!(
            decide(Pending, SessionTrigger::AgreementCompleted, &guards),
            SessionDecision::NoOp
        );
        assert_eq!(
            decide(PaymentCompleted, SessionTrigger::AgreementCompleted, &guards),
            SessionDecision::NoOp
        );
    }

    #[test]
    fn test_provisioning_before_payment_conflicts() {
        let guards = all_guards();
        assert!(matches!(
            decide(Pending, SessionTrigger::ContactProvisioned, &guards),
            SessionDecision::Conflict { .. }
        ));
    }

    #[test]
    fn test_cancelled_and_refunded_absorb() {
        let guards = all_guards();
        for trigger in [
            SessionTrigger::PaymentConfirmed,
            SessionTrigger::ContactProvisioned,
            SessionTrigger::SalesOrderProvisioned,
            SessionTrigger::AgreementCompleted,
        ] {
            for status in [Cancelled, Refunded] {
                assert!(matches!(
                    decide(status, trigger, &guards),
                    SessionDecision::Conflict { .. }
                ));
            }
        }
        assert_eq!(
            decide(Refunded, SessionTrigger::RefundIssued, &guards),
            SessionDecision::NoOp
        );
        assert_eq!(
            decide(Cancelled, SessionTrigger::InvoiceVoided, &guards),
            SessionDecision::NoOp
        );
    }

    #[test]
    fn test_void_cancels_only_unfinished_sessions() {
        let guards = all_guards();
        for status in [Pending, PaymentCompleted, ContactCreated, SalesOrderCreated] {
            assert_eq!(
                decide(status, SessionTrigger::InvoiceVoided, &guards),
                SessionDecision::Advance(Cancelled)
            );
        }
        assert!(matches!(
            decide(Completed, SessionTrigger::InvoiceVoided, &guards),
            SessionDecision::Conflict { .. }
        ));
    }

    #[test]
    fn test_no_decision_moves_backwards() {
        let guards = all_guards();
        let triggers = [
            SessionTrigger::PaymentConfirmed,
            SessionTrigger::ContactProvisioned,
            SessionTrigger::SalesOrderProvisioned,
            SessionTrigger::AgreementCompleted,
        ];
        for current in ALL {
            for trigger in triggers {
                if let SessionDecision::Advance(next) = decide(current, trigger, &guards) {
                    assert!(next.progress() > current.progress());
                }
            }
        }
    }
}
