//! Agreement sub-state machine.
//!
//! Envelope events arrive out of order, so the machine advances by
//! severity instead of matching the stored status exactly:
//! ```text
//! pending(0) < sent(1) < partially_signed(2) < completed | declined | voided (3)
//! ```
//! A lower-or-equal severity report for the same status is a no-op. Two
//! different terminal statuses for one envelope conflict.

use common::AgreementStatus;

/// What applying a reported status to an agreement should do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgreementDecision {
    /// Move to the given status.
    Advance(AgreementStatus),
    /// Stale, repeated or regressing report; nothing to write.
    NoOp,
    /// A different terminal status is already recorded.
    Conflict {
        current: AgreementStatus,
        reported: AgreementStatus,
    },
}

impl AgreementDecision {
    /// True when this decision records `completed` for the first time.
    pub fn completes(&self) -> bool {
        matches!(self, AgreementDecision::Advance(AgreementStatus::Completed))
    }
}

/// Decides how a `reported` status moves an agreement in `current`.
pub fn decide(current: AgreementStatus, reported: AgreementStatus) -> AgreementDecision {
    if reported == current {
        return AgreementDecision::NoOp;
    }

    match reported.severity().cmp(&current.severity()) {
        std::cmp::Ordering::Greater => AgreementDecision::Advance(reported),
        std::cmp::Ordering::Less => AgreementDecision::NoOp,
        std::cmp::Ordering::Equal => AgreementDecision::Conflict { current, reported },
    }
}
