//! Compare-and-set application of session triggers.

use common::{SessionId, SessionStatus};
use domain::machine::session::{self, SessionDecision};
use domain::{SessionGuards, SessionTrigger};
use session_store::{SessionStore, StoreError};

/// Attempts before a trigger gives up on a session that keeps changing.
const MAX_CAS_ATTEMPTS: usize = 3;

/// What happened when a trigger was applied to a stored session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TriggerResult {
    Applied {
        from: SessionStatus,
        to: SessionStatus,
    },
    Unchanged(SessionStatus),
    Blocked(&'static str),
    Conflict(SessionStatus),
    Missing,
}

/// Reads the session, decides, and writes the decision as a compare-and-set,
/// re-reading after a lost race.
pub(crate) async fn apply_trigger<S>(
    store: &S,
    session_id: SessionId,
    trigger: SessionTrigger,
    guards: &SessionGuards,
) -> Result<TriggerResult, StoreError>
where
    S: SessionStore + ?Sized,
{
    let mut last_race = None;

    for _ in 0..MAX_CAS_ATTEMPTS {
        let Some(stored) = store.get_session(session_id).await? else {
            return Ok(TriggerResult::Missing);
        };
        let current = stored.status;

        let next = match session::decide(current, trigger, guards) {
            SessionDecision::Advance(next) => next,
            SessionDecision::NoOp => return Ok(TriggerResult::Unchanged(current)),
            SessionDecision::GuardFailed(reason) => return Ok(TriggerResult::Blocked(reason)),
            SessionDecision::Conflict { current, .. } => return Ok(TriggerResult::Conflict(current)),
        };

        match store
            .transition_session_status(session_id, current, next)
            .await
        {
            Ok(updated) => {
                tracing::info!(
                    session_id = %session_id,
                    %trigger,
                    from = %current,
                    to = %updated.status,
                    "session status advanced"
                );
                return Ok(TriggerResult::Applied {
                    from: current,
                    to: updated.status,
                });
            }
            Err(err @ StoreError::StaleStatus { .. }) => {
                tracing::debug!(session_id = %session_id, %trigger, "lost status race, re-reading");
                last_race = Some(err);
            }
            Err(StoreError::NotFound { .. }) => return Ok(TriggerResult::Missing),
            Err(err) => return Err(err),
        }
    }

    Err(last_race.unwrap_or_else(|| StoreError::Conflict(format!(
        "session {session_id} kept changing while applying {trigger}"
    ))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::Money;
    use session_store::{InMemorySessionStore, NewCheckoutSession};

    async fn seed_session(store: &InMemorySessionStore) -> SessionId {
        let user = store.create_user("ada@example.com", None).await.unwrap();
        store
            .create_session(NewCheckoutSession {
                user_id: user.id,
                module: None,
                payment_reference: Some("pi_1".to_string()),
                amount: Money::from_cents(1000),
                currency: "USD".to_string(),
            })
            .await
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn test_apply_then_repeat_is_unchanged() {
        let store = InMemorySessionStore::new();
        let id = seed_session(&store).await;
        let guards = SessionGuards::default();

        let first = apply_trigger(&store, id, SessionTrigger::PaymentConfirmed, &guards)
            .await
            .unwrap();
        assert_eq!(
            first,
            TriggerResult::Applied {
                from: SessionStatus::Pending,
                to: SessionStatus::PaymentCompleted
            }
        );

        let second = apply_trigger(&store, id, SessionTrigger::PaymentConfirmed, &guards)
            .await
            .unwrap();
        assert_eq!(second, TriggerResult::Unchanged(SessionStatus::PaymentCompleted));
    }

    #[tokio::test]
    async fn test_guard_and_missing_session() {
        let store = InMemorySessionStore::new();
        let id = seed_session(&store).await;
        let guards = SessionGuards::default();

        apply_trigger(&store, id, SessionTrigger::PaymentConfirmed, &guards)
            .await
            .unwrap();
        let blocked = apply_trigger(&store, id, SessionTrigger::ContactProvisioned, &guards)
            .await
            .unwrap();
        assert_eq!(blocked, TriggerResult::Blocked("company info missing"));

        let missing = apply_trigger(
            &store,
            SessionId::new(),
            SessionTrigger::RefundIssued,
            &guards,
        )
        .await
        .unwrap();
        assert_eq!(missing, TriggerResult::Missing);
    }
}
