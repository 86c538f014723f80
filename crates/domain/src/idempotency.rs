//! Idempotency Guard.
//!
//! Admission is the ledger's atomic insert: whichever delivery inserts the
//! (provider, event id) pair first proceeds, every other one is told the
//! event was already processed. There is no read-then-write check here.
//!
//! The ledger write happens before any CRM call, but it is not in the same
//! transaction as the state writes that follow. When applying an admitted
//! event fails, the caller releases the entry so the provider's retry is
//! admitted again. A crash between admission and those writes still loses
//! the event; recovery is a manual provisioning re-run, and the orchestrator
//! warns when it sees a repeated step attempt.

use common::Provider;
use session_store::{EventLedger, NewProcessedEvent};

use crate::Result;

/// Outcome of [`IdempotencyGuard::admit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// First delivery; the caller may apply it.
    Admitted,
    /// Seen before; the caller acknowledges and stops.
    AlreadyProcessed,
}

/// Gate in front of every webhook state mutation.
#[derive(Debug, Clone)]
pub struct IdempotencyGuard<L> {
    ledger: L,
}

impl<L: EventLedger> IdempotencyGuard<L> {
    pub fn new(ledger: L) -> Self {
        Self { ledger }
    }

    /// Records the event in the ledger if it is new.
    ///
    /// `event_kind` is stored alongside for operators reading the ledger.
    #[tracing::instrument(skip(self, provider), fields(provider = %provider))]
    pub async fn admit(
        &self,
        provider: Provider,
        external_event_id: &str,
        event_kind: &str,
    ) -> Result<Admission> {
        let inserted = self
            .ledger
            .record_processed_event(NewProcessedEvent {
                provider,
                external_event_id: external_event_id.to_string(),
                event_kind: event_kind.to_string(),
            })
            .await?;

        if inserted {
            Ok(Admission::Admitted)
        } else {
            metrics::counter!("webhook_duplicates_total", "provider" => provider.as_str())
                .increment(1);
            tracing::info!(event_id = external_event_id, "duplicate delivery ignored");
            Ok(Admission::AlreadyProcessed)
        }
    }

    /// Undoes an admission whose event could not be applied.
    pub async fn release(&self, provider: Provider, external_event_id: &str) -> Result<()> {
        self.ledger
            .forget_processed_event(provider, external_event_id)
            .await?;
        tracing::info!(provider = %provider, event_id = external_event_id, "ledger entry released for retry");
        Ok(())
    }
}
