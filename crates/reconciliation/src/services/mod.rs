//! External collaborator traits and in-memory implementations.

pub mod billing;
pub mod crm;
pub mod signature;

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::ProviderCallError;

pub use billing::{
    BillingService, InMemoryBillingService, Invoice, InvoiceRequest, PaymentState, RefundReceipt,
};
pub use crm::{
    ContactFields, CrmContact, CrmService, InMemoryCrmService, RelatedModule, SalesOrderLine,
    SalesOrderRequest,
};
pub use signature::{EnvelopeRequest, InMemorySignatureService, SignatureService, SigningUrl};

/// A failure the in-memory services can be told to produce.
#[derive(Debug, Clone)]
pub enum InjectedFailure {
    Reject(String),
    Unavailable(String),
    /// Sleep before answering; long enough and the caller's bound fires.
    Hang(Duration),
}

impl InjectedFailure {
    async fn apply(self, operation: &'static str) -> Result<(), ProviderCallError> {
        match self {
            InjectedFailure::Reject(reason) => Err(ProviderCallError::Rejected { operation, reason }),
            InjectedFailure::Unavailable(reason) => {
                Err(ProviderCallError::Unavailable { operation, reason })
            }
            InjectedFailure::Hang(delay) => {
                tokio::time::sleep(delay).await;
                Ok(())
            }
        }
    }
}

// In-memory state is never left half-written, so a poisoned lock is still usable.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
