//! Billing and payment collaborator.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use common::Money;
use serde::{Deserialize, Serialize};

use super::{InjectedFailure, lock};
use crate::ProviderCallError;

pub const OP_CREATE_INVOICE: &str = "billing.create_invoice";
pub const OP_CAPTURE_PAYMENT: &str = "billing.capture_payment";
pub const OP_REFUND_PAYMENT: &str = "billing.refund_payment";
pub const OP_GET_PAYMENT_STATUS: &str = "billing.get_payment_status";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceRequest {
    pub customer_email: String,
    pub customer_name: Option<String>,
    pub description: String,
    pub amount: Money,
    pub currency: String,
}

/// Settlement state of an invoice or payment intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentState {
    Pending,
    Paid,
    Refunded,
    Voided,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invoice {
    pub id: String,
    pub amount: Money,
    pub currency: String,
    pub status: PaymentState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefundReceipt {
    pub refund_id: String,
    pub payment_reference: String,
    pub amount: Money,
}

/// Capability interface onto billing. A payment reference is either an
/// invoice id or a payment-intent id.
#[async_trait]
pub trait BillingService: Send + Sync {
    async fn create_invoice(&self, request: InvoiceRequest) -> Result<Invoice, ProviderCallError>;

    async fn capture_payment(&self, payment_reference: &str)
    -> Result<PaymentState, ProviderCallError>;

    async fn refund_payment(
        &self,
        payment_reference: &str,
        amount: Money,
    ) -> Result<RefundReceipt, ProviderCallError>;

    async fn get_payment_status(
        &self,
        payment_reference: &str,
    ) -> Result<PaymentState, ProviderCallError>;
}

#[derive(Debug, Default)]
struct InMemoryBillingState {
    payments: HashMap<String, (Money, PaymentState)>,
    next_id: u32,
    failures: HashMap<&'static str, InjectedFailure>,
}

/// In-memory billing provider.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBillingService {
    state: Arc<Mutex<InMemoryBillingState>>,
}

impl InMemoryBillingService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failure(&self, operation: &'static str, failure: Option<InjectedFailure>) {
        let mut state = lock(&self.state);
        match failure {
            Some(failure) => state.failures.insert(operation, failure),
            None => state.failures.remove(operation),
        };
    }

    /// Registers a payment made outside the service, such as a card intent.
    pub fn register_payment(&self, reference: &str, amount: Money, status: PaymentState) {
        lock(&self.state)
            .payments
            .insert(reference.to_string(), (amount, status));
    }

    async fn check(&self, operation: &'static str) -> Result<(), ProviderCallError> {
        let failure = lock(&self.state).failures.get(operation).cloned();
        match failure {
            Some(failure) => failure.apply(operation).await,
            None => Ok(()),
        }
    }
}

fn unknown(operation: &'static str, reference: &str) -> ProviderCallError {
    ProviderCallError::Rejected {
        operation,
        reason: format!("unknown payment reference {reference}"),
    }
}

#[async_trait]
impl BillingService for InMemoryBillingService {
    async fn create_invoice(&self, request: InvoiceRequest) -> Result<Invoice, ProviderCallError> {
        self.check(OP_CREATE_INVOICE).await?;
        if !request.amount.is_positive() {
            return Err(ProviderCallError::Rejected {
                operation: OP_CREATE_INVOICE,
                reason: "invoice amount must be positive".to_string(),
            });
        }

        let mut state = lock(&self.state);
        state.next_id += 1;
        let id = format!("inv-{:05}", state.next_id);
        state
            .payments
            .insert(id.clone(), (request.amount, PaymentState::Pending));

        Ok(Invoice {
            id,
            amount: request.amount,
            currency: request.currency,
            status: PaymentState::Pending,
        })
    }

    async fn capture_payment(
        &self,
        payment_reference: &str,
    ) -> Result<PaymentState, ProviderCallError> {
        self.check(OP_CAPTURE_PAYMENT).await?;
        let mut state = lock(&self.state);
        let (_, status) = state
            .payments
            .get_mut(payment_reference)
            .ok_or_else(|| unknown(OP_CAPTURE_PAYMENT, payment_reference))?;

        match *status {
            PaymentState::Pending => {
                *status = PaymentState::Paid;
                Ok(PaymentState::Paid)
            }
            PaymentState::Paid => Ok(PaymentState::Paid),
            other => Err(ProviderCallError::Rejected {
                operation: OP_CAPTURE_PAYMENT,
                reason: format!("payment is {other:?}"),
            }),
        }
    }

    async fn refund_payment(
        &self,
        payment_reference: &str,
        amount: Money,
    ) -> Result<RefundReceipt, ProviderCallError> {
        self.check(OP_REFUND_PAYMENT).await?;
        let mut state = lock(&self.state);
        state.next_id += 1;
        let refund_id = format!("rf-{:05}", state.next_id);

        let (paid, status) = state
            .payments
            .get_mut(payment_reference)
            .ok_or_else(|| unknown(OP_REFUND_PAYMENT, payment_reference))?;

        if *status != PaymentState::Paid {
            return Err(ProviderCallError::Rejected {
                operation: OP_REFUND_PAYMENT,
                reason: format!("payment is {status:?}"),
            });
        }
        if amount > *paid {
            return Err(ProviderCallError::Rejected {
                operation: OP_REFUND_PAYMENT,
                reason: format!("refund {amount} exceeds payment {paid}"),
            });
        }
        *status = PaymentState::Refunded;

        Ok(RefundReceipt {
            refund_id,
            payment_reference: payment_reference.to_string(),
            amount,
        })
    }

    async fn get_payment_status(
        &self,
        payment_reference: &str,
    ) -> Result<PaymentState, ProviderCallError> {
        self.check(OP_GET_PAYMENT_STATUS).await?;
        lock(&self.state)
            .payments
            .get(payment_reference)
            .map(|(_, status)| *status)
            .ok_or_else(|| unknown(OP_GET_PAYMENT_STATUS, payment_reference))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(cents: i64) -> InvoiceRequest {
        InvoiceRequest {
            customer_email: "ada@example.com".to_string(),
            customer_name: None,
            description: "Zoho Integration".to_string(),
            amount: Money::from_cents(cents),
            currency: "USD".to_string(),
        }
    }

    #[tokio::test]
    async fn test_invoice_capture_refund() {
        let billing = InMemoryBillingService::new();
        let invoice = billing.create_invoice(request(49_900)).await.unwrap();
        assert_eq!(invoice.status, PaymentState::Pending);

        assert_eq!(
            billing.capture_payment(&invoice.id).await.unwrap(),
            PaymentState::Paid
        );
        assert_eq!(
            billing.get_payment_status(&invoice.id).await.unwrap(),
            PaymentState::Paid
        );

        let receipt = billing
            .refund_payment(&invoice.id, Money::from_cents(49_900))
            .await
            .unwrap();
        assert_eq!(receipt.payment_reference, invoice.id);
        assert_eq!(
            billing.get_payment_status(&invoice.id).await.unwrap(),
            PaymentState::Refunded
        );
    }

    #[tokio::test]
    async fn test_refund_rules() {
        let billing = InMemoryBillingService::new();
        billing.register_payment("pi_1", Money::from_cents(1000), PaymentState::Pending);
        assert!(billing.refund_payment("pi_1", Money::from_cents(1000)).await.is_err());

        billing.capture_payment("pi_1").await.unwrap();
        assert!(billing.refund_payment("pi_1", Money::from_cents(5000)).await.is_err());
        assert!(billing.refund_payment("pi_unknown", Money::from_cents(1)).await.is_err());
    }

    #[tokio::test]
    async fn test_zero_invoice_rejected() {
        let billing = InMemoryBillingService::new();
        assert!(matches!(
            billing.create_invoice(request(0)).await,
            Err(ProviderCallError::Rejected { .. })
        ));
    }
}
