use chrono::{DateTime, Utc};
use serde::Serialize;

use super::domain::{
    Document, Lead, LeadStatus, Payment, PaymentStatus, Property, Transaction, TransactionId,
    TransactionStatus,
};
use super::status::TransitionError;

/// Reconciliation derived from (amount, payment) on every read; never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PaymentDetails {
    pub amount_paid: u64,
    pub due_amount: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_date: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_reference: Option<String>,
}

/// Only completed payments count. The paid amount is capped at `amount` so that
/// `amount_paid + due_amount == amount` holds for every input.
pub fn payment_details(amount: u64, payment: Option<&Payment>) -> PaymentDetails {
    let amount_paid = payment
        .filter(|payment| payment.status == PaymentStatus::Completed)
        .map(|payment| payment.amount.min(amount))
        .unwrap_or(0);

    PaymentDetails {
        amount_paid,
        due_amount: amount.saturating_sub(amount_paid),
        payment_date: payment.and_then(|payment| payment.paid_at),
        payment_method: payment.and_then(|payment| payment.method.clone()),
        transaction_reference: payment.and_then(|payment| payment.reference.clone()),
    }
}

/// Transaction as exposed to callers: stored record plus freshly derived payment details.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransactionView {
    #[serde(flatten)]
    pub transaction: Transaction,
    pub payment_details: PaymentDetails,
}

impl TransactionView {
    pub fn new(transaction: Transaction, payment: Option<&Payment>) -> Self {
        let payment_details = payment_details(transaction.amount, payment);
        Self {
            transaction,
            payment_details,
        }
    }
}

/// Edges and guards of the transaction confirmation workflow.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransactionLedger;

impl TransactionLedger {
    pub fn allows(&self, from: TransactionStatus, to: TransactionStatus) -> bool {
        matches!(
            (from, to),
            (TransactionStatus::Pending, TransactionStatus::Completed)
                | (TransactionStatus::Pending, TransactionStatus::Cancelled)
                | (TransactionStatus::Completed, TransactionStatus::Refunded)
        )
    }

    pub fn open(
        &self,
        id: TransactionId,
        lead: &Lead,
        property: &Property,
        now: DateTime<Utc>,
    ) -> Result<Transaction, TransitionError> {
        if !matches!(lead.status(), LeadStatus::Booked | LeadStatus::Closed) {
            return Err(TransitionError::LeadNotBooked(lead.status()));
        }
        if lead.property.as_ref() != Some(&property.id) {
            return Err(TransitionError::BookingWithoutProperty);
        }

        Ok(Transaction::pending(id, lead.id.clone(), property, now))
    }

    pub fn record_payment(
        &self,
        transaction: &Transaction,
        payment: &Payment,
        now: DateTime<Utc>,
    ) -> Result<Transaction, TransitionError> {
        if transaction.status() != TransactionStatus::Pending {
            return Err(TransitionError::TransactionClosed(transaction.status()));
        }
        if !payment.currency.eq_ignore_ascii_case(&transaction.currency) {
            return Err(TransitionError::CurrencyMismatch {
                expected: transaction.currency.clone(),
                found: payment.currency.clone(),
            });
        }
        if payment.amount > transaction.amount {
            return Err(TransitionError::PaymentExceedsAmount {
                amount: transaction.amount,
                paid: payment.amount,
            });
        }

        let mut next = transaction.clone();
        next.attach_payment(payment.id.clone());
        next.updated_at = now;
        Ok(next)
    }

    /// `None` when the customer already confirmed; repeat calls change nothing.
    pub fn confirm_by_customer(
        &self,
        transaction: &Transaction,
        now: DateTime<Utc>,
    ) -> Result<Option<Transaction>, TransitionError> {
        if transaction.status().is_terminal() {
            return Err(TransitionError::TransactionClosed(transaction.status()));
        }
        if transaction.customer_confirmed() {
            return Ok(None);
        }

        let mut next = transaction.clone();
        next.mark_customer_confirmed(now);
        next.updated_at = now;
        Ok(Some(next))
    }

    /// Completion is the administrative half of dual confirmation: it needs a completed
    /// payment and the customer's confirmation already on record.
    pub fn transition(
        &self,
        transaction: &Transaction,
        to: TransactionStatus,
        payment: Option<&Payment>,
        now: DateTime<Utc>,
    ) -> Result<Transaction, TransitionError> {
        let from = transaction.status();
        if from.is_terminal() {
            return Err(TransitionError::TransactionClosed(from));
        }
        if !self.allows(from, to) {
            return Err(TransitionError::TransactionEdge { from, to });
        }

        if to == TransactionStatus::Completed {
            let payment_status = payment.map(|payment| payment.status);
            if payment_status != Some(PaymentStatus::Completed)
                || !transaction.customer_confirmed()
            {
                return Err(TransitionError::CompletionRequirements {
                    payment: payment_status,
                    customer_confirmed: transaction.customer_confirmed(),
                });
            }
        }

        let mut next = transaction.clone();
        next.set_status(to);
        next.updated_at = now;
        Ok(next)
    }

    /// Keeps only documents for the transaction's own property, whichever entity owns them.
    pub fn documents_for<I>(&self, transaction: &Transaction, documents: I) -> Vec<Document>
    where
        I: IntoIterator<Item = Document>,
    {
        documents
            .into_iter()
            .filter(|document| document.property.as_ref() == Some(&transaction.property))
            .collect()
    }
}
