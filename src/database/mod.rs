//! Persistence seams for the payment core.
//!
//! The ledger, the ticket/inventory store and the audit log are traits so the
//! same orchestration code runs over MongoDB in production and over
//! [`memory_store::MemoryStore`] in tests and local development.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::errors::{AppError, Result};
use crate::models::audit::AuditEntry;
use crate::models::event::Event;
use crate::models::payment_transaction::{
    LedgerQuery, LedgerStats, PaymentState, PaymentTransaction, TransitionCheck,
    TransitionOutcome, TransitionRequest,
};
use crate::models::ticket::{Confirmation, Issuance, Ticket};

pub mod connection;
pub mod memory_store;
pub mod mongo_store;

pub const DEFAULT_LIST_LIMIT: i64 = 100;

/// Durable record of every charge attempt, keyed by checkout reference.
#[async_trait]
pub trait TransactionLedger: Send + Sync {
    /// Fails with `DuplicateReference` when the checkout reference is already recorded.
    async fn create(&self, tx: PaymentTransaction) -> Result<PaymentTransaction>;

    async fn find(&self, checkout_reference: &str) -> Result<Option<PaymentTransaction>>;

    async fn get(&self, checkout_reference: &str) -> Result<PaymentTransaction> {
        self.find(checkout_reference)
            .await?
            .ok_or_else(|| AppError::not_found(format!("transaction {}", checkout_reference)))
    }

    /// Compare-and-set state change. Only one concurrent caller gets `Applied`;
    /// the rest observe the stored state through `Unchanged` or `InvalidTransition`.
    async fn transition(
        &self,
        checkout_reference: &str,
        request: TransitionRequest,
        now: DateTime<Utc>,
    ) -> Result<TransitionOutcome>;

    /// Non-terminal transactions whose TTL ran out at or before `cutoff`.
    async fn open_expiring_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<PaymentTransaction>>;

    async fn list(&self, query: &LedgerQuery) -> Result<Vec<PaymentTransaction>>;

    async fn stats(&self) -> Result<LedgerStats>;
}

/// Event inventory plus the tickets issued against it.
#[async_trait]
pub trait TicketStore: Send + Sync {
    async fn event(&self, event_id: &str) -> Result<Event>;

    /// Decrements inventory, creates the ticket and marks the transaction
    /// `SUCCEEDED` with the ticket linked, all or nothing.
    async fn issue_ticket(
        &self,
        checkout_reference: &str,
        confirmation: &Confirmation,
        now: DateTime<Utc>,
    ) -> Result<Issuance>;

    async fn ticket_for(&self, checkout_reference: &str) -> Result<Option<Ticket>>;

    async fn tickets_for_buyer(&self, buyer_id: &str) -> Result<Vec<Ticket>>;
}

#[async_trait]
pub trait AuditLog: Send + Sync {
    async fn append(&self, entry: AuditEntry) -> Result<()>;

    /// Earliest callback record carrying a result for this reference.
    async fn first_completion(&self, checkout_reference: &str) -> Result<Option<AuditEntry>>;

    async fn entries_for(&self, checkout_reference: &str) -> Result<Vec<AuditEntry>>;
}

/// Decide what a transition request means against the stored transaction.
/// `Ok(true)` means apply, `Ok(false)` means already there.
pub(crate) fn decide_transition(
    current: &PaymentTransaction,
    target: PaymentState,
) -> Result<bool> {
    match current.state.check_transition(target) {
        TransitionCheck::Allowed => Ok(true),
        TransitionCheck::AlreadyThere => Ok(false),
        TransitionCheck::Rejected => Err(AppError::InvalidTransition {
            checkout_reference: current.checkout_reference.clone(),
            from: current.state,
            to: target,
        }),
    }
}

/// Guard run inside the issuance unit before any write.
pub(crate) enum IssueCheck {
    AlreadyIssued(String),
    Proceed,
}

pub(crate) fn check_issuable(tx: &PaymentTransaction) -> Result<IssueCheck> {
    if let Some(ticket_id) = &tx.ticket_id {
        return Ok(IssueCheck::AlreadyIssued(ticket_id.clone()));
    }
    if tx.is_terminal() {
        return Err(AppError::InvalidTransition {
            checkout_reference: tx.checkout_reference.clone(),
            from: tx.state,
            to: PaymentState::Succeeded,
        });
    }
    Ok(IssueCheck::Proceed)
}

pub(crate) fn apply_success(
    tx: &mut PaymentTransaction,
    ticket_id: &str,
    confirmation: &Confirmation,
    now: DateTime<Utc>,
) {
    tx.state = PaymentState::Succeeded;
    tx.ticket_id = Some(ticket_id.to_string());
    tx.gateway_result_code = Some(confirmation.result_code);
    tx.gateway_result_description = Some(confirmation.result_description.clone());
    if confirmation.provider_receipt_id.is_some() {
        tx.provider_receipt_id = confirmation.provider_receipt_id.clone();
    }
    tx.last_updated_at = now;
}
