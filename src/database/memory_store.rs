use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::database::{
    apply_success, check_issuable, decide_transition, AuditLog, IssueCheck, TicketStore,
    TransactionLedger, DEFAULT_LIST_LIMIT,
};
use crate::errors::{AppError, Result};
use crate::models::audit::AuditEntry;
use crate::models::event::Event;
use crate::models::payment_transaction::{
    LedgerQuery, LedgerStats, PaymentTransaction, TransitionOutcome, TransitionRequest,
};
use crate::models::ticket::{Confirmation, Issuance, Ticket};

#[derive(Default)]
struct Inner {
    transactions: HashMap<String, PaymentTransaction>,
    events: HashMap<String, Event>,
    // keyed by checkout reference
    tickets: HashMap<String, Ticket>,
    audit: Vec<AuditEntry>,
}

/// Process-local store. Every operation holds one lock, which makes the
/// issuance unit trivially atomic. Nothing survives a restart.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn upsert_event(&self, event: Event) {
        let mut inner = self.inner.lock().await;
        inner.events.insert(event.event_id.clone(), event);
    }

    pub async fn ticket_count(&self) -> usize {
        self.inner.lock().await.tickets.len()
    }
}

#[async_trait]
impl TransactionLedger for MemoryStore {
    async fn create(&self, tx: PaymentTransaction) -> Result<PaymentTransaction> {
        let mut inner = self.inner.lock().await;
        if inner.transactions.contains_key(&tx.checkout_reference) {
            return Err(AppError::DuplicateReference(tx.checkout_reference));
        }
        inner
            .transactions
            .insert(tx.checkout_reference.clone(), tx.clone());
        Ok(tx)
    }

    async fn find(&self, checkout_reference: &str) -> Result<Option<PaymentTransaction>> {
        Ok(self
            .inner
            .lock()
            .await
            .transactions
            .get(checkout_reference)
            .cloned())
    }

    async fn transition(
        &self,
        checkout_reference: &str,
        request: TransitionRequest,
        now: DateTime<Utc>,
    ) -> Result<TransitionOutcome> {
        let mut inner = self.inner.lock().await;
        let tx = inner
            .transactions
            .get_mut(checkout_reference)
            .ok_or_else(|| AppError::not_found(format!("transaction {}", checkout_reference)))?;

        if !decide_transition(tx, request.state)? {
            return Ok(TransitionOutcome::Unchanged(tx.clone()));
        }

        tx.state = request.state;
        if request.result_code.is_some() {
            tx.gateway_result_code = request.result_code;
        }
        if request.result_description.is_some() {
            tx.gateway_result_description = request.result_description;
        }
        tx.last_updated_at = now;
        Ok(TransitionOutcome::Applied(tx.clone()))
    }

    async fn open_expiring_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<PaymentTransaction>> {
        let inner = self.inner.lock().await;
        let mut open: Vec<PaymentTransaction> = inner
            .transactions
            .values()
            .filter(|tx| !tx.is_terminal() && tx.expires_at <= cutoff)
            .cloned()
            .collect();
        open.sort_by(|a, b| a.expires_at.cmp(&b.expires_at));
        open.truncate(limit.max(0) as usize);
        Ok(open)
    }

    async fn list(&self, query: &LedgerQuery) -> Result<Vec<PaymentTransaction>> {
        let inner = self.inner.lock().await;
        let mut matching: Vec<PaymentTransaction> = inner
            .transactions
            .values()
            .filter(|tx| query.buyer_id.as_ref().map_or(true, |b| &tx.buyer_id == b))
            .filter(|tx| query.event_id.as_ref().map_or(true, |e| &tx.event_id == e))
            .filter(|tx| query.state.map_or(true, |s| tx.state == s))
            .cloned()
            .collect();

        // Sort by created_at descending
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        matching.truncate(query.limit.unwrap_or(DEFAULT_LIST_LIMIT).max(0) as usize);
        Ok(matching)
    }

    async fn stats(&self) -> Result<LedgerStats> {
        let inner = self.inner.lock().await;
        let mut stats = LedgerStats::default();
        for tx in inner.transactions.values() {
            stats.record(tx.state, 1);
        }
        Ok(stats)
    }
}

#[async_trait]
impl TicketStore for MemoryStore {
    async fn event(&self, event_id: &str) -> Result<Event> {
        self.inner
            .lock()
            .await
            .events
            .get(event_id)
            .cloned()
            .ok_or_else(|| AppError::not_found(format!("event {}", event_id)))
    }

    async fn issue_ticket(
        &self,
        checkout_reference: &str,
        confirmation: &Confirmation,
        now: DateTime<Utc>,
    ) -> Result<Issuance> {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;

        let tx = inner
            .transactions
            .get_mut(checkout_reference)
            .ok_or_else(|| AppError::not_found(format!("transaction {}", checkout_reference)))?;

        if let IssueCheck::AlreadyIssued(ticket_id) = check_issuable(tx)? {
            let ticket = inner.tickets.get(checkout_reference).cloned().ok_or_else(|| {
                AppError::service(format!("ticket {} linked but missing", ticket_id))
            })?;
            return Ok(Issuance::AlreadyIssued(ticket));
        }

        let event = inner
            .events
            .get_mut(&tx.event_id)
            .ok_or_else(|| AppError::not_found(format!("event {}", tx.event_id)))?;
        if !event.has_capacity_for(tx.quantity) {
            return Err(AppError::SoldOut(format!(
                "event {} has {} tickets left, {} requested",
                event.event_id, event.remaining_tickets, tx.quantity
            )));
        }

        event.remaining_tickets -= i64::from(tx.quantity);
        let ticket = Ticket::for_transaction(tx, Uuid::new_v4().to_string(), now);
        apply_success(tx, &ticket.ticket_id, confirmation, now);
        inner
            .tickets
            .insert(checkout_reference.to_string(), ticket.clone());

        Ok(Issuance::Issued(ticket))
    }

    async fn ticket_for(&self, checkout_reference: &str) -> Result<Option<Ticket>> {
        Ok(self
            .inner
            .lock()
            .await
            .tickets
            .get(checkout_reference)
            .cloned())
    }

    async fn tickets_for_buyer(&self, buyer_id: &str) -> Result<Vec<Ticket>> {
        let inner = self.inner.lock().await;
        let mut tickets: Vec<Ticket> = inner
            .tickets
            .values()
            .filter(|t| t.buyer_id == buyer_id)
            .cloned()
            .collect();
        tickets.sort_by(|a, b| b.issued_at.cmp(&a.issued_at));
        Ok(tickets)
    }
}

#[async_trait]
impl AuditLog for MemoryStore {
    async fn append(&self, entry: AuditEntry) -> Result<()> {
        self.inner.lock().await.audit.push(entry);
        Ok(())
    }

    async fn first_completion(&self, checkout_reference: &str) -> Result<Option<AuditEntry>> {
        Ok(self
            .inner
            .lock()
            .await
            .audit
            .iter()
            .find(|e| e.checkout_reference == checkout_reference && e.is_completion())
            .cloned())
    }

    async fn entries_for(&self, checkout_reference: &str) -> Result<Vec<AuditEntry>> {
        Ok(self
            .inner
            .lock()
            .await
            .audit
            .iter()
            .filter(|e| e.checkout_reference == checkout_reference)
            .cloned()
            .collect())
    }
}
