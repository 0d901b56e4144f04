use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::TryStreamExt;
use mongodb::{
    bson::{doc, Document},
    error::{ErrorKind, WriteFailure, TRANSIENT_TRANSACTION_ERROR},
    options::{IndexOptions, ReturnDocument},
    Client, ClientSession, Collection, Database, IndexModel,
};
use tracing::{info, warn};
use uuid::Uuid;

use crate::database::{
    apply_success, check_issuable, decide_transition, AuditLog, IssueCheck, TicketStore,
    TransactionLedger, DEFAULT_LIST_LIMIT,
};
use crate::errors::{AppError, Result};
use crate::models::audit::{AuditEntry, AuditKind};
use crate::models::event::Event;
use crate::models::payment_transaction::{
    LedgerQuery, LedgerStats, PaymentState, PaymentTransaction, TransitionOutcome,
    TransitionRequest,
};
use crate::models::ticket::{Confirmation, Issuance, Ticket};

const TRANSACTIONS: &str = "payment_transactions";
const TICKETS: &str = "tickets";
const EVENTS: &str = "events";
const AUDIT_LOG: &str = "payment_audit_log";

const DUPLICATE_KEY: i32 = 11000;
const OPEN_STATES: &[PaymentState] = &[PaymentState::Initiated, PaymentState::PendingConfirmation];
const MAX_ATTEMPTS: usize = 3;

fn is_duplicate_key(err: &mongodb::error::Error) -> bool {
    matches!(
        err.kind.as_ref(),
        ErrorKind::Write(WriteFailure::WriteError(write_error)) if write_error.code == DUPLICATE_KEY
    )
}

fn is_transient(err: &AppError) -> bool {
    match err {
        AppError::MongoDB(e) => {
            e.contains_label(TRANSIENT_TRANSACTION_ERROR) || is_duplicate_key(e)
        }
        _ => false,
    }
}

fn state_names(states: &[PaymentState]) -> Vec<&'static str> {
    states.iter().map(|s| s.as_str()).collect()
}

/// Matches the transaction only while it is in one of `sources`.
fn transition_filter(checkout_reference: &str, sources: &[&'static str]) -> Document {
    doc! {
        "checkout_reference": checkout_reference,
        "state": { "$in": sources.to_vec() },
    }
}

fn transition_update(request: &TransitionRequest, now: DateTime<Utc>) -> Document {
    let mut set = doc! {
        "state": request.state.as_str(),
        "last_updated_at": now,
    };
    if let Some(code) = request.result_code {
        set.insert("gateway_result_code", code);
    }
    if let Some(description) = &request.result_description {
        set.insert("gateway_result_description", description.as_str());
    }
    doc! { "$set": set }
}

/// MongoDB-backed ledger, inventory and audit log.
///
/// Issuance runs inside a multi-document transaction, so the deployment must
/// be a replica set (a single-node replica set is enough).
#[derive(Clone)]
pub struct MongoStore {
    client: Client,
    db: Database,
}

impl MongoStore {
    pub fn new(client: Client, db: Database) -> Self {
        MongoStore { client, db }
    }

    fn transactions(&self) -> Collection<PaymentTransaction> {
        self.db.collection(TRANSACTIONS)
    }

    fn tickets(&self) -> Collection<Ticket> {
        self.db.collection(TICKETS)
    }

    fn events(&self) -> Collection<Event> {
        self.db.collection(EVENTS)
    }

    fn audit(&self) -> Collection<AuditEntry> {
        self.db.collection(AUDIT_LOG)
    }

    pub async fn ensure_indexes(&self) -> Result<()> {
        let unique = || IndexOptions::builder().unique(true).build();

        self.transactions()
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "checkout_reference": 1 })
                    .options(unique())
                    .build(),
            )
            .await?;
        self.transactions()
            .create_index(IndexModel::builder().keys(doc! { "state": 1, "expires_at": 1 }).build())
            .await?;
        self.tickets()
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "checkout_reference": 1 })
                    .options(unique())
                    .build(),
            )
            .await?;
        self.tickets()
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "ticket_id": 1 })
                    .options(unique())
                    .build(),
            )
            .await?;
        self.events()
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "event_id": 1 })
                    .options(unique())
                    .build(),
            )
            .await?;
        self.audit()
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "checkout_reference": 1, "recorded_at": 1 })
                    .build(),
            )
            .await?;

        info!("Payment indexes ensured");
        Ok(())
    }

    async fn issue_in_session(
        &self,
        session: &mut ClientSession,
        checkout_reference: &str,
        confirmation: &Confirmation,
        now: DateTime<Utc>,
    ) -> Result<Issuance> {
        let mut tx = self
            .transactions()
            .find_one(doc! { "checkout_reference": checkout_reference })
            .session(&mut *session)
            .await?
            .ok_or_else(|| AppError::not_found(format!("transaction {}", checkout_reference)))?;

        if let IssueCheck::AlreadyIssued(ticket_id) = check_issuable(&tx)? {
            let ticket = self
                .tickets()
                .find_one(doc! { "ticket_id": &ticket_id })
                .session(&mut *session)
                .await?
                .ok_or_else(|| {
                    AppError::service(format!("ticket {} linked but missing", ticket_id))
                })?;
            return Ok(Issuance::AlreadyIssued(ticket));
        }

        let quantity = i64::from(tx.quantity);
        let decremented = self
            .events()
            .find_one_and_update(
                doc! { "event_id": &tx.event_id, "remaining_tickets": { "$gte": quantity } },
                doc! { "$inc": { "remaining_tickets": -quantity } },
            )
            .session(&mut *session)
            .await?;

        if decremented.is_none() {
            let event = self
                .events()
                .find_one(doc! { "event_id": &tx.event_id })
                .session(&mut *session)
                .await?
                .ok_or_else(|| AppError::not_found(format!("event {}", tx.event_id)))?;
            return Err(AppError::SoldOut(format!(
                "event {} has {} tickets left, {} requested",
                event.event_id, event.remaining_tickets, tx.quantity
            )));
        }

        let ticket = Ticket::for_transaction(&tx, Uuid::new_v4().to_string(), now);
        self.tickets()
            .insert_one(&ticket)
            .session(&mut *session)
            .await?;

        apply_success(&mut tx, &ticket.ticket_id, confirmation, now);
        let linked = self
            .transactions()
            .update_one(
                doc! {
                    "checkout_reference": checkout_reference,
                    "ticket_id": null,
                    "state": { "$in": state_names(OPEN_STATES) },
                },
                doc! {
                    "$set": {
                        "state": PaymentState::Succeeded.as_str(),
                        "ticket_id": &ticket.ticket_id,
                        "gateway_result_code": confirmation.result_code,
                        "gateway_result_description": &confirmation.result_description,
                        "provider_receipt_id": tx.provider_receipt_id.clone(),
                        "last_updated_at": now,
                    }
                },
            )
            .session(&mut *session)
            .await?;

        if linked.matched_count != 1 {
            // Someone moved the transaction between our read and write.
            return Err(AppError::service(format!(
                "transaction {} changed during issuance",
                checkout_reference
            )));
        }

        Ok(Issuance::Issued(ticket))
    }
}

#[async_trait]
impl TransactionLedger for MongoStore {
    async fn create(&self, tx: PaymentTransaction) -> Result<PaymentTransaction> {
        match self.transactions().insert_one(&tx).await {
            Ok(_) => Ok(tx),
            Err(e) if is_duplicate_key(&e) => {
                Err(AppError::DuplicateReference(tx.checkout_reference))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn find(&self, checkout_reference: &str) -> Result<Option<PaymentTransaction>> {
        Ok(self
            .transactions()
            .find_one(doc! { "checkout_reference": checkout_reference })
            .await?)
    }

    async fn transition(
        &self,
        checkout_reference: &str,
        request: TransitionRequest,
        now: DateTime<Utc>,
    ) -> Result<TransitionOutcome> {
        let sources = state_names(PaymentState::sources_for(request.state));
        let update = transition_update(&request, now);

        for _ in 0..MAX_ATTEMPTS {
            if !sources.is_empty() {
                let updated = self
                    .transactions()
                    .find_one_and_update(
                        transition_filter(checkout_reference, &sources),
                        update.clone(),
                    )
                    .return_document(ReturnDocument::After)
                    .await?;

                if let Some(tx) = updated {
                    return Ok(TransitionOutcome::Applied(tx));
                }
            }

            let current = self.get(checkout_reference).await?;
            if !decide_transition(&current, request.state)? {
                return Ok(TransitionOutcome::Unchanged(current));
            }
            // Allowed but the CAS missed: the state moved underneath us, try again.
        }

        Err(AppError::service(format!(
            "transaction {} kept changing during transition",
            checkout_reference
        )))
    }

    async fn open_expiring_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<PaymentTransaction>> {
        let filter = doc! {
            "state": { "$in": state_names(OPEN_STATES) },
            "expires_at": { "$lte": cutoff },
        };
        let cursor = self
            .transactions()
            .find(filter)
            .sort(doc! { "expires_at": 1 })
            .limit(limit)
            .await?;
        Ok(cursor.try_collect().await?)
    }

    async fn list(&self, query: &LedgerQuery) -> Result<Vec<PaymentTransaction>> {
        let mut filter = Document::new();
        if let Some(buyer_id) = &query.buyer_id {
            filter.insert("buyer_id", buyer_id);
        }
        if let Some(event_id) = &query.event_id {
            filter.insert("event_id", event_id);
        }
        if let Some(state) = query.state {
            filter.insert("state", state.as_str());
        }

        let cursor = self
            .transactions()
            .find(filter)
            .sort(doc! { "created_at": -1 }) // Newest first
            .limit(query.limit.unwrap_or(DEFAULT_LIST_LIMIT))
            .await?;
        Ok(cursor.try_collect().await?)
    }

    async fn stats(&self) -> Result<LedgerStats> {
        let mut stats = LedgerStats::default();
        for state in PaymentState::ALL {
            let count = self
                .transactions()
                .count_documents(doc! { "state": state.as_str() })
                .await?;
            stats.record(state, count);
        }
        Ok(stats)
    }
}

#[async_trait]
impl TicketStore for MongoStore {
    async fn event(&self, event_id: &str) -> Result<Event> {
        self.events()
            .find_one(doc! { "event_id": event_id })
            .await?
            .ok_or_else(|| AppError::not_found(format!("event {}", event_id)))
    }

    async fn issue_ticket(
        &self,
        checkout_reference: &str,
        confirmation: &Confirmation,
        now: DateTime<Utc>,
    ) -> Result<Issuance> {
        let mut last_error = None;

        for attempt in 1..=MAX_ATTEMPTS {
            let mut session = self.client.start_session().await?;
            session.start_transaction().await?;

            match self
                .issue_in_session(&mut session, checkout_reference, confirmation, now)
                .await
            {
                Ok(issuance) => {
                    session.commit_transaction().await?;
                    return Ok(issuance);
                }
                Err(e) => {
                    if let Err(abort_err) = session.abort_transaction().await {
                        warn!("Abort failed for {}: {}", checkout_reference, abort_err);
                    }
                    if !is_transient(&e) {
                        return Err(e);
                    }
                    warn!(
                        "Issuance for {} hit a write conflict (attempt {}): {}",
                        checkout_reference, attempt, e
                    );
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| AppError::service("issuance retries exhausted")))
    }

    async fn ticket_for(&self, checkout_reference: &str) -> Result<Option<Ticket>> {
        Ok(self
            .tickets()
            .find_one(doc! { "checkout_reference": checkout_reference })
            .await?)
    }

    async fn tickets_for_buyer(&self, buyer_id: &str) -> Result<Vec<Ticket>> {
        let cursor = self
            .tickets()
            .find(doc! { "buyer_id": buyer_id })
            .sort(doc! { "issued_at": -1 })
            .await?;
        Ok(cursor.try_collect().await?)
    }
}

#[async_trait]
impl AuditLog for MongoStore {
    async fn append(&self, entry: AuditEntry) -> Result<()> {
        self.audit().insert_one(&entry).await?;
        Ok(())
    }

    async fn first_completion(&self, checkout_reference: &str) -> Result<Option<AuditEntry>> {
        let kind = mongodb::bson::to_bson(&AuditKind::CallbackReceived)?;
        Ok(self
            .audit()
            .find_one(doc! {
                "checkout_reference": checkout_reference,
                "kind": kind,
                "result_code": { "$ne": null },
            })
            .sort(doc! { "recorded_at": 1 })
            .await?)
    }

    async fn entries_for(&self, checkout_reference: &str) -> Result<Vec<AuditEntry>> {
        let cursor = self
            .audit()
            .find(doc! { "checkout_reference": checkout_reference })
            .sort(doc! { "recorded_at": 1 })
            .await?;
        Ok(cursor.try_collect().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_failures_only_leave_open_states() {
        assert_eq!(
            state_names(PaymentState::sources_for(PaymentState::Expired)),
            vec!["INITIATED", "PENDING_CONFIRMATION"]
        );
        assert!(state_names(PaymentState::sources_for(PaymentState::Succeeded)).is_empty());
    }

    #[test]
    fn transition_filter_guards_on_current_state() {
        let sources = state_names(PaymentState::sources_for(PaymentState::Cancelled));
        let filter = transition_filter("ws_CO_123", &sources);

        assert_eq!(filter.get_str("checkout_reference").unwrap(), "ws_CO_123");
        let states = filter
            .get_document("state")
            .unwrap()
            .get_array("$in")
            .unwrap();
        assert_eq!(states.len(), 2);
        assert_eq!(states[0].as_str(), Some("INITIATED"));
        assert_eq!(states[1].as_str(), Some("PENDING_CONFIRMATION"));
    }

    #[test]
    fn transition_update_sets_result_only_when_present() {
        let now = Utc::now();

        let bare = transition_update(&TransitionRequest::new(PaymentState::Expired), now);
        let set = bare.get_document("$set").unwrap();
        assert_eq!(set.get_str("state").unwrap(), "EXPIRED");
        assert!(set.contains_key("last_updated_at"));
        assert!(!set.contains_key("gateway_result_code"));
        assert!(!set.contains_key("gateway_result_description"));

        let request = TransitionRequest::new(PaymentState::Cancelled)
            .with_result(1032, "Request cancelled by user");
        let full = transition_update(&request, now);
        let set = full.get_document("$set").unwrap();
        assert_eq!(set.get_str("state").unwrap(), "CANCELLED");
        assert_eq!(set.get_i32("gateway_result_code").unwrap(), 1032);
        assert_eq!(
            set.get_str("gateway_result_description").unwrap(),
            "Request cancelled by user"
        );
    }

    #[test]
    fn only_database_errors_are_retried() {
        assert!(!is_transient(&AppError::SoldOut("evt".to_string())));
        assert!(!is_transient(&AppError::RateLimited));
        assert!(!is_transient(&AppError::invalid_data("bad")));
    }
}
