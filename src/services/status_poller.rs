use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::database::{AuditLog, TransactionLedger};
use crate::errors::{AppError, Result};
use crate::models::audit::{AuditEntry, AuditKind};
use crate::models::mpesa_callback::PaymentCallback;
use crate::models::payment_transaction::{
    PaymentState, PaymentStatus, PaymentTransaction, TransitionOutcome, TransitionRequest,
};
use crate::services::callback_reconciler::{CallbackReconciler, ResultSource};
use crate::services::clock::Clock;
use crate::services::gateway::{GatewayQuery, PaymentGateway};

const SWEEP_BATCH: i64 = 200;
const EXPIRED_DESCRIPTION: &str = "No confirmation received before expiry";

#[derive(Debug, Clone, Copy)]
pub struct PollerSettings {
    /// Age after which a non-terminal transaction is actively reconciled.
    pub reconcile_after: Duration,
    /// Upper bound for one active reconciliation attempt.
    pub reconcile_timeout: Duration,
}

/// Bounded client polling: every `interval` until `ceiling` has passed.
#[derive(Debug, Clone, Copy)]
pub struct PollSchedule {
    pub interval: Duration,
    pub ceiling: Duration,
}

impl Default for PollSchedule {
    fn default() -> Self {
        PollSchedule {
            interval: Duration::from_secs(10),
            ceiling: Duration::from_secs(300),
        }
    }
}

pub struct StatusPoller {
    ledger: Arc<dyn TransactionLedger>,
    audit: Arc<dyn AuditLog>,
    gateway: Option<Arc<dyn PaymentGateway>>,
    reconciler: Arc<CallbackReconciler>,
    clock: Arc<dyn Clock>,
    settings: PollerSettings,
}

impl StatusPoller {
    pub fn new(
        ledger: Arc<dyn TransactionLedger>,
        audit: Arc<dyn AuditLog>,
        gateway: Option<Arc<dyn PaymentGateway>>,
        reconciler: Arc<CallbackReconciler>,
        clock: Arc<dyn Clock>,
        settings: PollerSettings,
    ) -> Self {
        StatusPoller {
            ledger,
            audit,
            gateway,
            reconciler,
            clock,
            settings,
        }
    }

    pub async fn get_status(&self, checkout_reference: &str) -> Result<PaymentStatus> {
        let tx = self.ledger.get(checkout_reference).await?;
        let tx = self.refresh(tx).await?;
        Ok(PaymentStatus::from(&tx))
    }

    /// Poll until a terminal state or until the schedule's ceiling passes, in
    /// which case the outcome is `Unclear` rather than a guess.
    pub async fn wait_for_terminal(
        &self,
        checkout_reference: &str,
        schedule: PollSchedule,
    ) -> Result<PaymentStatus> {
        let ceiling = chrono::Duration::from_std(schedule.ceiling)
            .map_err(|e| AppError::invalid_data(format!("poll ceiling out of range: {}", e)))?;
        let deadline = self.clock.now() + ceiling;

        loop {
            let status = self.get_status(checkout_reference).await?;
            if status.state.is_terminal() {
                return Ok(status);
            }
            if self.clock.now() >= deadline {
                warn!("❓ No terminal state for {} before poll ceiling", checkout_reference);
                return Err(AppError::Unclear(checkout_reference.to_string()));
            }
            tokio::time::sleep(schedule.interval).await;
        }
    }

    /// Resolve every open transaction whose TTL has run out. Returns how many
    /// reached a terminal state.
    pub async fn sweep_expired(&self) -> Result<usize> {
        let open = self
            .ledger
            .open_expiring_before(self.clock.now(), SWEEP_BATCH)
            .await?;

        let mut resolved = 0;
        for tx in open {
            let reference = tx.checkout_reference.clone();
            match self.refresh(tx).await {
                Ok(tx) if tx.is_terminal() => resolved += 1,
                Ok(_) => {}
                Err(e) => warn!("Sweep could not resolve {}: {}", reference, e),
            }
        }

        if resolved > 0 {
            info!("🧹 Sweep resolved {} expired transactions", resolved);
        }
        Ok(resolved)
    }

    async fn refresh(&self, mut tx: PaymentTransaction) -> Result<PaymentTransaction> {
        if tx.is_terminal() {
            return Ok(tx);
        }

        let reconcile_after = chrono::Duration::from_std(self.settings.reconcile_after)
            .unwrap_or_else(|_| chrono::Duration::seconds(30));
        if tx.age(self.clock.now()) >= reconcile_after {
            let attempt = self.reconcile(&tx);
            match tokio::time::timeout(self.settings.reconcile_timeout, attempt).await {
                Ok(Ok(updated)) => tx = updated,
                Ok(Err(e)) => warn!("Reconciliation of {} failed: {}", tx.checkout_reference, e),
                Err(_) => warn!("⏳ Reconciliation of {} timed out", tx.checkout_reference),
            }
            if tx.is_terminal() {
                return Ok(tx);
            }
        }

        if tx.has_expired(self.clock.now()) {
            tx = self.expire(&tx).await?;
        }

        Ok(tx)
    }

    async fn reconcile(&self, tx: &PaymentTransaction) -> Result<PaymentTransaction> {
        if let Some(entry) = self.audit.first_completion(&tx.checkout_reference).await? {
            if let Some(result_code) = entry.result_code {
                info!("Found completion record for {} in audit log", tx.checkout_reference);
                let result = PaymentCallback {
                    checkout_reference: tx.checkout_reference.clone(),
                    result_code,
                    result_description: entry.result_description.unwrap_or_default(),
                    provider_receipt_id: entry.provider_receipt_id,
                };
                return Ok(self
                    .reconciler
                    .apply(tx, &result, ResultSource::AuditLog)
                    .await?
                    .transaction);
            }
        }

        let gateway = match &self.gateway {
            Some(gateway) => gateway,
            None => return Ok(tx.clone()),
        };

        match gateway.query_status(&tx.checkout_reference).await {
            Ok(GatewayQuery::Completed {
                result_code,
                result_description,
            }) => {
                let result = PaymentCallback {
                    checkout_reference: tx.checkout_reference.clone(),
                    result_code,
                    result_description,
                    provider_receipt_id: None,
                };
                Ok(self
                    .reconciler
                    .apply(tx, &result, ResultSource::GatewayQuery)
                    .await?
                    .transaction)
            }
            Ok(GatewayQuery::Processing) => self.mark_pending(tx).await,
            Err(e) => {
                warn!(
                    "{} status query for {} failed: {}",
                    gateway.name(),
                    tx.checkout_reference,
                    e
                );
                Ok(tx.clone())
            }
        }
    }

    async fn mark_pending(&self, tx: &PaymentTransaction) -> Result<PaymentTransaction> {
        let request = TransitionRequest::new(PaymentState::PendingConfirmation)
            .with_description("Awaiting payer confirmation");
        match self
            .ledger
            .transition(&tx.checkout_reference, request, self.clock.now())
            .await
        {
            Ok(outcome) => Ok(outcome.into_transaction()),
            // Lost to a terminal write; report what won.
            Err(AppError::InvalidTransition { .. }) => {
                self.ledger.get(&tx.checkout_reference).await
            }
            Err(e) => Err(e),
        }
    }

    async fn expire(&self, tx: &PaymentTransaction) -> Result<PaymentTransaction> {
        let request =
            TransitionRequest::new(PaymentState::Expired).with_description(EXPIRED_DESCRIPTION);
        match self
            .ledger
            .transition(&tx.checkout_reference, request, self.clock.now())
            .await
        {
            Ok(TransitionOutcome::Applied(expired)) => {
                info!("⌛ {} expired without confirmation", expired.checkout_reference);
                let entry = AuditEntry::new(
                    &expired.checkout_reference,
                    AuditKind::StateChanged,
                    self.clock.now(),
                )
                .with_detail(PaymentState::Expired.as_str());
                if let Err(e) = self.audit.append(entry).await {
                    warn!(
                        "Failed to append audit entry for {}: {}",
                        expired.checkout_reference, e
                    );
                }
                Ok(expired)
            }
            Ok(TransitionOutcome::Unchanged(current)) => Ok(current),
            Err(AppError::InvalidTransition { .. }) => {
                self.ledger.get(&tx.checkout_reference).await
            }
            Err(e) => Err(e),
        }
    }
}
