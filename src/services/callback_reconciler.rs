use std::sync::Arc;

use tracing::{error, info, warn};

use crate::database::{AuditLog, TransactionLedger};
use crate::errors::{AppError, Result};
use crate::models::audit::{AuditEntry, AuditKind};
use crate::models::mpesa_callback::{GatewayOutcome, PaymentCallback};
use crate::models::payment_transaction::{
    PaymentState, PaymentTransaction, TransitionOutcome, TransitionRequest,
};
use crate::models::ticket::Confirmation;
use crate::services::clock::Clock;
use crate::services::ticket_issuer::TicketIssuer;

/// Where a gateway result came from. Only used for logs and audit detail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultSource {
    Callback,
    GatewayQuery,
    AuditLog,
}

impl ResultSource {
    fn as_str(self) -> &'static str {
        match self {
            ResultSource::Callback => "callback",
            ResultSource::GatewayQuery => "gateway query",
            ResultSource::AuditLog => "audit log",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    /// This call moved the transaction to a terminal state.
    Applied,
    /// The transaction already held the state this result implies.
    Replayed,
    /// The result disagrees with the stored terminal state and was rejected.
    Conflict,
}

#[derive(Debug, Clone)]
pub struct Reconciled {
    pub transaction: PaymentTransaction,
    pub effect: Effect,
}

fn sold_out_description(raw: &str) -> String {
    format!(
        "SoldOut: payment received but inventory exhausted; manual refund required ({})",
        raw
    )
}

fn implied_state(outcome: GatewayOutcome) -> PaymentState {
    match outcome {
        GatewayOutcome::Succeeded => PaymentState::Succeeded,
        GatewayOutcome::Cancelled => PaymentState::Cancelled,
        GatewayOutcome::Failed => PaymentState::Failed,
    }
}

/// Applies provider results to the ledger and issues the ticket on success.
pub struct CallbackReconciler {
    ledger: Arc<dyn TransactionLedger>,
    issuer: Arc<TicketIssuer>,
    audit: Arc<dyn AuditLog>,
    clock: Arc<dyn Clock>,
}

impl CallbackReconciler {
    pub fn new(
        ledger: Arc<dyn TransactionLedger>,
        issuer: Arc<TicketIssuer>,
        audit: Arc<dyn AuditLog>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        CallbackReconciler {
            ledger,
            issuer,
            audit,
            clock,
        }
    }

    /// Entry point for provider callbacks. Unknown references are dropped
    /// with `Ok(None)`; they are routine for foreign or test transactions.
    pub async fn handle(&self, callback: PaymentCallback) -> Result<Option<Reconciled>> {
        // Record first: this is what the poller falls back on if we die below.
        let received = AuditEntry::new(
            &callback.checkout_reference,
            AuditKind::CallbackReceived,
            self.clock.now(),
        )
        .with_result(callback.result_code, &callback.result_description)
        .with_receipt(callback.provider_receipt_id.clone());
        self.record(received).await;

        let tx = match self.ledger.find(&callback.checkout_reference).await? {
            Some(tx) => tx,
            None => {
                warn!(
                    "Dropping callback for unknown checkout {} (code {})",
                    callback.checkout_reference, callback.result_code
                );
                return Ok(None);
            }
        };

        self.apply(&tx, &callback, ResultSource::Callback).await.map(Some)
    }

    /// Shared path for callbacks and poller-driven reconciliation.
    pub async fn apply(
        &self,
        tx: &PaymentTransaction,
        result: &PaymentCallback,
        source: ResultSource,
    ) -> Result<Reconciled> {
        let outcome = result.outcome();
        info!(
            "Applying {:?} ({} - {}) from {} to {} [{}]",
            outcome,
            result.result_code,
            result.result_description,
            source.as_str(),
            tx.checkout_reference,
            tx.state
        );

        let reconciled = match outcome {
            GatewayOutcome::Succeeded => self.settle_success(tx, result).await,
            GatewayOutcome::Cancelled | GatewayOutcome::Failed => {
                let request = TransitionRequest::new(implied_state(outcome))
                    .with_result(result.result_code, &result.result_description);
                self.settle(tx, request).await
            }
        };

        match reconciled {
            Ok(reconciled) => {
                if reconciled.effect == Effect::Conflict && outcome == GatewayOutcome::Succeeded {
                    error!(
                        "💸 Payment {} succeeded at the gateway but transaction is {}; \
                         manual refund required",
                        tx.checkout_reference, reconciled.transaction.state
                    );
                }
                Ok(reconciled)
            }
            Err(e) => self.fail_unexpectedly(tx, result, e).await,
        }
    }

    async fn settle_success(
        &self,
        tx: &PaymentTransaction,
        result: &PaymentCallback,
    ) -> Result<Reconciled> {
        let confirmation = Confirmation {
            result_code: result.result_code,
            result_description: result.result_description.clone(),
            provider_receipt_id: result.provider_receipt_id.clone(),
        };

        match self.issuer.issue(tx, &confirmation).await {
            Ok(issuance) => {
                let transaction = self.ledger.get(&tx.checkout_reference).await?;
                if !issuance.was_fresh() {
                    return Ok(Reconciled {
                        transaction,
                        effect: Effect::Replayed,
                    });
                }

                let entry = AuditEntry::new(
                    &tx.checkout_reference,
                    AuditKind::StateChanged,
                    self.clock.now(),
                )
                .with_result(result.result_code, &result.result_description)
                .with_receipt(result.provider_receipt_id.clone())
                .with_detail(format!("SUCCEEDED, ticket {}", issuance.ticket().ticket_id));
                self.record(entry).await;
                Ok(Reconciled {
                    transaction,
                    effect: Effect::Applied,
                })
            }
            Err(AppError::SoldOut(reason)) => {
                error!(
                    "🚨 {} paid but event sold out ({}); marking FAILED, manual refund required",
                    tx.checkout_reference, reason
                );
                let entry =
                    AuditEntry::new(&tx.checkout_reference, AuditKind::Anomaly, self.clock.now())
                        .with_result(result.result_code, &result.result_description)
                        .with_receipt(result.provider_receipt_id.clone())
                        .with_detail(format!("SoldOut after successful payment: {}", reason));
                self.record(entry).await;

                let request = TransitionRequest::new(PaymentState::Failed).with_result(
                    result.result_code,
                    sold_out_description(&result.result_description),
                );
                self.settle(tx, request).await
            }
            Err(AppError::InvalidTransition { from, .. }) => {
                self.rejected(tx, PaymentState::Succeeded, from, Some(result.result_code))
                    .await
            }
            Err(e) => Err(e),
        }
    }

    async fn settle(
        &self,
        tx: &PaymentTransaction,
        request: TransitionRequest,
    ) -> Result<Reconciled> {
        let target = request.state;
        let result_code = request.result_code;
        match self
            .ledger
            .transition(&tx.checkout_reference, request, self.clock.now())
            .await
        {
            Ok(TransitionOutcome::Applied(transaction)) => {
                info!("{} -> {}", transaction.checkout_reference, transaction.state);
                let mut entry = AuditEntry::new(
                    &transaction.checkout_reference,
                    AuditKind::StateChanged,
                    self.clock.now(),
                )
                .with_detail(transaction.state.as_str());
                if let (Some(code), Some(desc)) = (
                    transaction.gateway_result_code,
                    transaction.gateway_result_description.as_deref(),
                ) {
                    entry = entry.with_result(code, desc);
                }
                self.record(entry).await;
                Ok(Reconciled {
                    transaction,
                    effect: Effect::Applied,
                })
            }
            Ok(TransitionOutcome::Unchanged(transaction)) => Ok(Reconciled {
                transaction,
                effect: Effect::Replayed,
            }),
            Err(AppError::InvalidTransition { from, .. }) => {
                self.rejected(tx, target, from, result_code).await
            }
            Err(e) => Err(e),
        }
    }

    /// A terminal transaction refused the result. Provider retries of the
    /// result already stored are replays; anything else is a conflict.
    async fn rejected(
        &self,
        tx: &PaymentTransaction,
        attempted: PaymentState,
        stored: PaymentState,
        result_code: Option<i32>,
    ) -> Result<Reconciled> {
        let transaction = self.ledger.get(&tx.checkout_reference).await?;
        if result_code.is_some() && transaction.gateway_result_code == result_code {
            info!(
                "Result {:?} for {} already recorded as {}",
                result_code, tx.checkout_reference, transaction.state
            );
            return Ok(Reconciled {
                transaction,
                effect: Effect::Replayed,
            });
        }

        warn!(
            "⚠️ Conflicting result for {}: stored {}, attempted {}",
            tx.checkout_reference, stored, attempted
        );
        let entry = AuditEntry::new(&tx.checkout_reference, AuditKind::Anomaly, self.clock.now())
            .with_detail(format!("rejected {} -> {}", stored, attempted));
        self.record(entry).await;

        Ok(Reconciled {
            transaction,
            effect: Effect::Conflict,
        })
    }

    /// Anything unexpected turns into a FAILED transaction carrying the raw error.
    async fn fail_unexpectedly(
        &self,
        tx: &PaymentTransaction,
        result: &PaymentCallback,
        cause: AppError,
    ) -> Result<Reconciled> {
        error!(
            "❌ Reconciling {} failed: {}; marking FAILED for manual reconciliation",
            tx.checkout_reference, cause
        );
        let entry = AuditEntry::new(&tx.checkout_reference, AuditKind::Anomaly, self.clock.now())
            .with_result(result.result_code, &result.result_description)
            .with_detail(format!("processing error: {}", cause));
        self.record(entry).await;

        let request = TransitionRequest::new(PaymentState::Failed)
            .with_result(result.result_code, format!("processing error: {}", cause));
        match self
            .ledger
            .transition(&tx.checkout_reference, request, self.clock.now())
            .await
        {
            Ok(outcome) => {
                let effect = match outcome {
                    TransitionOutcome::Applied(_) => Effect::Applied,
                    TransitionOutcome::Unchanged(_) => Effect::Replayed,
                };
                Ok(Reconciled {
                    transaction: outcome.into_transaction(),
                    effect,
                })
            }
            Err(AppError::InvalidTransition { .. }) => {
                let transaction = self.ledger.get(&tx.checkout_reference).await?;
                Ok(Reconciled {
                    transaction,
                    effect: Effect::Conflict,
                })
            }
            Err(e) => Err(e),
        }
    }

    async fn record(&self, entry: AuditEntry) {
        let reference = entry.checkout_reference.clone();
        if let Err(e) = self.audit.append(entry).await {
            warn!("Failed to append audit entry for {}: {}", reference, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sold_out_reason_is_distinguishable() {
        let description = sold_out_description("The service request is processed successfully.");
        assert!(description.starts_with("SoldOut"));
        assert!(description.contains("manual refund"));
    }

    #[test]
    fn outcomes_imply_terminal_states() {
        assert_eq!(implied_state(GatewayOutcome::Succeeded), PaymentState::Succeeded);
        assert_eq!(implied_state(GatewayOutcome::Cancelled), PaymentState::Cancelled);
        assert_eq!(implied_state(GatewayOutcome::Failed), PaymentState::Failed);
        assert_eq!(PaymentState::ALL.iter().filter(|s| s.is_terminal()).count(), 4);
    }
}
