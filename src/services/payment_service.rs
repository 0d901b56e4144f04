use std::sync::Arc;

use tracing::{error, info, warn};
use validator::Validate;

use crate::config::PaymentSettings;
use crate::database::{AuditLog, TicketStore, TransactionLedger};
use crate::dtos::payment_dtos::{InitiatePaymentRequest, InitiatePaymentResponse};
use crate::errors::{AppError, Result};
use crate::models::audit::{AuditEntry, AuditKind};
use crate::models::payment_transaction::{NewTransaction, PaymentTransaction};
use crate::services::clock::Clock;
use crate::services::gateway::{ChargeRequest, PaymentGateway};
use crate::services::mpesa_service::normalize_phone_number;

// Daraja truncates these silently; keep them inside the limits ourselves.
const ACCOUNT_REFERENCE_MAX: usize = 12;
const DESCRIPTION_MAX: usize = 13;

fn clip(value: &str, max: usize) -> String {
    value.chars().take(max).collect()
}

/// Starts a charge for a buyer and records it in the ledger.
pub struct PaymentService {
    ledger: Arc<dyn TransactionLedger>,
    tickets: Arc<dyn TicketStore>,
    audit: Arc<dyn AuditLog>,
    gateway: Option<Arc<dyn PaymentGateway>>,
    clock: Arc<dyn Clock>,
    settings: PaymentSettings,
    account_reference: String,
}

impl PaymentService {
    pub fn new(
        ledger: Arc<dyn TransactionLedger>,
        tickets: Arc<dyn TicketStore>,
        audit: Arc<dyn AuditLog>,
        gateway: Option<Arc<dyn PaymentGateway>>,
        clock: Arc<dyn Clock>,
        settings: PaymentSettings,
    ) -> Self {
        PaymentService {
            ledger,
            tickets,
            audit,
            gateway,
            clock,
            settings,
            account_reference: "Tickets".to_string(),
        }
    }

    pub fn with_account_reference(mut self, account_reference: impl Into<String>) -> Self {
        self.account_reference = account_reference.into();
        self
    }

    pub fn has_gateway(&self) -> bool {
        self.gateway.is_some()
    }

    pub async fn initiate(
        &self,
        buyer_id: &str,
        request: InitiatePaymentRequest,
    ) -> Result<InitiatePaymentResponse> {
        request.validate()?;
        if request.quantity > self.settings.max_tickets_per_order {
            return Err(AppError::invalid_data(format!(
                "quantity must be between 1 and {}",
                self.settings.max_tickets_per_order
            )));
        }

        let phone_number = normalize_phone_number(&request.phone_number)?;

        let event = self.tickets.event(&request.event_id).await?;
        if event.currency != self.settings.currency {
            return Err(AppError::invalid_data(format!(
                "event {} is priced in {}, payments are taken in {}",
                event.event_id, event.currency, self.settings.currency
            )));
        }
        if event.unit_price <= 0 {
            return Err(AppError::invalid_data(format!(
                "event {} has no valid price",
                event.event_id
            )));
        }
        // Advisory only; issuance re-checks under the inventory lock.
        if !event.has_capacity_for(request.quantity) {
            return Err(AppError::SoldOut(format!(
                "event {} has {} tickets left",
                event.event_id, event.remaining_tickets
            )));
        }

        let gateway = self
            .gateway
            .as_ref()
            .ok_or_else(|| AppError::gateway("payment gateway is not configured"))?;

        let ttl = chrono::Duration::from_std(self.settings.ttl)
            .map_err(|_| AppError::configuration("payment TTL out of range"))?;
        let amount = event
            .unit_price
            .checked_mul(i64::from(request.quantity))
            .ok_or_else(|| {
                AppError::invalid_data(format!(
                    "{} x {} overflows the order total",
                    request.quantity, event.unit_price
                ))
            })?;

        let charge = ChargeRequest {
            phone_number: phone_number.clone(),
            amount,
            account_reference: clip(&self.account_reference, ACCOUNT_REFERENCE_MAX),
            description: clip(&event.title, DESCRIPTION_MAX),
        };

        info!(
            "💳 Initiating {} x {} for buyer {} ({} {})",
            request.quantity, event.event_id, buyer_id, amount, self.settings.currency
        );
        let accepted = gateway.initiate_charge(charge).await.map_err(|e| {
            warn!("{} rejected charge for buyer {}: {}", gateway.name(), buyer_id, e);
            e
        })?;

        let now = self.clock.now();
        let tx = PaymentTransaction::initiated(
            NewTransaction {
                checkout_reference: accepted.checkout_reference.clone(),
                merchant_request_id: accepted.merchant_request_id.clone(),
                buyer_id: buyer_id.to_string(),
                event_id: event.event_id.clone(),
                quantity: request.quantity,
                unit_amount: event.unit_price,
                total_amount: amount,
                currency: self.settings.currency.clone(),
                phone_number,
            },
            now,
            ttl,
        );

        let tx = match self.ledger.create(tx).await {
            Ok(tx) => tx,
            Err(e) if e.is_anomaly() => {
                error!("🚨 Gateway returned a reference we already hold: {}", e);
                return Err(e);
            }
            Err(e) => {
                // The payer may still get a prompt; the callback will be logged and dropped.
                error!(
                    "❌ Charge {} accepted but not recorded: {}",
                    accepted.checkout_reference, e
                );
                return Err(e);
            }
        };

        let entry = AuditEntry::new(&tx.checkout_reference, AuditKind::ChargeInitiated, now)
            .with_detail(format!(
                "{} x {} for {} {}",
                tx.quantity, tx.event_id, tx.total_amount, tx.currency
            ));
        if let Err(e) = self.audit.append(entry).await {
            warn!("Failed to append audit entry for {}: {}", tx.checkout_reference, e);
        }

        info!("📲 STK push sent, checkout {}", tx.checkout_reference);

        Ok(InitiatePaymentResponse {
            checkout_reference: tx.checkout_reference,
            amount: tx.total_amount,
            currency: tx.currency,
            phone_number: tx.phone_number,
            expires_at: tx.expires_at,
            customer_message: accepted.customer_message,
        })
    }
}
