use chrono::{DateTime, Utc};
use mongodb::bson;
use serde::{Deserialize, Serialize};

use crate::models::payment_transaction::PaymentTransaction;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticket {
    pub ticket_id: String,
    pub checkout_reference: String,
    pub buyer_id: String,
    pub event_id: String,
    pub quantity: u32,
    pub total_amount: i64,
    pub currency: String,

    #[serde(with = "bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub issued_at: DateTime<Utc>,
}

impl Ticket {
    pub fn for_transaction(tx: &PaymentTransaction, ticket_id: String, issued_at: DateTime<Utc>) -> Self {
        Ticket {
            ticket_id,
            checkout_reference: tx.checkout_reference.clone(),
            buyer_id: tx.buyer_id.clone(),
            event_id: tx.event_id.clone(),
            quantity: tx.quantity,
            total_amount: tx.total_amount,
            currency: tx.currency.clone(),
            issued_at,
        }
    }
}

/// Gateway facts recorded alongside a successful issuance.
#[derive(Debug, Clone, Default)]
pub struct Confirmation {
    pub result_code: i32,
    pub result_description: String,
    pub provider_receipt_id: Option<String>,
}

/// Result of asking the issuer for a ticket.
///
/// `AlreadyIssued` is a success signal: a replayed callback or a racing
/// poll found the ticket the winner created.
#[derive(Debug, Clone, PartialEq)]
pub enum Issuance {
    Issued(Ticket),
    AlreadyIssued(Ticket),
}

impl Issuance {
    pub fn ticket(&self) -> &Ticket {
        match self {
            Issuance::Issued(ticket) | Issuance::AlreadyIssued(ticket) => ticket,
        }
    }

    pub fn was_fresh(&self) -> bool {
        matches!(self, Issuance::Issued(_))
    }
}
