use std::sync::Arc;

use tracing::info;

use crate::database::TicketStore;
use crate::errors::Result;
use crate::models::payment_transaction::PaymentTransaction;
use crate::models::ticket::{Confirmation, Issuance};
use crate::services::clock::Clock;

/// Turns a confirmed payment into exactly one ticket.
///
/// Inventory check and decrement, ticket creation and the ledger link happen
/// in one store-level unit; calling this twice for the same transaction
/// yields `AlreadyIssued` with the original ticket and no second decrement.
pub struct TicketIssuer {
    store: Arc<dyn TicketStore>,
    clock: Arc<dyn Clock>,
}

impl TicketIssuer {
    pub fn new(store: Arc<dyn TicketStore>, clock: Arc<dyn Clock>) -> Self {
        TicketIssuer { store, clock }
    }

    pub async fn issue(
        &self,
        tx: &PaymentTransaction,
        confirmation: &Confirmation,
    ) -> Result<Issuance> {
        let issuance = self
            .store
            .issue_ticket(&tx.checkout_reference, confirmation, self.clock.now())
            .await?;

        match &issuance {
            Issuance::Issued(ticket) => info!(
                "🎟️ Issued ticket {} ({} x event {}) for {}",
                ticket.ticket_id, ticket.quantity, ticket.event_id, tx.checkout_reference
            ),
            Issuance::AlreadyIssued(ticket) => info!(
                "Ticket {} already issued for {}",
                ticket.ticket_id, tx.checkout_reference
            ),
        }

        Ok(issuance)
    }
}
