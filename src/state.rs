use std::sync::Arc;

use crate::config::AppConfig;
use crate::database::{AuditLog, TicketStore, TransactionLedger};
use crate::services::callback_reconciler::CallbackReconciler;
use crate::services::clock::Clock;
use crate::services::gateway::PaymentGateway;
use crate::services::payment_service::PaymentService;
use crate::services::status_poller::{PollerSettings, StatusPoller};
use crate::services::ticket_issuer::TicketIssuer;

#[derive(Clone)]
pub struct AppState {
    pub ledger: Arc<dyn TransactionLedger>,
    pub tickets: Arc<dyn TicketStore>,
    pub audit: Arc<dyn AuditLog>,
    pub payments: Arc<PaymentService>,
    pub reconciler: Arc<CallbackReconciler>,
    pub poller: Arc<StatusPoller>,
    pub jwt_secret: String,
    pub store_kind: &'static str,
}

/// The three persistence seams, usually backed by one store.
#[derive(Clone)]
pub struct Stores {
    pub ledger: Arc<dyn TransactionLedger>,
    pub tickets: Arc<dyn TicketStore>,
    pub audit: Arc<dyn AuditLog>,
    pub kind: &'static str,
}

impl Stores {
    pub fn shared<S>(store: Arc<S>, kind: &'static str) -> Self
    where
        S: TransactionLedger + TicketStore + AuditLog + 'static,
    {
        Stores {
            ledger: store.clone(),
            tickets: store.clone(),
            audit: store,
            kind,
        }
    }
}

impl AppState {
    /// Wire the services over the given stores. `gateway` is `None` when
    /// M-Pesa is not configured.
    pub fn new(
        config: &AppConfig,
        stores: Stores,
        gateway: Option<Arc<dyn PaymentGateway>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let issuer = Arc::new(TicketIssuer::new(stores.tickets.clone(), clock.clone()));
        let reconciler = Arc::new(CallbackReconciler::new(
            stores.ledger.clone(),
            issuer,
            stores.audit.clone(),
            clock.clone(),
        ));
        let poller = Arc::new(StatusPoller::new(
            stores.ledger.clone(),
            stores.audit.clone(),
            gateway.clone(),
            reconciler.clone(),
            clock.clone(),
            PollerSettings {
                reconcile_after: config.payments.reconcile_after,
                reconcile_timeout: config.payments.reconcile_timeout,
            },
        ));

        let mut payments = PaymentService::new(
            stores.ledger.clone(),
            stores.tickets.clone(),
            stores.audit.clone(),
            gateway,
            clock,
            config.payments.clone(),
        );
        if let Some(mpesa) = &config.mpesa {
            payments = payments.with_account_reference(mpesa.account_reference.clone());
        }

        AppState {
            ledger: stores.ledger,
            tickets: stores.tickets,
            audit: stores.audit,
            payments: Arc::new(payments),
            reconciler,
            poller,
            jwt_secret: config.jwt_secret.clone(),
            store_kind: stores.kind,
        }
    }
}
