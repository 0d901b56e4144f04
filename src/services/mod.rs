pub mod callback_reconciler;
pub mod clock;
pub mod gateway;
pub mod mpesa_service;
pub mod payment_service;
pub mod status_poller;
pub mod ticket_issuer;
