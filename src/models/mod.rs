pub mod audit;
pub mod event;
pub mod mpesa_callback;
pub mod payment_transaction;
pub mod ticket;
pub mod user;
