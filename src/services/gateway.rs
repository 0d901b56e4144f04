//! Transport-neutral view of the mobile-money provider.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::Result;

#[derive(Debug, Clone, Serialize)]
pub struct ChargeRequest {
    /// Canonical `254XXXXXXXXX` form.
    pub phone_number: String,
    /// Whole currency units; M-Pesa does not accept fractions.
    pub amount: i64,
    pub account_reference: String,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChargeAccepted {
    pub checkout_reference: String,
    pub merchant_request_id: Option<String>,
    pub customer_message: Option<String>,
}

/// Answer to "what happened to checkout X" from the provider's query API.
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayQuery {
    Completed {
        result_code: i32,
        result_description: String,
    },
    /// The payer has not answered the prompt yet.
    Processing,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    fn name(&self) -> &'static str;

    /// Sends the STK push. Never retries on its own; `RateLimited` goes back
    /// to the caller.
    async fn initiate_charge(&self, request: ChargeRequest) -> Result<ChargeAccepted>;

    async fn query_status(&self, checkout_reference: &str) -> Result<GatewayQuery>;
}
