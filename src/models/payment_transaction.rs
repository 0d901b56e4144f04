use chrono::{DateTime, Duration, Utc};
use mongodb::bson;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle of a single STK push charge attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentState {
    Initiated,
    PendingConfirmation,
    Succeeded,
    Failed,
    Cancelled,
    Expired,
}

impl PaymentState {
    pub const ALL: [PaymentState; 6] = [
        PaymentState::Initiated,
        PaymentState::PendingConfirmation,
        PaymentState::Succeeded,
        PaymentState::Failed,
        PaymentState::Cancelled,
        PaymentState::Expired,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PaymentState::Succeeded
                | PaymentState::Failed
                | PaymentState::Cancelled
                | PaymentState::Expired
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PaymentState::Initiated => "INITIATED",
            PaymentState::PendingConfirmation => "PENDING_CONFIRMATION",
            PaymentState::Succeeded => "SUCCEEDED",
            PaymentState::Failed => "FAILED",
            PaymentState::Cancelled => "CANCELLED",
            PaymentState::Expired => "EXPIRED",
        }
    }

    /// States a ledger transition into `target` may start from.
    ///
    /// `Succeeded` is absent on purpose: it is only reachable through ticket
    /// issuance, which links the ticket in the same atomic write.
    pub fn sources_for(target: PaymentState) -> &'static [PaymentState] {
        match target {
            PaymentState::Initiated | PaymentState::Succeeded => &[],
            PaymentState::PendingConfirmation => &[PaymentState::Initiated],
            PaymentState::Failed | PaymentState::Cancelled | PaymentState::Expired => {
                &[PaymentState::Initiated, PaymentState::PendingConfirmation]
            }
        }
    }

    pub fn check_transition(self, target: PaymentState) -> TransitionCheck {
        if self == target && (self.is_terminal() || self == PaymentState::PendingConfirmation) {
            return TransitionCheck::AlreadyThere;
        }
        if PaymentState::sources_for(target).contains(&self) {
            TransitionCheck::Allowed
        } else {
            TransitionCheck::Rejected
        }
    }
}

impl std::fmt::Display for PaymentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionCheck {
    Allowed,
    AlreadyThere,
    Rejected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentTransaction {
    pub checkout_reference: String,
    pub internal_id: String,
    pub merchant_request_id: Option<String>,

    pub buyer_id: String,
    pub event_id: String,
    pub quantity: u32,
    pub unit_amount: i64,
    pub total_amount: i64,
    pub currency: String,
    pub phone_number: String,

    pub state: PaymentState,
    pub gateway_result_code: Option<i32>,
    pub gateway_result_description: Option<String>,
    pub provider_receipt_id: Option<String>,

    #[serde(with = "bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub created_at: DateTime<Utc>,

    #[serde(with = "bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub last_updated_at: DateTime<Utc>,

    #[serde(with = "bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub expires_at: DateTime<Utc>,

    pub ticket_id: Option<String>,
}

/// Everything known about a charge once the gateway accepted it.
#[derive(Debug, Clone)]
pub struct NewTransaction {
    pub checkout_reference: String,
    pub merchant_request_id: Option<String>,
    pub buyer_id: String,
    pub event_id: String,
    pub quantity: u32,
    pub unit_amount: i64,
    pub total_amount: i64,
    pub currency: String,
    pub phone_number: String,
}

impl PaymentTransaction {
    pub fn initiated(new: NewTransaction, now: DateTime<Utc>, ttl: Duration) -> Self {
        PaymentTransaction {
            checkout_reference: new.checkout_reference,
            internal_id: Uuid::new_v4().to_string(),
            merchant_request_id: new.merchant_request_id,
            buyer_id: new.buyer_id,
            event_id: new.event_id,
            quantity: new.quantity,
            unit_amount: new.unit_amount,
            total_amount: new.total_amount,
            currency: new.currency,
            phone_number: new.phone_number,
            state: PaymentState::Initiated,
            gateway_result_code: None,
            gateway_result_description: None,
            provider_receipt_id: None,
            created_at: now,
            last_updated_at: now,
            expires_at: now + ttl,
            ticket_id: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now - self.created_at
    }

    pub fn has_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Compare-and-set request applied by the ledger.
#[derive(Debug, Clone)]
pub struct TransitionRequest {
    pub state: PaymentState,
    pub result_code: Option<i32>,
    pub result_description: Option<String>,
}

impl TransitionRequest {
    pub fn new(state: PaymentState) -> Self {
        TransitionRequest {
            state,
            result_code: None,
            result_description: None,
        }
    }

    pub fn with_result(mut self, code: i32, description: impl Into<String>) -> Self {
        self.result_code = Some(code);
        self.result_description = Some(description.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.result_description = Some(description.into());
        self
    }
}

#[derive(Debug, Clone)]
pub enum TransitionOutcome {
    /// This caller won the state change.
    Applied(PaymentTransaction),
    /// The transaction was already in the requested state.
    Unchanged(PaymentTransaction),
}

impl TransitionOutcome {
    pub fn into_transaction(self) -> PaymentTransaction {
        match self {
            TransitionOutcome::Applied(tx) | TransitionOutcome::Unchanged(tx) => tx,
        }
    }
}

/// Client-facing view returned by the status endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PaymentStatus {
    pub checkout_reference: String,
    pub state: PaymentState,
    pub result_code: Option<i32>,
    pub result_description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ticket_id: Option<String>,
    pub expires_at: DateTime<Utc>,
}

impl From<&PaymentTransaction> for PaymentStatus {
    fn from(tx: &PaymentTransaction) -> Self {
        PaymentStatus {
            checkout_reference: tx.checkout_reference.clone(),
            state: tx.state,
            result_code: tx.gateway_result_code,
            result_description: tx.gateway_result_description.clone(),
            ticket_id: tx.ticket_id.clone(),
            expires_at: tx.expires_at,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct LedgerQuery {
    pub buyer_id: Option<String>,
    pub event_id: Option<String>,
    pub state: Option<PaymentState>,
    pub limit: Option<i64>,
}

#[derive(Debug, Default, Clone, Serialize, PartialEq, Eq)]
pub struct LedgerStats {
    pub total: u64,
    pub initiated: u64,
    pub pending_confirmation: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub expired: u64,
}

impl LedgerStats {
    pub fn record(&mut self, state: PaymentState, count: u64) {
        self.total += count;
        match state {
            PaymentState::Initiated => self.initiated += count,
            PaymentState::PendingConfirmation => self.pending_confirmation += count,
            PaymentState::Succeeded => self.succeeded += count,
            PaymentState::Failed => self.failed += count,
            PaymentState::Cancelled => self.cancelled += count,
            PaymentState::Expired => self.expired += count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_reject_other_targets() {
        for from in PaymentState::ALL.into_iter().filter(|s| s.is_terminal()) {
            for to in PaymentState::ALL {
                let check = from.check_transition(to);
                if from == to {
                    assert_eq!(check, TransitionCheck::AlreadyThere, "{from} -> {to}");
                } else {
                    assert_eq!(check, TransitionCheck::Rejected, "{from} -> {to}");
                }
            }
        }
    }

    #[test]
    fn pending_confirmation_never_regresses() {
        assert_eq!(
            PaymentState::PendingConfirmation.check_transition(PaymentState::Initiated),
            TransitionCheck::Rejected
        );
        assert_eq!(
            PaymentState::Initiated.check_transition(PaymentState::PendingConfirmation),
            TransitionCheck::Allowed
        );
        assert_eq!(
            PaymentState::PendingConfirmation.check_transition(PaymentState::Expired),
            TransitionCheck::Allowed
        );
    }

    #[test]
    fn succeeded_is_not_a_plain_transition_target() {
        assert_eq!(
            PaymentState::Initiated.check_transition(PaymentState::Succeeded),
            TransitionCheck::Rejected
        );
    }

    #[test]
    fn state_serializes_screaming_snake_case() {
        let json = serde_json::to_string(&PaymentState::PendingConfirmation).unwrap();
        assert_eq!(json, "\"PENDING_CONFIRMATION\"");
    }

    #[test]
    fn initiated_transaction_sets_expiry() {
        let now = Utc::now();
        let tx = PaymentTransaction::initiated(
            NewTransaction {
                checkout_reference: "ws_CO_1".into(),
                merchant_request_id: None,
                buyer_id: "buyer-1".into(),
                event_id: "evt-1".into(),
                quantity: 2,
                unit_amount: 100,
                total_amount: 200,
                currency: "KES".into(),
                phone_number: "254712345678".into(),
            },
            now,
            Duration::minutes(5),
        );

        assert_eq!(tx.total_amount, 200);
        assert_eq!(tx.state, PaymentState::Initiated);
        assert_eq!(tx.expires_at, now + Duration::minutes(5));
        assert!(!tx.has_expired(now + Duration::seconds(299)));
        assert!(tx.has_expired(now + Duration::minutes(5)));
    }
}
