use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use validator::Validate;

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct InitiatePaymentRequest {
    #[validate(length(min = 1, message = "eventId is required"))]
    pub event_id: String,

    #[validate(range(min = 1, message = "quantity must be at least 1"))]
    pub quantity: u32,

    pub phone_number: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiatePaymentResponse {
    pub checkout_reference: String,
    pub amount: i64,
    pub currency: String,
    pub phone_number: String,
    pub expires_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub customer_message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_uses_camel_case() {
        let request: InitiatePaymentRequest = serde_json::from_str(
            r#"{"eventId":"evt-1","quantity":2,"phoneNumber":"0712345678"}"#,
        )
        .unwrap();
        assert_eq!(request.event_id, "evt-1");
        assert_eq!(request.quantity, 2);
        assert!(request.validate().is_ok());
    }

    #[test]
    fn zero_quantity_fails_validation() {
        let request = InitiatePaymentRequest {
            event_id: "evt-1".to_string(),
            quantity: 0,
            phone_number: "0712345678".to_string(),
        };
        assert!(request.validate().is_err());
    }
}
