use serde::{Deserialize, Serialize};

pub const RESULT_CODE_SUCCESS: i32 = 0;
/// Reported when the payer dismisses the STK prompt.
pub const RESULT_CODE_USER_CANCELLED: i32 = 1032;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayOutcome {
    Succeeded,
    Cancelled,
    Failed,
}

impl GatewayOutcome {
    pub fn from_result_code(code: i32) -> Self {
        match code {
            RESULT_CODE_SUCCESS => GatewayOutcome::Succeeded,
            RESULT_CODE_USER_CANCELLED => GatewayOutcome::Cancelled,
            _ => GatewayOutcome::Failed,
        }
    }
}

/// Normalised callback, whatever shape the provider posted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentCallback {
    pub checkout_reference: String,
    pub result_code: i32,
    pub result_description: String,
    #[serde(default)]
    pub provider_receipt_id: Option<String>,
}

impl PaymentCallback {
    pub fn outcome(&self) -> GatewayOutcome {
        GatewayOutcome::from_result_code(self.result_code)
    }
}

// Daraja STK callback envelope
#[derive(Debug, Clone, Deserialize)]
pub struct StkCallbackEnvelope {
    #[serde(rename = "Body")]
    pub body: StkCallbackBody,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StkCallbackBody {
    #[serde(rename = "stkCallback")]
    pub stk_callback: StkCallback,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StkCallback {
    #[serde(rename = "MerchantRequestID")]
    pub merchant_request_id: String,
    #[serde(rename = "CheckoutRequestID")]
    pub checkout_request_id: String,
    #[serde(rename = "ResultCode")]
    pub result_code: i32,
    #[serde(rename = "ResultDesc")]
    pub result_desc: String,
    #[serde(rename = "CallbackMetadata", default)]
    pub callback_metadata: Option<CallbackMetadata>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CallbackMetadata {
    #[serde(rename = "Item", default)]
    pub items: Vec<MetadataItem>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetadataItem {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Value", default)]
    pub value: Option<serde_json::Value>,
}

impl StkCallback {
    pub fn metadata_value(&self, name: &str) -> Option<&serde_json::Value> {
        self.callback_metadata
            .as_ref()?
            .items
            .iter()
            .find(|item| item.name == name)?
            .value
            .as_ref()
    }

    pub fn receipt_number(&self) -> Option<String> {
        match self.metadata_value("MpesaReceiptNumber")? {
            serde_json::Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }
}

impl From<StkCallbackEnvelope> for PaymentCallback {
    fn from(envelope: StkCallbackEnvelope) -> Self {
        let callback = envelope.body.stk_callback;
        let provider_receipt_id = callback.receipt_number();
        PaymentCallback {
            checkout_reference: callback.checkout_request_id,
            result_code: callback.result_code,
            result_description: callback.result_desc,
            provider_receipt_id,
        }
    }
}

/// Either the raw Daraja envelope or the already-flattened form.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum CallbackPayload {
    Stk(StkCallbackEnvelope),
    Flat(PaymentCallback),
}

impl From<CallbackPayload> for PaymentCallback {
    fn from(payload: CallbackPayload) -> Self {
        match payload {
            CallbackPayload::Stk(envelope) => envelope.into(),
            CallbackPayload::Flat(callback) => callback,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn maps_result_codes() {
        assert_eq!(GatewayOutcome::from_result_code(0), GatewayOutcome::Succeeded);
        assert_eq!(GatewayOutcome::from_result_code(1032), GatewayOutcome::Cancelled);
        assert_eq!(GatewayOutcome::from_result_code(1), GatewayOutcome::Failed);
        assert_eq!(GatewayOutcome::from_result_code(2001), GatewayOutcome::Failed);
    }

    #[test]
    fn parses_successful_daraja_envelope() {
        let raw = json!({
            "Body": {
                "stkCallback": {
                    "MerchantRequestID": "29115-34620561-1",
                    "CheckoutRequestID": "ws_CO_191220191020363925",
                    "ResultCode": 0,
                    "ResultDesc": "The service request is processed successfully.",
                    "CallbackMetadata": {
                        "Item": [
                            { "Name": "Amount", "Value": 200.00 },
                            { "Name": "MpesaReceiptNumber", "Value": "NLJ7RT61SV" },
                            { "Name": "Balance" },
                            { "Name": "PhoneNumber", "Value": 254708374149u64 }
                        ]
                    }
                }
            }
        });

        let payload: CallbackPayload = serde_json::from_value(raw).unwrap();
        let callback = PaymentCallback::from(payload);
        assert_eq!(callback.checkout_reference, "ws_CO_191220191020363925");
        assert_eq!(callback.result_code, 0);
        assert_eq!(callback.provider_receipt_id.as_deref(), Some("NLJ7RT61SV"));
        assert_eq!(callback.outcome(), GatewayOutcome::Succeeded);
    }

    #[test]
    fn parses_cancelled_envelope_without_metadata() {
        let raw = json!({
            "Body": {
                "stkCallback": {
                    "MerchantRequestID": "8555-67195-1",
                    "CheckoutRequestID": "ws_CO_27072017151044001",
                    "ResultCode": 1032,
                    "ResultDesc": "Request cancelled by user"
                }
            }
        });

        let callback = PaymentCallback::from(serde_json::from_value::<CallbackPayload>(raw).unwrap());
        assert_eq!(callback.outcome(), GatewayOutcome::Cancelled);
        assert!(callback.provider_receipt_id.is_none());
    }

    #[test]
    fn parses_flat_callback() {
        let raw = json!({
            "checkoutReference": "ws_CO_1",
            "resultCode": 1,
            "resultDescription": "The balance is insufficient for the transaction."
        });

        let callback = PaymentCallback::from(serde_json::from_value::<CallbackPayload>(raw).unwrap());
        assert_eq!(callback.checkout_reference, "ws_CO_1");
        assert_eq!(callback.outcome(), GatewayOutcome::Failed);
    }
}
