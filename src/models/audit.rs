use chrono::{DateTime, Utc};
use mongodb::bson;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditKind {
    ChargeInitiated,
    CallbackReceived,
    StateChanged,
    Anomaly,
}

/// Append-only record of everything the payment core observed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub checkout_reference: String,
    pub kind: AuditKind,
    pub result_code: Option<i32>,
    pub result_description: Option<String>,
    pub provider_receipt_id: Option<String>,
    pub detail: Option<String>,

    #[serde(with = "bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub recorded_at: DateTime<Utc>,
}

impl AuditEntry {
    pub fn new(checkout_reference: impl Into<String>, kind: AuditKind, recorded_at: DateTime<Utc>) -> Self {
        AuditEntry {
            checkout_reference: checkout_reference.into(),
            kind,
            result_code: None,
            result_description: None,
            provider_receipt_id: None,
            detail: None,
            recorded_at,
        }
    }

    pub fn with_result(mut self, code: i32, description: impl Into<String>) -> Self {
        self.result_code = Some(code);
        self.result_description = Some(description.into());
        self
    }

    pub fn with_receipt(mut self, receipt: Option<String>) -> Self {
        self.provider_receipt_id = receipt;
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// A callback record that carries a provider result is a completion record.
    pub fn is_completion(&self) -> bool {
        self.kind == AuditKind::CallbackReceived && self.result_code.is_some()
    }
}
