// services/mpesa_service.rs
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as base64, Engine as _};
use chrono::{DateTime, Utc};
use reqwest::{header, Client, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use crate::config::MpesaConfig;
use crate::errors::{AppError, Result};
use crate::services::gateway::{ChargeAccepted, ChargeRequest, GatewayQuery, PaymentGateway};

// Daraja fault codes we translate explicitly
const FAULT_SYSTEM_BUSY: &str = "500.003.02";
const FAULT_QUOTA_VIOLATION: &str = "500.003.03";
const FAULT_INVALID_PHONE: &str = "400.002.02";
const FAULT_STILL_PROCESSING: &str = "500.001.1001";

#[derive(Debug, Deserialize)]
pub struct AuthResponse {
    pub access_token: String,
    pub expires_in: String,
}

#[derive(Debug, Serialize)]
pub struct StkPushRequest {
    #[serde(rename = "BusinessShortCode")]
    pub business_short_code: String,
    #[serde(rename = "Password")]
    pub password: String,
    #[serde(rename = "Timestamp")]
    pub timestamp: String,
    #[serde(rename = "TransactionType")]
    pub transaction_type: String,
    #[serde(rename = "Amount")]
    pub amount: String,
    #[serde(rename = "PartyA")]
    pub party_a: String,
    #[serde(rename = "PartyB")]
    pub party_b: String,
    #[serde(rename = "PhoneNumber")]
    pub phone_number: String,
    #[serde(rename = "CallBackURL")]
    pub callback_url: String,
    #[serde(rename = "AccountReference")]
    pub account_reference: String,
    #[serde(rename = "TransactionDesc")]
    pub transaction_desc: String,
}

#[derive(Debug, Deserialize)]
pub struct StkPushResponse {
    #[serde(rename = "MerchantRequestID")]
    pub merchant_request_id: String,
    #[serde(rename = "CheckoutRequestID")]
    pub checkout_request_id: String,
    #[serde(rename = "ResponseCode")]
    pub response_code: String,
    #[serde(rename = "ResponseDescription")]
    pub response_description: String,
    #[serde(rename = "CustomerMessage")]
    pub customer_message: String,
}

#[derive(Debug, Serialize)]
pub struct StkQueryRequest {
    #[serde(rename = "BusinessShortCode")]
    pub business_short_code: String,
    #[serde(rename = "Password")]
    pub password: String,
    #[serde(rename = "Timestamp")]
    pub timestamp: String,
    #[serde(rename = "CheckoutRequestID")]
    pub checkout_request_id: String,
}

#[derive(Debug, Deserialize)]
pub struct StkQueryResponse {
    #[serde(rename = "ResponseCode")]
    pub response_code: String,
    #[serde(rename = "ResultCode")]
    pub result_code: Option<String>,
    #[serde(rename = "ResultDesc")]
    pub result_desc: Option<String>,
}

/// Error body Daraja returns on non-2xx responses.
#[derive(Debug, Default, Deserialize)]
pub struct DarajaFault {
    #[serde(rename = "errorCode", default)]
    pub error_code: String,
    #[serde(rename = "errorMessage", default)]
    pub error_message: String,
}

/// Canonicalise a Kenyan mobile number to `254XXXXXXXXX`.
pub fn normalize_phone_number(phone: &str) -> Result<String> {
    let cleaned: String = phone
        .trim()
        .chars()
        .filter(|c| !matches!(c, ' ' | '-' | '(' | ')' | '.'))
        .collect();
    let digits = cleaned.strip_prefix('+').unwrap_or(&cleaned);

    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(AppError::InvalidPhoneNumber(phone.to_string()));
    }

    let subscriber = match digits.len() {
        12 if digits.starts_with("254") => &digits[3..],
        10 if digits.starts_with('0') => &digits[1..],
        9 => digits,
        _ => return Err(AppError::InvalidPhoneNumber(phone.to_string())),
    };

    // Safaricom/Airtel mobile ranges start with 7 or 1
    if !(subscriber.starts_with('7') || subscriber.starts_with('1')) {
        return Err(AppError::InvalidPhoneNumber(phone.to_string()));
    }

    Ok(format!("254{}", subscriber))
}

/// Translate a non-success Daraja response into the payment error taxonomy.
pub fn classify_fault(status: StatusCode, body: &str) -> AppError {
    let fault: DarajaFault = serde_json::from_str(body).unwrap_or_default();
    let message = fault.error_message.to_lowercase();

    if status == StatusCode::TOO_MANY_REQUESTS
        || fault.error_code == FAULT_SYSTEM_BUSY
        || fault.error_code == FAULT_QUOTA_VIOLATION
        || message.contains("busy")
    {
        return AppError::RateLimited;
    }

    if fault.error_code == FAULT_INVALID_PHONE || message.contains("invalid phonenumber") {
        return AppError::InvalidPhoneNumber(fault.error_message);
    }

    let detail = format!("{} {} {}", status, fault.error_code, fault.error_message);
    AppError::gateway(detail.trim().to_string())
}

fn is_still_processing(body: &str) -> bool {
    let fault: DarajaFault = serde_json::from_str(body).unwrap_or_default();
    fault.error_code == FAULT_STILL_PROCESSING
        || fault.error_message.to_lowercase().contains("being processed")
}

pub struct MpesaService {
    config: MpesaConfig,
    client: Client,
    cached_token: RwLock<Option<(String, DateTime<Utc>)>>,
}

impl MpesaService {
    pub fn new(config: MpesaConfig, timeout: std::time::Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::configuration(format!("Failed to create HTTP client: {}", e)))?;

        Ok(MpesaService {
            config,
            client,
            cached_token: RwLock::new(None),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url(), path)
    }

    fn generate_password(&self, timestamp: &str) -> String {
        let password_string = format!(
            "{}{}{}",
            self.config.short_code, self.config.passkey, timestamp
        );
        base64.encode(password_string)
    }

    pub async fn get_access_token(&self) -> Result<String> {
        {
            let cached = self.cached_token.read().await;
            if let Some((token, expiry)) = cached.as_ref() {
                if *expiry > Utc::now() + chrono::Duration::minutes(5) {
                    return Ok(token.clone());
                }
            }
        }

        info!("Requesting new M-Pesa access token");
        let auth_string = format!("{}:{}", self.config.consumer_key, self.config.consumer_secret);
        let encoded_auth = base64.encode(auth_string);

        let response = self
            .client
            .get(self.url("/oauth/v1/generate?grant_type=client_credentials"))
            .header(header::AUTHORIZATION, format!("Basic {}", encoded_auth))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!("Failed to get access token: {} - {}", status, body);
            return Err(classify_fault(status, &body));
        }

        let auth_response: AuthResponse = response.json().await?;
        let lifetime = auth_response.expires_in.parse::<i64>().unwrap_or(3600);

        {
            let expiry_time = Utc::now() + chrono::Duration::seconds(lifetime);
            let mut cached = self.cached_token.write().await;
            *cached = Some((auth_response.access_token.clone(), expiry_time));
        }

        info!("Access token obtained");
        Ok(auth_response.access_token)
    }
}

#[async_trait]
impl PaymentGateway for MpesaService {
    fn name(&self) -> &'static str {
        "mpesa"
    }

    async fn initiate_charge(&self, request: ChargeRequest) -> Result<ChargeAccepted> {
        if request.amount <= 0 {
            return Err(AppError::invalid_data("Amount must be greater than 0"));
        }
        let phone = normalize_phone_number(&request.phone_number)?;
        info!("STK push for {} - {} {}", phone, request.amount, request.account_reference);

        let access_token = self.get_access_token().await?;
        let timestamp = Utc::now().format("%Y%m%d%H%M%S").to_string();
        let password = self.generate_password(&timestamp);

        let stk_request = StkPushRequest {
            business_short_code: self.config.short_code.clone(),
            password,
            timestamp,
            transaction_type: "CustomerPayBillOnline".to_string(),
            amount: request.amount.to_string(),
            party_a: phone.clone(),
            party_b: self.config.short_code.clone(),
            phone_number: phone,
            callback_url: self.config.callback_url.clone(),
            account_reference: request.account_reference,
            transaction_desc: request.description,
        };

        let response = self
            .client
            .post(self.url("/mpesa/stkpush/v1/processrequest"))
            .header(header::AUTHORIZATION, format!("Bearer {}", access_token))
            .json(&stk_request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!("STK push failed: {} - {}", status, body);
            return Err(classify_fault(status, &body));
        }

        let stk_response: StkPushResponse = response.json().await?;
        if stk_response.response_code != "0" {
            warn!(
                "STK push rejected: {} - {}",
                stk_response.response_code, stk_response.response_description
            );
            return Err(AppError::gateway(stk_response.response_description));
        }

        info!("STK push accepted: {}", stk_response.checkout_request_id);
        Ok(ChargeAccepted {
            checkout_reference: stk_response.checkout_request_id,
            merchant_request_id: Some(stk_response.merchant_request_id),
            customer_message: Some(stk_response.customer_message),
        })
    }

    async fn query_status(&self, checkout_reference: &str) -> Result<GatewayQuery> {
        let access_token = self.get_access_token().await?;
        let timestamp = Utc::now().format("%Y%m%d%H%M%S").to_string();

        let query = StkQueryRequest {
            business_short_code: self.config.short_code.clone(),
            password: self.generate_password(&timestamp),
            timestamp,
            checkout_request_id: checkout_reference.to_string(),
        };

        let response = self
            .client
            .post(self.url("/mpesa/stkpushquery/v1/query"))
            .header(header::AUTHORIZATION, format!("Bearer {}", access_token))
            .json(&query)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            if is_still_processing(&body) {
                return Ok(GatewayQuery::Processing);
            }
            warn!("STK query for {} failed: {} - {}", checkout_reference, status, body);
            return Err(classify_fault(status, &body));
        }

        let query_response: StkQueryResponse = response.json().await?;
        parse_query_response(query_response)
    }
}

fn parse_query_response(response: StkQueryResponse) -> Result<GatewayQuery> {
    match response.result_code.as_deref().map(str::trim) {
        Some(code) if !code.is_empty() => {
            let result_code = code
                .parse::<i32>()
                .map_err(|_| AppError::gateway(format!("unparseable result code {}", code)))?;
            Ok(GatewayQuery::Completed {
                result_code,
                result_description: response.result_desc.unwrap_or_default(),
            })
        }
        _ => Ok(GatewayQuery::Processing),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_common_formats() {
        for raw in ["0712345678", "712345678", "254712345678", "+254 712 345 678", "+254-712-345-678"] {
            assert_eq!(normalize_phone_number(raw).unwrap(), "254712345678", "{raw}");
        }
        assert_eq!(normalize_phone_number("0110123456").unwrap(), "254110123456");
    }

    #[test]
    fn rejects_malformed_numbers() {
        for raw in ["", "07123", "0812345678", "25571234567", "07123456ab", "+1 555 0100"] {
            assert!(
                matches!(normalize_phone_number(raw), Err(AppError::InvalidPhoneNumber(_))),
                "{raw}"
            );
        }
    }

    #[test]
    fn busy_faults_become_rate_limited() {
        let body = r#"{"requestId":"1","errorCode":"500.003.02","errorMessage":"System is busy. Please try again in few minutes."}"#;
        assert!(matches!(
            classify_fault(StatusCode::INTERNAL_SERVER_ERROR, body),
            AppError::RateLimited
        ));
        assert!(matches!(
            classify_fault(StatusCode::TOO_MANY_REQUESTS, ""),
            AppError::RateLimited
        ));
    }

    #[test]
    fn invalid_phone_fault_is_permanent() {
        let body = r#"{"requestId":"1","errorCode":"400.002.02","errorMessage":"Bad Request - Invalid PhoneNumber"}"#;
        let err = classify_fault(StatusCode::BAD_REQUEST, body);
        assert!(matches!(err, AppError::InvalidPhoneNumber(_)));
        assert!(!err.is_transient());
    }

    #[test]
    fn other_faults_are_gateway_unavailable() {
        let err = classify_fault(StatusCode::BAD_GATEWAY, "<html>upstream</html>");
        assert!(matches!(err, AppError::GatewayUnavailable(_)));
    }

    #[test]
    fn detects_processing_query_answer() {
        let body = r#"{"requestId":"1","errorCode":"500.001.1001","errorMessage":"The transaction is being processed"}"#;
        assert!(is_still_processing(body));
        assert!(!is_still_processing(r#"{"errorCode":"500.003.02"}"#));
    }

    #[test]
    fn parses_completed_query_response() {
        let response = StkQueryResponse {
            response_code: "0".into(),
            result_code: Some("1032".into()),
            result_desc: Some("Request cancelled by user".into()),
        };
        assert_eq!(
            parse_query_response(response).unwrap(),
            GatewayQuery::Completed {
                result_code: 1032,
                result_description: "Request cancelled by user".into()
            }
        );
    }
}
