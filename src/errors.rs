// src/errors.rs
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::models::payment_transaction::PaymentState;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("MongoDB error: {0}")]
    MongoDB(#[from] mongodb::error::Error),

    #[error("Payment gateway unavailable: {0}")]
    GatewayUnavailable(String),

    #[error("Payment gateway is busy, try again later")]
    RateLimited,

    #[error("Invalid phone number: {0}")]
    InvalidPhoneNumber(String),

    #[error("Checkout reference already recorded: {0}")]
    DuplicateReference(String),

    #[error("Invalid transition for {checkout_reference}: {from:?} -> {to:?}")]
    InvalidTransition {
        checkout_reference: String,
        from: PaymentState,
        to: PaymentState,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Sold out: {0}")]
    SoldOut(String),

    #[error("Payment outcome unclear for {0}, contact support")]
    Unclear(String),

    #[error("Authentication error")]
    AuthError,

    #[error("Unauthorized access")]
    Unauthorized,

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Service error: {0}")]
    ServiceError(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match &self {
            AppError::MongoDB(_) => (StatusCode::INTERNAL_SERVER_ERROR, "Database error".to_string()),
            AppError::GatewayUnavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, "Payment gateway unavailable".to_string()),
            AppError::RateLimited => (StatusCode::TOO_MANY_REQUESTS, "System busy, try later".to_string()),
            AppError::InvalidPhoneNumber(_) => (StatusCode::BAD_REQUEST, "Invalid phone number".to_string()),
            AppError::DuplicateReference(_) => (StatusCode::CONFLICT, "Duplicate checkout reference".to_string()),
            AppError::InvalidTransition { .. } => (StatusCode::CONFLICT, "Invalid state transition".to_string()),
            AppError::NotFound(_) => (StatusCode::NOT_FOUND, "Not found".to_string()),
            AppError::SoldOut(_) => (StatusCode::CONFLICT, "Tickets sold out".to_string()),
            AppError::Unclear(_) => (StatusCode::ACCEPTED, "Payment status unclear, contact support".to_string()),
            AppError::AuthError => (StatusCode::UNAUTHORIZED, "Authentication failed".to_string()),
            AppError::Unauthorized => (StatusCode::FORBIDDEN, "Unauthorized access".to_string()),
            AppError::ValidationError(_) => (StatusCode::BAD_REQUEST, "Validation failed".to_string()),
            AppError::ConfigurationError(_) => (StatusCode::INTERNAL_SERVER_ERROR, "Configuration error".to_string()),
            AppError::ServiceError(_) => (StatusCode::INTERNAL_SERVER_ERROR, "Service error".to_string()),
        };

        let body = Json(json!({
            "error": error_message,
            "message": self.to_string(),
            "success": false,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        }));

        (status, body).into_response()
    }
}

impl From<validator::ValidationErrors> for AppError {
    fn from(err: validator::ValidationErrors) -> Self {
        AppError::ValidationError(err.to_string())
    }
}

impl From<mongodb::bson::ser::Error> for AppError {
    fn from(err: mongodb::bson::ser::Error) -> Self {
        AppError::ServiceError(format!("BSON conversion failed: {}", err))
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        AppError::GatewayUnavailable(format!("HTTP request failed: {}", err))
    }
}

// Helper conversion functions
impl AppError {
    pub fn invalid_data(msg: impl Into<String>) -> Self {
        AppError::ValidationError(msg.into())
    }

    pub fn gateway(msg: impl Into<String>) -> Self {
        AppError::GatewayUnavailable(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        AppError::NotFound(msg.into())
    }

    pub fn configuration(msg: impl Into<String>) -> Self {
        AppError::ConfigurationError(msg.into())
    }

    pub fn service(msg: impl Into<String>) -> Self {
        AppError::ServiceError(msg.into())
    }

    /// Transient failures the caller may retry after backing off.
    pub fn is_transient(&self) -> bool {
        matches!(self, AppError::GatewayUnavailable(_) | AppError::RateLimited)
    }

    /// Errors that indicate a duplicate or racing write rather than a user mistake.
    pub fn is_anomaly(&self) -> bool {
        matches!(
            self,
            AppError::DuplicateReference(_) | AppError::InvalidTransition { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limited_maps_to_too_many_requests() {
        let response = AppError::RateLimited.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[test]
    fn unclear_is_not_reported_as_failure() {
        let response = AppError::Unclear("ws_CO_1".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }

    #[test]
    fn classifies_transient_and_anomalies() {
        assert!(AppError::gateway("timeout").is_transient());
        assert!(AppError::RateLimited.is_transient());
        assert!(!AppError::SoldOut("evt".into()).is_transient());

        let err = AppError::InvalidTransition {
            checkout_reference: "ws_CO_1".into(),
            from: PaymentState::Succeeded,
            to: PaymentState::Failed,
        };
        assert!(err.is_anomaly());
        assert!(AppError::DuplicateReference("ws_CO_1".into()).is_anomaly());
    }
}
