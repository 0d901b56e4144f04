// config.rs
use std::env;
use std::time::Duration;

use tracing::info;

use crate::errors::{AppError, Result};

#[derive(Debug, Clone)]
pub struct MpesaConfig {
    pub consumer_key: String,
    pub consumer_secret: String,
    pub short_code: String,
    pub passkey: String,
    pub callback_url: String,
    pub environment: String,
    pub account_reference: String,
}

impl MpesaConfig {
    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }

    pub fn base_url(&self) -> &'static str {
        if self.is_production() {
            "https://api.safaricom.co.ke"
        } else {
            "https://sandbox.safaricom.co.ke"
        }
    }
}

#[derive(Debug, Clone)]
pub struct PaymentSettings {
    pub currency: String,
    pub ttl: Duration,
    pub reconcile_after: Duration,
    pub reconcile_timeout: Duration,
    pub gateway_timeout: Duration,
    pub sweep_interval: Duration,
    pub max_tickets_per_order: u32,
}

impl Default for PaymentSettings {
    fn default() -> Self {
        PaymentSettings {
            currency: "KES".to_string(),
            ttl: Duration::from_secs(300),
            reconcile_after: Duration::from_secs(30),
            reconcile_timeout: Duration::from_secs(10),
            gateway_timeout: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(60),
            max_tickets_per_order: 10,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    /// `None` disables the gateway; initiation then fails with `GatewayUnavailable`.
    pub mpesa: Option<MpesaConfig>,
    pub payments: PaymentSettings,
    pub jwt_secret: String,
    /// `None` runs on the in-memory store.
    pub database_url: Option<String>,
    pub database_name: String,
    pub port: u16,
    pub host: String,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |key: &str| {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| AppError::configuration(format!("{} must be set", key)))
        };
        let secs = |key: &str, default: u64| -> Result<Duration> {
            match lookup(key) {
                Some(raw) => raw
                    .trim()
                    .parse::<u64>()
                    .map(Duration::from_secs)
                    .map_err(|_| AppError::configuration(format!("{} must be a number of seconds", key))),
                None => Ok(Duration::from_secs(default)),
            }
        };

        // M-Pesa is all or nothing: a consumer key without the rest is a mistake.
        let mpesa = match lookup("MPESA_CONSUMER_KEY") {
            Some(consumer_key) => Some(MpesaConfig {
                consumer_key,
                consumer_secret: required("MPESA_CONSUMER_SECRET")?,
                short_code: required("MPESA_SHORT_CODE")?,
                passkey: required("MPESA_PASSKEY")?,
                callback_url: required("MPESA_CALLBACK_URL")?,
                environment: lookup("MPESA_ENVIRONMENT").unwrap_or_else(|| "sandbox".to_string()),
                account_reference: lookup("MPESA_ACCOUNT_REFERENCE")
                    .unwrap_or_else(|| "Tickets".to_string()),
            }),
            None => None,
        };

        let defaults = PaymentSettings::default();
        let payments = PaymentSettings {
            currency: lookup("PAYMENT_CURRENCY").unwrap_or(defaults.currency),
            ttl: secs("PAYMENT_TTL_SECS", defaults.ttl.as_secs())?,
            reconcile_after: secs("RECONCILE_AFTER_SECS", defaults.reconcile_after.as_secs())?,
            reconcile_timeout: secs("RECONCILE_TIMEOUT_SECS", defaults.reconcile_timeout.as_secs())?,
            gateway_timeout: secs("GATEWAY_TIMEOUT_SECS", defaults.gateway_timeout.as_secs())?,
            sweep_interval: secs("SWEEP_INTERVAL_SECS", defaults.sweep_interval.as_secs())?,
            max_tickets_per_order: match lookup("MAX_TICKETS_PER_ORDER") {
                Some(raw) => raw
                    .trim()
                    .parse()
                    .map_err(|_| AppError::configuration("MAX_TICKETS_PER_ORDER must be a number"))?,
                None => defaults.max_tickets_per_order,
            },
        };

        let port = match lookup("PORT") {
            Some(raw) => raw
                .trim()
                .parse()
                .map_err(|_| AppError::configuration("PORT must be a number"))?,
            None => 3000,
        };

        Ok(AppConfig {
            mpesa,
            payments,
            jwt_secret: required("JWT_SECRET")?,
            database_url: lookup("DATABASE_URL").filter(|v| !v.trim().is_empty()),
            database_name: lookup("DATABASE_NAME").unwrap_or_else(|| "ticketing".to_string()),
            port,
            host: lookup("HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
        })
    }

    pub fn log_summary(&self) {
        match &self.mpesa {
            Some(mpesa) => {
                info!("📱 M-Pesa short code: {}", mpesa.short_code);
                info!("🌐 M-Pesa environment: {}", mpesa.environment);
            }
            None => info!("📱 M-Pesa not configured"),
        }
        info!(
            "⏱️ Payment TTL {}s, reconcile after {}s",
            self.payments.ttl.as_secs(),
            self.payments.reconcile_after.as_secs()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_without_mpesa() {
        let config = AppConfig::from_lookup(lookup_from(&[("JWT_SECRET", "s3cret")])).unwrap();
        assert!(config.mpesa.is_none());
        assert!(config.database_url.is_none());
        assert_eq!(config.payments.ttl, Duration::from_secs(300));
        assert_eq!(config.payments.currency, "KES");
        assert_eq!(config.port, 3000);
    }

    #[test]
    fn missing_jwt_secret_is_an_error() {
        let err = AppConfig::from_lookup(lookup_from(&[])).unwrap_err();
        assert!(matches!(err, AppError::ConfigurationError(_)));
    }

    #[test]
    fn partial_mpesa_config_is_rejected() {
        let err = AppConfig::from_lookup(lookup_from(&[
            ("JWT_SECRET", "s3cret"),
            ("MPESA_CONSUMER_KEY", "key"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("MPESA_CONSUMER_SECRET"));
    }

    #[test]
    fn production_environment_switches_base_url() {
        let config = AppConfig::from_lookup(lookup_from(&[
            ("JWT_SECRET", "s3cret"),
            ("MPESA_CONSUMER_KEY", "key"),
            ("MPESA_CONSUMER_SECRET", "secret"),
            ("MPESA_SHORT_CODE", "174379"),
            ("MPESA_PASSKEY", "passkey"),
            ("MPESA_CALLBACK_URL", "https://example.com/api/payments/callback"),
            ("MPESA_ENVIRONMENT", "production"),
            ("PAYMENT_TTL_SECS", "120"),
        ]))
        .unwrap();

        let mpesa = config.mpesa.unwrap();
        assert_eq!(mpesa.base_url(), "https://api.safaricom.co.ke");
        assert_eq!(config.payments.ttl, Duration::from_secs(120));
    }

    #[test]
    fn rejects_non_numeric_durations() {
        let err = AppConfig::from_lookup(lookup_from(&[
            ("JWT_SECRET", "s3cret"),
            ("RECONCILE_AFTER_SECS", "soon"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("RECONCILE_AFTER_SECS"));
    }
}
