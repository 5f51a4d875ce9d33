//! Payment gateway abstraction and the MercadoPago implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

use crate::errors::ServiceError;

pub mod mercadopago;

pub use mercadopago::{MercadoPagoClient, MercadoPagoClientBuilder};

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("gateway request failed: {0}")]
    Http(String),
    #[error("gateway request timed out")]
    Timeout,
    #[error("gateway returned {status}: {message}")]
    Api { status: u16, message: String },
    #[error("could not decode gateway response: {0}")]
    Decode(String),
    #[error("gateway circuit is open")]
    CircuitOpen,
    #[error("gateway access token is not configured")]
    NotConfigured,
}

impl GatewayError {
    /// Whether the error says something about gateway health.
    /// Client errors such as 404 do not.
    pub fn is_upstream_failure(&self) -> bool {
        match self {
            GatewayError::Http(_) | GatewayError::Timeout | GatewayError::Decode(_) => true,
            GatewayError::Api { status, .. } => *status >= 500 || *status == 429,
            GatewayError::CircuitOpen | GatewayError::NotConfigured => false,
        }
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            GatewayError::Timeout
        } else if err.is_decode() {
            GatewayError::Decode(err.to_string())
        } else {
            GatewayError::Http(err.to_string())
        }
    }
}

impl From<GatewayError> for ServiceError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::CircuitOpen => ServiceError::CircuitBreakerOpen,
            other => ServiceError::ExternalServiceError(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PreferenceItem {
    pub title: String,
    pub quantity: u32,
    #[serde(with = "rust_decimal::serde::float")]
    pub unit_price: Decimal,
    pub currency_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackUrls {
    pub success: String,
    pub failure: String,
    pub pending: String,
}

/// Body of `POST /checkout/preferences`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PreferenceRequest {
    pub items: Vec<PreferenceItem>,
    pub external_reference: String,
    pub back_urls: BackUrls,
    pub auto_return: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notification_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Preference {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    pub init_point: String,
    #[serde(default)]
    pub sandbox_init_point: Option<String>,
}

/// Authoritative payment record as reported by the gateway.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct GatewayPayment {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    pub status: String,
    #[serde(default)]
    pub status_detail: Option<String>,
    #[serde(default)]
    pub external_reference: Option<String>,
    #[serde(default)]
    pub transaction_amount: Option<Decimal>,
    #[serde(default)]
    pub currency_id: Option<String>,
    #[serde(default)]
    pub date_approved: Option<DateTime<Utc>>,
    #[serde(default)]
    pub date_last_updated: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PaymentSearchResult {
    #[serde(default)]
    pub results: Vec<GatewayPayment>,
}

/// Body of `POST /v1/payments/{id}/refunds`. No amount means a full refund.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RefundRequest {
    #[serde(
        with = "rust_decimal::serde::float_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub amount: Option<Decimal>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Refund {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(default)]
    pub amount: Option<Decimal>,
    #[serde(default)]
    pub status: Option<String>,
}

/// Gateway ids arrive as JSON numbers or strings.
pub fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Id {
        Text(String),
        Signed(i64),
        Unsigned(u64),
    }

    Ok(match Id::deserialize(deserializer)? {
        Id::Text(s) => s,
        Id::Signed(n) => n.to_string(),
        Id::Unsigned(n) => n.to_string(),
    })
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_preference(
        &self,
        request: &PreferenceRequest,
    ) -> Result<Preference, GatewayError>;

    async fn get_payment(&self, payment_id: &str) -> Result<GatewayPayment, GatewayError>;

    async fn search_payments(
        &self,
        external_reference: &str,
    ) -> Result<Vec<GatewayPayment>, GatewayError>;

    async fn refund(
        &self,
        payment_id: &str,
        amount: Option<Decimal>,
    ) -> Result<Refund, GatewayError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payment_ids_accept_numbers_and_strings() {
        let numeric: GatewayPayment = serde_json::from_value(serde_json::json!({
            "id": 1319478215,
            "status": "approved",
            "date_last_updated": "2024-05-02T10:15:00.000-04:00"
        }))
        .unwrap();
        assert_eq!(numeric.id, "1319478215");
        assert_eq!(
            numeric.date_last_updated.unwrap().to_rfc3339(),
            "2024-05-02T14:15:00+00:00"
        );

        let text: GatewayPayment =
            serde_json::from_value(serde_json::json!({"id": "abc", "status": "pending"}))
                .unwrap();
        assert_eq!(text.id, "abc");
        assert!(text.external_reference.is_none());
    }

    #[test]
    fn only_server_side_errors_count_as_failures() {
        assert!(GatewayError::Timeout.is_upstream_failure());
        assert!(GatewayError::Api {
            status: 502,
            message: String::new()
        }
        .is_upstream_failure());
        assert!(!GatewayError::Api {
            status: 404,
            message: String::new()
        }
        .is_upstream_failure());
    }

    #[test]
    fn converts_to_upstream_service_error() {
        let err: ServiceError = GatewayError::Timeout.into();
        assert_eq!(err.kind(), "UpstreamError");
        let err: ServiceError = GatewayError::CircuitOpen.into();
        assert!(matches!(err, ServiceError::CircuitBreakerOpen));
    }
}
