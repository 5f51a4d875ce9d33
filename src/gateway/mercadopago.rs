//! Async HTTP client for the MercadoPago REST API.

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, instrument, warn};

use super::{
    GatewayError, GatewayPayment, PaymentGateway, PaymentSearchResult, Preference,
    PreferenceRequest, Refund, RefundRequest,
};
use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError};

const DEFAULT_BASE_URL: &str = "https://api.mercadopago.com";
const PREFERENCES_PATH: &str = "/checkout/preferences";
const PAYMENTS_PATH: &str = "/v1/payments";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Builder for constructing a [`MercadoPagoClient`].
#[derive(Debug, Default)]
pub struct MercadoPagoClientBuilder {
    token: Option<String>,
    /// Base URL override (for testing).
    base_url: Option<String>,
    timeout: Option<Duration>,
    breaker: Option<CircuitBreakerConfig>,
}

impl MercadoPagoClientBuilder {
    #[must_use]
    pub fn token<T: Into<String>>(mut self, token: T) -> Self {
        self.token = Some(token.into());
        self
    }

    #[must_use]
    pub fn base_url<T: Into<String>>(mut self, url: T) -> Self {
        self.base_url = Some(url.into());
        self
    }

    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.breaker = Some(config);
        self
    }

    /// Builds the client.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::NotConfigured`] if the token is missing or blank.
    pub fn build(self) -> Result<MercadoPagoClient, GatewayError> {
        let token = self
            .token
            .filter(|t| !t.trim().is_empty())
            .ok_or(GatewayError::NotConfigured)?;
        let base_url = self
            .base_url
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_owned())
            .trim_end_matches('/')
            .to_owned();
        let http = reqwest::Client::builder()
            .timeout(self.timeout.unwrap_or(DEFAULT_TIMEOUT))
            .build()?;

        Ok(MercadoPagoClient {
            http,
            token,
            base_url,
            breaker: CircuitBreaker::new("mercadopago", self.breaker.unwrap_or_default()),
        })
    }
}

/// MercadoPago client. Every call is bounded by a timeout and runs through a circuit breaker.
#[derive(Debug, Clone)]
pub struct MercadoPagoClient {
    http: reqwest::Client,
    token: String,
    base_url: String,
    breaker: CircuitBreaker,
}

impl MercadoPagoClient {
    #[must_use]
    pub fn builder() -> MercadoPagoClientBuilder {
        MercadoPagoClientBuilder::default()
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn guarded<T, Fut>(&self, request: Fut) -> Result<T, GatewayError>
    where
        Fut: Future<Output = Result<T, GatewayError>>,
    {
        self.breaker
            .call_with(|| request, GatewayError::is_upstream_failure)
            .await
            .map_err(|e| match e {
                CircuitBreakerError::CircuitOpen => GatewayError::CircuitOpen,
                CircuitBreakerError::Inner(inner) => inner,
            })
    }

    async fn get_json<Resp: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<Resp, GatewayError> {
        let url = format!("{}{path}", self.base_url);
        self.guarded(async {
            let response = self
                .http
                .get(&url)
                .header(AUTHORIZATION, format!("Bearer {}", self.token))
                .query(query)
                .send()
                .await?;
            Self::handle_response(response).await
        })
        .await
    }

    async fn post_json<Req: serde::Serialize + Sync, Resp: DeserializeOwned>(
        &self,
        path: &str,
        body: &Req,
    ) -> Result<Resp, GatewayError> {
        let url = format!("{}{path}", self.base_url);
        self.guarded(async {
            let response = self
                .http
                .post(&url)
                .header(AUTHORIZATION, format!("Bearer {}", self.token))
                .header(CONTENT_TYPE, "application/json")
                .json(body)
                .send()
                .await?;
            Self::handle_response(response).await
        })
        .await
    }

    async fn handle_response<T: DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, GatewayError> {
        let status = response.status();
        let body = response.text().await?;
        if status.is_success() {
            serde_json::from_str(&body).map_err(|e| GatewayError::Decode(e.to_string()))
        } else {
            warn!(status = status.as_u16(), "MercadoPago returned an error response");
            Err(GatewayError::Api {
                status: status.as_u16(),
                message: if body.is_empty() {
                    "unknown error".to_owned()
                } else {
                    body
                },
            })
        }
    }
}

#[async_trait]
impl PaymentGateway for MercadoPagoClient {
    #[instrument(skip(self, request), fields(external_reference = %request.external_reference))]
    async fn create_preference(
        &self,
        request: &PreferenceRequest,
    ) -> Result<Preference, GatewayError> {
        let preference: Preference = self.post_json(PREFERENCES_PATH, request).await?;
        debug!(preference_id = %preference.id, "Checkout preference created");
        Ok(preference)
    }

    #[instrument(skip(self))]
    async fn get_payment(&self, payment_id: &str) -> Result<GatewayPayment, GatewayError> {
        self.get_json(&format!("{PAYMENTS_PATH}/{payment_id}"), &[])
            .await
    }

    #[instrument(skip(self))]
    async fn search_payments(
        &self,
        external_reference: &str,
    ) -> Result<Vec<GatewayPayment>, GatewayError> {
        let result: PaymentSearchResult = self
            .get_json(
                &format!("{PAYMENTS_PATH}/search"),
                &[
                    ("external_reference", external_reference),
                    ("sort", "date_created"),
                    ("criteria", "desc"),
                ],
            )
            .await?;
        Ok(result.results)
    }

    #[instrument(skip(self))]
    async fn refund(
        &self,
        payment_id: &str,
        amount: Option<Decimal>,
    ) -> Result<Refund, GatewayError> {
        let body = RefundRequest { amount };
        self.post_json(&format!("{PAYMENTS_PATH}/{payment_id}/refunds"), &body)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{BackUrls, PreferenceItem};
    use assert_matches::assert_matches;
    use rust_decimal_macros::dec;
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> MercadoPagoClient {
        MercadoPagoClient::builder()
            .token("TEST-token")
            .base_url(server.uri())
            .timeout(Duration::from_millis(500))
            .circuit_breaker(CircuitBreakerConfig {
                failure_threshold: 2,
                timeout: Duration::from_secs(60),
                success_threshold: 1,
            })
            .build()
            .unwrap()
    }

    #[test]
    fn builder_requires_token() {
        assert_matches!(
            MercadoPagoClient::builder().build(),
            Err(GatewayError::NotConfigured)
        );
        assert_matches!(
            MercadoPagoClient::builder().token("  ").build(),
            Err(GatewayError::NotConfigured)
        );
    }

    #[test]
    fn builder_defaults_to_production_url() {
        let client = MercadoPagoClient::builder().token("t").build().unwrap();
        assert_eq!(client.base_url(), DEFAULT_BASE_URL);
    }

    #[tokio::test]
    async fn create_preference_posts_items_with_bearer_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/checkout/preferences"))
            .and(header("authorization", "Bearer TEST-token"))
            .and(body_partial_json(serde_json::json!({
                "external_reference": "PAY-1",
                "auto_return": "approved"
            })))
            .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({
                "id": "123-pref",
                "init_point": "https://mp.test/checkout?pref=123-pref",
                "sandbox_init_point": "https://sandbox.mp.test/checkout?pref=123-pref"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let preference = client(&server)
            .create_preference(&PreferenceRequest {
                items: vec![PreferenceItem {
                    title: "Order ORD-1".into(),
                    quantity: 1,
                    unit_price: dec!(54025),
                    currency_id: "CLP".into(),
                }],
                external_reference: "PAY-1".into(),
                back_urls: BackUrls {
                    success: "http://s".into(),
                    failure: "http://f".into(),
                    pending: "http://p".into(),
                },
                auto_return: "approved".into(),
                notification_url: None,
            })
            .await
            .unwrap();

        assert_eq!(preference.id, "123-pref");
        assert!(preference.sandbox_init_point.is_some());
    }

    #[tokio::test]
    async fn get_payment_maps_not_found_to_api_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/payments/999"))
            .respond_with(ResponseTemplate::new(404).set_body_string("not found"))
            .mount(&server)
            .await;

        let client = client(&server);
        for _ in 0..3 {
            assert_matches!(
                client.get_payment("999").await,
                Err(GatewayError::Api { status: 404, .. })
            );
        }
    }

    #[tokio::test]
    async fn repeated_server_errors_open_the_circuit() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/payments/1"))
            .respond_with(ResponseTemplate::new(500))
            .expect(2)
            .mount(&server)
            .await;

        let client = client(&server);
        assert_matches!(
            client.get_payment("1").await,
            Err(GatewayError::Api { status: 500, .. })
        );
        assert_matches!(
            client.get_payment("1").await,
            Err(GatewayError::Api { status: 500, .. })
        );
        assert_matches!(client.get_payment("1").await, Err(GatewayError::CircuitOpen));
    }

    #[tokio::test]
    async fn slow_gateway_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/payments/2"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"id": 2, "status": "approved"}))
                    .set_delay(Duration::from_secs(2)),
            )
            .mount(&server)
            .await;

        assert_matches!(client(&server).get_payment("2").await, Err(GatewayError::Timeout));
    }

    #[tokio::test]
    async fn search_and_refund_hit_payment_endpoints() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/payments/search"))
            .and(query_param("external_reference", "PAY-9"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "results": [{"id": 77, "status": "approved", "external_reference": "PAY-9"}]
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/payments/77/refunds"))
            .and(body_partial_json(serde_json::json!({"amount": 1000.0})))
            .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({
                "id": 5001, "amount": 1000, "status": "approved"
            })))
            .mount(&server)
            .await;

        let client = client(&server);
        let found = client.search_payments("PAY-9").await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "77");

        let refund = client.refund("77", Some(dec!(1000))).await.unwrap();
        assert_eq!(refund.id, "5001");
        assert_eq!(refund.amount, Some(dec!(1000)));
    }
}
