use crate::{
    circuit_breaker::CircuitBreakerConfig,
    config::AppConfig,
    db::DbPool,
    gateway::{BackUrls, MercadoPagoClient, PaymentGateway},
    services::{
        currency::{CurrencyService, StaticRateSource},
        orders::{OrderService, PricingRules},
        payments::{CheckoutSettings, PaymentService},
        products::ProductService,
    },
};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

pub mod common;
pub mod currency;
pub mod health;
pub mod orders;
pub mod payments;
pub mod products;

/// Service container shared by every handler.
#[derive(Clone)]
pub struct AppServices {
    pub orders: Arc<OrderService>,
    pub payments: Arc<PaymentService>,
    pub products: Arc<ProductService>,
    pub currency: Arc<CurrencyService>,
}

impl AppServices {
    /// Wires the services from configuration. `gateway` is the payment
    /// gateway to use; `None` leaves checkout and reconciliation unavailable.
    pub fn new(
        db_pool: Arc<DbPool>,
        config: &AppConfig,
        gateway: Option<Arc<dyn PaymentGateway>>,
    ) -> Self {
        let orders = OrderService::new(db_pool.clone())
            .with_pricing(PricingRules {
                tax_rate: config.tax_rate,
                bulk_discount_rate: config.bulk_discount_rate,
                bulk_discount_min_quantity: config.bulk_discount_min_quantity,
            })
            .with_policy(config.transition_policy())
            .with_currency(config.default_currency.clone());

        let payments = PaymentService::new(db_pool.clone(), orders.clone(), gateway)
            .with_checkout(CheckoutSettings {
                back_urls: BackUrls {
                    success: config.checkout_success_url.clone(),
                    failure: config.checkout_failure_url.clone(),
                    pending: config.checkout_pending_url.clone(),
                },
                notification_url: config.checkout_notification_url.clone(),
                sandbox: config.mercadopago_sandbox,
            })
            .with_webhook_secret(config.mercadopago_webhook_secret.clone());

        let currency = CurrencyService::new(
            Arc::new(StaticRateSource::new(config.currency_rates.clone())),
            config.currency_rates_ttl(),
        );

        Self {
            orders: Arc::new(orders),
            payments: Arc::new(payments),
            products: Arc::new(ProductService::new(db_pool)),
            currency: Arc::new(currency),
        }
    }
}

/// Builds the MercadoPago client from configuration, or `None` when no
/// access token is configured.
pub fn gateway_from_config(config: &AppConfig) -> Option<Arc<dyn PaymentGateway>> {
    let client = MercadoPagoClient::builder()
        .token(config.mercadopago_access_token.clone())
        .base_url(config.mercadopago_base_url.clone())
        .timeout(config.gateway_timeout())
        .circuit_breaker(CircuitBreakerConfig {
            failure_threshold: config.circuit_breaker_failure_threshold,
            timeout: Duration::from_secs(config.circuit_breaker_timeout_secs),
            success_threshold: config.circuit_breaker_success_threshold,
        })
        .build();

    match client {
        Ok(client) => Some(Arc::new(client)),
        Err(e) => {
            warn!(error = %e, "MercadoPago client disabled; checkout will be unavailable");
            None
        }
    }
}
