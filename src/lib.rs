//! Ferremas API library
//!
//! Orders, MercadoPago checkout and payment reconciliation for the Ferremas
//! hardware store chain.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

pub mod auth;
pub mod circuit_breaker;
pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod gateway;
pub mod handlers;
pub mod middleware_helpers;
pub mod migrator;
pub mod openapi;
pub mod repositories;
pub mod services;
pub mod tracing;

use axum::{
    middleware,
    response::Json,
    routing::{get, post, put},
    Extension, Router,
};
use chrono::Utc;
use sea_orm::DatabaseConnection;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use utoipa::{IntoParams, ToSchema};

use crate::auth::{AuthRouterExt, AuthService, Role};
use crate::gateway::PaymentGateway;

// App state definition
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<DatabaseConnection>,
    pub config: config::AppConfig,
    pub services: handlers::AppServices,
    pub auth: Arc<AuthService>,
}

impl AppState {
    /// Wires services and auth around an established pool.
    pub fn new(
        db: Arc<DatabaseConnection>,
        config: config::AppConfig,
        gateway: Option<Arc<dyn PaymentGateway>>,
    ) -> Self {
        let services = handlers::AppServices::new(db.clone(), &config, gateway);
        let auth = Arc::new(AuthService::new(auth::AuthConfig::from(&config)));
        Self {
            db,
            config,
            services,
            auth,
        }
    }
}

// Common query parameters for list endpoints
#[derive(Debug, Default, Deserialize, ToSchema, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct ListQuery {
    /// Rows to skip
    pub offset: Option<u64>,
    /// Page size, clamped to the configured maximum
    pub limit: Option<u64>,
}

// Common response wrappers
#[derive(Serialize, ToSchema)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<ResponseMeta>,
}

#[derive(Serialize, ToSchema)]
pub struct ResponseMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub timestamp: String,
}

impl ResponseMeta {
    fn capture() -> Self {
        Self {
            request_id: crate::tracing::current_request_id().map(|rid| rid.as_str().to_string()),
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

#[derive(Serialize, ToSchema)]
pub struct PaginatedResponse<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub offset: u64,
    pub limit: u64,
}

impl<T> PaginatedResponse<T> {
    pub fn new(items: Vec<T>, total: u64, offset: u64, limit: u64) -> Self {
        Self {
            items,
            total,
            offset,
            limit,
        }
    }
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: None,
            errors: None,
            meta: Some(ResponseMeta::capture()),
        }
    }

    pub fn success_with_message(data: T, message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Self::success(data)
        }
    }
}


/// Standard API result type for JSON responses
pub type ApiResult<T> = Result<Json<ApiResponse<T>>, errors::ServiceError>;

/// Roles allowed to move orders through their lifecycle.
const ORDER_STATUS_ROLES: [Role; 3] = [Role::Admin, Role::Seller, Role::Warehouse];

/// Roles allowed to browse every payment.
const PAYMENT_AUDIT_ROLES: [Role; 2] = [Role::Admin, Role::Accountant];

/// Roles allowed to record payments taken at a branch.
const BRANCH_PAYMENT_ROLES: [Role; 3] = [Role::Admin, Role::Seller, Role::Accountant];

/// Every `/api/v1` route with its auth gate.
pub fn api_v1_routes() -> Router<AppState> {
    let orders_list = Router::new()
        .route("/orders", get(handlers::orders::list_orders))
        .with_roles(&Role::STAFF);

    let orders_authenticated = Router::new()
        .route("/orders", post(handlers::orders::create_order))
        .route("/orders/:id", get(handlers::orders::get_order))
        .route(
            "/orders/by-number/:order_number",
            get(handlers::orders::get_order_by_number),
        )
        .with_auth();

    let orders_status = Router::new()
        .route(
            "/orders/:id/status",
            put(handlers::orders::update_order_status),
        )
        .with_roles(&ORDER_STATUS_ROLES);

    let payments_public = Router::new()
        .route("/payments/webhook", post(handlers::payments::payment_webhook))
        .route("/payments/methods", get(handlers::payments::payment_methods));

    let payments_authenticated = Router::new()
        .route("/payments/checkout", post(handlers::payments::checkout))
        .route(
            "/payments/verify/:payment_id",
            get(handlers::payments::verify_payment),
        )
        .route(
            "/payments/order/:order_id",
            get(handlers::payments::get_order_payments),
        )
        .route("/payments/:id", get(handlers::payments::get_payment))
        .with_auth();

    let payments_audit = Router::new()
        .route("/payments", get(handlers::payments::list_payments))
        .route(
            "/payments/pending-confirmation",
            get(handlers::payments::pending_confirmation),
        )
        .route(
            "/payments/:id/confirm",
            put(handlers::payments::confirm_payment),
        )
        .with_roles(&PAYMENT_AUDIT_ROLES);

    let payments_branch = Router::new()
        .route(
            "/payments/manual",
            post(handlers::payments::register_manual_payment),
        )
        .with_roles(&BRANCH_PAYMENT_ROLES);

    let products_read = Router::new()
        .route("/products", get(handlers::products::list_products))
        .route("/products/search", get(handlers::products::search_products))
        .route("/products/:id", get(handlers::products::get_product));

    let products_admin = Router::new()
        .route("/products", post(handlers::products::create_product))
        .route(
            "/products/:id",
            put(handlers::products::update_product)
                .delete(handlers::products::deactivate_product),
        )
        .with_roles(&[Role::Admin]);

    Router::new()
        .route("/health", get(handlers::health::health_check))
        .route("/status", get(handlers::health::status))
        .route("/currency/rates", get(handlers::currency::get_rates))
        .route("/currency/convert", get(handlers::currency::convert))
        .route("/openapi.json", get(openapi::serve_openapi))
        .merge(orders_list)
        .merge(orders_authenticated)
        .merge(orders_status)
        .merge(payments_public)
        .merge(payments_authenticated)
        .merge(payments_audit)
        .merge(payments_branch)
        .merge(products_read)
        .merge(products_admin)
}

/// Application router: `/api/v1` plus request-id and HTTP tracing layers.
/// Transport concerns (CORS, timeouts, compression) are added by the binary.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .nest("/api/v1", api_v1_routes())
        .layer(Extension(state.auth.clone()))
        .layer(crate::tracing::configure_http_tracing())
        .layer(middleware::from_fn(
            middleware_helpers::request_id_middleware,
        ))
        .with_state(state)
}
