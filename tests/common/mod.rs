#![allow(dead_code)]

use axum::{
    body::{self, Body},
    http::{Method, Request},
    response::Response,
    Router,
};
use ferremas_api::{
    auth::Role,
    config::AppConfig,
    db,
    entities::product::Model as ProductModel,
    handlers::gateway_from_config,
    services::products::CreateProductRequest,
    AppState,
};
use rust_decimal_macros::dec;
use serde_json::{json, Value};
use std::sync::Arc;
use tempfile::TempDir;
use tower::ServiceExt;
use wiremock::{
    matchers::{method, path},
    Mock, MockServer, ResponseTemplate,
};

pub const TEST_JWT_SECRET: &str = "test_secret_key_for_testing_purposes_only_32chars";

/// Reads a response body as JSON.
pub async fn response_json(response: Response) -> Value {
    let bytes = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("response body bytes");
    serde_json::from_slice(&bytes).expect("json response")
}

/// Helper harness: the full router over a fresh SQLite file database, with
/// MercadoPago replaced by a wiremock server.
pub struct TestApp {
    router: Router,
    pub state: AppState,
    pub gateway: MockServer,
    pub product: ProductModel,
    _db_dir: TempDir,
}

impl TestApp {
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    /// Builds the app after letting the caller adjust the configuration.
    pub async fn with_config(customize: impl FnOnce(&mut AppConfig)) -> Self {
        let db_dir = tempfile::tempdir().expect("temp dir for test database");
        let db_path = db_dir.path().join("ferremas_test.db");
        let gateway = MockServer::start().await;

        let mut cfg = AppConfig::new(
            format!("sqlite://{}?mode=rwc", db_path.display()),
            TEST_JWT_SECRET.to_string(),
            "127.0.0.1".to_string(),
            18_080,
            "test".to_string(),
        );
        cfg.db_max_connections = 1;
        cfg.db_min_connections = 1;
        cfg.mercadopago_access_token = "TEST-token".to_string();
        cfg.mercadopago_base_url = gateway.uri();
        cfg.mercadopago_timeout_secs = 2;
        customize(&mut cfg);

        let pool = db::establish_connection_from_app_config(&cfg)
            .await
            .expect("failed to create test database");
        db::run_migrations(&pool)
            .await
            .expect("failed to run migrations in tests");

        let state = AppState::new(Arc::new(pool), cfg.clone(), gateway_from_config(&cfg));
        let router = ferremas_api::build_router(state.clone());

        let product = state
            .services
            .products
            .create_product(CreateProductRequest {
                code: "MART-001".to_string(),
                name: "Martillo".to_string(),
                description: Some("Seeded for integration tests".to_string()),
                price: dec!(10000),
                active: true,
            })
            .await
            .expect("seed product for tests");

        Self {
            router,
            state,
            gateway,
            product,
            _db_dir: db_dir,
        }
    }

    /// Bearer token for a user with `role`; the user id is fixed per role.
    pub fn token(&self, role: Role) -> String {
        let user_id = match role {
            Role::Admin => 1,
            Role::Seller => 2,
            Role::Warehouse => 3,
            Role::Accountant => 4,
            Role::Customer => 5,
        };
        self.state
            .auth
            .generate_token(user_id, &format!("{}@ferremas.test", role), role)
            .expect("token for tests")
    }

    /// Send a request against the router with an optional bearer token.
    pub async fn request(
        &self,
        method: Method,
        uri: &str,
        body: Option<Value>,
        token: Option<&str>,
    ) -> Response {
        let mut builder = Request::builder().method(method).uri(uri);

        if let Some(tok) = token {
            builder = builder.header("authorization", format!("Bearer {}", tok));
        }

        let body = if let Some(json) = body {
            builder = builder.header("content-type", "application/json");
            Body::from(serde_json::to_vec(&json).expect("failed to serialize json request body"))
        } else {
            Body::empty()
        };

        self.send(builder.body(body).expect("failed to build request"))
            .await
    }

    /// Convenience helper for requests made as `role`.
    pub async fn request_as(
        &self,
        role: Role,
        method: Method,
        uri: &str,
        body: Option<Value>,
    ) -> Response {
        let token = self.token(role);
        self.request(method, uri, body, Some(&token)).await
    }

    /// Posts a raw body to the webhook endpoint.
    pub async fn post_webhook(&self, query: &str, raw_body: &str) -> Response {
        let uri = if query.is_empty() {
            "/api/v1/payments/webhook".to_string()
        } else {
            format!("/api/v1/payments/webhook?{}", query)
        };
        let request = Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(raw_body.to_string()))
            .expect("failed to build request");
        self.send(request).await
    }

    pub async fn send(&self, request: Request<Body>) -> Response {
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router error during test request")
    }

    /// Creates an order for the seeded product as the admin user.
    pub async fn create_order(&self, quantity: i32) -> Value {
        let response = self
            .request_as(
                Role::Admin,
                Method::POST,
                "/api/v1/orders",
                Some(json!({
                    "customer_id": 42,
                    "branch_id": 1,
                    "line_items": [{ "product_id": self.product.id, "quantity": quantity }]
                })),
            )
            .await;
        assert_eq!(response.status(), 201, "order creation failed");
        response_json(response).await["data"].clone()
    }

    /// Stubs the preference endpoint of the fake gateway.
    pub async fn mock_preference(&self, preference_id: &str) {
        Mock::given(method("POST"))
            .and(path("/checkout/preferences"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "id": preference_id,
                "init_point": format!("https://mp.test/checkout?pref={}", preference_id),
                "sandbox_init_point": format!("https://sandbox.mp.test/checkout?pref={}", preference_id)
            })))
            .mount(&self.gateway)
            .await;
    }

    /// Stubs `GET /v1/payments/{id}` of the fake gateway.
    pub async fn mock_gateway_payment(&self, gateway_payment: Value) {
        let id = match &gateway_payment["id"] {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        Mock::given(method("GET"))
            .and(path(format!("/v1/payments/{}", id)))
            .respond_with(ResponseTemplate::new(200).set_body_json(gateway_payment))
            .mount(&self.gateway)
            .await;
    }
}
