mod common;

use axum::{
    body::Body,
    http::{Method, Request, StatusCode},
};
use ferremas_api::auth::{AuthConfig, AuthService, Role};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::{json, Value};
use std::str::FromStr;
use std::time::Duration;

use common::{response_json, TestApp, TEST_JWT_SECRET};

fn decimal(value: &Value) -> Decimal {
    match value {
        Value::String(s) => Decimal::from_str(s).expect("decimal string"),
        Value::Number(n) => Decimal::from_str(&n.to_string()).expect("decimal number"),
        other => panic!("not a decimal: {other}"),
    }
}

#[tokio::test]
async fn protected_routes_need_a_valid_token() {
    let app = TestApp::new().await;

    let missing = app.request(Method::GET, "/api/v1/orders/1", None, None).await;
    assert_eq!(missing.status(), StatusCode::UNAUTHORIZED);
    let body = response_json(missing).await;
    assert_eq!(body["success"], false);
    assert_eq!(body["error"], "Unauthorized");

    let garbage = app
        .request(Method::GET, "/api/v1/orders/1", None, Some("not-a-jwt"))
        .await;
    assert_eq!(garbage.status(), StatusCode::UNAUTHORIZED);

    let foreign = AuthService::new(AuthConfig::new(
        "another_secret_that_is_long_enough_to_sign".to_string(),
        "ferremas-api".to_string(),
        Duration::from_secs(60),
    ))
    .generate_token(1, "admin@ferremas.test", Role::Admin)
    .unwrap();
    let forged = app
        .request(Method::GET, "/api/v1/orders/1", None, Some(&foreign))
        .await;
    assert_eq!(forged.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn tokens_from_another_issuer_are_rejected() {
    let app = TestApp::new().await;
    let token = AuthService::new(AuthConfig::new(
        TEST_JWT_SECRET.to_string(),
        "someone-else".to_string(),
        Duration::from_secs(60),
    ))
    .generate_token(1, "admin@ferremas.test", Role::Admin)
    .unwrap();

    let response = app
        .request(Method::GET, "/api/v1/orders", None, Some(&token))
        .await;

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn wrong_role_is_forbidden() {
    let app = TestApp::new().await;

    let response = app
        .request_as(
            Role::Seller,
            Method::POST,
            "/api/v1/products",
            Some(json!({ "code": "X-1", "name": "Taladro", "price": 45990 })),
        )
        .await;

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(response_json(response).await["error"], "Forbidden");
}

#[tokio::test]
async fn client_request_id_is_echoed() {
    let app = TestApp::new().await;
    let request = Request::builder()
        .uri("/api/v1/orders/99999")
        .header("x-request-id", "client-req-42")
        .header("authorization", format!("Bearer {}", app.token(Role::Admin)))
        .body(Body::empty())
        .unwrap();

    let response = app.send(request).await;

    assert_eq!(response.headers()["x-request-id"], "client-req-42");
    let body = response_json(response).await;
    assert_eq!(body["request_id"], "client-req-42");
}

#[tokio::test]
async fn request_id_is_generated_when_absent() {
    let app = TestApp::new().await;

    let response = app.request(Method::GET, "/api/v1/products", None, None).await;

    let header = response.headers()["x-request-id"]
        .to_str()
        .expect("ascii header")
        .to_string();
    assert!(!header.is_empty());
    let body = response_json(response).await;
    assert_eq!(body["meta"]["request_id"], header);
}

#[tokio::test]
async fn health_and_status_are_public() {
    let app = TestApp::new().await;

    let health = app.request(Method::GET, "/api/v1/health", None, None).await;
    assert_eq!(health.status(), StatusCode::OK);
    let body = response_json(health).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["database"], "connected");

    let status = app.request(Method::GET, "/api/v1/status", None, None).await;
    assert_eq!(status.status(), StatusCode::OK);
    let body = response_json(status).await;
    assert_eq!(body["name"], "ferremas-api");
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn catalog_reads_are_public_and_hide_inactive_products() {
    let app = TestApp::new().await;
    let created = app
        .request_as(
            Role::Admin,
            Method::POST,
            "/api/v1/products",
            Some(json!({ "code": "OLD-1", "name": "Discontinued", "price": 100, "active": false })),
        )
        .await;
    assert_eq!(created.status(), StatusCode::CREATED);

    let list = app.request(Method::GET, "/api/v1/products", None, None).await;
    assert_eq!(list.status(), StatusCode::OK);
    let body = response_json(list).await;
    assert_eq!(body["data"]["total"], 1);
    assert_eq!(body["data"]["items"][0]["code"], "MART-001");

    let one = app
        .request(
            Method::GET,
            &format!("/api/v1/products/{}", app.product.id),
            None,
            None,
        )
        .await;
    assert_eq!(one.status(), StatusCode::OK);
    assert_eq!(decimal(&response_json(one).await["data"]["price"]), dec!(10000));

    let missing = app.request(Method::GET, "/api/v1/products/5555", None, None).await;
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn product_creation_is_validated() {
    let app = TestApp::new().await;

    let invalid = app
        .request_as(
            Role::Admin,
            Method::POST,
            "/api/v1/products",
            Some(json!({ "code": "", "name": "Sierra", "price": 0 })),
        )
        .await;
    assert_eq!(invalid.status(), StatusCode::BAD_REQUEST);
    let body = response_json(invalid).await;
    assert_eq!(body["errors"].as_array().map(Vec::len), Some(2));

    let duplicate = app
        .request_as(
            Role::Admin,
            Method::POST,
            "/api/v1/products",
            Some(json!({ "code": "MART-001", "name": "Martillo 2", "price": 9990 })),
        )
        .await;
    assert_eq!(duplicate.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn admins_update_and_deactivate_products() {
    let app = TestApp::new().await;
    let uri = format!("/api/v1/products/{}", app.product.id);

    let forbidden = app
        .request_as(Role::Seller, Method::PUT, &uri, Some(json!({ "price": 1 })))
        .await;
    assert_eq!(forbidden.status(), StatusCode::FORBIDDEN);

    let updated = app
        .request_as(
            Role::Admin,
            Method::PUT,
            &uri,
            Some(json!({ "name": "Martillo carpintero", "price": "12990" })),
        )
        .await;
    assert_eq!(updated.status(), StatusCode::OK);
    let body = response_json(updated).await;
    assert_eq!(body["data"]["name"], "Martillo carpintero");
    assert_eq!(body["data"]["code"], "MART-001");
    assert_eq!(decimal(&body["data"]["price"]), dec!(12990));
    assert!(body["data"]["created_at"].is_string());

    for invalid in [json!({}), json!({ "price": 0 }), json!({ "code": "NEW" })] {
        let response = app
            .request_as(Role::Admin, Method::PUT, &uri, Some(invalid))
            .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
    let missing = app
        .request_as(
            Role::Admin,
            Method::PUT,
            "/api/v1/products/5555",
            Some(json!({ "active": true })),
        )
        .await;
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);

    let deactivated = app.request_as(Role::Admin, Method::DELETE, &uri, None).await;
    assert_eq!(deactivated.status(), StatusCode::OK);
    assert_eq!(response_json(deactivated).await["data"]["active"], false);
    let again = app.request_as(Role::Admin, Method::DELETE, &uri, None).await;
    assert_eq!(again.status(), StatusCode::OK);

    let list = app.request(Method::GET, "/api/v1/products", None, None).await;
    assert_eq!(response_json(list).await["data"]["total"], 0);
}

#[tokio::test]
async fn product_search_matches_name_or_code() {
    let app = TestApp::new().await;
    for (code, name, active) in [
        ("DEST-010", "Destornillador plano", true),
        ("TAL-200", "Taladro percutor", true),
        ("TAL-100", "Taladro antiguo", false),
    ] {
        let created = app
            .request_as(
                Role::Admin,
                Method::POST,
                "/api/v1/products",
                Some(json!({ "code": code, "name": name, "price": 5000, "active": active })),
            )
            .await;
        assert_eq!(created.status(), StatusCode::CREATED);
    }

    let by_name = app
        .request(Method::GET, "/api/v1/products/search?q=Taladro", None, None)
        .await;
    assert_eq!(by_name.status(), StatusCode::OK);
    let body = response_json(by_name).await;
    assert_eq!(body["data"]["total"], 1);
    assert_eq!(body["data"]["items"][0]["code"], "TAL-200");

    let by_code = app
        .request(Method::GET, "/api/v1/products/search?q=MART", None, None)
        .await;
    assert_eq!(response_json(by_code).await["data"]["items"][0]["name"], "Martillo");

    let blank = app
        .request(Method::GET, "/api/v1/products/search?q=%20", None, None)
        .await;
    assert_eq!(blank.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn currency_rates_and_conversion() {
    let app = TestApp::new().await;

    let rates = app.request(Method::GET, "/api/v1/currency/rates", None, None).await;
    assert_eq!(rates.status(), StatusCode::OK);
    let body = response_json(rates).await;
    assert_eq!(body["data"]["base"], "CLP");
    assert_eq!(decimal(&body["data"]["rates"]["USD"]), dec!(800));

    let converted = app
        .request(
            Method::GET,
            "/api/v1/currency/convert?from=usd&to=CLP&amount=10",
            None,
            None,
        )
        .await;
    assert_eq!(converted.status(), StatusCode::OK);
    let body = response_json(converted).await;
    assert_eq!(body["data"]["from"], "USD");
    assert_eq!(decimal(&body["data"]["converted_amount"]), dec!(8000));

    let unsupported = app
        .request(
            Method::GET,
            "/api/v1/currency/convert?from=XYZ&to=CLP&amount=10",
            None,
            None,
        )
        .await;
    assert_eq!(unsupported.status(), StatusCode::BAD_REQUEST);

    let bad_amount = app
        .request(
            Method::GET,
            "/api/v1/currency/convert?from=USD&to=CLP&amount=ten",
            None,
            None,
        )
        .await;
    assert_eq!(bad_amount.status(), StatusCode::BAD_REQUEST);

    let huge = app
        .request(
            Method::GET,
            "/api/v1/currency/convert?from=USD&to=CLP&amount=79228162514264337593543950335",
            None,
            None,
        )
        .await;
    assert_eq!(huge.status(), StatusCode::BAD_REQUEST);
    assert_eq!(response_json(huge).await["success"], false);
}

#[tokio::test]
async fn malformed_json_uses_error_envelope() {
    let app = TestApp::new().await;
    let request = Request::builder()
        .method(Method::POST)
        .uri("/api/v1/orders")
        .header("content-type", "application/json")
        .header("authorization", format!("Bearer {}", app.token(Role::Seller)))
        .body(Body::from("{\"branch_id\": "))
        .unwrap();

    let response = app.send(request).await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = response_json(response).await;
    assert_eq!(body["success"], false);
    assert!(body["message"].is_string());
}

#[tokio::test]
async fn openapi_document_is_served() {
    let app = TestApp::new().await;

    let response = app.request(Method::GET, "/api/v1/openapi.json", None, None).await;

    assert_eq!(response.status(), StatusCode::OK);
    let body = response_json(response).await;
    assert!(body["paths"]["/api/v1/orders"].is_object());
}
