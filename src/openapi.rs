use axum::response::Json;
use utoipa::openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme};
use utoipa::{Modify, OpenApi};

use crate::entities::{
    order::{DeliveryType, OrderStatus},
    payment::{PaymentMethod, PaymentStatus},
};
use crate::handlers;
use crate::services::{orders, payments, products};

/// Registers the `Bearer` JWT scheme referenced by protected operations.
struct BearerAuth;

impl Modify for BearerAuth {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "Bearer",
                SecurityScheme::Http(
                    HttpBuilder::new()
                        .scheme(HttpAuthScheme::Bearer)
                        .bearer_format("JWT")
                        .build(),
                ),
            );
        }
    }
}

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Ferremas API",
        version = "1.0.0",
        description = r#"
# Ferremas API

Orders, MercadoPago checkout and payment reconciliation for Ferremas stores.

## Authentication

Protected endpoints expect an HS256 JWT:

```
Authorization: Bearer <your-jwt-token>
```

## Error Handling

Errors share one envelope:

```json
{
  "success": false,
  "error": "NotFound",
  "message": "Order 99999 not found",
  "timestamp": "2024-01-01T00:00:00Z"
}
```

## Pagination

List endpoints accept `offset` (default 0) and `limit` (default 20, max 100).
        "#
    ),
    servers(
        (url = "http://localhost:8080", description = "Local development")
    ),
    tags(
        (name = "Orders", description = "Order management endpoints"),
        (name = "Payments", description = "Checkout, branch payments, gateway notifications and lookup"),
        (name = "Products", description = "Product catalog"),
        (name = "Currency", description = "Exchange rates and conversion"),
        (name = "Health", description = "Health check endpoints")
    ),
    paths(
        // Orders
        handlers::orders::list_orders,
        handlers::orders::create_order,
        handlers::orders::get_order,
        handlers::orders::get_order_by_number,
        handlers::orders::update_order_status,
        // Payments
        handlers::payments::checkout,
        handlers::payments::payment_webhook,
        handlers::payments::verify_payment,
        handlers::payments::get_order_payments,
        handlers::payments::get_payment,
        handlers::payments::list_payments,
        handlers::payments::payment_methods,
        handlers::payments::register_manual_payment,
        handlers::payments::pending_confirmation,
        handlers::payments::confirm_payment,
        // Products
        handlers::products::list_products,
        handlers::products::get_product,
        handlers::products::create_product,
        handlers::products::search_products,
        handlers::products::update_product,
        handlers::products::deactivate_product,
        // Currency
        handlers::currency::get_rates,
        handlers::currency::convert,
        // Health
        handlers::health::health_check,
        handlers::health::status,
    ),
    components(
        schemas(
            OrderStatus,
            DeliveryType,
            PaymentStatus,
            PaymentMethod,
            orders::CreateOrderRequest,
            orders::LineItemRequest,
            orders::UpdateOrderStatusRequest,
            payments::CheckoutRequest,
            payments::CheckoutResponse,
            payments::PaymentVerification,
            payments::PaymentMethodInfo,
            payments::NotificationAck,
            payments::ManualPaymentRequest,
            payments::ConfirmPaymentRequest,
            products::CreateProductRequest,
            products::UpdateProductRequest,
            crate::auth::Role,
            crate::errors::ErrorResponse,
        )
    ),
    modifiers(&BearerAuth)
)]
pub struct ApiDocV1;

/// `GET /api/v1/openapi.json`
pub async fn serve_openapi() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDocV1::openapi())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_lists_routes_and_bearer_scheme() {
        let json = serde_json::to_string(&ApiDocV1::openapi()).expect("serializes");
        assert!(json.contains("Ferremas API"));
        assert!(json.contains("/api/v1/orders/{id}/status"));
        assert!(json.contains("/api/v1/payments/webhook"));
        assert!(json.contains("/api/v1/payments/{id}/confirm"));
        assert!(json.contains("/api/v1/products/search"));
        assert!(json.contains("\"Bearer\""));
    }
}
