use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json},
};
use serde::Deserialize;
use std::collections::HashMap;
use std::str::FromStr;
use utoipa::IntoParams;

use super::common::{page_window, parse_id, AppJson, AppQuery};
use crate::entities::payment::{Model as PaymentModel, PaymentMethod, PaymentStatus};
use crate::middleware_helpers::REQUEST_ID_HEADER;
use crate::repositories::PaymentFilter;
use crate::services::payments::{
    CheckoutRequest, CheckoutResponse, ConfirmPaymentRequest, ManualPaymentRequest,
    NotificationAck, NotificationHeaders, PaymentMethodInfo, PaymentService, PaymentVerification,
};
use crate::{
    auth::AuthUser, errors::ServiceError, ApiResponse, AppState, ListQuery, PaginatedResponse,
};

/// Header MercadoPago uses to sign notifications
const SIGNATURE_HEADER: &str = "x-signature";

#[derive(Debug, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct ListPaymentsQuery {
    pub offset: Option<u64>,
    pub limit: Option<u64>,
    pub order_id: Option<i32>,
    /// `pending`, `approved` or `rejected`
    pub status: Option<String>,
    /// `debit`, `credit`, `bank_transfer` or `gateway_checkout`
    pub method: Option<String>,
}

fn parse_method(raw: &str) -> Result<PaymentMethod, ServiceError> {
    PaymentMethod::from_str(raw.trim())
        .map_err(|_| ServiceError::ValidationError(format!("Unknown payment method '{}'", raw)))
}

#[derive(Debug, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct PendingConfirmationQuery {
    /// `debit`, `credit` or `bank_transfer`
    pub method: Option<String>,
}

impl ListPaymentsQuery {
    fn filter(&self) -> Result<PaymentFilter, ServiceError> {
        let status = self
            .status
            .as_deref()
            .map(|s| {
                PaymentStatus::from_str(s.trim()).map_err(|_| {
                    ServiceError::ValidationError(format!("Unknown payment status '{}'", s))
                })
            })
            .transpose()?;
        let method = self.method.as_deref().map(parse_method).transpose()?;
        Ok(PaymentFilter {
            order_id: self.order_id,
            status,
            method,
        })
    }
}

/// Start a gateway checkout for an order
#[utoipa::path(
    post,
    path = "/api/v1/payments/checkout",
    request_body = CheckoutRequest,
    responses(
        (status = 201, description = "Checkout ready", body = ApiResponse<CheckoutResponse>,
            headers(("X-Request-Id" = String, description = "Unique request identifier"))
        ),
        (status = 400, description = "Order cannot be paid", body = crate::errors::ErrorResponse),
        (status = 401, description = "Unauthorized", body = crate::errors::ErrorResponse),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse),
        (status = 503, description = "Payment gateway unavailable", body = crate::errors::ErrorResponse)
    ),
    security(("Bearer" = [])),
    tag = "Payments"
)]
pub async fn checkout(
    State(state): State<AppState>,
    AppJson(request): AppJson<CheckoutRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let result = state
        .services
        .payments
        .initiate_checkout(request.order_id)
        .await?;
    let message = if result.reused {
        "Existing checkout returned"
    } else {
        "Checkout created"
    };
    Ok((
        StatusCode::CREATED,
        Json(ApiResponse::success_with_message(result, message)),
    ))
}

/// Gateway notification endpoint. Always answers 200 so the gateway stops retrying;
/// failures are recorded instead.
#[utoipa::path(
    post,
    path = "/api/v1/payments/webhook",
    request_body(content = String, description = "Raw MercadoPago notification", content_type = "application/json"),
    responses(
        (status = 200, description = "Notification received", body = NotificationAck)
    ),
    tag = "Payments"
)]
pub async fn payment_webhook(
    State(state): State<AppState>,
    query: Option<Query<HashMap<String, String>>>,
    headers: HeaderMap,
    body: Bytes,
) -> Json<NotificationAck> {
    let query = query.map(|Query(q)| q).unwrap_or_default();
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    let notification_headers = NotificationHeaders {
        signature: header(SIGNATURE_HEADER),
        request_id: header(REQUEST_ID_HEADER),
    };

    Json(
        state
            .services
            .payments
            .handle_notification(&query, &notification_headers, &body)
            .await,
    )
}

/// Payment status with its order, synced with the gateway when still pending
#[utoipa::path(
    get,
    path = "/api/v1/payments/verify/{payment_id}",
    params(("payment_id" = i32, Path, description = "Payment ID")),
    responses(
        (status = 200, description = "Payment verification", body = ApiResponse<PaymentVerification>),
        (status = 401, description = "Unauthorized", body = crate::errors::ErrorResponse),
        (status = 404, description = "Payment not found", body = crate::errors::ErrorResponse)
    ),
    security(("Bearer" = [])),
    tag = "Payments"
)]
pub async fn verify_payment(
    State(state): State<AppState>,
    Path(payment_id): Path<String>,
) -> Result<Json<ApiResponse<PaymentVerification>>, ServiceError> {
    let payment_id = parse_id(&payment_id, "payment")?;
    let verification = state.services.payments.verify(payment_id).await?;
    Ok(Json(ApiResponse::success(verification)))
}

#[utoipa::path(
    get,
    path = "/api/v1/payments/order/{order_id}",
    params(("order_id" = i32, Path, description = "Order ID")),
    responses(
        (status = 200, description = "Payments of the order, newest first", body = ApiResponse<Vec<PaymentModel>>),
        (status = 401, description = "Unauthorized", body = crate::errors::ErrorResponse)
    ),
    security(("Bearer" = [])),
    tag = "Payments"
)]
pub async fn get_order_payments(
    State(state): State<AppState>,
    Path(order_id): Path<String>,
) -> Result<Json<ApiResponse<Vec<PaymentModel>>>, ServiceError> {
    let order_id = parse_id(&order_id, "order")?;
    let payments = state.services.payments.payments_for_order(order_id).await?;
    Ok(Json(ApiResponse::success(payments)))
}

#[utoipa::path(
    get,
    path = "/api/v1/payments/{id}",
    params(("id" = i32, Path, description = "Payment ID")),
    responses(
        (status = 200, description = "Payment", body = ApiResponse<PaymentModel>),
        (status = 401, description = "Unauthorized", body = crate::errors::ErrorResponse),
        (status = 404, description = "Payment not found", body = crate::errors::ErrorResponse)
    ),
    security(("Bearer" = [])),
    tag = "Payments"
)]
pub async fn get_payment(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<PaymentModel>>, ServiceError> {
    let payment_id = parse_id(&id, "payment")?;
    let payment = state.services.payments.get_payment(payment_id).await?;
    Ok(Json(ApiResponse::success(payment)))
}

#[utoipa::path(
    get,
    path = "/api/v1/payments",
    params(ListPaymentsQuery),
    responses(
        (status = 200, description = "Payments, newest first", body = ApiResponse<PaginatedResponse<PaymentModel>>),
        (status = 400, description = "Invalid filter", body = crate::errors::ErrorResponse),
        (status = 401, description = "Unauthorized", body = crate::errors::ErrorResponse),
        (status = 403, description = "Forbidden", body = crate::errors::ErrorResponse)
    ),
    security(("Bearer" = [])),
    tag = "Payments"
)]
pub async fn list_payments(
    State(state): State<AppState>,
    AppQuery(query): AppQuery<ListPaymentsQuery>,
) -> Result<Json<ApiResponse<PaginatedResponse<PaymentModel>>>, ServiceError> {
    let filter = query.filter()?;
    let (offset, limit) = page_window(
        &ListQuery {
            offset: query.offset,
            limit: query.limit,
        },
        &state.config,
    );
    let (payments, total) = state
        .services
        .payments
        .list_payments(&filter, offset, limit)
        .await?;
    Ok(Json(ApiResponse::success(PaginatedResponse::new(
        payments, total, offset, limit,
    ))))
}

#[utoipa::path(
    get,
    path = "/api/v1/payments/methods",
    responses(
        (status = 200, description = "Supported payment methods", body = ApiResponse<Vec<PaymentMethodInfo>>)
    ),
    tag = "Payments"
)]
pub async fn payment_methods() -> Json<ApiResponse<Vec<PaymentMethodInfo>>> {
    Json(ApiResponse::success(PaymentService::payment_methods()))
}

/// Register a card or bank-transfer payment taken at a branch
#[utoipa::path(
    post,
    path = "/api/v1/payments/manual",
    request_body = ManualPaymentRequest,
    responses(
        (status = 201, description = "Payment registered, pending confirmation", body = ApiResponse<PaymentModel>),
        (status = 400, description = "Invalid request or order cannot be paid", body = crate::errors::ErrorResponse),
        (status = 401, description = "Unauthorized", body = crate::errors::ErrorResponse),
        (status = 403, description = "Forbidden", body = crate::errors::ErrorResponse),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse)
    ),
    security(("Bearer" = [])),
    tag = "Payments"
)]
pub async fn register_manual_payment(
    State(state): State<AppState>,
    auth_user: AuthUser,
    AppJson(request): AppJson<ManualPaymentRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let payment = state
        .services
        .payments
        .register_manual_payment(request)
        .await?;
    tracing::info!(
        payment_id = payment.id,
        user_id = auth_user.user_id,
        "Branch payment registered"
    );
    Ok((
        StatusCode::CREATED,
        Json(ApiResponse::success_with_message(
            payment,
            "Payment registered, pending confirmation",
        )),
    ))
}

#[utoipa::path(
    get,
    path = "/api/v1/payments/pending-confirmation",
    params(PendingConfirmationQuery),
    responses(
        (status = 200, description = "Branch payments awaiting confirmation, oldest first", body = ApiResponse<Vec<PaymentModel>>),
        (status = 400, description = "Invalid method", body = crate::errors::ErrorResponse),
        (status = 401, description = "Unauthorized", body = crate::errors::ErrorResponse),
        (status = 403, description = "Forbidden", body = crate::errors::ErrorResponse)
    ),
    security(("Bearer" = [])),
    tag = "Payments"
)]
pub async fn pending_confirmation(
    State(state): State<AppState>,
    AppQuery(query): AppQuery<PendingConfirmationQuery>,
) -> Result<Json<ApiResponse<Vec<PaymentModel>>>, ServiceError> {
    let method = query.method.as_deref().map(parse_method).transpose()?;
    let payments = state.services.payments.pending_confirmation(method).await?;
    Ok(Json(ApiResponse::success(payments)))
}

/// Approve or reject a pending branch payment
#[utoipa::path(
    put,
    path = "/api/v1/payments/{id}/confirm",
    params(("id" = i32, Path, description = "Payment ID")),
    request_body = ConfirmPaymentRequest,
    responses(
        (status = 200, description = "Payment confirmed", body = ApiResponse<PaymentModel>),
        (status = 400, description = "Payment cannot take that status", body = crate::errors::ErrorResponse),
        (status = 401, description = "Unauthorized", body = crate::errors::ErrorResponse),
        (status = 403, description = "Forbidden", body = crate::errors::ErrorResponse),
        (status = 404, description = "Payment not found", body = crate::errors::ErrorResponse),
        (status = 409, description = "Concurrent modification", body = crate::errors::ErrorResponse)
    ),
    security(("Bearer" = [])),
    tag = "Payments"
)]
pub async fn confirm_payment(
    State(state): State<AppState>,
    auth_user: AuthUser,
    Path(id): Path<String>,
    AppJson(request): AppJson<ConfirmPaymentRequest>,
) -> Result<Json<ApiResponse<PaymentModel>>, ServiceError> {
    let payment_id = parse_id(&id, "payment")?;
    let payment = state
        .services
        .payments
        .confirm_manual_payment(payment_id, request)
        .await?;
    tracing::info!(
        payment_id,
        status = %payment.status,
        user_id = auth_user.user_id,
        "Branch payment confirmed"
    );
    Ok(Json(ApiResponse::success(payment)))
}
