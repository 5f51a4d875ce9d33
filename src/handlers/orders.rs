use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json},
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::str::FromStr;
use utoipa::IntoParams;
use validator::Validate;

use super::common::{page_window, parse_id, AppJson, AppQuery};
use crate::entities::order::{Model as OrderModel, OrderStatus};
use crate::repositories::OrderFilter;
use crate::services::orders::{CreateOrderRequest, OrderResponse, UpdateOrderStatusRequest};
use crate::{
    auth::{AuthUser, Role},
    errors::ServiceError,
    ApiResponse, AppState, ListQuery, PaginatedResponse,
};

/// Filters for `GET /orders`
#[derive(Debug, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct ListOrdersQuery {
    pub offset: Option<u64>,
    pub limit: Option<u64>,
    /// Order status (`pending`, `approved`, ...)
    pub status: Option<String>,
    pub branch_id: Option<i32>,
    pub customer_id: Option<i32>,
    /// Created at or after (RFC 3339)
    pub from: Option<DateTime<Utc>>,
    /// Created at or before (RFC 3339)
    pub to: Option<DateTime<Utc>>,
}

impl ListOrdersQuery {
    fn filter(&self) -> Result<OrderFilter, ServiceError> {
        let status = self
            .status
            .as_deref()
            .map(|s| {
                OrderStatus::from_str(s.trim())
                    .map_err(|_| ServiceError::InvalidStatus(format!("Unknown order status '{}'", s)))
            })
            .transpose()?;
        Ok(OrderFilter {
            status,
            branch_id: self.branch_id,
            customer_id: self.customer_id,
            from: self.from,
            to: self.to,
        })
    }
}

#[utoipa::path(
    get,
    path = "/api/v1/orders",
    summary = "List orders",
    description = "Paginated list of orders, newest first",
    params(ListOrdersQuery),
    responses(
        (status = 200, description = "Orders retrieved successfully", body = ApiResponse<PaginatedResponse<OrderModel>>,
            headers(("X-Request-Id" = String, description = "Unique request id"))
        ),
        (status = 400, description = "Invalid filter", body = crate::errors::ErrorResponse),
        (status = 401, description = "Unauthorized", body = crate::errors::ErrorResponse),
        (status = 403, description = "Forbidden", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "Orders"
)]
pub async fn list_orders(
    State(state): State<AppState>,
    AppQuery(query): AppQuery<ListOrdersQuery>,
) -> Result<Json<ApiResponse<PaginatedResponse<OrderModel>>>, ServiceError> {
    let filter = query.filter()?;
    let (offset, limit) = page_window(
        &ListQuery {
            offset: query.offset,
            limit: query.limit,
        },
        &state.config,
    );
    let (orders, total) = state
        .services
        .orders
        .list_orders(&filter, offset, limit)
        .await?;
    Ok(Json(ApiResponse::success(PaginatedResponse::new(
        orders, total, offset, limit,
    ))))
}

#[utoipa::path(
    post,
    path = "/api/v1/orders",
    summary = "Create order",
    description = "Create a pending order. Prices are taken from the catalog.",
    request_body = CreateOrderRequest,
    responses(
        (status = 201, description = "Order created successfully", body = ApiResponse<OrderResponse>,
            headers(("X-Request-Id" = String, description = "Unique request id"))
        ),
        (status = 400, description = "Invalid request data", body = crate::errors::ErrorResponse),
        (status = 401, description = "Unauthorized", body = crate::errors::ErrorResponse),
        (status = 409, description = "Order number could not be allocated", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "Orders"
)]
pub async fn create_order(
    State(state): State<AppState>,
    auth_user: AuthUser,
    AppJson(payload): AppJson<CreateOrderRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    // Customers always order for themselves
    let customer_id = match auth_user.role {
        Role::Customer => auth_user.user_id,
        _ => payload.customer_id.unwrap_or(auth_user.user_id),
    };
    let order = state
        .services
        .orders
        .create_order(customer_id, payload)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(ApiResponse::success_with_message(order, "Order created")),
    ))
}

#[utoipa::path(
    get,
    path = "/api/v1/orders/{id}",
    summary = "Get order",
    params(("id" = i32, Path, description = "Order ID")),
    responses(
        (status = 200, description = "Order retrieved successfully", body = ApiResponse<OrderResponse>),
        (status = 401, description = "Unauthorized", body = crate::errors::ErrorResponse),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "Orders"
)]
pub async fn get_order(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<OrderResponse>>, ServiceError> {
    let order_id = parse_id(&id, "order")?;
    let order = state.services.orders.get_order(order_id).await?;
    Ok(Json(ApiResponse::success(order)))
}

#[utoipa::path(
    get,
    path = "/api/v1/orders/by-number/{order_number}",
    summary = "Get order by number",
    description = "Retrieve an order by its public order number (e.g., ORD-123456789)",
    params(("order_number" = String, Path, description = "Public order number")),
    responses(
        (status = 200, description = "Order retrieved successfully", body = ApiResponse<OrderResponse>),
        (status = 401, description = "Unauthorized", body = crate::errors::ErrorResponse),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse)
    ),
    security(("Bearer" = [])),
    tag = "Orders"
)]
pub async fn get_order_by_number(
    State(state): State<AppState>,
    Path(order_number): Path<String>,
) -> Result<Json<ApiResponse<OrderResponse>>, ServiceError> {
    let order = state
        .services
        .orders
        .get_order_by_number(order_number.trim())
        .await?;
    Ok(Json(ApiResponse::success(order)))
}

#[utoipa::path(
    put,
    path = "/api/v1/orders/{id}/status",
    summary = "Update order status",
    description = "Move an order through its lifecycle. Repeating the current status is a no-op.",
    params(("id" = i32, Path, description = "Order ID")),
    request_body = UpdateOrderStatusRequest,
    responses(
        (status = 200, description = "Order status updated", body = ApiResponse<OrderResponse>),
        (status = 400, description = "Unknown status or transition not allowed", body = crate::errors::ErrorResponse),
        (status = 401, description = "Unauthorized", body = crate::errors::ErrorResponse),
        (status = 403, description = "Forbidden", body = crate::errors::ErrorResponse),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse),
        (status = 409, description = "Concurrent modification", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "Orders"
)]
pub async fn update_order_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
    auth_user: AuthUser,
    AppJson(payload): AppJson<UpdateOrderStatusRequest>,
) -> Result<Json<ApiResponse<OrderResponse>>, ServiceError> {
    let order_id = parse_id(&id, "order")?;
    payload.validate()?;
    tracing::info!(
        order_id,
        user_id = auth_user.user_id,
        role = %auth_user.role,
        status = %payload.status,
        "Order status change requested"
    );
    let order = state
        .services
        .orders
        .update_status(order_id, &payload.status, payload.notes)
        .await?;
    Ok(Json(ApiResponse::success_with_message(
        order,
        "Order status updated",
    )))
}
