use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json},
};
use serde::Deserialize;
use utoipa::IntoParams;

use super::common::{page_window, parse_id, AppJson, AppQuery};
use crate::entities::product::Model as ProductModel;
use crate::services::products::{CreateProductRequest, UpdateProductRequest};
use crate::{
    auth::AuthUser, errors::ServiceError, ApiResponse, AppState, ListQuery, PaginatedResponse,
};

/// Active catalog products, paginated
#[utoipa::path(
    get,
    path = "/api/v1/products",
    params(ListQuery),
    responses(
        (status = 200, description = "Active products", body = ApiResponse<PaginatedResponse<ProductModel>>)
    ),
    tag = "Products"
)]
pub async fn list_products(
    State(state): State<AppState>,
    AppQuery(query): AppQuery<ListQuery>,
) -> Result<Json<ApiResponse<PaginatedResponse<ProductModel>>>, ServiceError> {
    let (offset, limit) = page_window(&query, &state.config);
    let (products, total) = state
        .services
        .products
        .list_products(false, offset, limit)
        .await?;
    Ok(Json(ApiResponse::success(PaginatedResponse::new(
        products, total, offset, limit,
    ))))
}

#[derive(Debug, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct SearchProductsQuery {
    /// Matched against product name and code
    pub q: String,
    pub offset: Option<u64>,
    pub limit: Option<u64>,
}

/// Search active products by name or code
#[utoipa::path(
    get,
    path = "/api/v1/products/search",
    params(SearchProductsQuery),
    responses(
        (status = 200, description = "Matching products", body = ApiResponse<PaginatedResponse<ProductModel>>),
        (status = 400, description = "Missing search term", body = crate::errors::ErrorResponse)
    ),
    tag = "Products"
)]
pub async fn search_products(
    State(state): State<AppState>,
    AppQuery(query): AppQuery<SearchProductsQuery>,
) -> Result<Json<ApiResponse<PaginatedResponse<ProductModel>>>, ServiceError> {
    let (offset, limit) = page_window(
        &ListQuery {
            offset: query.offset,
            limit: query.limit,
        },
        &state.config,
    );
    let (products, total) = state
        .services
        .products
        .search_products(&query.q, offset, limit)
        .await?;
    Ok(Json(ApiResponse::success(PaginatedResponse::new(
        products, total, offset, limit,
    ))))
}

#[utoipa::path(
    get,
    path = "/api/v1/products/{id}",
    params(("id" = i32, Path, description = "Product ID")),
    responses(
        (status = 200, description = "Product", body = ApiResponse<ProductModel>),
        (status = 404, description = "Product not found", body = crate::errors::ErrorResponse)
    ),
    tag = "Products"
)]
pub async fn get_product(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<ProductModel>>, ServiceError> {
    let product_id = parse_id(&id, "product")?;
    let product = state.services.products.get_product(product_id).await?;
    Ok(Json(ApiResponse::success(product)))
}

#[utoipa::path(
    post,
    path = "/api/v1/products",
    request_body = CreateProductRequest,
    responses(
        (status = 201, description = "Product created", body = ApiResponse<ProductModel>),
        (status = 400, description = "Invalid request data", body = crate::errors::ErrorResponse),
        (status = 401, description = "Unauthorized", body = crate::errors::ErrorResponse),
        (status = 403, description = "Forbidden", body = crate::errors::ErrorResponse),
        (status = 409, description = "Product code already exists", body = crate::errors::ErrorResponse)
    ),
    security(("Bearer" = [])),
    tag = "Products"
)]
pub async fn create_product(
    State(state): State<AppState>,
    auth_user: AuthUser,
    AppJson(payload): AppJson<CreateProductRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let product = state.services.products.create_product(payload).await?;
    tracing::info!(product_id = product.id, user_id = auth_user.user_id, "Product created");
    Ok((
        StatusCode::CREATED,
        Json(ApiResponse::success_with_message(product, "Product created")),
    ))
}

#[utoipa::path(
    put,
    path = "/api/v1/products/{id}",
    params(("id" = i32, Path, description = "Product ID")),
    request_body = UpdateProductRequest,
    responses(
        (status = 200, description = "Product updated", body = ApiResponse<ProductModel>),
        (status = 400, description = "Invalid request data", body = crate::errors::ErrorResponse),
        (status = 401, description = "Unauthorized", body = crate::errors::ErrorResponse),
        (status = 403, description = "Forbidden", body = crate::errors::ErrorResponse),
        (status = 404, description = "Product not found", body = crate::errors::ErrorResponse)
    ),
    security(("Bearer" = [])),
    tag = "Products"
)]
pub async fn update_product(
    State(state): State<AppState>,
    auth_user: AuthUser,
    Path(id): Path<String>,
    AppJson(payload): AppJson<UpdateProductRequest>,
) -> Result<Json<ApiResponse<ProductModel>>, ServiceError> {
    let product_id = parse_id(&id, "product")?;
    let product = state
        .services
        .products
        .update_product(product_id, payload)
        .await?;
    tracing::info!(product_id, user_id = auth_user.user_id, "Product updated");
    Ok(Json(ApiResponse::success_with_message(product, "Product updated")))
}

/// Deactivate a product. It disappears from the catalog; past orders are untouched.
#[utoipa::path(
    delete,
    path = "/api/v1/products/{id}",
    params(("id" = i32, Path, description = "Product ID")),
    responses(
        (status = 200, description = "Product deactivated", body = ApiResponse<ProductModel>),
        (status = 401, description = "Unauthorized", body = crate::errors::ErrorResponse),
        (status = 403, description = "Forbidden", body = crate::errors::ErrorResponse),
        (status = 404, description = "Product not found", body = crate::errors::ErrorResponse)
    ),
    security(("Bearer" = [])),
    tag = "Products"
)]
pub async fn deactivate_product(
    State(state): State<AppState>,
    auth_user: AuthUser,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<ProductModel>>, ServiceError> {
    let product_id = parse_id(&id, "product")?;
    let product = state.services.products.deactivate_product(product_id).await?;
    tracing::info!(product_id, user_id = auth_user.user_id, "Product deactivated");
    Ok(Json(ApiResponse::success_with_message(product, "Product deactivated")))
}
