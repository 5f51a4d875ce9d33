use axum::{extract::State, response::Json};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::str::FromStr;
use utoipa::IntoParams;

use super::common::AppQuery;
use crate::services::currency::{Conversion, RateTable};
use crate::{errors::ServiceError, ApiResponse, AppState};

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct ConvertQuery {
    /// Source currency code, e.g. `USD`
    pub from: String,
    /// Target currency code, e.g. `CLP`
    pub to: String,
    /// Amount in the source currency
    pub amount: String,
}

#[utoipa::path(
    get,
    path = "/api/v1/currency/rates",
    responses(
        (status = 200, description = "Current exchange rates against CLP", body = ApiResponse<RateTable>)
    ),
    tag = "Currency"
)]
pub async fn get_rates(State(state): State<AppState>) -> Json<ApiResponse<RateTable>> {
    Json(ApiResponse::success(state.services.currency.rates().await))
}

#[utoipa::path(
    get,
    path = "/api/v1/currency/convert",
    params(ConvertQuery),
    responses(
        (status = 200, description = "Converted amount", body = ApiResponse<Conversion>),
        (status = 400, description = "Invalid amount or unsupported currency", body = crate::errors::ErrorResponse)
    ),
    tag = "Currency"
)]
pub async fn convert(
    State(state): State<AppState>,
    AppQuery(query): AppQuery<ConvertQuery>,
) -> Result<Json<ApiResponse<Conversion>>, ServiceError> {
    let amount = Decimal::from_str(query.amount.trim()).map_err(|_| {
        ServiceError::ValidationError(format!("Invalid amount '{}'", query.amount))
    })?;
    let conversion = state
        .services
        .currency
        .convert(amount, &query.from, &query.to)
        .await?;
    Ok(Json(ApiResponse::success(conversion)))
}
