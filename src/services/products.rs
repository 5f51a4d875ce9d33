use crate::{
    entities::product::{ActiveModel as ProductActiveModel, Model as ProductModel},
    errors::ServiceError,
    repositories::ProductRepository,
};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use sea_orm::{ActiveValue::NotSet, DatabaseConnection, Set};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument};
use utoipa::ToSchema;
use validator::{Validate, ValidationError};

#[derive(Debug, Clone, Serialize, Deserialize, Validate, ToSchema)]
#[serde(deny_unknown_fields)]
pub struct CreateProductRequest {
    #[validate(length(min = 1, max = 64, message = "must be between 1 and 64 characters"))]
    pub code: String,
    #[validate(length(min = 1, max = 200, message = "must be between 1 and 200 characters"))]
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[validate(custom = "validate_price")]
    pub price: Decimal,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

/// Highest unit price the catalog accepts.
pub const MAX_PRODUCT_PRICE: Decimal = dec!(1000000000);

fn validate_price(price: &Decimal) -> Result<(), ValidationError> {
    let message = if *price <= Decimal::ZERO {
        "must be greater than 0"
    } else if *price > MAX_PRODUCT_PRICE {
        "must be at most 1000000000"
    } else {
        return Ok(());
    };
    let mut err = ValidationError::new("price");
    err.message = Some(message.into());
    Err(err)
}

/// Partial product update; absent fields keep their value.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate, ToSchema)]
#[serde(deny_unknown_fields)]
pub struct UpdateProductRequest {
    #[serde(default)]
    #[validate(length(min = 1, max = 200, message = "must be between 1 and 200 characters"))]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    #[validate(custom = "validate_price")]
    pub price: Option<Decimal>,
    #[serde(default)]
    pub active: Option<bool>,
}

impl UpdateProductRequest {
    fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.description.is_none()
            && self.price.is_none()
            && self.active.is_none()
    }
}

/// Catalog reads and admin maintenance.
#[derive(Clone)]
pub struct ProductService {
    products: ProductRepository,
}

impl ProductService {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self {
            products: ProductRepository::new(db),
        }
    }

    pub async fn get_product(&self, id: i32) -> Result<ProductModel, ServiceError> {
        self.products
            .find_by_id(id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Product {} not found", id)))
    }

    pub async fn list_products(
        &self,
        include_inactive: bool,
        offset: u64,
        limit: u64,
    ) -> Result<(Vec<ProductModel>, u64), ServiceError> {
        self.products.list(!include_inactive, offset, limit).await
    }

    #[instrument(skip(self, request), fields(code = %request.code))]
    pub async fn create_product(
        &self,
        request: CreateProductRequest,
    ) -> Result<ProductModel, ServiceError> {
        request.validate()?;

        let product = ProductActiveModel {
            code: Set(request.code.trim().to_string()),
            name: Set(request.name.trim().to_string()),
            description: Set(request.description),
            price: Set(request.price.round_dp(2)),
            active: Set(request.active),
            ..Default::default()
        };
        let saved = self.products.insert(product).await.map_err(|e| match e {
            ServiceError::Conflict(_) => {
                ServiceError::Conflict(format!("Product code '{}' already exists", request.code))
            }
            other => other,
        })?;

        info!(product_id = saved.id, "Product created");
        Ok(saved)
    }

    /// Active products whose name or code contains `term`.
    pub async fn search_products(
        &self,
        term: &str,
        offset: u64,
        limit: u64,
    ) -> Result<(Vec<ProductModel>, u64), ServiceError> {
        let term = term.trim();
        if term.is_empty() {
            return Err(ServiceError::ValidationError(
                "search term must not be empty".to_string(),
            ));
        }
        self.products.search(term, offset, limit).await
    }

    #[instrument(skip(self, request))]
    pub async fn update_product(
        &self,
        id: i32,
        request: UpdateProductRequest,
    ) -> Result<ProductModel, ServiceError> {
        request.validate()?;
        if request.is_empty() {
            return Err(ServiceError::ValidationError(
                "at least one field must be provided".to_string(),
            ));
        }
        let existing = self.get_product(id).await?;

        let changes = ProductActiveModel {
            id: Set(existing.id),
            name: request
                .name
                .map(|n| Set(n.trim().to_string()))
                .unwrap_or(NotSet),
            description: request.description.map(|d| Set(Some(d))).unwrap_or(NotSet),
            price: request.price.map(|p| Set(p.round_dp(2))).unwrap_or(NotSet),
            active: request.active.map(Set).unwrap_or(NotSet),
            ..Default::default()
        };
        let updated = self.products.update(changes).await?;

        info!(product_id = id, "Product updated");
        Ok(updated)
    }

    /// Hides a product from the catalog and from new orders. Existing
    /// orders keep their line items.
    #[instrument(skip(self))]
    pub async fn deactivate_product(&self, id: i32) -> Result<ProductModel, ServiceError> {
        let existing = self.get_product(id).await?;
        if !existing.active {
            return Ok(existing);
        }
        let updated = self
            .products
            .update(ProductActiveModel {
                id: Set(existing.id),
                active: Set(false),
                ..Default::default()
            })
            .await?;

        info!(product_id = id, "Product deactivated");
        Ok(updated)
    }
}
