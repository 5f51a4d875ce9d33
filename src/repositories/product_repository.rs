use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, DatabaseConnection, EntityTrait, PaginatorTrait,
    QueryFilter, QueryOrder, QuerySelect,
};
use std::sync::Arc;

use crate::entities::product::{
    ActiveModel as ProductActiveModel, Column, Entity as Product, Model as ProductModel,
};
use crate::errors::ServiceError;
use crate::repositories::Repository;

use super::BaseRepository;

#[derive(Debug, Clone)]
pub struct ProductRepository {
    base: BaseRepository,
}

impl ProductRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self {
            base: BaseRepository::new(db),
        }
    }

    pub async fn find_by_id(&self, id: i32) -> Result<Option<ProductModel>, ServiceError> {
        Ok(Product::find_by_id(id).one(self.get_db()).await?)
    }

    /// Active products among `ids`; missing or inactive ids are simply absent.
    pub async fn find_active_by_ids(&self, ids: &[i32]) -> Result<Vec<ProductModel>, ServiceError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        Ok(Product::find()
            .filter(Column::Id.is_in(ids.iter().copied()))
            .filter(Column::Active.eq(true))
            .all(self.get_db())
            .await?)
    }

    pub async fn list(
        &self,
        active_only: bool,
        offset: u64,
        limit: u64,
    ) -> Result<(Vec<ProductModel>, u64), ServiceError> {
        let mut query = Product::find();
        if active_only {
            query = query.filter(Column::Active.eq(true));
        }
        let total = query.clone().count(self.get_db()).await?;
        let products = query
            .order_by_asc(Column::Name)
            .order_by_asc(Column::Id)
            .offset(offset)
            .limit(limit)
            .all(self.get_db())
            .await?;
        Ok((products, total))
    }

    /// Active products with `term` in the name or code, by name.
    pub async fn search(
        &self,
        term: &str,
        offset: u64,
        limit: u64,
    ) -> Result<(Vec<ProductModel>, u64), ServiceError> {
        let query = Product::find().filter(Column::Active.eq(true)).filter(
            Condition::any()
                .add(Column::Name.contains(term))
                .add(Column::Code.contains(term)),
        );
        let total = query.clone().count(self.get_db()).await?;
        let products = query
            .order_by_asc(Column::Name)
            .order_by_asc(Column::Id)
            .offset(offset)
            .limit(limit)
            .all(self.get_db())
            .await?;
        Ok((products, total))
    }

    pub async fn insert(&self, product: ProductActiveModel) -> Result<ProductModel, ServiceError> {
        Ok(product.insert(self.get_db()).await?)
    }

    pub async fn update(&self, product: ProductActiveModel) -> Result<ProductModel, ServiceError> {
        Ok(product.update(self.get_db()).await?)
    }
}

impl Repository for ProductRepository {
    fn get_db(&self) -> &DatabaseConnection {
        self.base.get_db()
    }
}
