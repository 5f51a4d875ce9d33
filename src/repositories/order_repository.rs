use chrono::{DateTime, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, ConnectionTrait, DatabaseConnection, DbErr,
    EntityTrait, PaginatorTrait, QueryFilter, QueryOrder, QuerySelect, TransactionTrait,
};
use std::sync::Arc;

use crate::entities::order::{
    ActiveModel as OrderActiveModel, Column, Entity as Order, Model as OrderModel, OrderStatus,
};
use crate::entities::order_line_item::{
    self, ActiveModel as LineItemActiveModel, Entity as OrderLineItem, Model as LineItemModel,
};
use crate::errors::ServiceError;
use crate::repositories::Repository;

use super::BaseRepository;

/// Filters accepted by [`OrderRepository::list`].
#[derive(Debug, Clone, Default)]
pub struct OrderFilter {
    pub status: Option<OrderStatus>,
    pub branch_id: Option<i32>,
    pub customer_id: Option<i32>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

impl OrderFilter {
    fn condition(&self) -> Condition {
        let mut cond = Condition::all();
        if let Some(status) = self.status {
            cond = cond.add(Column::Status.eq(status));
        }
        if let Some(branch_id) = self.branch_id {
            cond = cond.add(Column::BranchId.eq(branch_id));
        }
        if let Some(customer_id) = self.customer_id {
            cond = cond.add(Column::CustomerId.eq(customer_id));
        }
        if let Some(from) = self.from {
            cond = cond.add(Column::CreatedAt.gte(from));
        }
        if let Some(to) = self.to {
            cond = cond.add(Column::CreatedAt.lte(to));
        }
        cond
    }
}

/// Repository for order operations
#[derive(Debug, Clone)]
pub struct OrderRepository {
    base: BaseRepository,
}

impl OrderRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self {
            base: BaseRepository::new(db),
        }
    }

    pub async fn find_by_id(&self, id: i32) -> Result<Option<OrderModel>, ServiceError> {
        Ok(Self::find_by_id_in(self.get_db(), id).await?)
    }

    /// Same lookup, on any connection or open transaction.
    pub async fn find_by_id_in<C: ConnectionTrait>(
        conn: &C,
        id: i32,
    ) -> Result<Option<OrderModel>, DbErr> {
        Order::find_by_id(id).one(conn).await
    }

    pub async fn find_by_number(&self, number: &str) -> Result<Option<OrderModel>, ServiceError> {
        Ok(Order::find()
            .filter(Column::OrderNumber.eq(number))
            .one(self.get_db())
            .await?)
    }

    /// Line items of an order in insertion order
    pub async fn line_items(&self, order_id: i32) -> Result<Vec<LineItemModel>, ServiceError> {
        Ok(OrderLineItem::find()
            .filter(order_line_item::Column::OrderId.eq(order_id))
            .order_by_asc(order_line_item::Column::Id)
            .all(self.get_db())
            .await?)
    }

    /// Filtered listing, newest first. Returns the page and the total match count.
    pub async fn list(
        &self,
        filter: &OrderFilter,
        offset: u64,
        limit: u64,
    ) -> Result<(Vec<OrderModel>, u64), ServiceError> {
        let query = Order::find().filter(filter.condition());
        let total = query.clone().count(self.get_db()).await?;
        let orders = query
            .order_by_desc(Column::CreatedAt)
            .order_by_desc(Column::Id)
            .offset(offset)
            .limit(limit)
            .all(self.get_db())
            .await?;
        Ok((orders, total))
    }

    /// Inserts the order header and its line items atomically.
    pub async fn insert_with_items(
        &self,
        order: OrderActiveModel,
        items: Vec<LineItemActiveModel>,
    ) -> Result<(OrderModel, Vec<LineItemModel>), ServiceError> {
        let txn = self.get_db().begin().await?;

        let saved = order.insert(&txn).await?;
        let mut saved_items = Vec::with_capacity(items.len());
        for mut item in items {
            item.order_id = sea_orm::Set(saved.id);
            saved_items.push(item.insert(&txn).await?);
        }

        txn.commit().await?;
        Ok((saved, saved_items))
    }

    /// Applies `changes` only if the row still carries `expected_version`.
    /// Returns whether a row was updated.
    pub async fn compare_and_set<C: ConnectionTrait>(
        conn: &C,
        id: i32,
        expected_version: i32,
        changes: OrderActiveModel,
    ) -> Result<bool, DbErr> {
        let result = Order::update_many()
            .set(changes)
            .filter(Column::Id.eq(id))
            .filter(Column::Version.eq(expected_version))
            .exec(conn)
            .await?;
        Ok(result.rows_affected == 1)
    }
}

impl Repository for OrderRepository {
    fn get_db(&self) -> &DatabaseConnection {
        self.base.get_db()
    }
}
