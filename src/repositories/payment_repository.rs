use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, DatabaseConnection, EntityTrait, PaginatorTrait,
    QueryFilter, QueryOrder, QuerySelect,
};
use std::sync::Arc;

use crate::entities::payment::{
    ActiveModel as PaymentActiveModel, Column, Entity as Payment, Model as PaymentModel,
    PaymentMethod, PaymentStatus,
};
use crate::errors::ServiceError;
use crate::repositories::Repository;

use super::BaseRepository;

#[derive(Debug, Clone, Default)]
pub struct PaymentFilter {
    pub order_id: Option<i32>,
    pub status: Option<PaymentStatus>,
    pub method: Option<PaymentMethod>,
}

impl PaymentFilter {
    fn condition(&self) -> Condition {
        let mut cond = Condition::all();
        if let Some(order_id) = self.order_id {
            cond = cond.add(Column::OrderId.eq(order_id));
        }
        if let Some(status) = self.status {
            cond = cond.add(Column::Status.eq(status));
        }
        if let Some(method) = self.method {
            cond = cond.add(Column::Method.eq(method));
        }
        cond
    }
}

#[derive(Debug, Clone)]
pub struct PaymentRepository {
    base: BaseRepository,
}

impl PaymentRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self {
            base: BaseRepository::new(db),
        }
    }

    pub async fn find_by_id(&self, id: i32) -> Result<Option<PaymentModel>, ServiceError> {
        Ok(Payment::find_by_id(id).one(self.get_db()).await?)
    }

    /// Payments of an order, most recent first
    pub async fn find_by_order(&self, order_id: i32) -> Result<Vec<PaymentModel>, ServiceError> {
        Ok(Payment::find()
            .filter(Column::OrderId.eq(order_id))
            .order_by_desc(Column::CreatedAt)
            .order_by_desc(Column::Id)
            .all(self.get_db())
            .await?)
    }

    /// Most recent payment of the order in the given status, optionally
    /// restricted to one method
    pub async fn latest_for_order_with_status(
        &self,
        order_id: i32,
        status: PaymentStatus,
        method: Option<PaymentMethod>,
    ) -> Result<Option<PaymentModel>, ServiceError> {
        let mut query = Payment::find()
            .filter(Column::OrderId.eq(order_id))
            .filter(Column::Status.eq(status));
        if let Some(method) = method {
            query = query.filter(Column::Method.eq(method));
        }
        Ok(query
            .order_by_desc(Column::CreatedAt)
            .order_by_desc(Column::Id)
            .one(self.get_db())
            .await?)
    }

    pub async fn find_by_gateway_payment_id(
        &self,
        gateway_payment_id: &str,
    ) -> Result<Option<PaymentModel>, ServiceError> {
        Ok(Payment::find()
            .filter(Column::GatewayPaymentId.eq(gateway_payment_id))
            .one(self.get_db())
            .await?)
    }

    pub async fn find_by_internal_ref(
        &self,
        internal_ref: &str,
    ) -> Result<Option<PaymentModel>, ServiceError> {
        Ok(Payment::find()
            .filter(Column::InternalRef.eq(internal_ref))
            .one(self.get_db())
            .await?)
    }

    /// Loose match on the stored gateway reference of checkout payments.
    pub async fn find_by_external_ref_containing(
        &self,
        fragment: &str,
    ) -> Result<Option<PaymentModel>, ServiceError> {
        if fragment.trim().is_empty() {
            return Ok(None);
        }
        Ok(Payment::find()
            .filter(Column::Method.eq(PaymentMethod::GatewayCheckout))
            .filter(Column::ExternalRef.contains(fragment))
            .order_by_desc(Column::CreatedAt)
            .one(self.get_db())
            .await?)
    }

    pub async fn list(
        &self,
        filter: &PaymentFilter,
        offset: u64,
        limit: u64,
    ) -> Result<(Vec<PaymentModel>, u64), ServiceError> {
        let query = Payment::find().filter(filter.condition());
        let total = query.clone().count(self.get_db()).await?;
        let payments = query
            .order_by_desc(Column::CreatedAt)
            .order_by_desc(Column::Id)
            .offset(offset)
            .limit(limit)
            .all(self.get_db())
            .await?;
        Ok((payments, total))
    }

    /// Pending branch payments (anything but gateway checkout) waiting for
    /// confirmation, oldest first.
    pub async fn pending_confirmation(
        &self,
        method: Option<PaymentMethod>,
    ) -> Result<Vec<PaymentModel>, ServiceError> {
        let mut query = Payment::find()
            .filter(Column::Status.eq(PaymentStatus::Pending))
            .filter(Column::Method.ne(PaymentMethod::GatewayCheckout));
        if let Some(method) = method {
            query = query.filter(Column::Method.eq(method));
        }
        Ok(query
            .order_by_asc(Column::CreatedAt)
            .order_by_asc(Column::Id)
            .all(self.get_db())
            .await?)
    }

    pub async fn insert(&self, payment: PaymentActiveModel) -> Result<PaymentModel, ServiceError> {
        Ok(payment.insert(self.get_db()).await?)
    }

    /// Applies `changes` only if the row still carries `expected_version`.
    pub async fn compare_and_set(
        &self,
        id: i32,
        expected_version: i32,
        changes: PaymentActiveModel,
    ) -> Result<bool, ServiceError> {
        let result = Payment::update_many()
            .set(changes)
            .filter(Column::Id.eq(id))
            .filter(Column::Version.eq(expected_version))
            .exec(self.get_db())
            .await?;
        Ok(result.rows_affected == 1)
    }
}

impl Repository for PaymentRepository {
    fn get_db(&self) -> &DatabaseConnection {
        self.base.get_db()
    }
}
