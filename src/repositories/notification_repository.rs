use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, Set,
};
use std::sync::Arc;

use crate::entities::gateway_notification::{
    ActiveModel as NotificationActiveModel, Column, Entity as GatewayNotification,
    Model as NotificationModel, NotificationOutcome,
};
use crate::errors::ServiceError;
use crate::repositories::Repository;

use super::BaseRepository;

/// Append-only log of inbound gateway notifications.
#[derive(Debug, Clone)]
pub struct NotificationRepository {
    base: BaseRepository,
}

/// A notification ready to be recorded.
#[derive(Debug, Clone)]
pub struct NotificationRecord {
    pub event_type: Option<String>,
    pub resource_id: Option<String>,
    pub payload: String,
    pub outcome: NotificationOutcome,
    pub detail: Option<String>,
    pub payment_id: Option<i32>,
}

impl NotificationRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self {
            base: BaseRepository::new(db),
        }
    }

    pub async fn record(
        &self,
        record: NotificationRecord,
    ) -> Result<NotificationModel, ServiceError> {
        let model = NotificationActiveModel {
            event_type: Set(record.event_type),
            resource_id: Set(record.resource_id),
            payload: Set(record.payload),
            outcome: Set(record.outcome),
            detail: Set(record.detail),
            payment_id: Set(record.payment_id),
            created_at: Set(chrono::Utc::now()),
            ..Default::default()
        };
        Ok(model.insert(self.get_db()).await?)
    }

    pub async fn find_by_outcome(
        &self,
        outcome: NotificationOutcome,
    ) -> Result<Vec<NotificationModel>, ServiceError> {
        Ok(GatewayNotification::find()
            .filter(Column::Outcome.eq(outcome))
            .order_by_asc(Column::Id)
            .all(self.get_db())
            .await?)
    }
}

impl Repository for NotificationRepository {
    fn get_db(&self) -> &DatabaseConnection {
        self.base.get_db()
    }
}
