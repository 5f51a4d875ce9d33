use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// What happened to an inbound gateway notification.
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize, strum::Display,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(32))")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum NotificationOutcome {
    /// Local payment updated
    #[sea_orm(string_value = "processed")]
    Processed,
    /// Matched but nothing to apply (duplicate, stale, or refused downgrade)
    #[sea_orm(string_value = "unchanged")]
    Unchanged,
    /// No local payment corresponds to the gateway payment
    #[sea_orm(string_value = "unmatched")]
    Unmatched,
    /// Event type we do not act on
    #[sea_orm(string_value = "ignored")]
    Ignored,
    #[sea_orm(string_value = "rejected_signature")]
    RejectedSignature,
    /// Dead letter: processing raised an error
    #[sea_orm(string_value = "failed")]
    Failed,
}

/// Audit trail of every notification received, including failures.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "gateway_notifications")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    pub event_type: Option<String>,
    pub resource_id: Option<String>,
    #[sea_orm(column_type = "Text")]
    pub payload: String,
    pub outcome: NotificationOutcome,
    pub detail: Option<String>,
    pub payment_id: Option<i32>,
    pub created_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
