use sea_orm::DatabaseConnection;
use std::sync::Arc;

pub mod notification_repository;
pub mod order_repository;
pub mod payment_repository;
pub mod product_repository;

pub use notification_repository::{NotificationRecord, NotificationRepository};
pub use order_repository::{OrderFilter, OrderRepository};
pub use payment_repository::{PaymentFilter, PaymentRepository};
pub use product_repository::ProductRepository;

/// Repository trait for common database operations
pub trait Repository {
    fn get_db(&self) -> &DatabaseConnection;
}

#[derive(Debug, Clone)]
pub struct BaseRepository {
    db: Arc<DatabaseConnection>,
}

impl BaseRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }
}

impl Repository for BaseRepository {
    fn get_db(&self) -> &DatabaseConnection {
        &self.db
    }
}
