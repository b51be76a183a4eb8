//! Repository contracts used by the escrow engine.
//!
//! The engine only talks to storage through these traits. Every mutation the
//! engine relies on for correctness is a single atomic call: a version-checked
//! transaction update together with its log entry, and a compare-and-increment
//! stock reservation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::models::{Product, User};
use crate::transaction::{Transaction, TransactionLog};

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("{0}")]
    NotFound(String),

    /// Optimistic concurrency check failed
    #[error("{0}")]
    Conflict(String),

    #[error("Database error: {0}")]
    Database(String),
}

impl From<sqlx::Error> for RepositoryError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => RepositoryError::NotFound("Resource not found".to_string()),
            _ => RepositoryError::Database(err.to_string()),
        }
    }
}

pub type RepositoryResult<T> = Result<T, RepositoryError>;

#[async_trait]
pub trait TransactionRepository: Send + Sync {
    /// Persist a new transaction together with its first log entry
    async fn insert_with_log(&self, tx: &Transaction, log: &TransactionLog) -> RepositoryResult<()>;

    async fn get_by_id(&self, id: Uuid) -> RepositoryResult<Transaction>;

    /// Look up a transaction by the order id sent to the payment gateway
    async fn get_by_order_id(&self, order_id: &str) -> RepositoryResult<Transaction>;

    /// Replace the stored transaction if its version is still `expected_version`,
    /// appending `log` in the same atomic step. Fails with
    /// [`RepositoryError::Conflict`] when another writer got there first.
    async fn update_with_log(
        &self,
        tx: &Transaction,
        expected_version: i64,
        log: &TransactionLog,
    ) -> RepositoryResult<()>;

    /// Audit trail in insertion order
    async fn list_logs(&self, transaction_id: Uuid) -> RepositoryResult<Vec<TransactionLog>>;

    async fn count_recent_by_buyer(
        &self,
        buyer_id: Uuid,
        since: DateTime<Utc>,
    ) -> RepositoryResult<i64>;

    /// Delivered, unconfirmed holds whose release deadline is before `now`,
    /// oldest deadline first
    async fn list_due_for_auto_release(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> RepositoryResult<Vec<Transaction>>;
}

#[async_trait]
pub trait ProductRepository: Send + Sync {
    async fn get_by_id(&self, id: Uuid) -> RepositoryResult<Product>;

    /// Transactions currently holding a unit of this product
    async fn pending_transaction_count(&self, product_id: Uuid) -> RepositoryResult<i64>;

    /// Atomically reserve one unit. Returns `false` when
    /// `sold_count + reserved_count` already reached the effective stock.
    async fn try_reserve(&self, product_id: Uuid) -> RepositoryResult<bool>;

    async fn release_reservation(&self, product_id: Uuid) -> RepositoryResult<()>;

    /// Count one sale, consuming a reservation when `from_reservation` is set,
    /// and mark the product sold out when its stock is exhausted
    async fn commit_sale(&self, product_id: Uuid, from_reservation: bool) -> RepositoryResult<()>;

    async fn increment_views(&self, product_id: Uuid) -> RepositoryResult<()>;
}

#[async_trait]
pub trait UserRepository: Send + Sync {
    async fn get_by_id(&self, id: Uuid) -> RepositoryResult<User>;
}
