//! In-memory repository used by the development host and the test suite.
//!
//! One store implements all three repository traits over shared maps. Each
//! call takes the lock once and never holds it across an await point.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use super::repository::{
    ProductRepository, RepositoryError, RepositoryResult, TransactionRepository, UserRepository,
};
use crate::models::{Product, User};
use crate::transaction::{EscrowStatus, Transaction, TransactionLog, TransactionStatus};

#[derive(Default)]
struct StoreState {
    transactions: HashMap<Uuid, Transaction>,
    logs: Vec<TransactionLog>,
    products: HashMap<Uuid, Product>,
    users: HashMap<Uuid, User>,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<StoreState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> RepositoryResult<MutexGuard<'_, StoreState>> {
        self.state
            .lock()
            .map_err(|_| RepositoryError::Database("in-memory store lock poisoned".to_string()))
    }

    pub fn insert_user(&self, user: User) {
        if let Ok(mut state) = self.lock() {
            state.users.insert(user.id, user);
        }
    }

    pub fn insert_product(&self, product: Product) {
        if let Ok(mut state) = self.lock() {
            state.products.insert(product.id, product);
        }
    }

    /// Snapshot of a stored product
    pub fn product(&self, id: Uuid) -> Option<Product> {
        self.lock().ok()?.products.get(&id).cloned()
    }

    /// Snapshot of a stored transaction
    pub fn transaction(&self, id: Uuid) -> Option<Transaction> {
        self.lock().ok()?.transactions.get(&id).cloned()
    }

    pub fn transactions_for_product(&self, product_id: Uuid) -> Vec<Transaction> {
        self.lock()
            .map(|state| {
                state
                    .transactions
                    .values()
                    .filter(|tx| tx.product_id == product_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Overwrite a stored transaction without version checks or logging
    pub fn put_transaction(&self, tx: Transaction) {
        if let Ok(mut state) = self.lock() {
            state.transactions.insert(tx.id, tx);
        }
    }
}

#[async_trait]
impl TransactionRepository for MemoryStore {
    async fn insert_with_log(&self, tx: &Transaction, log: &TransactionLog) -> RepositoryResult<()> {
        let mut state = self.lock()?;
        if state.transactions.contains_key(&tx.id) {
            return Err(RepositoryError::Conflict(format!(
                "Transaction {} already exists",
                tx.id
            )));
        }
        state.transactions.insert(tx.id, tx.clone());
        state.logs.push(log.clone());
        Ok(())
    }

    async fn get_by_id(&self, id: Uuid) -> RepositoryResult<Transaction> {
        self.lock()?
            .transactions
            .get(&id)
            .cloned()
            .ok_or_else(|| RepositoryError::NotFound(format!("Transaction {} not found", id)))
    }

    async fn get_by_order_id(&self, order_id: &str) -> RepositoryResult<Transaction> {
        self.lock()?
            .transactions
            .values()
            .find(|tx| tx.gateway_order_id.as_deref() == Some(order_id))
            .cloned()
            .ok_or_else(|| {
                RepositoryError::NotFound(format!("Transaction for order {} not found", order_id))
            })
    }

    async fn update_with_log(
        &self,
        tx: &Transaction,
        expected_version: i64,
        log: &TransactionLog,
    ) -> RepositoryResult<()> {
        let mut state = self.lock()?;
        let current = state
            .transactions
            .get_mut(&tx.id)
            .ok_or_else(|| RepositoryError::NotFound(format!("Transaction {} not found", tx.id)))?;

        if current.version != expected_version {
            return Err(RepositoryError::Conflict(format!(
                "Transaction {} is at version {}, expected {}",
                tx.id, current.version, expected_version
            )));
        }

        *current = tx.clone();
        state.logs.push(log.clone());
        Ok(())
    }

    async fn list_logs(&self, transaction_id: Uuid) -> RepositoryResult<Vec<TransactionLog>> {
        Ok(self
            .lock()?
            .logs
            .iter()
            .filter(|log| log.transaction_id == transaction_id)
            .cloned()
            .collect())
    }

    async fn count_recent_by_buyer(
        &self,
        buyer_id: Uuid,
        since: DateTime<Utc>,
    ) -> RepositoryResult<i64> {
        Ok(self
            .lock()?
            .transactions
            .values()
            .filter(|tx| tx.buyer_id == buyer_id && tx.created_at > since)
            .count() as i64)
    }

    async fn list_due_for_auto_release(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> RepositoryResult<Vec<Transaction>> {
        let state = self.lock()?;
        let mut due: Vec<Transaction> = state
            .transactions
            .values()
            .filter(|tx| {
                tx.status == TransactionStatus::CredentialsDelivered
                    && !tx.buyer_confirmed_credentials
                    && tx.escrow_status == EscrowStatus::Held
                    && tx.auto_release_at.is_some_and(|at| at < now)
            })
            .cloned()
            .collect();

        due.sort_by_key(|tx| tx.auto_release_at);
        due.truncate(limit.max(0) as usize);
        Ok(due)
    }
}

#[async_trait]
impl ProductRepository for MemoryStore {
    async fn get_by_id(&self, id: Uuid) -> RepositoryResult<Product> {
        self.lock()?
            .products
            .get(&id)
            .cloned()
            .ok_or_else(|| RepositoryError::NotFound("Product not found".to_string()))
    }

    async fn pending_transaction_count(&self, product_id: Uuid) -> RepositoryResult<i64> {
        Ok(self
            .lock()?
            .transactions
            .values()
            .filter(|tx| tx.product_id == product_id && tx.stock_reserved)
            .count() as i64)
    }

    async fn try_reserve(&self, product_id: Uuid) -> RepositoryResult<bool> {
        let mut state = self.lock()?;
        let product = state
            .products
            .get_mut(&product_id)
            .ok_or_else(|| RepositoryError::NotFound("Product not found".to_string()))?;

        let Some(limit) = product.effective_stock() else {
            return Ok(true);
        };

        if product.sold_count + product.reserved_count >= limit {
            return Ok(false);
        }

        product.reserved_count += 1;
        product.updated_at = Utc::now();
        Ok(true)
    }

    async fn release_reservation(&self, product_id: Uuid) -> RepositoryResult<()> {
        let mut state = self.lock()?;
        let product = state
            .products
            .get_mut(&product_id)
            .ok_or_else(|| RepositoryError::NotFound("Product not found".to_string()))?;

        product.reserved_count = (product.reserved_count - 1).max(0);
        product.updated_at = Utc::now();
        Ok(())
    }

    async fn commit_sale(&self, product_id: Uuid, from_reservation: bool) -> RepositoryResult<()> {
        let mut state = self.lock()?;
        let product = state
            .products
            .get_mut(&product_id)
            .ok_or_else(|| RepositoryError::NotFound("Product not found".to_string()))?;

        product.status = product.status_after_sale();
        product.sold_count += 1;
        if from_reservation {
            product.reserved_count = (product.reserved_count - 1).max(0);
        }
        product.updated_at = Utc::now();
        Ok(())
    }

    async fn increment_views(&self, product_id: Uuid) -> RepositoryResult<()> {
        let mut state = self.lock()?;
        let product = state
            .products
            .get_mut(&product_id)
            .ok_or_else(|| RepositoryError::NotFound("Product not found".to_string()))?;

        product.views += 1;
        product.updated_at = Utc::now();
        Ok(())
    }
}

#[async_trait]
impl UserRepository for MemoryStore {
    async fn get_by_id(&self, id: Uuid) -> RepositoryResult<User> {
        self.lock()?
            .users
            .get(&id)
            .cloned()
            .ok_or_else(|| RepositoryError::NotFound("User not found".to_string()))
    }
}
