//! Postgres implementation of the repository contracts.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::PgPool;
use uuid::Uuid;

use super::repository::{
    ProductRepository, RepositoryError, RepositoryResult, TransactionRepository, UserRepository,
};
use crate::models::{Credentials, Product, ProductStatus, User};
use crate::transaction::{
    DeliveryMethod, EscrowStatus, MiddlemanStatus, PaymentStatus, SecurityLevel, Transaction,
    TransactionLog, TransactionStatus, VirtualAccount,
};

/// Postgres-backed repository for transactions, products and users.
#[derive(Clone)]
pub struct PostgresRepository {
    pool: PgPool,
}

impl PostgresRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const TRANSACTION_COLUMNS: &str = r#"
    id, product_id, buyer_id, seller_id, admin_id,
    amount, fee, total_amount, delivery_method, payment_method,
    status, payment_status, escrow_status, middleman_status,
    credentials, credentials_delivered, credentials_delivered_at, credentials_accessed_at,
    buyer_confirmed_credentials, buyer_confirmed_at, auto_release_at,
    gateway_order_id, payment_token, payment_redirect_url, virtual_accounts, middleman_chat_id,
    fraud_score, security_flags, security_level,
    stock_reserved, inventory_committed, notes, cancellation_reason, version,
    payment_at, completed_at, cancelled_at, refunded_at, created_at, updated_at
"#;

/// A product carries credentials when at least one value is non-blank
const HAS_CREDENTIALS: &str =
    "EXISTS (SELECT 1 FROM jsonb_each_text(credentials) AS c(key, value) WHERE c.value ~ '\\S')";

#[async_trait]
impl TransactionRepository for PostgresRepository {
    async fn insert_with_log(&self, tx: &Transaction, log: &TransactionLog) -> RepositoryResult<()> {
        let mut db_tx = self.pool.begin().await?;

        sqlx::query(&format!(
            r#"
            INSERT INTO transactions ({})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10,
                    $11, $12, $13, $14, $15, $16, $17, $18, $19, $20,
                    $21, $22, $23, $24, $25, $26, $27, $28, $29, $30,
                    $31, $32, $33, $34, $35, $36, $37, $38, $39, $40)
            "#,
            TRANSACTION_COLUMNS
        ))
        .bind(tx.id)
        .bind(tx.product_id)
        .bind(tx.buyer_id)
        .bind(tx.seller_id)
        .bind(tx.admin_id)
        .bind(tx.amount)
        .bind(tx.fee)
        .bind(tx.total_amount)
        .bind(tx.delivery_method)
        .bind(&tx.payment_method)
        .bind(tx.status)
        .bind(tx.payment_status)
        .bind(tx.escrow_status)
        .bind(tx.middleman_status)
        .bind(tx.credentials.clone().map(Json))
        .bind(tx.credentials_delivered)
        .bind(tx.credentials_delivered_at)
        .bind(tx.credentials_accessed_at)
        .bind(tx.buyer_confirmed_credentials)
        .bind(tx.buyer_confirmed_at)
        .bind(tx.auto_release_at)
        .bind(&tx.gateway_order_id)
        .bind(&tx.payment_token)
        .bind(&tx.payment_redirect_url)
        .bind(Json(tx.virtual_accounts.clone()))
        .bind(&tx.middleman_chat_id)
        .bind(tx.fraud_score)
        .bind(&tx.security_flags)
        .bind(tx.security_level)
        .bind(tx.stock_reserved)
        .bind(tx.inventory_committed)
        .bind(&tx.notes)
        .bind(&tx.cancellation_reason)
        .bind(tx.version)
        .bind(tx.payment_at)
        .bind(tx.completed_at)
        .bind(tx.cancelled_at)
        .bind(tx.refunded_at)
        .bind(tx.created_at)
        .bind(tx.updated_at)
        .execute(&mut *db_tx)
        .await?;

        insert_log(&mut db_tx, log).await?;
        db_tx.commit().await?;

        Ok(())
    }

    async fn get_by_id(&self, id: Uuid) -> RepositoryResult<Transaction> {
        let row = sqlx::query_as::<_, TransactionRow>(&format!(
            "SELECT {} FROM transactions WHERE id = $1",
            TRANSACTION_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(TransactionRow::into_domain)
            .ok_or_else(|| RepositoryError::NotFound(format!("Transaction {} not found", id)))
    }

    async fn get_by_order_id(&self, order_id: &str) -> RepositoryResult<Transaction> {
        let row = sqlx::query_as::<_, TransactionRow>(&format!(
            "SELECT {} FROM transactions WHERE gateway_order_id = $1",
            TRANSACTION_COLUMNS
        ))
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(TransactionRow::into_domain).ok_or_else(|| {
            RepositoryError::NotFound(format!("Transaction for order {} not found", order_id))
        })
    }

    async fn update_with_log(
        &self,
        tx: &Transaction,
        expected_version: i64,
        log: &TransactionLog,
    ) -> RepositoryResult<()> {
        let mut db_tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE transactions SET
                admin_id = $3, payment_method = $4,
                status = $5, payment_status = $6, escrow_status = $7, middleman_status = $8,
                credentials = $9, credentials_delivered = $10, credentials_delivered_at = $11,
                credentials_accessed_at = $12, buyer_confirmed_credentials = $13,
                buyer_confirmed_at = $14, auto_release_at = $15,
                gateway_order_id = $16, payment_token = $17, payment_redirect_url = $18,
                virtual_accounts = $19, middleman_chat_id = $20,
                fraud_score = $21, security_flags = $22, security_level = $23,
                stock_reserved = $24, inventory_committed = $25,
                notes = $26, cancellation_reason = $27, version = $28,
                payment_at = $29, completed_at = $30, cancelled_at = $31, refunded_at = $32,
                updated_at = $33
            WHERE id = $1 AND version = $2
            "#,
        )
        .bind(tx.id)
        .bind(expected_version)
        .bind(tx.admin_id)
        .bind(&tx.payment_method)
        .bind(tx.status)
        .bind(tx.payment_status)
        .bind(tx.escrow_status)
        .bind(tx.middleman_status)
        .bind(tx.credentials.clone().map(Json))
        .bind(tx.credentials_delivered)
        .bind(tx.credentials_delivered_at)
        .bind(tx.credentials_accessed_at)
        .bind(tx.buyer_confirmed_credentials)
        .bind(tx.buyer_confirmed_at)
        .bind(tx.auto_release_at)
        .bind(&tx.gateway_order_id)
        .bind(&tx.payment_token)
        .bind(&tx.payment_redirect_url)
        .bind(Json(tx.virtual_accounts.clone()))
        .bind(&tx.middleman_chat_id)
        .bind(tx.fraud_score)
        .bind(&tx.security_flags)
        .bind(tx.security_level)
        .bind(tx.stock_reserved)
        .bind(tx.inventory_committed)
        .bind(&tx.notes)
        .bind(&tx.cancellation_reason)
        .bind(tx.version)
        .bind(tx.payment_at)
        .bind(tx.completed_at)
        .bind(tx.cancelled_at)
        .bind(tx.refunded_at)
        .bind(tx.updated_at)
        .execute(&mut *db_tx)
        .await?;

        if result.rows_affected() == 0 {
            db_tx.rollback().await?;
            return Err(RepositoryError::Conflict(format!(
                "Transaction {} was modified concurrently (expected version {})",
                tx.id, expected_version
            )));
        }

        insert_log(&mut db_tx, log).await?;
        db_tx.commit().await?;

        Ok(())
    }

    async fn list_logs(&self, transaction_id: Uuid) -> RepositoryResult<Vec<TransactionLog>> {
        let logs = sqlx::query_as::<_, TransactionLog>(
            r#"
            SELECT id, transaction_id, status, notes, created_by, created_at
            FROM transaction_logs
            WHERE transaction_id = $1
            ORDER BY created_at ASC, seq ASC
            "#,
        )
        .bind(transaction_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(logs)
    }

    async fn count_recent_by_buyer(
        &self,
        buyer_id: Uuid,
        since: DateTime<Utc>,
    ) -> RepositoryResult<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM transactions WHERE buyer_id = $1 AND created_at > $2",
        )
        .bind(buyer_id)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    async fn list_due_for_auto_release(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> RepositoryResult<Vec<Transaction>> {
        let rows = sqlx::query_as::<_, TransactionRow>(&format!(
            r#"
            SELECT {} FROM transactions
            WHERE status = 'credentials_delivered'
              AND buyer_confirmed_credentials = FALSE
              AND escrow_status = 'held'
              AND auto_release_at < $1
            ORDER BY auto_release_at ASC
            LIMIT $2
            "#,
            TRANSACTION_COLUMNS
        ))
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(TransactionRow::into_domain).collect())
    }
}

async fn insert_log(
    db_tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    log: &TransactionLog,
) -> RepositoryResult<()> {
    sqlx::query(
        r#"
        INSERT INTO transaction_logs (id, transaction_id, status, notes, created_by, created_at)
        VALUES ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(log.id)
    .bind(log.transaction_id)
    .bind(log.status)
    .bind(&log.notes)
    .bind(&log.created_by)
    .bind(log.created_at)
    .execute(&mut **db_tx)
    .await?;

    Ok(())
}

#[async_trait]
impl ProductRepository for PostgresRepository {
    async fn get_by_id(&self, id: Uuid) -> RepositoryResult<Product> {
        let row = sqlx::query_as::<_, ProductRow>(
            r#"
            SELECT id, seller_id, title, game, price, stock, sold_count, reserved_count,
                   views, status, credentials, created_at, updated_at
            FROM products WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(ProductRow::into_domain)
            .ok_or_else(|| RepositoryError::NotFound("Product not found".to_string()))
    }

    async fn pending_transaction_count(&self, product_id: Uuid) -> RepositoryResult<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM transactions WHERE product_id = $1 AND stock_reserved",
        )
        .bind(product_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    async fn try_reserve(&self, product_id: Uuid) -> RepositoryResult<bool> {
        let reserved = sqlx::query_scalar::<_, bool>(&format!(
            r#"
            WITH target AS (
                SELECT id, stock > 0 OR {has_credentials} AS limited
                FROM products WHERE id = $1
            ),
            reserved AS (
                UPDATE products p
                SET reserved_count = p.reserved_count + 1, updated_at = NOW()
                FROM target
                WHERE p.id = target.id
                  AND target.limited
                  AND p.sold_count + p.reserved_count < GREATEST(p.stock, 1)
                RETURNING p.id
            )
            SELECT NOT target.limited OR EXISTS (SELECT 1 FROM reserved) FROM target
            "#,
            has_credentials = HAS_CREDENTIALS
        ))
        .bind(product_id)
        .fetch_optional(&self.pool)
        .await?;

        reserved.ok_or_else(|| RepositoryError::NotFound("Product not found".to_string()))
    }

    async fn release_reservation(&self, product_id: Uuid) -> RepositoryResult<()> {
        sqlx::query(
            r#"
            UPDATE products
            SET reserved_count = GREATEST(reserved_count - 1, 0), updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(product_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn commit_sale(&self, product_id: Uuid, from_reservation: bool) -> RepositoryResult<()> {
        sqlx::query(&format!(
            r#"
            UPDATE products SET
                sold_count = sold_count + 1,
                reserved_count = CASE WHEN $2 THEN GREATEST(reserved_count - 1, 0)
                                      ELSE reserved_count END,
                status = CASE
                    WHEN stock = 0 AND {has_credentials} THEN 'sold'::product_status
                    WHEN stock > 0 AND sold_count + 1 >= stock THEN 'sold_out'::product_status
                    ELSE status END,
                updated_at = NOW()
            WHERE id = $1
            "#,
            has_credentials = HAS_CREDENTIALS
        ))
        .bind(product_id)
        .bind(from_reservation)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn increment_views(&self, product_id: Uuid) -> RepositoryResult<()> {
        let result = sqlx::query(
            "UPDATE products SET views = views + 1, updated_at = NOW() WHERE id = $1",
        )
        .bind(product_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound("Product not found".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl UserRepository for PostgresRepository {
    async fn get_by_id(&self, id: Uuid) -> RepositoryResult<User> {
        let user = sqlx::query_as::<_, User>(
            r#"
            SELECT id, username, email, phone, role, status, verification_status,
                   seller_rating, seller_review_count, created_at
            FROM users WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        user.ok_or_else(|| RepositoryError::NotFound("User not found".to_string()))
    }
}

/// Internal row type for SQLx. Not exposed outside the adapter.
#[derive(Debug, sqlx::FromRow)]
struct TransactionRow {
    id: Uuid,
    product_id: Uuid,
    buyer_id: Uuid,
    seller_id: Uuid,
    admin_id: Option<Uuid>,
    amount: i64,
    fee: i64,
    total_amount: i64,
    delivery_method: DeliveryMethod,
    payment_method: String,
    status: TransactionStatus,
    payment_status: PaymentStatus,
    escrow_status: EscrowStatus,
    middleman_status: Option<MiddlemanStatus>,
    credentials: Option<Json<Credentials>>,
    credentials_delivered: bool,
    credentials_delivered_at: Option<DateTime<Utc>>,
    credentials_accessed_at: Option<DateTime<Utc>>,
    buyer_confirmed_credentials: bool,
    buyer_confirmed_at: Option<DateTime<Utc>>,
    auto_release_at: Option<DateTime<Utc>>,
    gateway_order_id: Option<String>,
    payment_token: Option<String>,
    payment_redirect_url: Option<String>,
    virtual_accounts: Json<Vec<VirtualAccount>>,
    middleman_chat_id: Option<String>,
    fraud_score: f64,
    security_flags: Vec<String>,
    security_level: SecurityLevel,
    stock_reserved: bool,
    inventory_committed: bool,
    notes: Option<String>,
    cancellation_reason: Option<String>,
    version: i64,
    payment_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    cancelled_at: Option<DateTime<Utc>>,
    refunded_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TransactionRow {
    fn into_domain(self) -> Transaction {
        Transaction {
            id: self.id,
            product_id: self.product_id,
            buyer_id: self.buyer_id,
            seller_id: self.seller_id,
            admin_id: self.admin_id,
            amount: self.amount,
            fee: self.fee,
            total_amount: self.total_amount,
            delivery_method: self.delivery_method,
            payment_method: self.payment_method,
            status: self.status,
            payment_status: self.payment_status,
            escrow_status: self.escrow_status,
            middleman_status: self.middleman_status,
            credentials: self.credentials.map(|c| c.0),
            credentials_delivered: self.credentials_delivered,
            credentials_delivered_at: self.credentials_delivered_at,
            credentials_accessed_at: self.credentials_accessed_at,
            buyer_confirmed_credentials: self.buyer_confirmed_credentials,
            buyer_confirmed_at: self.buyer_confirmed_at,
            auto_release_at: self.auto_release_at,
            gateway_order_id: self.gateway_order_id,
            payment_token: self.payment_token,
            payment_redirect_url: self.payment_redirect_url,
            virtual_accounts: self.virtual_accounts.0,
            middleman_chat_id: self.middleman_chat_id,
            fraud_score: self.fraud_score,
            security_flags: self.security_flags,
            security_level: self.security_level,
            stock_reserved: self.stock_reserved,
            inventory_committed: self.inventory_committed,
            notes: self.notes,
            cancellation_reason: self.cancellation_reason,
            version: self.version,
            payment_at: self.payment_at,
            completed_at: self.completed_at,
            cancelled_at: self.cancelled_at,
            refunded_at: self.refunded_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ProductRow {
    id: Uuid,
    seller_id: Uuid,
    title: String,
    game: Option<String>,
    price: i64,
    stock: i32,
    sold_count: i32,
    reserved_count: i32,
    views: i64,
    status: ProductStatus,
    credentials: Option<Json<Credentials>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl ProductRow {
    fn into_domain(self) -> Product {
        Product {
            id: self.id,
            seller_id: self.seller_id,
            title: self.title,
            game: self.game,
            price: self.price,
            stock: self.stock,
            sold_count: self.sold_count,
            reserved_count: self.reserved_count,
            views: self.views,
            status: self.status,
            credentials: self.credentials.map(|c| c.0),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}
