//! Stock reservation guard
//!
//! [`StockReservationGuard::check`] is the cheap read-side test that gives
//! callers a precise error. It can be raced, so [`StockReservationGuard::reserve`]
//! follows it with the repository's atomic compare-and-increment, which is
//! what actually prevents overselling.

use crate::db::ProductRepository;
use crate::error::{ApiError, ApiResult};
use crate::models::Product;

pub const SOLD_OUT: &str = "Product is sold out";
pub const SOLD_OUT_RESERVED: &str = "Product is sold out (reserved)";

#[derive(Debug, Clone, Copy, Default)]
pub struct StockReservationGuard;

impl StockReservationGuard {
    pub fn new() -> Self {
        Self
    }

    /// Reject a purchase when the product has no unit left to sell.
    pub fn check(&self, product: &Product, pending_count: i64) -> ApiResult<()> {
        let Some(limit) = product.effective_stock() else {
            return Ok(());
        };
        let limit = i64::from(limit);
        let sold = i64::from(product.sold_count);

        if sold >= limit {
            return Err(ApiError::BadRequest(SOLD_OUT.to_string()));
        }
        if sold + pending_count >= limit {
            return Err(ApiError::BadRequest(SOLD_OUT_RESERVED.to_string()));
        }
        Ok(())
    }

    /// Check, then atomically reserve one unit.
    ///
    /// Returns `true` when a unit was reserved and must later be committed or
    /// released, `false` for products with unlimited stock.
    pub async fn reserve(&self, products: &dyn ProductRepository, product: &Product) -> ApiResult<bool> {
        if product.effective_stock().is_none() {
            return Ok(false);
        }

        let pending = products.pending_transaction_count(product.id).await?;
        self.check(product, pending)?;

        if !products.try_reserve(product.id).await? {
            tracing::info!(product_id = %product.id, "Lost stock reservation race");
            return Err(ApiError::BadRequest(SOLD_OUT_RESERVED.to_string()));
        }

        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Credentials, ProductStatus};
    use chrono::Utc;
    use uuid::Uuid;

    fn product(stock: i32, sold_count: i32, with_credentials: bool) -> Product {
        Product {
            id: Uuid::new_v4(),
            seller_id: Uuid::new_v4(),
            title: "Mythic account".to_string(),
            game: None,
            price: 100_000,
            stock,
            sold_count,
            reserved_count: 0,
            views: 0,
            status: ProductStatus::Active,
            credentials: with_credentials
                .then(|| [("username", "mythic")].into_iter().collect::<Credentials>()),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn message(result: ApiResult<()>) -> String {
        match result {
            Err(ApiError::BadRequest(msg)) => msg,
            other => panic!("expected BadRequest, got {:?}", other),
        }
    }

    #[test]
    fn test_sold_out() {
        let guard = StockReservationGuard::new();
        assert_eq!(message(guard.check(&product(2, 2, false), 0)), SOLD_OUT);
        assert_eq!(message(guard.check(&product(0, 1, true), 0)), SOLD_OUT);
    }

    #[test]
    fn test_sold_out_by_reservations() {
        let guard = StockReservationGuard::new();
        assert_eq!(message(guard.check(&product(2, 1, false), 1)), SOLD_OUT_RESERVED);
        assert_eq!(message(guard.check(&product(0, 0, true), 1)), SOLD_OUT_RESERVED);
    }

    #[test]
    fn test_available() {
        let guard = StockReservationGuard::new();
        assert!(guard.check(&product(3, 1, false), 1).is_ok());
        assert!(guard.check(&product(0, 0, true), 0).is_ok());
    }

    #[test]
    fn test_unlimited_stock_is_never_checked() {
        let guard = StockReservationGuard::new();
        assert!(guard.check(&product(0, 500, false), 500).is_ok());
    }
}
