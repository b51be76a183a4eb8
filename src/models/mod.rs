//! Marketplace data models shared by the escrow engine
//!
//! Users and products are read-only inputs to the engine; the only product
//! fields it changes are the stock counters, through
//! [`crate::db::ProductRepository`].

use serde::{Deserialize, Serialize};
use sqlx::types::chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use uuid::Uuid;

/// User model
#[derive(Debug, Serialize, Deserialize, sqlx::FromRow, Clone)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    pub phone: Option<String>,
    pub role: UserRole,
    pub status: UserStatus,
    pub verification_status: VerificationStatus,
    /// Average seller rating (0.0-5.0)
    pub seller_rating: f64,
    pub seller_review_count: i32,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn is_admin(&self) -> bool {
        self.role == UserRole::Admin
    }

    pub fn is_verified(&self) -> bool {
        self.verification_status == VerificationStatus::Verified
    }
}

/// User roles
#[derive(Debug, Serialize, Deserialize, sqlx::Type, Clone, Copy, PartialEq, Eq)]
#[sqlx(type_name = "user_role", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    User,
    Admin,
}

/// Account status
#[derive(Debug, Serialize, Deserialize, sqlx::Type, Clone, Copy, PartialEq, Eq)]
#[sqlx(type_name = "user_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum UserStatus {
    Active,
    Inactive,
    Suspended,
    Banned,
}

/// Seller identity verification
#[derive(Debug, Serialize, Deserialize, sqlx::Type, Clone, Copy, PartialEq, Eq)]
#[sqlx(type_name = "verification_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum VerificationStatus {
    Unverified,
    Pending,
    Verified,
    Rejected,
}

/// Delivery payload of a digital good (login, password, recovery email, ...)
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
#[serde(transparent)]
pub struct Credentials(pub BTreeMap<String, String>);

impl Credentials {
    pub fn is_empty(&self) -> bool {
        self.0.values().all(|v| v.trim().is_empty())
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Credentials {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Credentials(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// Product listing
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Product {
    pub id: Uuid,
    pub seller_id: Uuid,
    pub title: String,
    pub game: Option<String>,
    /// Price in minor currency units
    pub price: i64,
    /// Units on offer; 0 means a single-use good when credentials are attached
    pub stock: i32,
    pub sold_count: i32,
    /// Units held by transactions that have not completed yet
    pub reserved_count: i32,
    pub views: i64,
    pub status: ProductStatus,
    pub credentials: Option<Credentials>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Product {
    pub fn has_credentials(&self) -> bool {
        self.credentials.as_ref().is_some_and(|c| !c.is_empty())
    }

    /// Copy of the listing with credentials hidden
    pub fn redacted(&self) -> Product {
        Product {
            credentials: None,
            ..self.clone()
        }
    }

    /// Number of units that may ever be sold, `None` for unlimited stock.
    pub fn effective_stock(&self) -> Option<i32> {
        if self.stock > 0 {
            Some(self.stock)
        } else if self.has_credentials() {
            Some(1)
        } else {
            None
        }
    }

    /// Product status after one more unit is sold
    pub fn status_after_sale(&self) -> ProductStatus {
        match self.effective_stock() {
            Some(_) if self.stock == 0 => ProductStatus::Sold,
            Some(limit) if self.sold_count + 1 >= limit => ProductStatus::SoldOut,
            _ => self.status,
        }
    }
}

/// Product status
#[derive(Debug, Serialize, Deserialize, sqlx::Type, Clone, Copy, PartialEq, Eq)]
#[sqlx(type_name = "product_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ProductStatus {
    Active,
    Inactive,
    Sold,
    SoldOut,
}
