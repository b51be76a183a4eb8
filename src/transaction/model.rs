//! Transaction aggregate and the value types around it

use serde::{Deserialize, Serialize};
use sqlx::types::chrono::{DateTime, Utc};
use std::fmt;
use uuid::Uuid;
use validator::Validate;

use crate::models::Credentials;

/// Marketplace transaction between a buyer and a seller
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Transaction {
    pub id: Uuid,
    pub product_id: Uuid,
    pub buyer_id: Uuid,
    pub seller_id: Uuid,
    /// Middleman handling the exchange, if any
    pub admin_id: Option<Uuid>,

    // Amounts in minor currency units
    pub amount: i64,
    pub fee: i64,
    pub total_amount: i64,
    pub delivery_method: DeliveryMethod,
    pub payment_method: String,

    pub status: TransactionStatus,
    pub payment_status: PaymentStatus,
    pub escrow_status: EscrowStatus,
    pub middleman_status: Option<MiddlemanStatus>,

    pub credentials: Option<Credentials>,
    pub credentials_delivered: bool,
    pub credentials_delivered_at: Option<DateTime<Utc>>,
    pub credentials_accessed_at: Option<DateTime<Utc>>,
    pub buyer_confirmed_credentials: bool,
    pub buyer_confirmed_at: Option<DateTime<Utc>>,
    pub auto_release_at: Option<DateTime<Utc>>,

    pub gateway_order_id: Option<String>,
    pub payment_token: Option<String>,
    pub payment_redirect_url: Option<String>,
    pub virtual_accounts: Vec<VirtualAccount>,
    pub middleman_chat_id: Option<String>,

    pub fraud_score: f64,
    pub security_flags: Vec<String>,
    pub security_level: SecurityLevel,

    /// A unit of the product is held for this transaction
    pub stock_reserved: bool,
    /// The sale has been counted in the product's `sold_count`
    pub inventory_committed: bool,

    pub notes: Option<String>,
    pub cancellation_reason: Option<String>,

    /// Optimistic concurrency counter, bumped on every write
    pub version: i64,

    pub payment_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub refunded_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Transaction {
    pub fn is_payment_settled(&self) -> bool {
        self.payment_status.is_settled()
    }

    pub fn add_security_flag(&mut self, flag: &str) {
        if !self.security_flags.iter().any(|f| f == flag) {
            self.security_flags.push(flag.to_string());
        }
    }

    pub fn has_security_flag(&self, flag: &str) -> bool {
        self.security_flags.iter().any(|f| f == flag)
    }

    /// Copy of the transaction with credentials hidden
    pub fn redacted(&self) -> Transaction {
        Transaction {
            credentials: None,
            ..self.clone()
        }
    }
}

/// Append-only audit record, one per accepted write
#[derive(Debug, Serialize, Deserialize, sqlx::FromRow, Clone)]
pub struct TransactionLog {
    pub id: Uuid,
    pub transaction_id: Uuid,
    pub status: TransactionStatus,
    pub notes: String,
    /// User id of the actor, or `system`
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

impl TransactionLog {
    pub fn new(
        transaction_id: Uuid,
        status: TransactionStatus,
        notes: impl Into<String>,
        created_by: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            transaction_id,
            status,
            notes: notes.into(),
            created_by: created_by.into(),
            created_at,
        }
    }
}

/// Transaction lifecycle status
#[derive(Debug, Serialize, Deserialize, sqlx::Type, Clone, Copy, PartialEq, Eq, Hash)]
#[sqlx(type_name = "transaction_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    PaymentPending,
    PaymentFailed,
    Paid,
    Processing,
    CredentialsDelivered,
    Completed,
    AutoCompleted,
    Disputed,
    Cancelled,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "pending",
            TransactionStatus::PaymentPending => "payment_pending",
            TransactionStatus::PaymentFailed => "payment_failed",
            TransactionStatus::Paid => "paid",
            TransactionStatus::Processing => "processing",
            TransactionStatus::CredentialsDelivered => "credentials_delivered",
            TransactionStatus::Completed => "completed",
            TransactionStatus::AutoCompleted => "auto_completed",
            TransactionStatus::Disputed => "disputed",
            TransactionStatus::Cancelled => "cancelled",
        }
    }

    /// No further status changes are possible
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionStatus::Completed
                | TransactionStatus::AutoCompleted
                | TransactionStatus::Cancelled
        )
    }

    /// A transaction in this status keeps its unit of stock reserved
    pub fn holds_reservation(&self) -> bool {
        matches!(
            self,
            TransactionStatus::Pending
                | TransactionStatus::PaymentPending
                | TransactionStatus::Paid
                | TransactionStatus::Processing
                | TransactionStatus::CredentialsDelivered
                | TransactionStatus::Disputed
        )
    }

    /// Reaching this status counts the sale against the product's stock
    pub fn commits_sale(&self) -> bool {
        matches!(
            self,
            TransactionStatus::CredentialsDelivered
                | TransactionStatus::Completed
                | TransactionStatus::AutoCompleted
        )
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Internal payment status
#[derive(Debug, Serialize, Deserialize, sqlx::Type, Clone, Copy, PartialEq, Eq)]
#[sqlx(type_name = "payment_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Pending,
    /// Settled from the buyer's wallet
    Paid,
    /// Settled through the payment gateway
    Success,
    Failed,
    Expired,
    Refunded,
}

impl PaymentStatus {
    pub fn is_settled(&self) -> bool {
        matches!(self, PaymentStatus::Paid | PaymentStatus::Success)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Paid => "paid",
            PaymentStatus::Success => "success",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Expired => "expired",
            PaymentStatus::Refunded => "refunded",
        }
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where the buyer's funds currently sit
#[derive(Debug, Serialize, Deserialize, sqlx::Type, Clone, Copy, PartialEq, Eq)]
#[sqlx(type_name = "escrow_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum EscrowStatus {
    Pending,
    Held,
    Released,
    Refunded,
}

/// Sub-state of a middleman-mediated transaction
#[derive(Debug, Serialize, Deserialize, sqlx::Type, Clone, Copy, PartialEq, Eq)]
#[sqlx(type_name = "middleman_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum MiddlemanStatus {
    Assigned,
    AwaitingFundsConfirmation,
    FundsReceived,
    Completed,
}

/// How the good reaches the buyer
#[derive(Debug, Serialize, Deserialize, sqlx::Type, Clone, Copy, PartialEq, Eq)]
#[sqlx(type_name = "delivery_method", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMethod {
    Instant,
    Middleman,
}

impl DeliveryMethod {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "instant" => Some(DeliveryMethod::Instant),
            "middleman" => Some(DeliveryMethod::Middleman),
            _ => None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, sqlx::Type, Clone, Copy, PartialEq, Eq)]
#[sqlx(type_name = "security_level", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum SecurityLevel {
    Low,
    Medium,
    High,
}

impl SecurityLevel {
    /// Handling level for a purchase of `total_amount` delivered by `delivery_method`
    pub fn for_purchase(delivery_method: DeliveryMethod, total_amount: i64) -> Self {
        if delivery_method == DeliveryMethod::Instant {
            return SecurityLevel::Low;
        }
        match total_amount {
            a if a >= 10_000_000 => SecurityLevel::High,
            a if a >= 1_000_000 => SecurityLevel::Medium,
            _ => SecurityLevel::Low,
        }
    }
}

/// Bank transfer destination issued by the payment gateway
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct VirtualAccount {
    pub bank: String,
    pub va_number: String,
}

/// Who is acting on a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Actor {
    User(Uuid),
    System,
}

impl Actor {
    /// Value recorded in `TransactionLog::created_by`
    pub fn created_by(&self) -> String {
        match self {
            Actor::User(id) => id.to_string(),
            Actor::System => "system".to_string(),
        }
    }
}

/// Role an actor plays on one particular transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Buyer,
    Seller,
    Admin,
    System,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Role::Buyer => "buyer",
            Role::Seller => "seller",
            Role::Admin => "admin",
            Role::System => "system",
        })
    }
}

// ============================================================================
// Request/Response DTOs
// ============================================================================

/// Request DTO for creating a transaction
#[derive(Debug, Deserialize, Validate)]
pub struct CreateTransactionRequest {
    pub product_id: Uuid,
    pub delivery_method: String,
    #[validate(length(min = 1, max = 50))]
    pub payment_method: String,
    pub middleman_id: Option<Uuid>,
    #[validate(length(max = 1000))]
    pub notes: Option<String>,
}

/// Response DTO for transaction creation
#[derive(Debug, Serialize)]
pub struct CreatedTransaction {
    pub transaction: Transaction,
    pub payment_token: Option<String>,
    pub payment_url: Option<String>,
    pub virtual_accounts: Vec<VirtualAccount>,
}

/// Request DTO for paying a transaction
#[derive(Debug, Deserialize)]
pub struct ProcessPaymentRequest {
    pub payment_method: String,
}

impl ProcessPaymentRequest {
    pub fn wallet() -> Self {
        Self {
            payment_method: "wallet".to_string(),
        }
    }

    pub fn is_wallet(&self) -> bool {
        self.payment_method.eq_ignore_ascii_case("wallet")
    }
}
