//! Wallet ledger collaborator
//!
//! The ledger's bookkeeping lives outside the engine; the engine only debits
//! buyers, credits sellers and refunds buyers through [`WalletService`].
//! [`InMemoryWallet`] backs the development host and the tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum WalletError {
    #[error("Insufficient balance: required {required}, available {available}")]
    InsufficientBalance { required: i64, available: i64 },

    #[error("Invalid amount: {0}")]
    InvalidAmount(i64),

    #[error("Wallet service unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LedgerKind {
    Debit,
    Credit,
    Refund,
}

/// One ledger movement
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LedgerEntry {
    pub id: Uuid,
    pub user_id: Uuid,
    pub kind: LedgerKind,
    pub amount: i64,
    pub balance_after: i64,
    pub description: String,
    /// Transaction id the movement belongs to
    pub reference: String,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait WalletService: Send + Sync {
    async fn debit(
        &self,
        user_id: Uuid,
        amount: i64,
        description: &str,
        reference: &str,
    ) -> Result<LedgerEntry, WalletError>;

    async fn credit(
        &self,
        user_id: Uuid,
        amount: i64,
        description: &str,
        reference: &str,
    ) -> Result<LedgerEntry, WalletError>;

    async fn refund(
        &self,
        user_id: Uuid,
        amount: i64,
        description: &str,
        reference: &str,
    ) -> Result<LedgerEntry, WalletError>;
}

#[derive(Default)]
struct Ledger {
    balances: HashMap<Uuid, i64>,
    entries: Vec<LedgerEntry>,
}

/// Process-local wallet ledger
#[derive(Default)]
pub struct InMemoryWallet {
    ledger: Mutex<Ledger>,
}

impl InMemoryWallet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a user's balance directly
    pub fn set_balance(&self, user_id: Uuid, amount: i64) {
        if let Ok(mut ledger) = self.ledger.lock() {
            ledger.balances.insert(user_id, amount);
        }
    }

    pub fn balance(&self, user_id: Uuid) -> i64 {
        self.ledger
            .lock()
            .map(|l| l.balances.get(&user_id).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    pub fn entries(&self) -> Vec<LedgerEntry> {
        self.ledger
            .lock()
            .map(|l| l.entries.clone())
            .unwrap_or_default()
    }

    pub fn entries_for(&self, user_id: Uuid, kind: LedgerKind) -> Vec<LedgerEntry> {
        self.entries()
            .into_iter()
            .filter(|e| e.user_id == user_id && e.kind == kind)
            .collect()
    }

    fn post(
        &self,
        user_id: Uuid,
        kind: LedgerKind,
        amount: i64,
        description: &str,
        reference: &str,
    ) -> Result<LedgerEntry, WalletError> {
        if amount <= 0 {
            return Err(WalletError::InvalidAmount(amount));
        }

        let mut ledger = self
            .ledger
            .lock()
            .map_err(|_| WalletError::Unavailable("ledger lock poisoned".to_string()))?;

        let available = ledger.balances.get(&user_id).copied().unwrap_or(0);
        let balance_after = match kind {
            LedgerKind::Debit if available < amount => {
                return Err(WalletError::InsufficientBalance {
                    required: amount,
                    available,
                })
            }
            LedgerKind::Debit => available - amount,
            LedgerKind::Credit | LedgerKind::Refund => available + amount,
        };

        ledger.balances.insert(user_id, balance_after);

        let entry = LedgerEntry {
            id: Uuid::new_v4(),
            user_id,
            kind,
            amount,
            balance_after,
            description: description.to_string(),
            reference: reference.to_string(),
            created_at: Utc::now(),
        };
        ledger.entries.push(entry.clone());

        Ok(entry)
    }
}

#[async_trait]
impl WalletService for InMemoryWallet {
    async fn debit(
        &self,
        user_id: Uuid,
        amount: i64,
        description: &str,
        reference: &str,
    ) -> Result<LedgerEntry, WalletError> {
        self.post(user_id, LedgerKind::Debit, amount, description, reference)
    }

    async fn credit(
        &self,
        user_id: Uuid,
        amount: i64,
        description: &str,
        reference: &str,
    ) -> Result<LedgerEntry, WalletError> {
        self.post(user_id, LedgerKind::Credit, amount, description, reference)
    }

    async fn refund(
        &self,
        user_id: Uuid,
        amount: i64,
        description: &str,
        reference: &str,
    ) -> Result<LedgerEntry, WalletError> {
        self.post(user_id, LedgerKind::Refund, amount, description, reference)
    }
}
