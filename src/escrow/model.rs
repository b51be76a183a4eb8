//! Escrow request and report types

use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::models::Credentials;

/// Seller's hand-over of the account credentials
#[derive(Debug, Deserialize, Clone)]
pub struct DeliverCredentialsRequest {
    pub credentials: Credentials,
}

/// Buyer's verdict on delivered credentials
#[derive(Debug, Deserialize, Clone, Validate)]
pub struct ConfirmCredentialsRequest {
    pub is_working: bool,
    #[validate(length(max = 1000))]
    pub notes: Option<String>,
}

impl ConfirmCredentialsRequest {
    pub fn working() -> Self {
        Self {
            is_working: true,
            notes: None,
        }
    }

    pub fn not_working(notes: impl Into<String>) -> Self {
        Self {
            is_working: false,
            notes: Some(notes.into()),
        }
    }
}

/// Outcome of one auto-release sweep
#[derive(Debug, Serialize, Clone, Copy, Default, PartialEq, Eq)]
pub struct AutoReleaseReport {
    /// Candidates returned by the due-list query
    pub examined: usize,
    pub released: usize,
    /// Candidates that changed state before they could be released
    pub skipped: usize,
    pub failed: usize,
}
