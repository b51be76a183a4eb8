//! Central transition table for transaction statuses.
//!
//! Every status change written by [`super::TransactionEngine`] passes through
//! [`authorize`]. Writes that leave the status untouched (payment references,
//! chat ids, security flags) are checked by the operation that makes them.

use super::model::{Role, TransactionStatus};
use crate::error::{ApiError, ApiResult};

use Role::{Admin, Buyer, Seller, System};
use TransactionStatus::*;

/// Roles allowed to move a transaction from `from` to `to`.
///
/// An empty slice means the transition does not exist.
pub fn allowed_roles(from: TransactionStatus, to: TransactionStatus) -> &'static [Role] {
    match (from, to) {
        (Pending, Processing) => &[Admin],
        (Pending, PaymentFailed) => &[System],
        (Pending, Cancelled) => &[Buyer, Seller, Admin, System],

        (PaymentPending, Paid) => &[System],
        (PaymentPending, Completed) => &[Buyer],
        (PaymentPending, PaymentFailed) => &[Buyer, System],
        (PaymentPending, Cancelled) => &[Buyer, Seller, Admin, System],

        (PaymentFailed, Paid) => &[System],
        (PaymentFailed, Pending) => &[System],
        (PaymentFailed, Cancelled) => &[Buyer, Seller, Admin, System],

        (Paid, CredentialsDelivered) => &[Seller, System],
        (Paid, Cancelled) => &[Admin, System],

        (Processing, CredentialsDelivered) => &[Seller],
        (Processing, Completed) => &[Admin],
        (Processing, Disputed) => &[Buyer, Seller],
        (Processing, Cancelled) => &[Admin, System],

        (CredentialsDelivered, Completed) => &[Buyer],
        (CredentialsDelivered, AutoCompleted) => &[System],
        (CredentialsDelivered, Disputed) => &[Buyer],
        (CredentialsDelivered, Cancelled) => &[Admin, System],

        (Disputed, Completed) => &[Admin],
        (Disputed, Cancelled) => &[Admin, System],

        _ => &[],
    }
}

/// Check that `role` may move a transaction from `from` to `to`.
pub fn authorize(from: TransactionStatus, to: TransactionStatus, role: Role) -> ApiResult<()> {
    if from == to {
        return Ok(());
    }

    if from.is_terminal() {
        return Err(ApiError::BadRequest(format!(
            "Transaction is already {} and cannot move to {}",
            from, to
        )));
    }

    let allowed = allowed_roles(from, to);
    if allowed.is_empty() {
        return Err(ApiError::BadRequest(format!(
            "Invalid status transition from {} to {}",
            from, to
        )));
    }

    if !allowed.contains(&role) {
        return Err(ApiError::Forbidden(format!(
            "The {} cannot move a transaction from {} to {}",
            role, from, to
        )));
    }

    Ok(())
}
