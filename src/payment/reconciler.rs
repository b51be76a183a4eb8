//! Payment reconciliation
//!
//! Folds gateway verdicts into transactions, whether they arrive as webhook
//! notifications or from a status poll. Notifications may be repeated or
//! arrive out of order; a status never regresses from settled, and a repeat
//! of the current status writes nothing.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::gateway::PaymentGateway;
use super::model::PaymentNotification;
use crate::error::{ApiError, ApiResult};
use crate::escrow::EscrowManager;
use crate::notifier::MarketplaceEvent;
use crate::transaction::{
    Actor, DeliveryMethod, EscrowStatus, MiddlemanStatus, PaymentStatus, Transaction,
    TransactionEngine, TransactionStatus, STOCK_CONFLICT_FLAG,
};

/// Flag set when money arrives for a transaction that is already closed
pub const PAYMENT_AFTER_CLOSE_FLAG: &str = "payment_after_cancellation";

/// Flag set when the gateway refunds a payment that was already paid out
pub const REFUND_AFTER_RELEASE_FLAG: &str = "refund_after_release";

/// Map a gateway `transaction_status`/`fraud_status` pair to a payment status
pub fn map_gateway_status(transaction_status: &str, fraud_status: &str) -> PaymentStatus {
    let transaction_status = transaction_status.trim().to_ascii_lowercase();
    let fraud_status = fraud_status.trim().to_ascii_lowercase();

    if fraud_status == "deny" {
        return PaymentStatus::Failed;
    }

    match transaction_status.as_str() {
        "capture" | "settlement" => match fraud_status.as_str() {
            "" | "accept" => PaymentStatus::Success,
            // "challenge" stays pending until the gateway decides
            _ => PaymentStatus::Pending,
        },
        "pending" => PaymentStatus::Pending,
        "cancel" | "deny" | "expire" | "failure" => PaymentStatus::Failed,
        "refund" | "partial_refund" => PaymentStatus::Refunded,
        other => {
            tracing::warn!(transaction_status = other, "Unknown gateway status, treating as pending");
            PaymentStatus::Pending
        }
    }
}

/// What a notification did
#[derive(Debug)]
pub enum CallbackOutcome {
    /// Nothing changed; the notification repeated what is already recorded
    Duplicate { transaction: Transaction },
    Applied {
        transaction: Transaction,
        /// Background credential delivery for instant purchases
        delivery: Option<JoinHandle<()>>,
    },
}

impl CallbackOutcome {
    pub fn transaction(&self) -> &Transaction {
        match self {
            CallbackOutcome::Duplicate { transaction } => transaction,
            CallbackOutcome::Applied { transaction, .. } => transaction,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, CallbackOutcome::Duplicate { .. })
    }
}

pub struct PaymentReconciler {
    engine: Arc<TransactionEngine>,
    escrow: Arc<EscrowManager>,
    gateway: Arc<dyn PaymentGateway>,
    server_key: Option<String>,
}

impl PaymentReconciler {
    pub fn new(
        engine: Arc<TransactionEngine>,
        escrow: Arc<EscrowManager>,
        gateway: Arc<dyn PaymentGateway>,
    ) -> Self {
        Self {
            engine,
            escrow,
            gateway,
            server_key: None,
        }
    }

    /// Reject notifications whose signature does not match `server_key`
    pub fn with_signature_verification(mut self, server_key: impl Into<String>) -> Self {
        self.server_key = Some(server_key.into());
        self
    }

    pub fn verifies_signatures(&self) -> bool {
        self.server_key.is_some()
    }

    pub fn parse_notification(&self, body: &[u8]) -> ApiResult<PaymentNotification> {
        let notification: PaymentNotification = serde_json::from_slice(body)?;
        if notification.order_id.trim().is_empty() {
            return Err(ApiError::BadRequest(
                "Notification is missing order_id".to_string(),
            ));
        }
        Ok(notification)
    }

    /// Parse and handle a raw webhook body
    pub async fn handle_callback(&self, body: &[u8]) -> ApiResult<CallbackOutcome> {
        let notification = self.parse_notification(body)?;
        self.handle_payment_callback(notification).await
    }

    pub async fn handle_payment_callback(
        &self,
        notification: PaymentNotification,
    ) -> ApiResult<CallbackOutcome> {
        if let Some(server_key) = &self.server_key {
            if !notification.verify_signature(server_key) {
                tracing::warn!(
                    order_id = %notification.order_id,
                    "Rejected payment notification with invalid signature"
                );
                return Err(ApiError::Unauthorized(
                    "Invalid notification signature".to_string(),
                ));
            }
        }

        let tx = self
            .engine
            .transactions()
            .get_by_order_id(&notification.order_id)
            .await?;

        let new_status =
            map_gateway_status(&notification.transaction_status, &notification.fraud_status);

        tracing::info!(
            transaction_id = %tx.id,
            order_id = %notification.order_id,
            transaction_status = %notification.transaction_status,
            fraud_status = %notification.fraud_status,
            mapped = %new_status,
            "Payment notification received"
        );

        self.reconcile(tx.id, new_status).await
    }

    /// Payment state for a party, polling the gateway while still pending
    pub async fn get_payment_status(
        &self,
        user_id: Uuid,
        transaction_id: Uuid,
    ) -> ApiResult<Transaction> {
        let tx = self.engine.get_transaction(user_id, transaction_id).await?;

        if tx.payment_status != PaymentStatus::Pending {
            return Ok(tx);
        }
        let Some(order_id) = tx.gateway_order_id.clone() else {
            return Ok(tx);
        };

        let gateway_status = self.gateway.get_payment_status(&order_id).await?;
        let new_status = map_gateway_status(
            &gateway_status.transaction_status,
            &gateway_status.fraud_status,
        );

        if self.reconcile(tx.id, new_status).await?.is_duplicate() {
            return Ok(tx);
        }
        self.engine.get_transaction(user_id, transaction_id).await
    }

    async fn reconcile(
        &self,
        transaction_id: Uuid,
        new_status: PaymentStatus,
    ) -> ApiResult<CallbackOutcome> {
        let now = Utc::now();
        let applied = self
            .engine
            .apply(transaction_id, Actor::System, now, |t, _| {
                Ok(apply_payment_status(t, new_status, now))
            })
            .await?;

        if !applied.changed {
            tracing::debug!(
                transaction_id = %transaction_id,
                payment_status = %new_status,
                "Payment notification already applied"
            );
            return Ok(CallbackOutcome::Duplicate {
                transaction: applied.transaction,
            });
        }

        let tx = applied.transaction;

        if new_status.is_settled() && tx.is_payment_settled() && !tx.status.is_terminal() {
            let event = MarketplaceEvent::PaymentConfirmed {
                transaction_id: tx.id,
                amount: tx.total_amount,
            };
            self.engine.notify(tx.seller_id, event.clone());
            if tx.delivery_method == DeliveryMethod::Middleman {
                self.engine
                    .post_to_chat(&tx, "Buyer payment received, awaiting middleman confirmation", event);
            }
        }

        if tx.status == TransactionStatus::Cancelled && tx.has_security_flag(STOCK_CONFLICT_FLAG) {
            self.engine.notify(
                tx.buyer_id,
                MarketplaceEvent::StatusChanged {
                    transaction_id: tx.id,
                    status: tx.status,
                },
            );
        }

        let delivery = (tx.delivery_method == DeliveryMethod::Instant
            && tx.status == TransactionStatus::Paid)
            .then(|| {
                let escrow = Arc::clone(&self.escrow);
                let id = tx.id;
                tokio::spawn(async move {
                    if let Err(e) = escrow.deliver_instant(id).await {
                        tracing::error!(transaction_id = %id, error = %e, "Instant delivery failed");
                    }
                })
            });

        Ok(CallbackOutcome::Applied {
            transaction: tx,
            delivery,
        })
    }
}

/// Fold a gateway payment status into a transaction.
///
/// Returns the log notes, or `None` when the status adds nothing.
pub(crate) fn apply_payment_status(
    t: &mut Transaction,
    new_status: PaymentStatus,
    now: DateTime<Utc>,
) -> Option<String> {
    let current = t.payment_status;
    if current == new_status || current == PaymentStatus::Refunded {
        return None;
    }
    if current.is_settled() && new_status != PaymentStatus::Refunded {
        return None;
    }

    match new_status {
        PaymentStatus::Success | PaymentStatus::Paid => {
            t.payment_status = new_status;
            t.payment_at = Some(now);

            if t.status.is_terminal() {
                t.add_security_flag(PAYMENT_AFTER_CLOSE_FLAG);
                return Some(format!(
                    "Payment {} after the transaction was {}; refund required",
                    new_status, t.status
                ));
            }

            t.escrow_status = EscrowStatus::Held;
            match t.delivery_method {
                DeliveryMethod::Instant => t.status = TransactionStatus::Paid,
                DeliveryMethod::Middleman => {
                    if t.status == TransactionStatus::PaymentFailed {
                        t.status = TransactionStatus::Pending;
                    }
                    if t.middleman_status == Some(MiddlemanStatus::Assigned) {
                        t.middleman_status = Some(MiddlemanStatus::AwaitingFundsConfirmation);
                    }
                }
            }
            Some(format!("Payment confirmed by gateway ({})", new_status))
        }
        PaymentStatus::Failed | PaymentStatus::Expired => {
            t.payment_status = new_status;
            if matches!(
                t.status,
                TransactionStatus::Pending | TransactionStatus::PaymentPending
            ) {
                t.status = TransactionStatus::PaymentFailed;
            }
            Some(format!("Payment {} at gateway", new_status))
        }
        PaymentStatus::Refunded => {
            t.payment_status = PaymentStatus::Refunded;
            t.refunded_at = Some(now);

            if t.escrow_status == EscrowStatus::Released {
                t.add_security_flag(REFUND_AFTER_RELEASE_FLAG);
            } else {
                t.escrow_status = EscrowStatus::Refunded;
            }

            if !t.status.is_terminal() {
                t.status = TransactionStatus::Cancelled;
                t.cancelled_at = Some(now);
                t.cancellation_reason
                    .get_or_insert_with(|| "Payment refunded by gateway".to_string());
            }
            Some("Payment refunded by gateway".to_string())
        }
        PaymentStatus::Pending => None,
    }
}
