//! Chat and user notifications for transaction events
//!
//! The engine calls the [`Notifier`] fire-and-forget: failures are logged and
//! never fail the transaction. [`BroadcastNotifier`] fans deliveries out on a
//! tokio broadcast channel for whatever transport the host attaches.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::transaction::TransactionStatus;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("No subscribers for notification")]
    NoSubscribers,

    #[error("Notification transport error: {0}")]
    Transport(String),
}

/// Transaction events delivered to chats and users
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MarketplaceEvent {
    TransactionCreated {
        transaction_id: Uuid,
        product_id: Uuid,
        buyer_id: Uuid,
        total_amount: i64,
    },
    PaymentConfirmed {
        transaction_id: Uuid,
        amount: i64,
    },
    MiddlemanAssigned {
        transaction_id: Uuid,
        admin_id: Uuid,
    },
    CredentialsDelivered {
        transaction_id: Uuid,
        auto_release_at: Option<DateTime<Utc>>,
    },
    EscrowReleased {
        transaction_id: Uuid,
        amount: i64,
        automatic: bool,
    },
    DisputeOpened {
        transaction_id: Uuid,
        reason: String,
    },
    StatusChanged {
        transaction_id: Uuid,
        status: TransactionStatus,
    },
}

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Post a system message into a chat thread
    async fn send_system_message(
        &self,
        thread_id: &str,
        text: &str,
        event: MarketplaceEvent,
    ) -> Result<(), NotifyError>;

    async fn notify_user(&self, user_id: Uuid, event: MarketplaceEvent) -> Result<(), NotifyError>;

    /// Open a chat between the transaction's parties, returning its id
    async fn create_transaction_chat(
        &self,
        transaction_id: Uuid,
        participants: &[Uuid],
    ) -> Result<String, NotifyError>;
}

/// Who a delivery is addressed to
#[derive(Debug, Serialize, Clone, PartialEq)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Recipient {
    Thread(String),
    User(Uuid),
}

#[derive(Debug, Serialize, Clone)]
pub struct Delivery {
    pub recipient: Recipient,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    pub event: MarketplaceEvent,
}

/// Broadcast-channel notifier
#[derive(Clone)]
pub struct BroadcastNotifier {
    tx: broadcast::Sender<Delivery>,
}

impl BroadcastNotifier {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(100);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Delivery> {
        self.tx.subscribe()
    }

    fn publish(&self, delivery: Delivery) -> Result<(), NotifyError> {
        self.tx
            .send(delivery)
            .map(|_| ())
            .map_err(|_| NotifyError::NoSubscribers)
    }
}

impl Default for BroadcastNotifier {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Notifier for BroadcastNotifier {
    async fn send_system_message(
        &self,
        thread_id: &str,
        text: &str,
        event: MarketplaceEvent,
    ) -> Result<(), NotifyError> {
        self.publish(Delivery {
            recipient: Recipient::Thread(thread_id.to_string()),
            text: Some(text.to_string()),
            event,
        })
    }

    async fn notify_user(&self, user_id: Uuid, event: MarketplaceEvent) -> Result<(), NotifyError> {
        self.publish(Delivery {
            recipient: Recipient::User(user_id),
            text: None,
            event,
        })
    }

    async fn create_transaction_chat(
        &self,
        transaction_id: Uuid,
        participants: &[Uuid],
    ) -> Result<String, NotifyError> {
        let chat_id = format!("chat-{}", transaction_id);
        tracing::debug!(
            chat_id = %chat_id,
            participants = participants.len(),
            "Transaction chat opened"
        );
        Ok(chat_id)
    }
}

/// Notify a user in the background, logging failures
pub fn dispatch_user(notifier: &Arc<dyn Notifier>, user_id: Uuid, event: MarketplaceEvent) {
    let notifier = Arc::clone(notifier);
    tokio::spawn(async move {
        if let Err(e) = notifier.notify_user(user_id, event).await {
            tracing::warn!(user_id = %user_id, error = %e, "Failed to notify user");
        }
    });
}

/// Post a system message in the background, logging failures
pub fn dispatch_system_message(
    notifier: &Arc<dyn Notifier>,
    thread_id: String,
    text: String,
    event: MarketplaceEvent,
) {
    let notifier = Arc::clone(notifier);
    tokio::spawn(async move {
        if let Err(e) = notifier.send_system_message(&thread_id, &text, event).await {
            tracing::warn!(thread_id = %thread_id, error = %e, "Failed to send system message");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_broadcast_delivery() {
        let notifier = BroadcastNotifier::new();
        let mut rx = notifier.subscribe();
        let transaction_id = Uuid::new_v4();

        notifier
            .send_system_message(
                "chat-1",
                "Credentials delivered",
                MarketplaceEvent::CredentialsDelivered {
                    transaction_id,
                    auto_release_at: None,
                },
            )
            .await
            .unwrap();

        let delivery = rx.recv().await.unwrap();
        assert_eq!(delivery.recipient, Recipient::Thread("chat-1".to_string()));
        assert_eq!(delivery.text.as_deref(), Some("Credentials delivered"));
    }

    #[tokio::test]
    async fn test_no_subscribers_is_an_error() {
        let notifier = BroadcastNotifier::new();
        let result = notifier
            .notify_user(
                Uuid::new_v4(),
                MarketplaceEvent::StatusChanged {
                    transaction_id: Uuid::new_v4(),
                    status: TransactionStatus::Cancelled,
                },
            )
            .await;
        assert!(matches!(result, Err(NotifyError::NoSubscribers)));
    }

    #[test]
    fn test_event_is_tagged() {
        let event = MarketplaceEvent::EscrowReleased {
            transaction_id: Uuid::nil(),
            amount: 100_000,
            automatic: true,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "escrow_released");
        assert_eq!(json["automatic"], true);
    }
}
