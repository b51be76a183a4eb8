//! Transaction engine - creation, payment, middleman flow, cancellation and disputes
//!
//! The engine is the only writer of transactions and their audit log. Every
//! write goes through [`TransactionEngine::apply`]: read the current row,
//! resolve the caller's role, run the mutation, check the status change
//! against the transition table, then persist the new row and its log entry
//! in one version-checked repository call.

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use uuid::Uuid;
use validator::Validate;

use super::model::{
    Actor, CreateTransactionRequest, CreatedTransaction, DeliveryMethod, EscrowStatus,
    MiddlemanStatus, PaymentStatus, ProcessPaymentRequest, Role, SecurityLevel, Transaction,
    TransactionLog, TransactionStatus,
};
use super::state_machine;
use crate::db::{ProductRepository, RepositoryError, TransactionRepository, UserRepository};
use crate::error::{ApiError, ApiResult};
use crate::models::{Credentials, Product, ProductStatus, User};
use crate::notifier::{self, MarketplaceEvent, Notifier};
use crate::payment::{
    map_gateway_status, CustomerDetails, LineItem, PaymentGateway, PaymentRequest,
};
use crate::services::fraud_scorer::RAPID_TRANSACTION_WINDOW_HOURS;
use crate::services::{FraudAction, FraudContext, FraudScorer, StockReservationGuard};
use crate::wallet::WalletService;

/// Platform fee in basis points of the item amount
pub const PLATFORM_FEE_BPS: i64 = 250;

/// Flag set when a late payment finds the product already sold out
pub const STOCK_CONFLICT_FLAG: &str = "stock_conflict";

const MAX_WRITE_ATTEMPTS: usize = 3;

const AMOUNT_TOO_LARGE: &str = "Transaction amount is too large";

const FRAUD_BLOCK_MESSAGE: &str = "Transaction blocked for security reasons. Please contact support.";

/// Platform fee for `amount`, rounded half up.
///
/// The fee is flat across payment methods.
pub fn calculate_fee(amount: i64, _payment_method: &str) -> ApiResult<i64> {
    amount
        .checked_mul(PLATFORM_FEE_BPS)
        .and_then(|scaled| scaled.checked_add(5_000))
        .map(|scaled| scaled / 10_000)
        .ok_or_else(|| ApiError::BadRequest(AMOUNT_TOO_LARGE.to_string()))
}

/// Order id sent to the payment gateway
pub fn order_id_for(transaction_id: Uuid, at: DateTime<Utc>) -> String {
    format!("TRX-{}-{}", transaction_id, at.timestamp())
}

/// Result of [`TransactionEngine::apply`]
#[derive(Debug, Clone)]
pub struct Applied {
    pub transaction: Transaction,
    /// `false` when the mutation declined to write anything
    pub changed: bool,
}

/// Stock effect of one write, decided before it is persisted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StockOutcome {
    Unchanged,
    /// A unit was taken here and goes back if the write fails
    Reserved,
    /// The unit this transaction lost is gone
    SoldOut,
}

pub struct TransactionEngine {
    transactions: Arc<dyn TransactionRepository>,
    products: Arc<dyn ProductRepository>,
    users: Arc<dyn UserRepository>,
    gateway: Arc<dyn PaymentGateway>,
    wallet: Arc<dyn WalletService>,
    notifier: Arc<dyn Notifier>,
    fraud_scorer: FraudScorer,
    stock_guard: StockReservationGuard,
}

impl TransactionEngine {
    pub fn new(
        transactions: Arc<dyn TransactionRepository>,
        products: Arc<dyn ProductRepository>,
        users: Arc<dyn UserRepository>,
        gateway: Arc<dyn PaymentGateway>,
        wallet: Arc<dyn WalletService>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            transactions,
            products,
            users,
            gateway,
            wallet,
            notifier,
            fraud_scorer: FraudScorer::new(),
            stock_guard: StockReservationGuard::new(),
        }
    }

    pub fn with_fraud_scorer(mut self, fraud_scorer: FraudScorer) -> Self {
        self.fraud_scorer = fraud_scorer;
        self
    }

    pub(crate) fn transactions(&self) -> &Arc<dyn TransactionRepository> {
        &self.transactions
    }

    pub(crate) fn products(&self) -> &Arc<dyn ProductRepository> {
        &self.products
    }

    // ========================================================================
    // Creation
    // ========================================================================

    /// Validate, score, reserve stock and persist a new transaction.
    ///
    /// Non-wallet purchases also get a payable reference from the gateway.
    pub async fn create_transaction(
        &self,
        buyer_id: Uuid,
        request: CreateTransactionRequest,
    ) -> ApiResult<CreatedTransaction> {
        request.validate()?;

        let product = self.products.get_by_id(request.product_id).await?;

        if product.seller_id == buyer_id {
            return Err(ApiError::BadRequest("Cannot buy your own product".to_string()));
        }
        if product.status != ProductStatus::Active {
            return Err(ApiError::BadRequest("Product is not available".to_string()));
        }

        let seller = self.users.get_by_id(product.seller_id).await?;
        if !seller.is_verified() {
            return Err(ApiError::BadRequest("Seller is not verified".to_string()));
        }

        let delivery_method = DeliveryMethod::parse(&request.delivery_method)
            .ok_or_else(|| ApiError::BadRequest("Invalid delivery method".to_string()))?;

        let admin_id = match delivery_method {
            DeliveryMethod::Instant => {
                if !product.has_credentials() {
                    return Err(ApiError::BadRequest(
                        "Product credentials are not available".to_string(),
                    ));
                }
                None
            }
            DeliveryMethod::Middleman => {
                let middleman_id = request.middleman_id.ok_or_else(|| {
                    ApiError::BadRequest(
                        "Middleman ID is required for middleman delivery".to_string(),
                    )
                })?;
                if middleman_id == buyer_id || middleman_id == product.seller_id {
                    return Err(ApiError::BadRequest(
                        "A party to the transaction cannot act as its middleman".to_string(),
                    ));
                }
                let middleman = self.users.get_by_id(middleman_id).await?;
                if !middleman.is_admin() {
                    return Err(ApiError::BadRequest(
                        "Selected middleman is not a platform admin".to_string(),
                    ));
                }
                Some(middleman_id)
            }
        };

        let buyer = self.users.get_by_id(buyer_id).await?;

        let now = Utc::now();
        let payment_method = request.payment_method.trim().to_lowercase();
        let amount = product.price;
        let fee = calculate_fee(amount, &payment_method)?;
        let total_amount = amount
            .checked_add(fee)
            .ok_or_else(|| ApiError::BadRequest(AMOUNT_TOO_LARGE.to_string()))?;

        let recent_buyer_transactions = self
            .transactions
            .count_recent_by_buyer(buyer_id, now - Duration::hours(RAPID_TRANSACTION_WINDOW_HOURS))
            .await?;

        let fraud = self.fraud_scorer.analyze(&FraudContext {
            buyer: &buyer,
            seller: &seller,
            product: &product,
            total_amount,
            recent_buyer_transactions,
            now,
        });

        match fraud.action {
            FraudAction::Block => {
                tracing::warn!(
                    buyer_id = %buyer_id,
                    product_id = %product.id,
                    score = fraud.score,
                    flags = ?fraud.flag_tags(),
                    "Transaction blocked by fraud scoring"
                );
                return Err(ApiError::BadRequest(FRAUD_BLOCK_MESSAGE.to_string()));
            }
            FraudAction::Review => {
                tracing::warn!(
                    buyer_id = %buyer_id,
                    product_id = %product.id,
                    score = fraud.score,
                    risk_level = ?fraud.risk_level,
                    review_by = ?fraud.review_by,
                    "Transaction flagged for review"
                );
            }
            FraudAction::Allow => {}
        }

        let stock_reserved = self
            .stock_guard
            .reserve(self.products.as_ref(), &product)
            .await?;

        let id = Uuid::new_v4();
        let is_wallet = payment_method == "wallet";

        let tx = Transaction {
            id,
            product_id: product.id,
            buyer_id,
            seller_id: product.seller_id,
            admin_id,
            amount,
            fee,
            total_amount,
            delivery_method,
            payment_method,
            status: match delivery_method {
                DeliveryMethod::Instant => TransactionStatus::PaymentPending,
                DeliveryMethod::Middleman => TransactionStatus::Pending,
            },
            payment_status: PaymentStatus::Pending,
            escrow_status: EscrowStatus::Pending,
            middleman_status: None,
            credentials: None,
            credentials_delivered: false,
            credentials_delivered_at: None,
            credentials_accessed_at: None,
            buyer_confirmed_credentials: false,
            buyer_confirmed_at: None,
            auto_release_at: None,
            gateway_order_id: (!is_wallet).then(|| order_id_for(id, now)),
            payment_token: None,
            payment_redirect_url: None,
            virtual_accounts: Vec::new(),
            middleman_chat_id: None,
            fraud_score: fraud.score,
            security_flags: fraud.flag_tags(),
            security_level: SecurityLevel::for_purchase(delivery_method, total_amount),
            stock_reserved,
            inventory_committed: false,
            notes: request.notes,
            cancellation_reason: None,
            version: 0,
            payment_at: None,
            completed_at: None,
            cancelled_at: None,
            refunded_at: None,
            created_at: now,
            updated_at: now,
        };

        let log = TransactionLog::new(
            id,
            tx.status,
            "Transaction created",
            Actor::User(buyer_id).created_by(),
            now,
        );

        if let Err(e) = self.transactions.insert_with_log(&tx, &log).await {
            if stock_reserved {
                self.release_stock(product.id).await;
            }
            return Err(e.into());
        }

        tracing::info!(
            transaction_id = %id,
            product_id = %product.id,
            buyer_id = %buyer_id,
            total_amount,
            fraud_score = fraud.score,
            "Transaction created"
        );

        notifier::dispatch_user(
            &self.notifier,
            tx.seller_id,
            MarketplaceEvent::TransactionCreated {
                transaction_id: id,
                product_id: product.id,
                buyer_id,
                total_amount,
            },
        );

        if is_wallet {
            return Ok(CreatedTransaction {
                transaction: tx,
                payment_token: None,
                payment_url: None,
                virtual_accounts: Vec::new(),
            });
        }

        self.open_gateway_payment(tx, &buyer, &product).await
    }

    async fn open_gateway_payment(
        &self,
        tx: Transaction,
        buyer: &User,
        product: &Product,
    ) -> ApiResult<CreatedTransaction> {
        let order_id = tx
            .gateway_order_id
            .clone()
            .unwrap_or_else(|| order_id_for(tx.id, tx.created_at));

        let request = PaymentRequest {
            order_id,
            gross_amount: tx.total_amount,
            payment_method: tx.payment_method.clone(),
            customer: CustomerDetails {
                first_name: buyer.username.clone(),
                email: buyer.email.clone(),
                phone: buyer.phone.clone(),
            },
            items: vec![
                LineItem {
                    id: product.id.to_string(),
                    name: product.title.clone(),
                    price: tx.amount,
                    quantity: 1,
                },
                LineItem {
                    id: "platform_fee".to_string(),
                    name: "Platform fee".to_string(),
                    price: tx.fee,
                    quantity: 1,
                },
            ],
        };

        let response = match self.gateway.create_payment(&request).await {
            Ok(response) => response,
            Err(e) => {
                let message = e.to_string();
                tracing::error!(
                    transaction_id = %tx.id,
                    order_id = %request.order_id,
                    error = %message,
                    "Payment gateway call failed"
                );

                let marked = self
                    .apply(tx.id, Actor::System, Utc::now(), |t, _| {
                        t.status = TransactionStatus::PaymentFailed;
                        t.payment_status = PaymentStatus::Failed;
                        Ok(Some(format!("Payment gateway error: {}", message)))
                    })
                    .await;
                if let Err(mark_err) = marked {
                    tracing::error!(
                        transaction_id = %tx.id,
                        error = %mark_err,
                        "Failed to mark transaction as payment_failed"
                    );
                }

                return Err(ApiError::ExternalServiceError(format!(
                    "Failed to create payment: {}",
                    message
                )));
            }
        };

        let applied = self
            .apply(tx.id, Actor::System, Utc::now(), |t, _| {
                t.payment_token = Some(response.token.clone());
                t.payment_redirect_url = Some(response.redirect_url.clone());
                t.virtual_accounts = response.virtual_accounts.clone();
                Ok(Some(format!("Payment reference {} created", response.order_id)))
            })
            .await?;

        Ok(CreatedTransaction {
            transaction: applied.transaction,
            payment_token: Some(response.token),
            payment_url: Some(response.redirect_url),
            virtual_accounts: response.virtual_accounts,
        })
    }

    // ========================================================================
    // Payment
    // ========================================================================

    /// Pay for a transaction as its buyer, from the wallet or by confirming a
    /// gateway payment.
    pub async fn process_payment(
        &self,
        user_id: Uuid,
        transaction_id: Uuid,
        request: ProcessPaymentRequest,
    ) -> ApiResult<Transaction> {
        let tx = self.transactions.get_by_id(transaction_id).await?;

        if tx.buyer_id != user_id {
            return Err(ApiError::Forbidden(
                "Only the buyer can pay for this transaction".to_string(),
            ));
        }
        ensure_awaiting_payment(&tx)?;

        let credentials = match tx.delivery_method {
            DeliveryMethod::Instant => self.products.get_by_id(tx.product_id).await?.credentials,
            DeliveryMethod::Middleman => None,
        };

        if request.is_wallet() {
            self.pay_with_wallet(tx, credentials).await
        } else {
            self.pay_with_gateway(tx, credentials).await
        }
    }

    async fn pay_with_wallet(
        &self,
        tx: Transaction,
        credentials: Option<Credentials>,
    ) -> ApiResult<Transaction> {
        let reference = tx.id.to_string();

        self.wallet
            .debit(
                tx.buyer_id,
                tx.total_amount,
                &format!("Payment for transaction {}", tx.id),
                &reference,
            )
            .await?;

        let now = Utc::now();
        let result = self
            .apply(tx.id, Actor::User(tx.buyer_id), now, |t, _| {
                let notes = settle_buyer_payment(t, PaymentStatus::Paid, credentials.as_ref(), now)?;
                t.payment_method = "wallet".to_string();
                Ok(Some(notes))
            })
            .await;

        match result {
            Ok(applied) => {
                self.after_buyer_payment(&applied.transaction).await;
                Ok(applied.transaction)
            }
            Err(e) => {
                tracing::warn!(
                    transaction_id = %tx.id,
                    error = %e,
                    "Transaction write failed after wallet debit, refunding"
                );
                if let Err(refund_err) = self
                    .wallet
                    .refund(
                        tx.buyer_id,
                        tx.total_amount,
                        &format!("Rollback of payment for transaction {}", tx.id),
                        &reference,
                    )
                    .await
                {
                    tracing::error!(
                        transaction_id = %tx.id,
                        buyer_id = %tx.buyer_id,
                        amount = tx.total_amount,
                        error = %refund_err,
                        "Wallet rollback failed"
                    );
                }
                Err(e)
            }
        }
    }

    async fn pay_with_gateway(
        &self,
        tx: Transaction,
        credentials: Option<Credentials>,
    ) -> ApiResult<Transaction> {
        let order_id = tx.gateway_order_id.clone().ok_or_else(|| {
            ApiError::BadRequest("No pending payment reference for this transaction".to_string())
        })?;

        let gateway_status = self.gateway.get_payment_status(&order_id).await?;
        let new_status = map_gateway_status(
            &gateway_status.transaction_status,
            &gateway_status.fraud_status,
        );

        match new_status {
            PaymentStatus::Success | PaymentStatus::Paid => {
                let now = Utc::now();
                let applied = self
                    .apply(tx.id, Actor::User(tx.buyer_id), now, |t, _| {
                        settle_buyer_payment(t, PaymentStatus::Success, credentials.as_ref(), now)
                            .map(Some)
                    })
                    .await?;
                self.after_buyer_payment(&applied.transaction).await;
                Ok(applied.transaction)
            }
            PaymentStatus::Failed | PaymentStatus::Expired => {
                self.apply(tx.id, Actor::System, Utc::now(), |t, _| {
                    if t.is_payment_settled() || t.status.is_terminal() {
                        return Ok(None);
                    }
                    t.payment_status = new_status;
                    t.status = TransactionStatus::PaymentFailed;
                    Ok(Some(format!("Payment {} at gateway", new_status)))
                })
                .await?;
                Err(ApiError::BadRequest(format!("Payment {}", new_status)))
            }
            PaymentStatus::Refunded => Err(ApiError::BadRequest(
                "Payment has been refunded".to_string(),
            )),
            PaymentStatus::Pending => Err(ApiError::BadRequest(
                "Payment is still pending".to_string(),
            )),
        }
    }

    async fn after_buyer_payment(&self, tx: &Transaction) {
        if tx.status == TransactionStatus::Completed {
            self.payout_seller(tx).await;
            self.notify(
                tx.buyer_id,
                MarketplaceEvent::StatusChanged {
                    transaction_id: tx.id,
                    status: tx.status,
                },
            );
            self.notify(
                tx.seller_id,
                MarketplaceEvent::EscrowReleased {
                    transaction_id: tx.id,
                    amount: tx.amount,
                    automatic: false,
                },
            );
        } else {
            let event = MarketplaceEvent::PaymentConfirmed {
                transaction_id: tx.id,
                amount: tx.total_amount,
            };
            self.notify(tx.seller_id, event.clone());
            self.post_to_chat(tx, "Buyer payment received, awaiting middleman confirmation", event);
        }
    }

    // ========================================================================
    // Middleman flow
    // ========================================================================

    /// Take on a pending middleman transaction as its middleman.
    pub async fn assign_middleman(
        &self,
        admin_id: Uuid,
        transaction_id: Uuid,
    ) -> ApiResult<Transaction> {
        let admin = self.users.get_by_id(admin_id).await?;
        if !admin.is_admin() {
            return Err(ApiError::Forbidden(
                "Only platform admins can act as middleman".to_string(),
            ));
        }

        let applied = self
            .apply(transaction_id, Actor::User(admin_id), Utc::now(), |t, _| {
                if t.delivery_method != DeliveryMethod::Middleman {
                    return Err(ApiError::BadRequest(
                        "Transaction does not use middleman delivery".to_string(),
                    ));
                }
                if t.status != TransactionStatus::Pending {
                    return Err(ApiError::BadRequest(
                        "Middleman can only be assigned to a pending transaction".to_string(),
                    ));
                }
                if t.middleman_status.is_some() {
                    return Err(ApiError::BadRequest(
                        "A middleman is already assigned".to_string(),
                    ));
                }
                if admin_id == t.buyer_id || admin_id == t.seller_id {
                    return Err(ApiError::BadRequest(
                        "A party to the transaction cannot act as its middleman".to_string(),
                    ));
                }
                if t.admin_id.is_some_and(|chosen| chosen != admin_id) {
                    return Err(ApiError::Forbidden(
                        "Transaction is reserved for another middleman".to_string(),
                    ));
                }

                t.admin_id = Some(admin_id);
                t.middleman_status = Some(if t.is_payment_settled() {
                    MiddlemanStatus::AwaitingFundsConfirmation
                } else {
                    MiddlemanStatus::Assigned
                });
                Ok(Some(format!("Middleman {} assigned", admin_id)))
            })
            .await?;

        let mut tx = applied.transaction;

        match self
            .notifier
            .create_transaction_chat(tx.id, &[tx.buyer_id, tx.seller_id, admin_id])
            .await
        {
            Ok(chat_id) => {
                let recorded = self
                    .apply(tx.id, Actor::System, Utc::now(), |t, _| {
                        if t.middleman_chat_id.as_deref() == Some(chat_id.as_str()) {
                            return Ok(None);
                        }
                        t.middleman_chat_id = Some(chat_id.clone());
                        Ok(Some("Transaction chat created".to_string()))
                    })
                    .await;
                match recorded {
                    Ok(applied) => tx = applied.transaction,
                    Err(e) => tracing::warn!(
                        transaction_id = %tx.id,
                        error = %e,
                        "Failed to record transaction chat"
                    ),
                }
            }
            Err(e) => tracing::warn!(
                transaction_id = %tx.id,
                error = %e,
                "Failed to create transaction chat"
            ),
        }

        self.post_to_chat(
            &tx,
            "A middleman has joined this transaction",
            MarketplaceEvent::MiddlemanAssigned {
                transaction_id: tx.id,
                admin_id,
            },
        );

        Ok(tx)
    }

    /// Assigned middleman confirms the buyer's funds arrived.
    pub async fn confirm_middleman_payment(
        &self,
        admin_id: Uuid,
        transaction_id: Uuid,
    ) -> ApiResult<Transaction> {
        let applied = self
            .apply(transaction_id, Actor::User(admin_id), Utc::now(), |t, _| {
                ensure_assigned_middleman(t, admin_id)?;
                if t.status != TransactionStatus::Pending
                    || t.middleman_status != Some(MiddlemanStatus::AwaitingFundsConfirmation)
                    || !t.is_payment_settled()
                {
                    return Err(ApiError::BadRequest(
                        "Transaction is not awaiting funds confirmation".to_string(),
                    ));
                }
                t.status = TransactionStatus::Processing;
                t.middleman_status = Some(MiddlemanStatus::FundsReceived);
                Ok(Some("Middleman confirmed receipt of funds".to_string()))
            })
            .await?;

        let tx = applied.transaction;
        self.post_to_chat(
            &tx,
            "Funds confirmed by the middleman. The seller can now hand over the account.",
            MarketplaceEvent::StatusChanged {
                transaction_id: tx.id,
                status: tx.status,
            },
        );
        Ok(tx)
    }

    /// Assigned middleman checks the account and completes the sale.
    pub async fn verify_and_complete_middleman(
        &self,
        admin_id: Uuid,
        transaction_id: Uuid,
        credentials: Credentials,
    ) -> ApiResult<Transaction> {
        if credentials.is_empty() {
            return Err(ApiError::BadRequest("Credentials are required".to_string()));
        }

        let now = Utc::now();
        let applied = self
            .apply(transaction_id, Actor::User(admin_id), now, |t, _| {
                ensure_assigned_middleman(t, admin_id)?;
                if t.status != TransactionStatus::Processing
                    || t.middleman_status != Some(MiddlemanStatus::FundsReceived)
                {
                    return Err(ApiError::BadRequest(
                        "Funds have not been confirmed for this transaction".to_string(),
                    ));
                }
                t.credentials = Some(credentials.clone());
                t.credentials_delivered = true;
                t.credentials_delivered_at = Some(now);
                t.status = TransactionStatus::Completed;
                t.middleman_status = Some(MiddlemanStatus::Completed);
                t.escrow_status = EscrowStatus::Released;
                t.completed_at = Some(now);
                Ok(Some(
                    "Middleman verified the account and completed the transaction".to_string(),
                ))
            })
            .await?;

        let tx = applied.transaction;
        self.payout_seller(&tx).await;
        self.post_to_chat(
            &tx,
            "Transaction completed by the middleman",
            MarketplaceEvent::EscrowReleased {
                transaction_id: tx.id,
                amount: tx.amount,
                automatic: false,
            },
        );
        Ok(tx)
    }

    // ========================================================================
    // Cancellation and disputes
    // ========================================================================

    /// Cancel a transaction; refunds the buyer when funds are held.
    pub async fn cancel_transaction(
        &self,
        user_id: Uuid,
        transaction_id: Uuid,
        reason: &str,
    ) -> ApiResult<Transaction> {
        let now = Utc::now();
        let mut refund_due = false;

        let applied = self
            .apply(transaction_id, Actor::User(user_id), now, |t, role| {
                if t.status.is_terminal() {
                    return Err(ApiError::BadRequest(
                        "Transaction cannot be cancelled in its current state".to_string(),
                    ));
                }
                refund_due = t.escrow_status == EscrowStatus::Held;

                t.status = TransactionStatus::Cancelled;
                t.cancelled_at = Some(now);
                t.cancellation_reason = Some(reason.to_string());
                if refund_due {
                    t.escrow_status = EscrowStatus::Refunded;
                    t.payment_status = PaymentStatus::Refunded;
                    t.refunded_at = Some(now);
                }
                Ok(Some(format!("Transaction cancelled by {}: {}", role, reason)))
            })
            .await?;

        let tx = applied.transaction;
        if refund_due {
            self.refund_buyer(&tx).await;
        }

        for user in [tx.buyer_id, tx.seller_id] {
            self.notify(
                user,
                MarketplaceEvent::StatusChanged {
                    transaction_id: tx.id,
                    status: tx.status,
                },
            );
        }
        Ok(tx)
    }

    /// Open a dispute on a transaction in processing.
    pub async fn create_dispute(
        &self,
        user_id: Uuid,
        transaction_id: Uuid,
        reason: &str,
    ) -> ApiResult<Transaction> {
        let applied = self
            .apply(transaction_id, Actor::User(user_id), Utc::now(), |t, role| {
                if t.status != TransactionStatus::Processing {
                    return Err(ApiError::BadRequest(
                        "Disputes can only be opened while the transaction is processing"
                            .to_string(),
                    ));
                }
                t.status = TransactionStatus::Disputed;
                Ok(Some(format!("Dispute created by {}: {}", role, reason)))
            })
            .await?;

        let tx = applied.transaction;
        self.post_to_chat(
            &tx,
            "A dispute has been opened",
            MarketplaceEvent::DisputeOpened {
                transaction_id: tx.id,
                reason: reason.to_string(),
            },
        );
        Ok(tx)
    }

    /// Admin decision on a dispute: refund the buyer or pay the seller.
    pub async fn resolve_dispute(
        &self,
        admin_id: Uuid,
        transaction_id: Uuid,
        resolution: &str,
        refund: bool,
    ) -> ApiResult<Transaction> {
        let now = Utc::now();
        let mut funds_held = false;

        let applied = self
            .apply(transaction_id, Actor::User(admin_id), now, |t, _| {
                if t.status != TransactionStatus::Disputed {
                    return Err(ApiError::BadRequest("Transaction is not disputed".to_string()));
                }
                funds_held = t.escrow_status == EscrowStatus::Held;

                if refund {
                    t.status = TransactionStatus::Cancelled;
                    t.payment_status = PaymentStatus::Refunded;
                    t.escrow_status = EscrowStatus::Refunded;
                    t.refunded_at = Some(now);
                    t.cancelled_at = Some(now);
                    t.cancellation_reason = Some(resolution.to_string());
                } else {
                    t.status = TransactionStatus::Completed;
                    t.escrow_status = EscrowStatus::Released;
                    t.completed_at = Some(now);
                    if t.middleman_status.is_some() {
                        t.middleman_status = Some(MiddlemanStatus::Completed);
                    }
                }
                Ok(Some(format!("Dispute resolved by admin: {}", resolution)))
            })
            .await?;

        let tx = applied.transaction;
        if funds_held {
            if refund {
                self.refund_buyer(&tx).await;
            } else {
                self.payout_seller(&tx).await;
            }
        }

        for user in [tx.buyer_id, tx.seller_id] {
            self.notify(
                user,
                MarketplaceEvent::StatusChanged {
                    transaction_id: tx.id,
                    status: tx.status,
                },
            );
        }
        Ok(tx)
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Listing as seen by `viewer_id`.
    ///
    /// Only the seller sees the stored credentials. Every other view is
    /// counted in the background and never fails the read.
    pub async fn view_product(&self, viewer_id: Option<Uuid>, product_id: Uuid) -> ApiResult<Product> {
        let product = self.products.get_by_id(product_id).await?;

        if viewer_id == Some(product.seller_id) {
            return Ok(product);
        }

        let products = Arc::clone(&self.products);
        tokio::spawn(async move {
            if let Err(e) = products.increment_views(product_id).await {
                tracing::warn!(product_id = %product_id, error = %e, "Failed to count product view");
            }
        });

        Ok(product.redacted())
    }

    /// Transaction as seen by `user_id`; buyers see credentials only once paid.
    pub async fn get_transaction(&self, user_id: Uuid, transaction_id: Uuid) -> ApiResult<Transaction> {
        let tx = self.transactions.get_by_id(transaction_id).await?;
        let role = self.resolve_role(Actor::User(user_id), &tx).await?;

        if role == Role::Buyer && !tx.is_payment_settled() {
            return Ok(tx.redacted());
        }
        Ok(tx)
    }

    pub async fn list_transaction_logs(
        &self,
        user_id: Uuid,
        transaction_id: Uuid,
    ) -> ApiResult<Vec<TransactionLog>> {
        let tx = self.transactions.get_by_id(transaction_id).await?;
        self.resolve_role(Actor::User(user_id), &tx).await?;
        Ok(self.transactions.list_logs(transaction_id).await?)
    }

    // ========================================================================
    // Write path
    // ========================================================================

    /// Apply one mutation to a transaction.
    ///
    /// `mutate` runs against a fresh copy on every attempt and returns the log
    /// notes for the write, or `None` to leave the transaction untouched.
    /// Lost version races are retried; the last one surfaces as `Conflict`.
    pub(crate) async fn apply<F>(
        &self,
        transaction_id: Uuid,
        actor: Actor,
        now: DateTime<Utc>,
        mut mutate: F,
    ) -> ApiResult<Applied>
    where
        F: FnMut(&mut Transaction, Role) -> ApiResult<Option<String>> + Send,
    {
        for attempt in 1..=MAX_WRITE_ATTEMPTS {
            let current = self.transactions.get_by_id(transaction_id).await?;
            let role = self.resolve_role(actor, &current).await?;

            let mut next = current.clone();
            let Some(notes) = mutate(&mut next, role)? else {
                return Ok(Applied {
                    transaction: current,
                    changed: false,
                });
            };

            state_machine::authorize(current.status, next.status, role)?;

            let mut notes = notes;
            let stock = self.prepare_inventory(&current, &mut next).await?;
            if stock == StockOutcome::SoldOut {
                withdraw_sold_out(&mut next, now);
                state_machine::authorize(current.status, next.status, role)?;
                notes = format!(
                    "{}; product sold out before the payment settled, transaction cancelled and refund required",
                    notes
                );
            }
            let re_reserved = stock == StockOutcome::Reserved;

            next.version = current.version + 1;
            next.updated_at = now;
            let log = TransactionLog::new(transaction_id, next.status, notes, actor.created_by(), now);

            match self
                .transactions
                .update_with_log(&next, current.version, &log)
                .await
            {
                Ok(()) => {
                    self.finish_inventory(&current, &next, current.stock_reserved || re_reserved)
                        .await;
                    tracing::info!(
                        transaction_id = %transaction_id,
                        from = %current.status,
                        to = %next.status,
                        actor = %log.created_by,
                        version = next.version,
                        "Transaction updated"
                    );
                    return Ok(Applied {
                        transaction: next,
                        changed: true,
                    });
                }
                Err(RepositoryError::Conflict(msg)) => {
                    if re_reserved {
                        self.release_stock(current.product_id).await;
                    }
                    tracing::debug!(
                        transaction_id = %transaction_id,
                        attempt,
                        "Write conflict, retrying: {}",
                        msg
                    );
                }
                Err(e) => {
                    if re_reserved {
                        self.release_stock(current.product_id).await;
                    }
                    return Err(e.into());
                }
            }
        }

        Err(ApiError::Conflict(format!(
            "Transaction {} is being modified concurrently, please retry",
            transaction_id
        )))
    }

    async fn resolve_role(&self, actor: Actor, tx: &Transaction) -> ApiResult<Role> {
        let user_id = match actor {
            Actor::System => return Ok(Role::System),
            Actor::User(id) => id,
        };

        if user_id == tx.buyer_id {
            return Ok(Role::Buyer);
        }
        if user_id == tx.seller_id {
            return Ok(Role::Seller);
        }
        if tx.admin_id == Some(user_id) {
            return Ok(Role::Admin);
        }

        match self.users.get_by_id(user_id).await {
            Ok(user) if user.is_admin() => Ok(Role::Admin),
            Ok(_) | Err(RepositoryError::NotFound(_)) => Err(ApiError::Forbidden(
                "You don't have access to this transaction".to_string(),
            )),
            Err(e) => Err(e.into()),
        }
    }

    /// Adjust stock bookkeeping on `next` before it is written.
    ///
    /// A transaction coming back from a released reservation must win a unit
    /// again; [`StockOutcome::Reserved`] must be undone if the write fails.
    async fn prepare_inventory(
        &self,
        current: &Transaction,
        next: &mut Transaction,
    ) -> ApiResult<StockOutcome> {
        if current.inventory_committed {
            return Ok(StockOutcome::Unchanged);
        }

        if current.stock_reserved {
            if next.status.commits_sale() {
                next.inventory_committed = true;
                next.stock_reserved = false;
            } else if !next.status.holds_reservation() {
                next.stock_reserved = false;
            }
            return Ok(StockOutcome::Unchanged);
        }

        let reacquiring = !current.status.holds_reservation()
            && (next.status.holds_reservation() || next.status.commits_sale());
        if reacquiring {
            let product = self.products.get_by_id(current.product_id).await?;
            if product.effective_stock().is_some() {
                if !self.products.try_reserve(product.id).await? {
                    tracing::warn!(
                        transaction_id = %current.id,
                        product_id = %product.id,
                        "Late payment for a product that is no longer in stock"
                    );
                    return Ok(StockOutcome::SoldOut);
                }
                if next.status.commits_sale() {
                    next.inventory_committed = true;
                } else {
                    next.stock_reserved = true;
                }
                return Ok(StockOutcome::Reserved);
            }
        }

        if next.status.commits_sale() {
            next.inventory_committed = true;
        }
        Ok(StockOutcome::Unchanged)
    }

    /// Apply stock effects of a committed write
    async fn finish_inventory(&self, current: &Transaction, next: &Transaction, holds_unit: bool) {
        if !current.inventory_committed && next.inventory_committed {
            if let Err(e) = self
                .products
                .commit_sale(next.product_id, holds_unit)
                .await
            {
                tracing::error!(
                    transaction_id = %next.id,
                    product_id = %next.product_id,
                    error = %e,
                    "Failed to record sale"
                );
            }
        } else if current.stock_reserved && !next.stock_reserved {
            self.release_stock(next.product_id).await;
        }
    }

    async fn release_stock(&self, product_id: Uuid) {
        if let Err(e) = self.products.release_reservation(product_id).await {
            tracing::error!(product_id = %product_id, error = %e, "Failed to release stock reservation");
        }
    }

    // ========================================================================
    // Money movement and notifications
    // ========================================================================

    pub(crate) async fn payout_seller(&self, tx: &Transaction) {
        let description = format!("Sale proceeds for transaction {}", tx.id);
        match self
            .wallet
            .credit(tx.seller_id, tx.amount, &description, &tx.id.to_string())
            .await
        {
            Ok(entry) => tracing::info!(
                transaction_id = %tx.id,
                seller_id = %tx.seller_id,
                amount = tx.amount,
                balance_after = entry.balance_after,
                "Seller paid out"
            ),
            Err(e) => tracing::error!(
                transaction_id = %tx.id,
                seller_id = %tx.seller_id,
                amount = tx.amount,
                error = %e,
                "Seller payout failed"
            ),
        }
    }

    pub(crate) async fn refund_buyer(&self, tx: &Transaction) {
        let description = format!("Refund for transaction {}", tx.id);
        match self
            .wallet
            .refund(tx.buyer_id, tx.total_amount, &description, &tx.id.to_string())
            .await
        {
            Ok(entry) => tracing::info!(
                transaction_id = %tx.id,
                buyer_id = %tx.buyer_id,
                amount = tx.total_amount,
                balance_after = entry.balance_after,
                "Buyer refunded"
            ),
            Err(e) => tracing::error!(
                transaction_id = %tx.id,
                buyer_id = %tx.buyer_id,
                amount = tx.total_amount,
                error = %e,
                "Buyer refund failed"
            ),
        }
    }

    pub(crate) fn notify(&self, user_id: Uuid, event: MarketplaceEvent) {
        notifier::dispatch_user(&self.notifier, user_id, event);
    }

    /// System message in the transaction's chat thread
    pub(crate) fn post_to_chat(&self, tx: &Transaction, text: &str, event: MarketplaceEvent) {
        let thread_id = tx
            .middleman_chat_id
            .clone()
            .unwrap_or_else(|| tx.id.to_string());
        notifier::dispatch_system_message(&self.notifier, thread_id, text.to_string(), event);
    }
}

/// Close a late-paid transaction whose unit was sold to someone else.
///
/// The payment is kept as received so the refund can be traced.
fn withdraw_sold_out(t: &mut Transaction, now: DateTime<Utc>) {
    t.status = TransactionStatus::Cancelled;
    t.cancelled_at = Some(now);
    t.cancellation_reason = Some("Product sold out before the payment settled".to_string());
    t.stock_reserved = false;
    if t.escrow_status == EscrowStatus::Held {
        t.escrow_status = EscrowStatus::Refunded;
    }
    t.add_security_flag(STOCK_CONFLICT_FLAG);
}

fn ensure_awaiting_payment(tx: &Transaction) -> ApiResult<()> {
    let awaiting = matches!(
        tx.status,
        TransactionStatus::Pending | TransactionStatus::PaymentPending
    );
    if !awaiting || tx.is_payment_settled() {
        return Err(ApiError::BadRequest(
            "Transaction is not awaiting payment".to_string(),
        ));
    }
    if tx.delivery_method == DeliveryMethod::Middleman
        && tx.middleman_status != Some(MiddlemanStatus::Assigned)
    {
        return Err(ApiError::BadRequest(
            "A middleman must be assigned before payment".to_string(),
        ));
    }
    Ok(())
}

fn ensure_assigned_middleman(tx: &Transaction, admin_id: Uuid) -> ApiResult<()> {
    if tx.admin_id != Some(admin_id) || tx.middleman_status.is_none() {
        return Err(ApiError::Forbidden(
            "Only the assigned middleman can perform this action".to_string(),
        ));
    }
    Ok(())
}

/// Record a payment made by the buyer.
///
/// Instant purchases complete on the spot with the product's credentials;
/// middleman purchases wait for the middleman to confirm the funds.
fn settle_buyer_payment(
    t: &mut Transaction,
    payment_status: PaymentStatus,
    credentials: Option<&Credentials>,
    now: DateTime<Utc>,
) -> ApiResult<String> {
    ensure_awaiting_payment(t)?;

    t.payment_status = payment_status;
    t.payment_at = Some(now);
    t.escrow_status = EscrowStatus::Held;

    match t.delivery_method {
        DeliveryMethod::Instant => {
            let credentials = credentials
                .filter(|c| !c.is_empty())
                .cloned()
                .ok_or_else(|| {
                    ApiError::BadRequest("Product credentials are not available".to_string())
                })?;
            t.credentials = Some(credentials);
            t.credentials_delivered = true;
            t.credentials_delivered_at = Some(now);
            t.status = TransactionStatus::Completed;
            t.escrow_status = EscrowStatus::Released;
            t.completed_at = Some(now);
            Ok("Payment completed and credentials delivered".to_string())
        }
        DeliveryMethod::Middleman => {
            t.middleman_status = Some(MiddlemanStatus::AwaitingFundsConfirmation);
            Ok("Payment received, awaiting middleman confirmation".to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fee_is_two_and_a_half_percent() {
        assert_eq!(calculate_fee(100_000, "wallet").unwrap(), 2_500);
        assert_eq!(calculate_fee(100_000, "bank_transfer").unwrap(), 2_500);
        assert_eq!(calculate_fee(2_000_000, "qris").unwrap(), 50_000);
    }

    #[test]
    fn test_fee_rounds_half_up() {
        // 2.5% of 1_010 is 25.25, of 1_020 is 25.5
        assert_eq!(calculate_fee(1_010, "wallet").unwrap(), 25);
        assert_eq!(calculate_fee(1_020, "wallet").unwrap(), 26);
        assert_eq!(calculate_fee(0, "wallet").unwrap(), 0);
    }

    #[test]
    fn test_fee_overflow_is_rejected() {
        let err = calculate_fee(i64::MAX, "wallet").unwrap_err();
        assert!(matches!(err, ApiError::BadRequest(msg) if msg == AMOUNT_TOO_LARGE));

        let largest = (i64::MAX - 5_000) / PLATFORM_FEE_BPS;
        assert!(calculate_fee(largest, "wallet").is_ok());
        assert!(calculate_fee(largest + 1, "wallet").is_err());
    }

    #[test]
    fn test_order_id_format() {
        let id = Uuid::nil();
        let at = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        assert_eq!(
            order_id_for(id, at),
            "TRX-00000000-0000-0000-0000-000000000000-1700000000"
        );
    }
}
