//! Escrow service layer - credential delivery, buyer confirmation and auto-release

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use uuid::Uuid;
use validator::Validate;

use super::model::{AutoReleaseReport, ConfirmCredentialsRequest, DeliverCredentialsRequest};
use crate::config::EscrowConfig;
use crate::error::{ApiError, ApiResult};
use crate::models::Credentials;
use crate::notifier::MarketplaceEvent;
use crate::services::FraudFlag;
use crate::transaction::{
    Actor, DeliveryMethod, EscrowStatus, MiddlemanStatus, Role, Transaction, TransactionEngine,
    TransactionStatus,
};

/// Credential views later than this after delivery are flagged
pub const DELAYED_ACCESS_HOURS: i64 = 24;

/// Fraud score pinned on a transaction whose account was recovered by the seller
pub const ACCOUNT_RECOVERY_SCORE: f64 = 0.9;

/// Escrow manager for the hold/release part of a transaction's life
pub struct EscrowManager {
    engine: Arc<TransactionEngine>,
    config: EscrowConfig,
}

impl EscrowManager {
    pub fn new(engine: Arc<TransactionEngine>, config: EscrowConfig) -> Self {
        Self { engine, config }
    }

    pub fn config(&self) -> &EscrowConfig {
        &self.config
    }

    /// Seller hands over the credentials; funds stay held until the buyer
    /// confirms or the release window passes.
    pub async fn deliver_credentials(
        &self,
        transaction_id: Uuid,
        seller_id: Uuid,
        request: DeliverCredentialsRequest,
    ) -> ApiResult<Transaction> {
        let credentials = request.credentials;
        if credentials.is_empty() {
            return Err(ApiError::BadRequest("Credentials are required".to_string()));
        }

        let now = Utc::now();
        let auto_release_at = now + self.config.auto_release_window();

        let applied = self
            .engine
            .apply(transaction_id, Actor::User(seller_id), now, |t, role| {
                if role != Role::Seller {
                    return Err(ApiError::Forbidden(
                        "Only the seller can deliver credentials".to_string(),
                    ));
                }
                if t.credentials_delivered {
                    return Err(ApiError::BadRequest(
                        "Credentials have already been delivered".to_string(),
                    ));
                }
                if !t.is_payment_settled() {
                    return Err(ApiError::BadRequest(
                        "Payment has not been completed".to_string(),
                    ));
                }
                if !matches!(
                    t.status,
                    TransactionStatus::Paid | TransactionStatus::Processing
                ) {
                    return Err(ApiError::BadRequest(
                        "Transaction is not awaiting delivery".to_string(),
                    ));
                }

                mark_delivered(t, credentials.clone(), now, auto_release_at);
                Ok(Some("Credentials delivered by seller".to_string()))
            })
            .await?;

        let tx = applied.transaction;
        self.announce_delivery(&tx);
        Ok(tx)
    }

    /// Deliver the product's stored credentials once an instant purchase is
    /// paid. Safe to call more than once.
    pub async fn deliver_instant(&self, transaction_id: Uuid) -> ApiResult<Transaction> {
        let tx = self.engine.transactions().get_by_id(transaction_id).await?;
        let product = self.engine.products().get_by_id(tx.product_id).await?;

        let credentials = product
            .credentials
            .filter(|c| !c.is_empty())
            .ok_or_else(|| {
                ApiError::BadRequest("Product credentials are not available".to_string())
            })?;

        let now = Utc::now();
        let auto_release_at = now + self.config.auto_release_window();

        let applied = self
            .engine
            .apply(transaction_id, Actor::System, now, |t, _| {
                if t.delivery_method != DeliveryMethod::Instant
                    || t.status != TransactionStatus::Paid
                    || t.credentials_delivered
                {
                    return Ok(None);
                }
                mark_delivered(t, credentials.clone(), now, auto_release_at);
                Ok(Some("Credentials delivered automatically after payment".to_string()))
            })
            .await?;

        if applied.changed {
            tracing::info!(transaction_id = %transaction_id, "Instant credentials delivered");
            self.announce_delivery(&applied.transaction);
        }
        Ok(applied.transaction)
    }

    /// Buyer confirms the credentials work (releasing the funds) or reports
    /// that they don't (opening a dispute).
    pub async fn confirm_credentials(
        &self,
        transaction_id: Uuid,
        buyer_id: Uuid,
        request: ConfirmCredentialsRequest,
    ) -> ApiResult<Transaction> {
        request.validate()?;
        let ConfirmCredentialsRequest { is_working, notes } = request;
        let now = Utc::now();

        let applied = self
            .engine
            .apply(transaction_id, Actor::User(buyer_id), now, |t, role| {
                if role != Role::Buyer {
                    return Err(ApiError::Forbidden(
                        "Only the buyer can confirm credentials".to_string(),
                    ));
                }
                if t.status != TransactionStatus::CredentialsDelivered || !t.credentials_delivered {
                    return Err(ApiError::BadRequest(
                        "Credentials have not been delivered".to_string(),
                    ));
                }

                if is_working {
                    t.buyer_confirmed_credentials = true;
                    t.buyer_confirmed_at = Some(now);
                    release(t, TransactionStatus::Completed, now);
                    Ok(Some(match notes.as_deref() {
                        Some(n) if !n.trim().is_empty() => {
                            format!("Buyer confirmed credentials are working: {}", n)
                        }
                        _ => "Buyer confirmed credentials are working".to_string(),
                    }))
                } else {
                    t.status = TransactionStatus::Disputed;
                    Ok(Some(format!(
                        "Buyer dispute: {}",
                        notes.as_deref().unwrap_or("credentials are not working")
                    )))
                }
            })
            .await?;

        let tx = applied.transaction;
        if is_working {
            self.engine.payout_seller(&tx).await;
            self.engine.notify(
                tx.seller_id,
                MarketplaceEvent::EscrowReleased {
                    transaction_id: tx.id,
                    amount: tx.amount,
                    automatic: false,
                },
            );
        } else {
            self.engine.post_to_chat(
                &tx,
                "The buyer reported a problem with the credentials",
                MarketplaceEvent::DisputeOpened {
                    transaction_id: tx.id,
                    reason: notes.unwrap_or_else(|| "credentials are not working".to_string()),
                },
            );
        }
        Ok(tx)
    }

    /// Release every hold whose window has passed
    pub async fn process_auto_release(&self) -> ApiResult<AutoReleaseReport> {
        self.process_auto_release_at(Utc::now()).await
    }

    /// One auto-release sweep as of `now`.
    ///
    /// Each candidate is re-checked inside its own write, so a buyer
    /// confirmation or dispute racing the sweep wins and the candidate is
    /// skipped. A failure on one candidate does not stop the sweep.
    pub async fn process_auto_release_at(&self, now: DateTime<Utc>) -> ApiResult<AutoReleaseReport> {
        let due = self
            .engine
            .transactions()
            .list_due_for_auto_release(now, self.config.batch_size)
            .await?;

        let mut report = AutoReleaseReport {
            examined: due.len(),
            ..Default::default()
        };

        for candidate in due {
            let result = self
                .engine
                .apply(candidate.id, Actor::System, now, |t, _| {
                    let still_due = t.status == TransactionStatus::CredentialsDelivered
                        && !t.buyer_confirmed_credentials
                        && t.escrow_status == EscrowStatus::Held
                        && t.auto_release_at.is_some_and(|at| at < now);
                    if !still_due {
                        return Ok(None);
                    }
                    release(t, TransactionStatus::AutoCompleted, now);
                    Ok(Some(
                        "Funds released automatically after the confirmation window".to_string(),
                    ))
                })
                .await;

            match result {
                Ok(applied) if applied.changed => {
                    let tx = applied.transaction;
                    self.engine.payout_seller(&tx).await;
                    self.engine.notify(
                        tx.seller_id,
                        MarketplaceEvent::EscrowReleased {
                            transaction_id: tx.id,
                            amount: tx.amount,
                            automatic: true,
                        },
                    );
                    self.engine.notify(
                        tx.buyer_id,
                        MarketplaceEvent::StatusChanged {
                            transaction_id: tx.id,
                            status: tx.status,
                        },
                    );
                    report.released += 1;
                }
                Ok(_) => report.skipped += 1,
                Err(e) => {
                    tracing::error!(
                        transaction_id = %candidate.id,
                        error = %e,
                        "Auto-release failed"
                    );
                    report.failed += 1;
                }
            }
        }

        if report.examined > 0 {
            tracing::info!(
                examined = report.examined,
                released = report.released,
                skipped = report.skipped,
                failed = report.failed,
                "Auto-release sweep finished"
            );
        }

        Ok(report)
    }

    /// Record the buyer's first look at delivered credentials
    pub async fn record_credential_access(
        &self,
        transaction_id: Uuid,
        buyer_id: Uuid,
    ) -> ApiResult<Transaction> {
        self.record_credential_access_at(transaction_id, buyer_id, Utc::now())
            .await
    }

    pub async fn record_credential_access_at(
        &self,
        transaction_id: Uuid,
        buyer_id: Uuid,
        now: DateTime<Utc>,
    ) -> ApiResult<Transaction> {
        let applied = self
            .engine
            .apply(transaction_id, Actor::User(buyer_id), now, |t, role| {
                if role != Role::Buyer {
                    return Err(ApiError::Forbidden(
                        "Only the buyer can view delivered credentials".to_string(),
                    ));
                }
                if !t.credentials_delivered {
                    return Err(ApiError::BadRequest(
                        "Credentials have not been delivered".to_string(),
                    ));
                }
                if t.credentials_accessed_at.is_some() {
                    return Ok(None);
                }

                t.credentials_accessed_at = Some(now);
                let delayed = t
                    .credentials_delivered_at
                    .is_some_and(|at| now - at > Duration::hours(DELAYED_ACCESS_HOURS));
                if delayed {
                    t.add_security_flag(FraudFlag::DelayedCredentialAccess.as_str());
                    return Ok(Some(
                        "Buyer first viewed credentials more than 24 hours after delivery"
                            .to_string(),
                    ));
                }
                Ok(Some("Buyer viewed credentials".to_string()))
            })
            .await?;

        if applied.changed
            && applied
                .transaction
                .has_security_flag(FraudFlag::DelayedCredentialAccess.as_str())
        {
            tracing::warn!(transaction_id = %transaction_id, "Delayed credential access");
        }
        Ok(applied.transaction)
    }

    /// Buyer reports the seller took the account back after delivery
    pub async fn report_account_recovery(
        &self,
        transaction_id: Uuid,
        buyer_id: Uuid,
        details: &str,
    ) -> ApiResult<Transaction> {
        let flag = FraudFlag::AccountRecoveryReported.as_str();

        let applied = self
            .engine
            .apply(transaction_id, Actor::User(buyer_id), Utc::now(), |t, role| {
                if role != Role::Buyer {
                    return Err(ApiError::Forbidden(
                        "Only the buyer can report an account recovery".to_string(),
                    ));
                }
                if !t.credentials_delivered {
                    return Err(ApiError::BadRequest(
                        "Credentials have not been delivered".to_string(),
                    ));
                }
                if t.has_security_flag(flag) {
                    return Ok(None);
                }

                t.fraud_score = t.fraud_score.max(ACCOUNT_RECOVERY_SCORE);
                t.add_security_flag(flag);
                if matches!(
                    t.status,
                    TransactionStatus::Processing | TransactionStatus::CredentialsDelivered
                ) {
                    t.status = TransactionStatus::Disputed;
                }
                Ok(Some(format!("Account recovery reported by buyer: {}", details)))
            })
            .await?;

        let tx = applied.transaction;
        if applied.changed {
            tracing::warn!(
                transaction_id = %tx.id,
                seller_id = %tx.seller_id,
                status = %tx.status,
                "Account recovery reported"
            );
            if tx.status == TransactionStatus::Disputed {
                self.engine.post_to_chat(
                    &tx,
                    "The buyer reported that the account was recovered by the seller",
                    MarketplaceEvent::DisputeOpened {
                        transaction_id: tx.id,
                        reason: details.to_string(),
                    },
                );
            }
        }
        Ok(tx)
    }

    fn announce_delivery(&self, tx: &Transaction) {
        let event = MarketplaceEvent::CredentialsDelivered {
            transaction_id: tx.id,
            auto_release_at: tx.auto_release_at,
        };
        self.engine.notify(tx.buyer_id, event.clone());
        self.engine.post_to_chat(
            tx,
            "Credentials delivered. Please check them and confirm.",
            event,
        );
    }
}

fn mark_delivered(
    t: &mut Transaction,
    credentials: Credentials,
    now: DateTime<Utc>,
    auto_release_at: DateTime<Utc>,
) {
    t.credentials = Some(credentials);
    t.credentials_delivered = true;
    t.credentials_delivered_at = Some(now);
    t.auto_release_at = Some(auto_release_at);
    t.status = TransactionStatus::CredentialsDelivered;
    t.escrow_status = EscrowStatus::Held;
}

fn release(t: &mut Transaction, status: TransactionStatus, now: DateTime<Utc>) {
    t.status = status;
    t.escrow_status = EscrowStatus::Released;
    t.completed_at = Some(now);
    if t.middleman_status.is_some() {
        t.middleman_status = Some(MiddlemanStatus::Completed);
    }
}
