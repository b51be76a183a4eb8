//! Credential delivery, buyer confirmation and the auto-release sweep

mod common;

use chrono::Duration as ChronoDuration;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use common::{credentials, Harness, PRICE};
use marketplace_escrow::config::EscrowConfig;
use marketplace_escrow::error::ApiError;
use marketplace_escrow::escrow::{
    AutoReleaseScheduler, ConfirmCredentialsRequest, DeliverCredentialsRequest,
    ACCOUNT_RECOVERY_SCORE,
};
use marketplace_escrow::models::Credentials;
use marketplace_escrow::services::FraudFlag;
use marketplace_escrow::transaction::{EscrowStatus, MiddlemanStatus, TransactionStatus};
use marketplace_escrow::wallet::LedgerKind;

fn delivery() -> DeliverCredentialsRequest {
    DeliverCredentialsRequest {
        credentials: credentials(),
    }
}

#[tokio::test]
async fn test_auto_release_pays_seller_exactly_once() {
    let harness = Harness::new();
    let (_buyer, seller, _product, tx) = harness.delivered_instant().await;
    let release_at = tx.auto_release_at.unwrap();

    let early = harness
        .escrow
        .process_auto_release_at(release_at - ChronoDuration::seconds(1))
        .await
        .unwrap();
    assert_eq!(early.examined, 0);

    let report = harness
        .escrow
        .process_auto_release_at(release_at + ChronoDuration::seconds(1))
        .await
        .unwrap();
    assert_eq!(report.examined, 1);
    assert_eq!(report.released, 1);

    let released = harness.transaction(tx.id);
    assert_eq!(released.status, TransactionStatus::AutoCompleted);
    assert_eq!(released.escrow_status, EscrowStatus::Released);
    assert!(released.completed_at.is_some());

    let credits = harness.wallet.entries_for(seller, LedgerKind::Credit);
    assert_eq!(credits.len(), 1);
    assert_eq!(credits[0].amount, PRICE);

    let again = harness
        .escrow
        .process_auto_release_at(release_at + ChronoDuration::hours(1))
        .await
        .unwrap();
    assert_eq!(again.examined, 0);
    assert_eq!(harness.wallet.entries_for(seller, LedgerKind::Credit).len(), 1);
}

#[tokio::test]
async fn test_disputed_transaction_is_never_auto_released() {
    let harness = Harness::new();
    let (buyer, seller, _product, tx) = harness.delivered_instant().await;

    let disputed = harness
        .escrow
        .confirm_credentials(tx.id, buyer, ConfirmCredentialsRequest::not_working("wrong password"))
        .await
        .unwrap();
    assert_eq!(disputed.status, TransactionStatus::Disputed);

    let report = harness
        .escrow
        .process_auto_release_at(tx.auto_release_at.unwrap() + ChronoDuration::days(3))
        .await
        .unwrap();
    assert_eq!(report.examined, 0);
    assert_eq!(harness.transaction(tx.id).status, TransactionStatus::Disputed);
    assert!(harness.wallet.entries_for(seller, LedgerKind::Credit).is_empty());

    let logs = harness.engine.list_transaction_logs(buyer, tx.id).await.unwrap();
    assert!(logs.iter().any(|log| log.notes == "Buyer dispute: wrong password"));
}

#[tokio::test]
async fn test_buyer_confirmation_releases_funds() {
    let harness = Harness::new();
    let (buyer, seller, _product, tx) = harness.delivered_instant().await;

    let completed = harness
        .escrow
        .confirm_credentials(tx.id, buyer, ConfirmCredentialsRequest::working())
        .await
        .unwrap();

    assert_eq!(completed.status, TransactionStatus::Completed);
    assert_eq!(completed.escrow_status, EscrowStatus::Released);
    assert!(completed.buyer_confirmed_credentials);
    assert_eq!(harness.wallet.balance(seller), PRICE);

    let report = harness
        .escrow
        .process_auto_release_at(tx.auto_release_at.unwrap() + ChronoDuration::seconds(1))
        .await
        .unwrap();
    assert_eq!(report.examined, 0);
    assert_eq!(harness.wallet.entries_for(seller, LedgerKind::Credit).len(), 1);
}

#[tokio::test]
async fn test_only_buyer_confirms_credentials() {
    let harness = Harness::new();
    let (_buyer, seller, _product, tx) = harness.delivered_instant().await;

    let err = harness
        .escrow
        .confirm_credentials(tx.id, seller, ConfirmCredentialsRequest::working())
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::Forbidden(_)));
}

#[tokio::test]
async fn test_confirmation_notes_are_length_checked() {
    let harness = Harness::new();
    let (buyer, _seller, _product, tx) = harness.delivered_instant().await;

    let err = harness
        .escrow
        .confirm_credentials(tx.id, buyer, ConfirmCredentialsRequest::not_working("x".repeat(1001)))
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::ValidationError(_)));
    assert_eq!(harness.transaction(tx.id).status, TransactionStatus::CredentialsDelivered);
}

#[tokio::test]
async fn test_seller_delivers_middleman_credentials_once() {
    let harness = Harness::new();
    let (buyer, seller, product) = harness.seed();
    let admin = harness.admin();
    harness.wallet.set_balance(buyer, 500_000);

    let mut req = common::request(product, "middleman", "wallet");
    req.middleman_id = Some(admin);
    let created = harness.engine.create_transaction(buyer, req).await.unwrap();
    let id = created.transaction.id;

    harness.engine.assign_middleman(admin, id).await.unwrap();
    harness
        .engine
        .process_payment(buyer, id, marketplace_escrow::transaction::ProcessPaymentRequest::wallet())
        .await
        .unwrap();
    harness.engine.confirm_middleman_payment(admin, id).await.unwrap();

    let err = harness
        .escrow
        .deliver_credentials(
            id,
            seller,
            DeliverCredentialsRequest {
                credentials: Credentials::default(),
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::BadRequest(_)));

    let delivered = harness
        .escrow
        .deliver_credentials(id, seller, delivery())
        .await
        .unwrap();
    assert_eq!(delivered.status, TransactionStatus::CredentialsDelivered);
    assert_eq!(delivered.escrow_status, EscrowStatus::Held);
    assert_eq!(delivered.middleman_status, Some(MiddlemanStatus::FundsReceived));
    let window = delivered.auto_release_at.unwrap() - delivered.credentials_delivered_at.unwrap();
    assert_eq!(window, ChronoDuration::hours(24));

    let err = harness
        .escrow
        .deliver_credentials(id, seller, delivery())
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::BadRequest(msg) if msg == "Credentials have already been delivered"));
}

#[tokio::test]
async fn test_delayed_credential_access_is_flagged() {
    let harness = Harness::new();
    let (buyer, _seller, _product, tx) = harness.delivered_instant().await;
    let delivered_at = tx.credentials_delivered_at.unwrap();

    let viewed = harness
        .escrow
        .record_credential_access_at(tx.id, buyer, delivered_at + ChronoDuration::hours(25))
        .await
        .unwrap();

    assert!(viewed.credentials_accessed_at.is_some());
    assert!(viewed.has_security_flag(FraudFlag::DelayedCredentialAccess.as_str()));

    let version = viewed.version;
    let again = harness.escrow.record_credential_access(tx.id, buyer).await.unwrap();
    assert_eq!(again.version, version);
}

#[tokio::test]
async fn test_prompt_credential_access_is_not_flagged() {
    let harness = Harness::new();
    let (buyer, _seller, _product, tx) = harness.delivered_instant().await;

    let viewed = harness.escrow.record_credential_access(tx.id, buyer).await.unwrap();
    assert!(viewed.credentials_accessed_at.is_some());
    assert!(!viewed.has_security_flag(FraudFlag::DelayedCredentialAccess.as_str()));
}

#[tokio::test]
async fn test_account_recovery_report_opens_dispute() {
    let harness = Harness::new();
    let (buyer, _seller, _product, tx) = harness.delivered_instant().await;

    let reported = harness
        .escrow
        .report_account_recovery(tx.id, buyer, "email changed back by seller")
        .await
        .unwrap();

    assert_eq!(reported.status, TransactionStatus::Disputed);
    assert!((reported.fraud_score - ACCOUNT_RECOVERY_SCORE).abs() < 1e-9);
    assert!(reported.has_security_flag(FraudFlag::AccountRecoveryReported.as_str()));

    let report = harness
        .escrow
        .process_auto_release_at(tx.auto_release_at.unwrap() + ChronoDuration::seconds(1))
        .await
        .unwrap();
    assert_eq!(report.released, 0);
}

#[tokio::test]
async fn test_scheduler_sweeps_and_stops_on_shutdown() {
    let harness = Harness::with_config(EscrowConfig {
        auto_release_hours: 0,
        sweep_interval_secs: 1,
        batch_size: 10,
    });
    let (_buyer, seller, _product, tx) = harness.delivered_instant().await;

    let scheduler = AutoReleaseScheduler::new(Arc::clone(&harness.escrow), Duration::from_millis(20));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(scheduler.run(shutdown_rx));

    let mut released = false;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        if harness.transaction(tx.id).status == TransactionStatus::AutoCompleted {
            released = true;
            break;
        }
    }
    assert!(released, "scheduler should release the due transaction");

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("scheduler stops after shutdown")
        .unwrap();

    assert_eq!(harness.wallet.entries_for(seller, LedgerKind::Credit).len(), 1);
}
