//! Marketplace Escrow Engine
//!
//! Wires the settlement engine to its collaborators and runs the auto-release
//! scheduler until shutdown. Request routing is left to the embedding host.

use std::sync::Arc;
use tokio::signal;
use tokio::sync::{broadcast, watch};

use marketplace_escrow::config::Config;
use marketplace_escrow::db::{
    self, MemoryStore, PostgresRepository, ProductRepository, TransactionRepository,
    UserRepository,
};
use marketplace_escrow::escrow::{AutoReleaseScheduler, EscrowManager};
use marketplace_escrow::notifier::BroadcastNotifier;
use marketplace_escrow::payment::{PaymentGateway, PaymentReconciler, SnapGateway};
use marketplace_escrow::services::FraudScorer;
use marketplace_escrow::transaction::TransactionEngine;
use marketplace_escrow::wallet::{InMemoryWallet, WalletService};

type Repositories = (
    Arc<dyn TransactionRepository>,
    Arc<dyn ProductRepository>,
    Arc<dyn UserRepository>,
);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level)),
        )
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    tracing::info!(
        environment = config.environment.as_str(),
        database = %config.database_url_masked(),
        "Starting marketplace escrow engine"
    );

    let (transactions, products, users): Repositories = if config.database_url.is_some() {
        tracing::info!("Connecting to database...");
        let pool = db::create_pool(&config).await?;
        db::run_migrations(&pool).await?;
        db::check_health(&pool).await?;
        tracing::info!("Database connected successfully");

        repositories(Arc::new(PostgresRepository::new(pool)))
    } else {
        tracing::warn!("DATABASE_URL not set, using the in-memory store");
        repositories(Arc::new(MemoryStore::new()))
    };

    let gateway: Arc<dyn PaymentGateway> = Arc::new(SnapGateway::new(
        &config.payment_server_key,
        config.payment_production,
    )?);
    let wallet: Arc<dyn WalletService> = Arc::new(InMemoryWallet::new());

    let notifier = BroadcastNotifier::new();
    let mut deliveries = notifier.subscribe();
    tokio::spawn(async move {
        loop {
            match deliveries.recv().await {
                Ok(delivery) => tracing::debug!(?delivery, "Notification published"),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Notification log lagging")
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let engine = Arc::new(
        TransactionEngine::new(
            transactions,
            products,
            users,
            gateway.clone(),
            wallet,
            Arc::new(notifier),
        )
        .with_fraud_scorer(
            FraudScorer::new().with_high_value_threshold(config.fraud_high_value_threshold),
        ),
    );

    let escrow = Arc::new(EscrowManager::new(engine.clone(), config.escrow.clone()));

    let mut reconciler = PaymentReconciler::new(engine, escrow.clone(), gateway);
    if config.webhook_verify_signature {
        reconciler = reconciler.with_signature_verification(config.payment_server_key.clone());
    }
    tracing::info!(
        verify_signatures = reconciler.verifies_signatures(),
        "Payment reconciler ready"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler = AutoReleaseScheduler::new(escrow, config.escrow.sweep_interval());
    let sweeper = tokio::spawn(scheduler.run(shutdown_rx));

    shutdown_signal().await;

    let _ = shutdown_tx.send(true);
    if let Err(e) = sweeper.await {
        tracing::error!("Auto-release scheduler task failed: {}", e);
    }

    tracing::info!("Server shutdown complete");
    Ok(())
}

fn repositories<R>(store: Arc<R>) -> Repositories
where
    R: TransactionRepository + ProductRepository + UserRepository + 'static,
{
    (store.clone(), store.clone(), store)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown...");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown...");
        }
    }
}
