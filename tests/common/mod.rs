//! Shared fixtures for the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{Duration, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use marketplace_escrow::config::EscrowConfig;
use marketplace_escrow::db::{MemoryStore, ProductRepository};
use marketplace_escrow::escrow::EscrowManager;
use marketplace_escrow::models::{
    Credentials, Product, ProductStatus, User, UserRole, UserStatus, VerificationStatus,
};
use marketplace_escrow::notifier::BroadcastNotifier;
use marketplace_escrow::payment::{
    CallbackOutcome, GatewayError, GatewayStatus, PaymentGateway, PaymentNotification,
    PaymentReconciler, PaymentRequest, PaymentResponse,
};
use marketplace_escrow::transaction::{
    CreateTransactionRequest, CreatedTransaction, Transaction, TransactionEngine, VirtualAccount,
};
use marketplace_escrow::wallet::InMemoryWallet;

pub const PRICE: i64 = 100_000;
pub const FEE: i64 = 2_500;
pub const TOTAL: i64 = 102_500;

// ============================================================================
// Gateway double
// ============================================================================

/// Scripted payment gateway
#[derive(Default)]
pub struct MockGateway {
    statuses: Mutex<HashMap<String, GatewayStatus>>,
    created: Mutex<Vec<PaymentRequest>>,
    fail_create: AtomicBool,
}

impl MockGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_status(&self, order_id: &str, transaction_status: &str, fraud_status: &str) {
        self.statuses.lock().unwrap().insert(
            order_id.to_string(),
            GatewayStatus {
                transaction_status: transaction_status.to_string(),
                fraud_status: fraud_status.to_string(),
                status_code: "200".to_string(),
                ..Default::default()
            },
        );
    }

    pub fn fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    pub fn created_requests(&self) -> Vec<PaymentRequest> {
        self.created.lock().unwrap().clone()
    }
}

#[async_trait]
impl PaymentGateway for MockGateway {
    async fn create_payment(&self, request: &PaymentRequest) -> Result<PaymentResponse, GatewayError> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(GatewayError::Rejected {
                status: 503,
                message: "gateway unavailable".to_string(),
            });
        }
        self.created.lock().unwrap().push(request.clone());

        Ok(PaymentResponse {
            token: format!("token-{}", request.order_id),
            redirect_url: format!("https://pay.example.com/{}", request.order_id),
            order_id: request.order_id.clone(),
            status: "pending".to_string(),
            virtual_accounts: vec![VirtualAccount {
                bank: "bca".to_string(),
                va_number: "8000123456".to_string(),
            }],
        })
    }

    async fn get_payment_status(&self, order_id: &str) -> Result<GatewayStatus, GatewayError> {
        Ok(self
            .statuses
            .lock()
            .unwrap()
            .get(order_id)
            .cloned()
            .unwrap_or_else(|| GatewayStatus {
                transaction_status: "pending".to_string(),
                ..Default::default()
            }))
    }
}

// ============================================================================
// Harness
// ============================================================================

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub wallet: Arc<InMemoryWallet>,
    pub gateway: Arc<MockGateway>,
    pub notifier: BroadcastNotifier,
    pub engine: Arc<TransactionEngine>,
    pub escrow: Arc<EscrowManager>,
    pub reconciler: PaymentReconciler,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(EscrowConfig::default())
    }

    pub fn with_config(config: EscrowConfig) -> Self {
        let store = Arc::new(MemoryStore::new());
        Self::build(store.clone(), store, config)
    }

    /// Harness whose engine reads products through `products`
    pub fn build(
        store: Arc<MemoryStore>,
        products: Arc<dyn ProductRepository>,
        config: EscrowConfig,
    ) -> Self {
        let wallet = Arc::new(InMemoryWallet::new());
        let gateway = Arc::new(MockGateway::new());
        let notifier = BroadcastNotifier::new();

        let engine = Arc::new(TransactionEngine::new(
            store.clone(),
            products,
            store.clone(),
            gateway.clone(),
            wallet.clone(),
            Arc::new(notifier.clone()),
        ));
        let escrow = Arc::new(EscrowManager::new(engine.clone(), config));
        let reconciler = PaymentReconciler::new(engine.clone(), escrow.clone(), gateway.clone());

        Self {
            store,
            wallet,
            gateway,
            notifier,
            engine,
            escrow,
            reconciler,
        }
    }

    pub fn add_user(&self, user: User) -> Uuid {
        let id = user.id;
        self.store.insert_user(user);
        id
    }

    pub fn add_product(&self, product: Product) -> Uuid {
        let id = product.id;
        self.store.insert_product(product);
        id
    }

    /// Established buyer and seller plus a single-use account listing
    pub fn seed(&self) -> (Uuid, Uuid, Uuid) {
        let buyer = self.add_user(established_user("buyer"));
        let seller = self.add_user(established_user("seller"));
        let product = self.add_product(account_product(seller));
        (buyer, seller, product)
    }

    pub fn admin(&self) -> Uuid {
        self.add_user(admin_user())
    }

    pub fn transaction(&self, id: Uuid) -> Transaction {
        self.store.transaction(id).expect("transaction exists")
    }

    pub fn product(&self, id: Uuid) -> Product {
        self.store.product(id).expect("product exists")
    }

    pub async fn create(
        &self,
        buyer: Uuid,
        product: Uuid,
        delivery_method: &str,
        payment_method: &str,
    ) -> CreatedTransaction {
        self.engine
            .create_transaction(buyer, request(product, delivery_method, payment_method))
            .await
            .expect("transaction created")
    }

    /// Deliver a gateway notification and wait for any background delivery
    pub async fn notify_gateway(&self, tx: &Transaction, transaction_status: &str) -> CallbackOutcome {
        let order_id = tx.gateway_order_id.clone().expect("gateway order id");
        let mut outcome = self
            .reconciler
            .handle_payment_callback(notification(&order_id, transaction_status, ""))
            .await
            .expect("notification handled");

        if let CallbackOutcome::Applied { delivery, .. } = &mut outcome {
            if let Some(handle) = delivery.take() {
                handle.await.expect("delivery task");
            }
        }
        outcome
    }

    /// Instant purchase paid through the gateway, credentials delivered
    pub async fn delivered_instant(&self) -> (Uuid, Uuid, Uuid, Transaction) {
        let (buyer, seller, product) = self.seed();
        let created = self.create(buyer, product, "instant", "bank_transfer").await;
        self.notify_gateway(&created.transaction, "settlement").await;
        let tx = self.transaction(created.transaction.id);
        (buyer, seller, product, tx)
    }

    pub async fn log_count(&self, id: Uuid) -> usize {
        self.engine
            .list_transaction_logs(self.transaction(id).buyer_id, id)
            .await
            .expect("logs")
            .len()
    }
}

// ============================================================================
// Builders
// ============================================================================

pub fn user(name: &str, age: Duration) -> User {
    User {
        id: Uuid::new_v4(),
        username: format!("{}-{}", name, Uuid::new_v4().simple()),
        email: format!("{}@example.com", name),
        phone: Some("+628123456789".to_string()),
        role: UserRole::User,
        status: UserStatus::Active,
        verification_status: VerificationStatus::Verified,
        seller_rating: 4.8,
        seller_review_count: 40,
        created_at: Utc::now() - age,
    }
}

/// Verified user with a long, well-reviewed history
pub fn established_user(name: &str) -> User {
    user(name, Duration::days(90))
}

pub fn admin_user() -> User {
    User {
        role: UserRole::Admin,
        ..established_user("admin")
    }
}

pub fn credentials() -> Credentials {
    [("username", "immortal_rank"), ("password", "hunter2")]
        .into_iter()
        .collect()
}

/// Single-use account with stored credentials
pub fn account_product(seller_id: Uuid) -> Product {
    Product {
        id: Uuid::new_v4(),
        seller_id,
        title: "Immortal rank account".to_string(),
        game: Some("dota2".to_string()),
        price: PRICE,
        stock: 0,
        sold_count: 0,
        reserved_count: 0,
        views: 0,
        status: ProductStatus::Active,
        credentials: Some(credentials()),
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

pub fn request(product_id: Uuid, delivery_method: &str, payment_method: &str) -> CreateTransactionRequest {
    CreateTransactionRequest {
        product_id,
        delivery_method: delivery_method.to_string(),
        payment_method: payment_method.to_string(),
        middleman_id: None,
        notes: None,
    }
}

pub fn notification(order_id: &str, transaction_status: &str, fraud_status: &str) -> PaymentNotification {
    serde_json::from_value(serde_json::json!({
        "order_id": order_id,
        "transaction_status": transaction_status,
        "fraud_status": fraud_status,
        "status_code": "200",
        "gross_amount": "102500.00",
    }))
    .expect("valid notification")
}
