//! Payment gateway payloads

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};

use crate::transaction::VirtualAccount;

/// Payment creation request sent to the gateway
#[derive(Debug, Serialize, Clone)]
pub struct PaymentRequest {
    pub order_id: String,
    /// Total charged, in minor currency units
    pub gross_amount: i64,
    pub payment_method: String,
    pub customer: CustomerDetails,
    pub items: Vec<LineItem>,
}

#[derive(Debug, Serialize, Clone)]
pub struct CustomerDetails {
    pub first_name: String,
    pub email: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
}

#[derive(Debug, Serialize, Clone)]
pub struct LineItem {
    pub id: String,
    pub name: String,
    pub price: i64,
    pub quantity: i32,
}

/// Payable reference returned by the gateway
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PaymentResponse {
    pub token: String,
    pub redirect_url: String,
    pub order_id: String,
    pub status: String,
    pub virtual_accounts: Vec<VirtualAccount>,
}

/// Gateway-side status of an order, as reported by a status poll
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct GatewayStatus {
    pub transaction_status: String,
    pub fraud_status: String,
    pub status_code: String,
    pub payment_type: String,
    pub virtual_accounts: Vec<VirtualAccount>,
}

/// Asynchronous payment notification (webhook body)
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PaymentNotification {
    pub order_id: String,
    #[serde(default)]
    pub transaction_status: String,
    #[serde(default)]
    pub fraud_status: String,
    #[serde(default)]
    pub status_code: String,
    #[serde(default)]
    pub gross_amount: String,
    #[serde(default)]
    pub signature_key: String,
    #[serde(default)]
    pub payment_type: String,
    #[serde(default)]
    pub transaction_id: Option<String>,
}

impl PaymentNotification {
    /// Expected signature: hex SHA-512 of order id, status code, gross amount and server key
    pub fn expected_signature(&self, server_key: &str) -> String {
        let mut hasher = Sha512::new();
        hasher.update(self.order_id.as_bytes());
        hasher.update(self.status_code.as_bytes());
        hasher.update(self.gross_amount.as_bytes());
        hasher.update(server_key.as_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn verify_signature(&self, server_key: &str) -> bool {
        !self.signature_key.is_empty()
            && self
                .expected_signature(server_key)
                .eq_ignore_ascii_case(self.signature_key.trim())
    }
}
