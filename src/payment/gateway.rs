//! Payment gateway client
//!
//! [`SnapGateway`] talks to a Snap-style hosted checkout: a JSON `POST` creates
//! the payment and returns a token plus redirect URL, and a `GET` on the order
//! reports its status.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use super::model::{GatewayStatus, PaymentRequest, PaymentResponse};
use crate::transaction::VirtualAccount;

const SANDBOX_SNAP_URL: &str = "https://app.sandbox.midtrans.com/snap/v1/transactions";
const PRODUCTION_SNAP_URL: &str = "https://app.midtrans.com/snap/v1/transactions";
const SANDBOX_API_URL: &str = "https://api.sandbox.midtrans.com/v2";
const PRODUCTION_API_URL: &str = "https://api.midtrans.com/v2";

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Payment gateway request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Payment gateway rejected the request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Payment gateway returned an unexpected response: {0}")]
    Decode(String),
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_payment(&self, request: &PaymentRequest) -> Result<PaymentResponse, GatewayError>;

    async fn get_payment_status(&self, order_id: &str) -> Result<GatewayStatus, GatewayError>;
}

pub struct SnapGateway {
    client: Client,
    authorization: String,
    snap_url: String,
    api_url: String,
}

impl SnapGateway {
    pub fn new(server_key: &str, production: bool) -> Result<Self, GatewayError> {
        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;

        let (snap_url, api_url) = if production {
            (PRODUCTION_SNAP_URL, PRODUCTION_API_URL)
        } else {
            (SANDBOX_SNAP_URL, SANDBOX_API_URL)
        };

        Ok(Self {
            client,
            authorization: format!("Basic {}", STANDARD.encode(format!("{}:", server_key))),
            snap_url: snap_url.to_string(),
            api_url: api_url.to_string(),
        })
    }

    /// Point the client at a different host (used against local stubs)
    pub fn with_base_urls(mut self, snap_url: impl Into<String>, api_url: impl Into<String>) -> Self {
        self.snap_url = snap_url.into();
        self.api_url = api_url.into();
        self
    }
}

#[derive(Serialize)]
struct SnapTransaction<'a> {
    transaction_details: TransactionDetails<'a>,
    customer_details: &'a super::model::CustomerDetails,
    item_details: &'a [super::model::LineItem],
    #[serde(skip_serializing_if = "Option::is_none")]
    enabled_payments: Option<Vec<&'a str>>,
}

#[derive(Serialize)]
struct TransactionDetails<'a> {
    order_id: &'a str,
    gross_amount: i64,
}

#[derive(Deserialize)]
struct SnapResponse {
    token: String,
    redirect_url: String,
}

#[derive(Deserialize)]
struct StatusResponse {
    #[serde(default)]
    transaction_status: String,
    #[serde(default)]
    fraud_status: String,
    #[serde(default)]
    status_code: String,
    #[serde(default)]
    status_message: String,
    #[serde(default)]
    payment_type: String,
    #[serde(default)]
    va_numbers: Vec<VaNumber>,
}

#[derive(Deserialize)]
struct VaNumber {
    bank: String,
    va_number: String,
}

#[async_trait]
impl PaymentGateway for SnapGateway {
    async fn create_payment(&self, request: &PaymentRequest) -> Result<PaymentResponse, GatewayError> {
        let enabled_payments = match request.payment_method.as_str() {
            "" | "gateway" | "any" => None,
            method => Some(vec![method]),
        };

        let body = SnapTransaction {
            transaction_details: TransactionDetails {
                order_id: &request.order_id,
                gross_amount: request.gross_amount,
            },
            customer_details: &request.customer,
            item_details: &request.items,
            enabled_payments,
        };

        let response = self
            .client
            .post(&self.snap_url)
            .header(reqwest::header::AUTHORIZATION, &self.authorization)
            .header(reqwest::header::ACCEPT, "application/json")
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(GatewayError::Rejected {
                status: status.as_u16(),
                message,
            });
        }

        let snap: SnapResponse = response
            .json()
            .await
            .map_err(|e| GatewayError::Decode(e.to_string()))?;

        tracing::info!(order_id = %request.order_id, "Payment created at gateway");

        Ok(PaymentResponse {
            token: snap.token,
            redirect_url: snap.redirect_url,
            order_id: request.order_id.clone(),
            status: "pending".to_string(),
            virtual_accounts: Vec::new(),
        })
    }

    async fn get_payment_status(&self, order_id: &str) -> Result<GatewayStatus, GatewayError> {
        let response = self
            .client
            .get(format!("{}/{}/status", self.api_url, order_id))
            .header(reqwest::header::AUTHORIZATION, &self.authorization)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(GatewayError::Rejected {
                status: status.as_u16(),
                message,
            });
        }

        let body: StatusResponse = response
            .json()
            .await
            .map_err(|e| GatewayError::Decode(e.to_string()))?;

        // The status endpoint answers 200 with an error code in the body for unknown orders
        if body.status_code == "404" {
            return Err(GatewayError::Rejected {
                status: 404,
                message: body.status_message,
            });
        }

        Ok(GatewayStatus {
            transaction_status: body.transaction_status,
            fraud_status: body.fraud_status,
            status_code: body.status_code,
            payment_type: body.payment_type,
            virtual_accounts: body
                .va_numbers
                .into_iter()
                .map(|va| VirtualAccount {
                    bank: va.bank,
                    va_number: va.va_number,
                })
                .collect(),
        })
    }
}
