//! Payment gateway integration
//!
//! Contains the gateway client, its payloads, and the reconciler that applies
//! gateway verdicts to transactions.

mod gateway;
mod model;
mod reconciler;

pub use gateway::{GatewayError, PaymentGateway, SnapGateway};
pub use model::*;
pub use reconciler::{
    map_gateway_status, CallbackOutcome, PaymentReconciler, PAYMENT_AFTER_CLOSE_FLAG,
    REFUND_AFTER_RELEASE_FLAG,
};
