//! Marketplace Escrow Library
//!
//! Settlement engine for a digital-goods marketplace: transaction creation,
//! stock reservation, payment reconciliation, escrow hold/release and the
//! auto-release sweep, with fraud scoring gating creation.

pub mod config;
pub mod db;
pub mod error;
pub mod escrow;
pub mod models;
pub mod notifier;
pub mod payment;
pub mod services;
pub mod transaction;
pub mod wallet;
