//! Transaction domain module
//!
//! Contains the transaction aggregate, its transition table and the engine
//! that drives it.

mod model;
mod service;
pub mod state_machine;

pub use model::*;
pub use service::{calculate_fee, order_id_for, Applied, TransactionEngine, PLATFORM_FEE_BPS, STOCK_CONFLICT_FLAG};
