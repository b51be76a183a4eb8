//! Escrow domain module
//!
//! Contains the escrow manager, its request/report types, and the
//! auto-release scheduler.

mod model;
mod scheduler;
mod service;

pub use model::*;
pub use scheduler::AutoReleaseScheduler;
pub use service::{EscrowManager, ACCOUNT_RECOVERY_SCORE, DELAYED_ACCESS_HOURS};
