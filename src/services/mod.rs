//! Pre-persistence checks run before a transaction is created

pub mod fraud_scorer;
pub mod stock_guard;

pub use fraud_scorer::{
    FraudAction, FraudAnalysisResult, FraudContext, FraudFlag, FraudScorer, ReviewBy, RiskLevel,
};
pub use stock_guard::StockReservationGuard;
