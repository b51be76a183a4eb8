//! Fraud scoring for purchase attempts
//!
//! Scoring is additive over independent signals: each signal contributes a
//! fixed weight when its predicate holds. The result is advisory; the
//! transaction engine decides what a `block` or `review` action means.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{Product, User, UserStatus};

// ============================================================================
// Configuration Constants
// ============================================================================

/// Buyer account younger than 24 hours
const WEIGHT_NEW_BUYER: f64 = 0.20;

/// Seller account younger than 7 days
const WEIGHT_NEW_SELLER: f64 = 0.15;

/// Total amount above the high-value threshold
const WEIGHT_HIGH_VALUE: f64 = 0.30;

/// More than `RAPID_TRANSACTION_LIMIT` purchases by the buyer in the last hour
const WEIGHT_RAPID_TRANSACTIONS: f64 = 0.40;

/// Seller with fewer than `MIN_SELLER_REVIEWS` reviews
const WEIGHT_LOW_SELLER_REVIEWS: f64 = 0.10;

/// Seller rating below `MIN_SELLER_RATING`
const WEIGHT_LOW_SELLER_RATING: f64 = 0.20;

/// Product belongs to a game with a history of account recovery scams
const WEIGHT_HIGH_RISK_GAME: f64 = 0.10;

/// Buyer account is not active
const WEIGHT_INACTIVE_BUYER: f64 = 0.15;

/// Seller identity is not verified
const WEIGHT_UNVERIFIED_SELLER: f64 = 0.25;

const NEW_BUYER_HOURS: i64 = 24;
const NEW_SELLER_DAYS: i64 = 7;
const RAPID_TRANSACTION_LIMIT: i64 = 5;
const MIN_SELLER_REVIEWS: i32 = 5;
const MIN_SELLER_RATING: f64 = 4.0;

/// Default total amount (minor units) above which a purchase is high value
pub const DEFAULT_HIGH_VALUE_THRESHOLD: i64 = 1_000_000;

const DEFAULT_HIGH_RISK_GAMES: [&str; 3] = ["valorant", "csgo", "pubg"];

/// Window in which a buyer's purchases count as rapid
pub const RAPID_TRANSACTION_WINDOW_HOURS: i64 = 1;

// ============================================================================
// Data Models
// ============================================================================

/// Fraud analysis for one purchase attempt
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct FraudAnalysisResult {
    pub score: f64,
    pub risk_level: RiskLevel,
    pub flags: Vec<FraudFlag>,
    pub reasons: Vec<String>,
    pub action: FraudAction,
    pub review_by: ReviewBy,
}

impl FraudAnalysisResult {
    /// Flags as the tags stored on a transaction
    pub fn flag_tags(&self) -> Vec<String> {
        self.flags.iter().map(|f| f.as_str().to_string()).collect()
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Minimal,
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FraudAction {
    Allow,
    Review,
    Block,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReviewBy {
    Auto,
    Human,
    Admin,
}

/// Signals raised by the scorer and by post-delivery monitoring
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FraudFlag {
    NewBuyer,
    NewSeller,
    HighValue,
    RapidTransactions,
    LowSellerReviews,
    LowSellerRating,
    HighRiskGame,
    InactiveBuyer,
    UnverifiedSeller,
    DelayedCredentialAccess,
    AccountRecoveryReported,
}

impl FraudFlag {
    pub fn as_str(&self) -> &'static str {
        match self {
            FraudFlag::NewBuyer => "new_buyer",
            FraudFlag::NewSeller => "new_seller",
            FraudFlag::HighValue => "high_value",
            FraudFlag::RapidTransactions => "rapid_transactions",
            FraudFlag::LowSellerReviews => "low_seller_reviews",
            FraudFlag::LowSellerRating => "low_seller_rating",
            FraudFlag::HighRiskGame => "high_risk_game",
            FraudFlag::InactiveBuyer => "inactive_buyer",
            FraudFlag::UnverifiedSeller => "unverified_seller",
            FraudFlag::DelayedCredentialAccess => "delayed_credential_access",
            FraudFlag::AccountRecoveryReported => "account_recovery_reported",
        }
    }
}

/// Everything the scorer looks at for one attempt
#[derive(Debug, Clone, Copy)]
pub struct FraudContext<'a> {
    pub buyer: &'a User,
    pub seller: &'a User,
    pub product: &'a Product,
    pub total_amount: i64,
    /// Buyer's purchases within the rapid-transaction window
    pub recent_buyer_transactions: i64,
    pub now: DateTime<Utc>,
}

// ============================================================================
// Scorer
// ============================================================================

#[derive(Debug, Clone)]
pub struct FraudScorer {
    high_value_threshold: i64,
    high_risk_games: Vec<String>,
}

impl Default for FraudScorer {
    fn default() -> Self {
        Self::new()
    }
}

impl FraudScorer {
    pub fn new() -> Self {
        Self {
            high_value_threshold: DEFAULT_HIGH_VALUE_THRESHOLD,
            high_risk_games: DEFAULT_HIGH_RISK_GAMES
                .iter()
                .map(|g| g.to_string())
                .collect(),
        }
    }

    pub fn with_high_value_threshold(mut self, threshold: i64) -> Self {
        self.high_value_threshold = threshold;
        self
    }

    pub fn with_high_risk_games<I, S>(mut self, games: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.high_risk_games = games.into_iter().map(|g| g.into().to_lowercase()).collect();
        self
    }

    /// Score a purchase attempt
    pub fn analyze(&self, ctx: &FraudContext<'_>) -> FraudAnalysisResult {
        let mut score = 0.0;
        let mut flags = Vec::new();
        let mut reasons = Vec::new();

        let mut raise = |weight: f64, flag: FraudFlag, reason: String| {
            score += weight;
            flags.push(flag);
            reasons.push(reason);
        };

        if ctx.now - ctx.buyer.created_at < Duration::hours(NEW_BUYER_HOURS) {
            raise(
                WEIGHT_NEW_BUYER,
                FraudFlag::NewBuyer,
                "Buyer account is less than 24 hours old".to_string(),
            );
        }

        if ctx.now - ctx.seller.created_at < Duration::days(NEW_SELLER_DAYS) {
            raise(
                WEIGHT_NEW_SELLER,
                FraudFlag::NewSeller,
                "Seller account is less than 7 days old".to_string(),
            );
        }

        if ctx.total_amount > self.high_value_threshold {
            raise(
                WEIGHT_HIGH_VALUE,
                FraudFlag::HighValue,
                format!("Transaction amount {} exceeds {}", ctx.total_amount, self.high_value_threshold),
            );
        }

        if ctx.recent_buyer_transactions > RAPID_TRANSACTION_LIMIT {
            raise(
                WEIGHT_RAPID_TRANSACTIONS,
                FraudFlag::RapidTransactions,
                format!(
                    "Buyer made {} transactions in the last hour",
                    ctx.recent_buyer_transactions
                ),
            );
        }

        if ctx.seller.seller_review_count < MIN_SELLER_REVIEWS {
            raise(
                WEIGHT_LOW_SELLER_REVIEWS,
                FraudFlag::LowSellerReviews,
                format!("Seller has only {} reviews", ctx.seller.seller_review_count),
            );
        }

        if ctx.seller.seller_rating < MIN_SELLER_RATING {
            raise(
                WEIGHT_LOW_SELLER_RATING,
                FraudFlag::LowSellerRating,
                format!("Seller rating {:.1} is below {:.1}", ctx.seller.seller_rating, MIN_SELLER_RATING),
            );
        }

        if self.is_high_risk_product(ctx.product) {
            raise(
                WEIGHT_HIGH_RISK_GAME,
                FraudFlag::HighRiskGame,
                "Product belongs to a high-risk game".to_string(),
            );
        }

        if ctx.buyer.status != UserStatus::Active {
            raise(
                WEIGHT_INACTIVE_BUYER,
                FraudFlag::InactiveBuyer,
                "Buyer account is not active".to_string(),
            );
        }

        if !ctx.seller.is_verified() {
            raise(
                WEIGHT_UNVERIFIED_SELLER,
                FraudFlag::UnverifiedSeller,
                "Seller is not verified".to_string(),
            );
        }

        let (risk_level, action, review_by) = classify(score);

        FraudAnalysisResult {
            score,
            risk_level,
            flags,
            reasons,
            action,
            review_by,
        }
    }

    fn is_high_risk_product(&self, product: &Product) -> bool {
        let title = product.title.to_lowercase();
        let game = product.game.as_deref().unwrap_or_default().to_lowercase();
        self.high_risk_games
            .iter()
            .any(|g| title.contains(g.as_str()) || game.contains(g.as_str()))
    }
}

/// Map a score to its risk level, action and reviewer. First match wins.
pub fn classify(score: f64) -> (RiskLevel, FraudAction, ReviewBy) {
    if score >= 0.8 {
        (RiskLevel::Critical, FraudAction::Block, ReviewBy::Admin)
    } else if score >= 0.6 {
        (RiskLevel::High, FraudAction::Review, ReviewBy::Human)
    } else if score >= 0.4 {
        (RiskLevel::Medium, FraudAction::Review, ReviewBy::Auto)
    } else if score >= 0.2 {
        (RiskLevel::Low, FraudAction::Allow, ReviewBy::Auto)
    } else {
        (RiskLevel::Minimal, FraudAction::Allow, ReviewBy::Auto)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ProductStatus, UserRole, VerificationStatus};
    use uuid::Uuid;

    fn user(age: Duration) -> User {
        User {
            id: Uuid::new_v4(),
            username: "player".to_string(),
            email: "player@example.com".to_string(),
            phone: None,
            role: UserRole::User,
            status: UserStatus::Active,
            verification_status: VerificationStatus::Verified,
            seller_rating: 4.8,
            seller_review_count: 40,
            created_at: Utc::now() - age,
        }
    }

    fn product(title: &str) -> Product {
        Product {
            id: Uuid::new_v4(),
            seller_id: Uuid::new_v4(),
            title: title.to_string(),
            game: None,
            price: 50_000,
            stock: 1,
            sold_count: 0,
            reserved_count: 0,
            views: 0,
            status: ProductStatus::Active,
            credentials: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_weights_sum() {
        let total = WEIGHT_NEW_BUYER
            + WEIGHT_NEW_SELLER
            + WEIGHT_HIGH_VALUE
            + WEIGHT_RAPID_TRANSACTIONS
            + WEIGHT_LOW_SELLER_REVIEWS
            + WEIGHT_LOW_SELLER_RATING
            + WEIGHT_HIGH_RISK_GAME
            + WEIGHT_INACTIVE_BUYER
            + WEIGHT_UNVERIFIED_SELLER;
        assert!((total - 1.85).abs() < 1e-9);
    }

    #[test]
    fn test_classification_boundaries() {
        assert_eq!(classify(0.8).0, RiskLevel::Critical);
        assert_eq!(classify(0.8).1, FraudAction::Block);
        assert_eq!(classify(0.79).0, RiskLevel::High);
        assert_eq!(classify(0.6).2, ReviewBy::Human);
        assert_eq!(classify(0.4), (RiskLevel::Medium, FraudAction::Review, ReviewBy::Auto));
        assert_eq!(classify(0.2), (RiskLevel::Low, FraudAction::Allow, ReviewBy::Auto));
        assert_eq!(classify(0.0).0, RiskLevel::Minimal);
    }

    #[test]
    fn test_high_risk_game_matches_title_and_game() {
        let scorer = FraudScorer::new();
        assert!(scorer.is_high_risk_product(&product("Valorant Immortal 3 account")));

        let mut p = product("Radiant smurf");
        p.game = Some("PUBG".to_string());
        assert!(scorer.is_high_risk_product(&p));

        assert!(!scorer.is_high_risk_product(&product("Genshin AR60")));
    }

    #[test]
    fn test_score_is_not_capped() {
        let now = Utc::now();
        let mut buyer = user(Duration::minutes(5));
        buyer.status = UserStatus::Suspended;
        let mut seller = user(Duration::hours(1));
        seller.verification_status = VerificationStatus::Unverified;
        seller.seller_rating = 1.0;
        seller.seller_review_count = 0;

        let result = FraudScorer::new().analyze(&FraudContext {
            buyer: &buyer,
            seller: &seller,
            product: &product("csgo prime"),
            total_amount: 5_000_000,
            recent_buyer_transactions: 9,
            now,
        });

        assert!((result.score - 1.85).abs() < 1e-9);
        assert_eq!(result.flags.len(), 9);
        assert_eq!(result.action, FraudAction::Block);
    }

    #[test]
    fn test_flag_tags() {
        let now = Utc::now();
        let buyer = user(Duration::hours(2));
        let seller = user(Duration::days(30));

        let result = FraudScorer::new().analyze(&FraudContext {
            buyer: &buyer,
            seller: &seller,
            product: &product("Genshin AR60"),
            total_amount: 10_000,
            recent_buyer_transactions: 0,
            now,
        });

        assert_eq!(result.flag_tags(), vec!["new_buyer".to_string()]);
        assert_eq!(result.risk_level, RiskLevel::Low);
    }
}
