pub mod leaderboard;
pub mod portfolio_store;
pub mod price_cache;
pub mod rate_limiter;
pub mod sqlite_store;
pub mod trade_executor;

pub use leaderboard::{
    LeaderboardEngine, LeaderboardError, LeaderboardTrigger, LeaderboardWorker, TriggerOutcome,
};
pub use portfolio_store::{AppliedTrade, PortfolioStore, CASH_TOLERANCE};
pub use price_cache::{PriceCache, PriceError};
pub use rate_limiter::{RateCategory, RateLimited, RateLimiter};
pub use sqlite_store::SqliteStore;
pub use trade_executor::{TradeError, TradeErrorKind, TradeExecutor};
