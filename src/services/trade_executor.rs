//! Trade Executor
//!
//! Order path: rate limit gate, fresh price, atomic portfolio update, then a
//! fire-and-forget leaderboard trigger for league trades. Only the first three
//! steps decide the outcome of a trade.

use crate::config::ExecutionConfig;
use crate::services::leaderboard::{LeaderboardTrigger, TriggerOutcome};
use crate::services::portfolio_store::PortfolioStore;
use crate::services::price_cache::{PriceCache, PriceError};
use crate::services::rate_limiter::{RateCategory, RateLimited, RateLimiter};
use crate::types::{Portfolio, PriceQuote, TradeReceipt, TradeRequest, TradingContext};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Trade errors.
#[derive(Debug, Error)]
pub enum TradeError {
    #[error(transparent)]
    RateLimited(#[from] RateLimited),

    #[error("Price unavailable for {symbol}: {reason}")]
    PriceUnavailable { symbol: String, reason: String },

    #[error("Invalid quantity: {0}")]
    InvalidQuantity(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Insufficient funds: need {needed}, have {available}")]
    InsufficientFunds { needed: Decimal, available: Decimal },

    #[error("Insufficient shares of {symbol}: requested {requested}, held {held}")]
    InsufficientShares {
        symbol: String,
        requested: u64,
        held: u64,
    },

    #[error("Storage failure: {0}")]
    StorageFailure(String),

    #[error("Portfolio not found: {0}")]
    PortfolioNotFound(String),

    #[error("Portfolio already exists: {0}")]
    PortfolioExists(String),
}

/// Machine-readable error kind returned to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeErrorKind {
    RateLimited,
    PriceUnavailable,
    InvalidQuantity,
    InvalidRequest,
    InsufficientFunds,
    InsufficientShares,
    StorageFailure,
    PortfolioNotFound,
    PortfolioExists,
}

impl TradeError {
    pub fn kind(&self) -> TradeErrorKind {
        match self {
            TradeError::RateLimited(_) => TradeErrorKind::RateLimited,
            TradeError::PriceUnavailable { .. } => TradeErrorKind::PriceUnavailable,
            TradeError::InvalidQuantity(_) => TradeErrorKind::InvalidQuantity,
            TradeError::InvalidRequest(_) => TradeErrorKind::InvalidRequest,
            TradeError::InsufficientFunds { .. } => TradeErrorKind::InsufficientFunds,
            TradeError::InsufficientShares { .. } => TradeErrorKind::InsufficientShares,
            TradeError::StorageFailure(_) => TradeErrorKind::StorageFailure,
            TradeError::PortfolioNotFound(_) => TradeErrorKind::PortfolioNotFound,
            TradeError::PortfolioExists(_) => TradeErrorKind::PortfolioExists,
        }
    }

    /// Only transient storage faults may be retried automatically.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TradeError::StorageFailure(_))
    }

    /// An amount that overflowed decimal arithmetic.
    pub(crate) fn out_of_range(what: &str) -> Self {
        TradeError::InvalidQuantity(format!("{} is out of range", what))
    }
}

impl From<rusqlite::Error> for TradeError {
    fn from(e: rusqlite::Error) -> Self {
        TradeError::StorageFailure(e.to_string())
    }
}

impl From<PriceError> for TradeError {
    fn from(e: PriceError) -> Self {
        match e {
            PriceError::Unavailable { symbol, reason } => {
                TradeError::PriceUnavailable { symbol, reason }
            }
            PriceError::StaleOnly { symbol, .. } => TradeError::PriceUnavailable {
                symbol,
                reason: "live lookup failed and only a stale price is cached".to_string(),
            },
        }
    }
}

/// Executes trades against the portfolio store.
pub struct TradeExecutor {
    rate_limiter: Arc<RateLimiter>,
    prices: Arc<PriceCache>,
    portfolios: Arc<PortfolioStore>,
    leaderboard: LeaderboardTrigger,
    config: ExecutionConfig,
    allow_stale_prices: bool,
}

impl TradeExecutor {
    pub fn new(
        rate_limiter: Arc<RateLimiter>,
        prices: Arc<PriceCache>,
        portfolios: Arc<PortfolioStore>,
        leaderboard: LeaderboardTrigger,
        config: ExecutionConfig,
        allow_stale_prices: bool,
    ) -> Self {
        Self {
            rate_limiter,
            prices,
            portfolios,
            leaderboard,
            config,
            allow_stale_prices,
        }
    }

    /// Submit an order. Rate limiting is checked against the context's user.
    pub async fn submit(&self, request: TradeRequest) -> Result<TradeReceipt, TradeError> {
        let context = request.context;
        let symbol = request.symbol.trim().to_uppercase();

        self.rate_limiter
            .check(context.user_id(), RateCategory::Trade)?;

        if request.shares <= 0 {
            return Err(TradeError::InvalidQuantity(format!(
                "shares must be positive, got {}",
                request.shares
            )));
        }
        if !self.portfolios.exists(&context)? {
            return Err(TradeError::PortfolioNotFound(context.key()));
        }

        let quote = self.trade_price(&symbol).await?;
        let notional = Decimal::from(request.shares)
            .checked_mul(quote.price)
            .ok_or_else(|| TradeError::out_of_range("trade notional"))?;
        let fee = self.fee_for(notional)?;

        let attempts = self.config.storage_retry_attempts.max(1);
        let mut attempt = 1;
        let applied = loop {
            match self.portfolios.apply_trade(
                &context,
                &symbol,
                request.side,
                request.shares,
                quote.price,
                fee,
            ) {
                Err(e) if e.is_retryable() && attempt < attempts => {
                    let backoff = self.backoff(attempt);
                    warn!(
                        "Storage failure on attempt {}/{} for {}, retrying in {:?}: {}",
                        attempt, attempts, context, backoff, e
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                result => break result?,
            }
        };

        info!(
            "Executed {} {} {} @ {} (fee {}) for {}",
            request.side, applied.transaction.shares, symbol, quote.price, fee, context
        );

        self.notify_league(&context);

        Ok(TradeReceipt {
            transaction_id: applied.transaction.id,
            symbol,
            side: request.side,
            shares: applied.transaction.shares,
            price: quote.price,
            fee,
            new_cash: applied.new_cash,
            new_holding_shares: applied.new_holding_shares,
        })
    }

    /// Open a portfolio. Joining a league adds a new leaderboard entrant.
    pub fn open_portfolio(
        &self,
        context: TradingContext,
        starting_cash: Option<Decimal>,
    ) -> Result<Portfolio, TradeError> {
        let cash = starting_cash.unwrap_or(self.config.default_starting_cash);
        let portfolio = self.portfolios.open_portfolio(context, cash)?;
        self.notify_league(&portfolio.context);
        Ok(portfolio)
    }

    /// Credit cash to a portfolio.
    pub fn deposit(
        &self,
        context: &TradingContext,
        amount: Decimal,
    ) -> Result<Portfolio, TradeError> {
        let portfolio = self.portfolios.deposit(context, amount)?;
        self.notify_league(context);
        Ok(portfolio)
    }

    fn notify_league(&self, context: &TradingContext) {
        let Some(league_id) = context.league_id() else {
            return;
        };
        match self.leaderboard.trigger(league_id) {
            TriggerOutcome::Scheduled => debug!("Leaderboard recompute scheduled for {}", league_id),
            TriggerOutcome::Coalesced => debug!("Leaderboard recompute coalesced for {}", league_id),
            TriggerOutcome::Degraded(reason) => {
                warn!("Leaderboard for {} may be stale: {}", league_id, reason)
            }
        }
    }

    /// Fee for a trade of the given notional, rounded to cents.
    pub fn fee_for(&self, notional: Decimal) -> Result<Decimal, TradeError> {
        self.config
            .fee_pct
            .checked_mul(notional)
            .and_then(|pct| pct.checked_add(self.config.fee_flat))
            .map(|fee| fee.round_dp(2))
            .ok_or_else(|| TradeError::out_of_range("trade fee"))
    }

    async fn trade_price(&self, symbol: &str) -> Result<PriceQuote, TradeError> {
        match self.prices.get_fresh_price(symbol).await {
            Ok(quote) => Ok(quote),
            Err(PriceError::StaleOnly { quote, .. }) if self.allow_stale_prices => {
                warn!(
                    "Executing {} trade on stale price {} fetched at {}",
                    symbol, quote.price, quote.fetched_at
                );
                Ok(quote)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << (attempt - 1).min(16);
        Duration::from_millis(self.config.storage_retry_backoff_ms.saturating_mul(factor))
    }
}
