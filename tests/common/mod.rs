//! Shared fixtures for integration tests.

#![allow(dead_code)]

use rust_decimal::Decimal;
use std::sync::Arc;
use tradeleague::config::{Config, RateRule};
use tradeleague::services::{LeaderboardWorker, SqliteStore};
use tradeleague::sources::FixedQuoteProvider;
use tradeleague::types::{TradeRequest, TradeSide, TradingContext};
use tradeleague::AppState;

pub struct Harness {
    pub state: AppState,
    pub worker: Option<LeaderboardWorker>,
    pub provider: Arc<FixedQuoteProvider>,
    pub sqlite: Arc<SqliteStore>,
}

impl Harness {
    pub fn new(config: Config, prices: &[(&str, Decimal)]) -> Self {
        let sqlite = Arc::new(SqliteStore::new_in_memory().expect("in-memory sqlite"));
        let provider = Arc::new(FixedQuoteProvider::with_prices(prices.iter().copied()));
        Self::with_store(config, sqlite, provider)
    }

    pub fn with_store(
        config: Config,
        sqlite: Arc<SqliteStore>,
        provider: Arc<FixedQuoteProvider>,
    ) -> Self {
        let (state, worker) = AppState::new(config, Arc::clone(&sqlite), provider.clone());
        Self {
            state,
            worker: Some(worker),
            provider,
            sqlite,
        }
    }

    /// Run the leaderboard worker in the background.
    pub fn spawn_worker(&mut self) {
        if let Some(worker) = self.worker.take() {
            tokio::spawn(worker.run());
        }
    }
}

/// Default config with generous rate limits.
pub fn config() -> Config {
    let mut config = Config::default();
    config.rate_limits.trade = RateRule {
        max_requests: 1_000,
        time_window_seconds: 60,
    };
    config.rate_limits.lookup = RateRule {
        max_requests: 1_000,
        time_window_seconds: 60,
    };
    config
}

pub fn personal(user: &str) -> TradingContext {
    TradingContext::Personal {
        user_id: user.to_string(),
    }
}

pub fn league(league_id: &str, user: &str) -> TradingContext {
    TradingContext::League {
        league_id: league_id.to_string(),
        user_id: user.to_string(),
    }
}

pub fn order(context: &TradingContext, symbol: &str, side: TradeSide, shares: i64) -> TradeRequest {
    TradeRequest {
        symbol: symbol.to_string(),
        side,
        shares,
        context: context.clone(),
    }
}
