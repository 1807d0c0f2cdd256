//! TradeLeague - paper-trading execution and real-time league leaderboards

pub mod api;
pub mod config;
pub mod error;
pub mod services;
pub mod sources;
pub mod types;
pub mod websocket;

use axum::{routing::get, Router};
use config::Config;
use services::{
    LeaderboardEngine, LeaderboardWorker, PortfolioStore, PriceCache, RateLimiter, SqliteStore,
    TradeExecutor,
};
use sources::QuoteProvider;
use std::sync::Arc;
use std::time::Duration;
use websocket::RoomManager;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub sqlite: Arc<SqliteStore>,
    pub rate_limiter: Arc<RateLimiter>,
    pub prices: Arc<PriceCache>,
    pub portfolios: Arc<PortfolioStore>,
    pub executor: Arc<TradeExecutor>,
    pub leaderboard: Arc<LeaderboardEngine>,
    pub room_manager: Arc<RoomManager>,
}

impl AppState {
    /// Wire every service. The returned worker must be spawned for
    /// leaderboard deltas to be computed and broadcast.
    pub fn new(
        config: Config,
        sqlite: Arc<SqliteStore>,
        provider: Arc<dyn QuoteProvider>,
    ) -> (Self, LeaderboardWorker) {
        let config = Arc::new(config);
        let rate_limiter = Arc::new(RateLimiter::new(config.rate_limits.clone()));
        let prices = Arc::new(PriceCache::new(
            provider,
            Duration::from_secs(config.prices.ttl_secs),
        ));
        let portfolios = Arc::new(PortfolioStore::new(Arc::clone(&sqlite)));
        let room_manager = RoomManager::new();

        let leaderboard = Arc::new(LeaderboardEngine::new(
            Arc::clone(&portfolios),
            Arc::clone(&prices),
            Arc::clone(&sqlite),
            config.leaderboard.clone(),
        ));
        let (worker, trigger) =
            LeaderboardWorker::new(Arc::clone(&leaderboard), Arc::clone(&room_manager));

        let executor = Arc::new(TradeExecutor::new(
            Arc::clone(&rate_limiter),
            Arc::clone(&prices),
            Arc::clone(&portfolios),
            trigger,
            config.execution.clone(),
            config.prices.allow_stale_trades,
        ));

        let state = Self {
            config,
            sqlite,
            rate_limiter,
            prices,
            portfolios,
            executor,
            leaderboard,
            room_manager,
        };
        (state, worker)
    }
}

/// HTTP and WebSocket routes, without middleware layers.
pub fn app(state: AppState) -> Router {
    Router::new()
        .merge(api::router())
        .route("/ws", get(websocket::ws_handler))
        .with_state(state)
}

// Re-export commonly used types
pub use types::*;
