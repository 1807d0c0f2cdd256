use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use tradeleague::config::Config;
use tradeleague::services::SqliteStore;
use tradeleague::sources::{FinnhubQuoteProvider, FixedQuoteProvider, QuoteProvider};
use tradeleague::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tradeleague=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::from_env();
    info!("Starting TradeLeague server on {}:{}", config.host, config.port);

    let sqlite = Arc::new(SqliteStore::open(&config.database_path)?);
    info!("Using SQLite database at {}", config.database_path);

    let provider: Arc<dyn QuoteProvider> = match &config.prices.finnhub_api_key {
        Some(key) => {
            info!("Using Finnhub for price quotes");
            Arc::new(FinnhubQuoteProvider::new(key.clone()))
        }
        None => {
            warn!(
                "FINNHUB_API_KEY not set, serving {} fixed prices",
                config.prices.fixed_prices.len()
            );
            Arc::new(FixedQuoteProvider::with_prices(
                config.prices.fixed_prices.clone(),
            ))
        }
    };

    let (state, worker) = AppState::new(config, sqlite, provider);
    let config = Arc::clone(&state.config);

    if let Err(e) = state.leaderboard.restore_from_store() {
        warn!("Starting without persisted leaderboards: {}", e);
    }

    tokio::spawn(worker.run());

    // Garbage-collect idle rate limit windows
    {
        let rate_limiter = Arc::clone(&state.rate_limiter);
        let period = Duration::from_secs(config.rate_limits.sweep_interval_secs.max(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                let swept = rate_limiter.sweep_idle();
                if swept > 0 {
                    debug!(
                        "Swept {} idle rate limit windows, {} still tracked",
                        swept,
                        rate_limiter.tracked_windows()
                    );
                }
            }
        });
    }

    // Drop prices nobody has asked for in a while
    {
        let prices = Arc::clone(&state.prices);
        let ttl = prices.ttl();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(ttl.max(Duration::from_secs(1)));
            interval.tick().await;
            loop {
                interval.tick().await;
                let evicted = prices.evict_older_than(ttl * 10);
                if evicted > 0 {
                    debug!("Evicted {} cached prices", evicted);
                }
            }
        });
    }

    // Build CORS layer
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = tradeleague::app(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    // Start the server
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("TradeLeague server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("TradeLeague server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
