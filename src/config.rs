use rust_decimal::Decimal;
use std::env;
use std::str::FromStr;

/// Request budget for one operation category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateRule {
    /// Maximum requests allowed inside the window.
    pub max_requests: u32,
    /// Trailing window length in seconds.
    pub time_window_seconds: u64,
}

/// Rate limits per operation category.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Order submission.
    pub trade: RateRule,
    /// Read-heavy lookups (prices, portfolio reads).
    pub lookup: RateRule,
    /// How often idle windows are garbage-collected (seconds).
    pub sweep_interval_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            trade: RateRule {
                max_requests: 20,
                time_window_seconds: 60,
            },
            lookup: RateRule {
                max_requests: 30,
                time_window_seconds: 60,
            },
            sweep_interval_secs: 300,
        }
    }
}

/// Price oracle cache configuration.
#[derive(Debug, Clone)]
pub struct PriceConfig {
    /// Freshness window in seconds.
    pub ttl_secs: u64,
    /// Let trades execute on a stale price (logged). Off by default.
    pub allow_stale_trades: bool,
    /// Finnhub API key for live quotes.
    pub finnhub_api_key: Option<String>,
    /// Seed prices for the fixed provider, e.g. `AAPL=150,MSFT=300`.
    pub fixed_prices: Vec<(String, Decimal)>,
}

impl Default for PriceConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 60,
            allow_stale_trades: false,
            finnhub_api_key: None,
            fixed_prices: Vec::new(),
        }
    }
}

/// Trade execution configuration.
#[derive(Debug, Clone)]
pub struct ExecutionConfig {
    /// Flat fee charged per trade.
    pub fee_flat: Decimal,
    /// Fee as a fraction of notional (0.001 = 0.1%).
    pub fee_pct: Decimal,
    /// Attempts for a commit that hits a storage fault.
    pub storage_retry_attempts: u32,
    /// Base backoff between storage retries (ms), doubled per attempt.
    pub storage_retry_backoff_ms: u64,
    /// Cash for a newly opened portfolio when none is given.
    pub default_starting_cash: Decimal,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            fee_flat: Decimal::ZERO,
            fee_pct: Decimal::ZERO,
            storage_retry_attempts: 3,
            storage_retry_backoff_ms: 50,
            default_starting_cash: Decimal::from(10_000),
        }
    }
}

/// Leaderboard engine configuration.
#[derive(Debug, Clone)]
pub struct LeaderboardConfig {
    /// Value differences at or below this are not reported as changes.
    pub value_epsilon: Decimal,
    /// Recompute time budget in ms; overruns are logged.
    pub budget_ms: u64,
}

impl Default for LeaderboardConfig {
    fn default() -> Self {
        Self {
            value_epsilon: Decimal::new(5, 3), // 0.005
            budget_ms: 200,
        }
    }
}

/// Application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server host address.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// SQLite database path (`:memory:` for an in-memory store).
    pub database_path: String,
    pub rate_limits: RateLimitConfig,
    pub prices: PriceConfig,
    pub execution: ExecutionConfig,
    pub leaderboard: LeaderboardConfig,
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

fn env_flag(key: &str) -> Option<bool> {
    env::var(key).ok().map(|v| v == "true" || v == "1")
}

/// Parse `SYM=price,SYM2=price2`. Malformed pairs are skipped.
pub fn parse_fixed_prices(raw: &str) -> Vec<(String, Decimal)> {
    raw.split(',')
        .filter_map(|pair| {
            let (symbol, price) = pair.split_once('=')?;
            let symbol = symbol.trim();
            if symbol.is_empty() {
                return None;
            }
            let price = Decimal::from_str(price.trim()).ok()?;
            Some((symbol.to_uppercase(), price))
        })
        .collect()
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let rate_defaults = RateLimitConfig::default();
        let price_defaults = PriceConfig::default();
        let exec_defaults = ExecutionConfig::default();
        let board_defaults = LeaderboardConfig::default();

        Self {
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env_parse("PORT").unwrap_or(3001),
            database_path: env::var("DATABASE_PATH")
                .unwrap_or_else(|_| "tradeleague.db".to_string()),
            rate_limits: RateLimitConfig {
                trade: RateRule {
                    max_requests: env_parse("TRADE_RATE_LIMIT")
                        .unwrap_or(rate_defaults.trade.max_requests),
                    time_window_seconds: env_parse("TRADE_RATE_WINDOW_SECS")
                        .unwrap_or(rate_defaults.trade.time_window_seconds),
                },
                lookup: RateRule {
                    max_requests: env_parse("LOOKUP_RATE_LIMIT")
                        .unwrap_or(rate_defaults.lookup.max_requests),
                    time_window_seconds: env_parse("LOOKUP_RATE_WINDOW_SECS")
                        .unwrap_or(rate_defaults.lookup.time_window_seconds),
                },
                sweep_interval_secs: env_parse("RATE_LIMIT_SWEEP_SECS")
                    .unwrap_or(rate_defaults.sweep_interval_secs),
            },
            prices: PriceConfig {
                ttl_secs: env_parse("PRICE_TTL_SECS").unwrap_or(price_defaults.ttl_secs),
                allow_stale_trades: env_flag("ALLOW_STALE_TRADE_PRICES")
                    .unwrap_or(price_defaults.allow_stale_trades),
                finnhub_api_key: env::var("FINNHUB_API_KEY").ok().filter(|k| !k.is_empty()),
                fixed_prices: env::var("FIXED_PRICES")
                    .map(|raw| parse_fixed_prices(&raw))
                    .unwrap_or_default(),
            },
            execution: ExecutionConfig {
                fee_flat: env_parse("TRADE_FEE_FLAT").unwrap_or(exec_defaults.fee_flat),
                fee_pct: env_parse("TRADE_FEE_PCT").unwrap_or(exec_defaults.fee_pct),
                storage_retry_attempts: env_parse("STORAGE_RETRY_ATTEMPTS")
                    .unwrap_or(exec_defaults.storage_retry_attempts),
                storage_retry_backoff_ms: env_parse("STORAGE_RETRY_BACKOFF_MS")
                    .unwrap_or(exec_defaults.storage_retry_backoff_ms),
                default_starting_cash: env_parse("DEFAULT_STARTING_CASH")
                    .unwrap_or(exec_defaults.default_starting_cash),
            },
            leaderboard: LeaderboardConfig {
                value_epsilon: env_parse("LEADERBOARD_VALUE_EPSILON")
                    .unwrap_or(board_defaults.value_epsilon),
                budget_ms: env_parse("LEADERBOARD_BUDGET_MS").unwrap_or(board_defaults.budget_ms),
            },
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3001,
            database_path: ":memory:".to_string(),
            rate_limits: RateLimitConfig::default(),
            prices: PriceConfig::default(),
            execution: ExecutionConfig::default(),
            leaderboard: LeaderboardConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    // =========================================================================
    // Defaults
    // =========================================================================

    #[test]
    fn test_rate_limit_defaults() {
        let config = RateLimitConfig::default();
        assert_eq!(config.trade.max_requests, 20);
        assert_eq!(config.trade.time_window_seconds, 60);
        assert_eq!(config.lookup.max_requests, 30);
        assert_eq!(config.lookup.time_window_seconds, 60);
    }

    #[test]
    fn test_price_defaults() {
        let config = PriceConfig::default();
        assert_eq!(config.ttl_secs, 60);
        assert!(!config.allow_stale_trades);
        assert!(config.finnhub_api_key.is_none());
    }

    #[test]
    fn test_default_config_is_in_memory() {
        let config = Config::default();
        assert_eq!(config.database_path, ":memory:");
        assert_eq!(config.execution.default_starting_cash, dec!(10000));
        assert_eq!(config.leaderboard.value_epsilon, dec!(0.005));
    }

    // =========================================================================
    // FIXED_PRICES parsing
    // =========================================================================

    #[test]
    fn test_parse_fixed_prices() {
        let prices = parse_fixed_prices("aapl=150, MSFT = 300.25");
        assert_eq!(
            prices,
            vec![
                ("AAPL".to_string(), dec!(150)),
                ("MSFT".to_string(), dec!(300.25)),
            ]
        );
    }

    #[test]
    fn test_parse_fixed_prices_skips_malformed() {
        let prices = parse_fixed_prices("AAPL=abc,=5,GOOG,TSLA=200");
        assert_eq!(prices, vec![("TSLA".to_string(), dec!(200))]);
    }
}
