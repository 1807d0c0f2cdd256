//! Price oracle cache.
//!
//! Wraps an untrusted [`QuoteProvider`] with a short-TTL cache. Fresh entries
//! are served directly; expired or missing entries trigger a live lookup, and
//! when that lookup fails an expired entry is served flagged as stale.

use crate::sources::{QuoteError, QuoteProvider};
use crate::types::PriceQuote;
use dashmap::DashMap;
use rust_decimal::Decimal;
use std::sync::Arc;
use thiserror::Error;
use tokio::time::{Duration, Instant};
use tracing::{debug, warn};

/// No price could be produced for a symbol.
#[derive(Debug, Error)]
pub enum PriceError {
    #[error("No price available for {symbol}: {reason}")]
    Unavailable { symbol: String, reason: String },

    #[error("Only a stale price is available for {symbol}")]
    StaleOnly { symbol: String, quote: PriceQuote },
}

#[derive(Debug, Clone)]
struct PriceCacheEntry {
    price: Decimal,
    /// Monotonic fetch time, for TTL checks.
    fetched_at: Instant,
    /// Wall-clock fetch time (ms), for clients.
    fetched_at_ms: i64,
}

/// Short-TTL cache in front of the external price capability.
pub struct PriceCache {
    entries: DashMap<String, PriceCacheEntry>,
    provider: Arc<dyn QuoteProvider>,
    ttl: Duration,
}

impl PriceCache {
    pub fn new(provider: Arc<dyn QuoteProvider>, ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            provider,
            ttl,
        }
    }

    /// Get a price, falling back to a stale cache entry if the live lookup fails.
    pub async fn get_price(&self, symbol: &str) -> Result<PriceQuote, PriceError> {
        let symbol = normalize(symbol);

        if let Some(quote) = self.fresh_entry(&symbol) {
            return Ok(quote);
        }

        match self.provider.lookup(&symbol).await {
            Ok(price) => Ok(self.store(&symbol, price)),
            Err(e) => self.fallback(&symbol, e),
        }
    }

    /// Get a price suitable for settling a trade: fresh or an error.
    ///
    /// A stale fallback is returned as [`PriceError::StaleOnly`] so the caller
    /// decides whether to accept it.
    pub async fn get_fresh_price(&self, symbol: &str) -> Result<PriceQuote, PriceError> {
        let quote = self.get_price(symbol).await?;
        if quote.is_stale {
            return Err(PriceError::StaleOnly {
                symbol: quote.symbol.clone(),
                quote,
            });
        }
        Ok(quote)
    }

    /// Seed or overwrite an entry as freshly fetched.
    pub fn insert(&self, symbol: &str, price: Decimal) -> PriceQuote {
        self.store(&normalize(symbol), price)
    }

    /// Drop entries older than `max_age`.
    pub fn evict_older_than(&self, max_age: Duration) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| entry.fetched_at.elapsed() < max_age);
        before.saturating_sub(self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn fresh_entry(&self, symbol: &str) -> Option<PriceQuote> {
        let entry = self.entries.get(symbol)?;
        if entry.fetched_at.elapsed() < self.ttl {
            Some(PriceQuote {
                symbol: symbol.to_string(),
                price: entry.price,
                is_stale: false,
                fetched_at: entry.fetched_at_ms,
            })
        } else {
            None
        }
    }

    fn store(&self, symbol: &str, price: Decimal) -> PriceQuote {
        let entry = PriceCacheEntry {
            price,
            fetched_at: Instant::now(),
            fetched_at_ms: chrono::Utc::now().timestamp_millis(),
        };
        let quote = PriceQuote {
            symbol: symbol.to_string(),
            price,
            is_stale: false,
            fetched_at: entry.fetched_at_ms,
        };
        self.entries.insert(symbol.to_string(), entry);
        debug!("Cached {} price for {}: {}", self.provider.name(), symbol, price);
        quote
    }

    fn fallback(&self, symbol: &str, error: QuoteError) -> Result<PriceQuote, PriceError> {
        match self.entries.get(symbol) {
            Some(entry) => {
                warn!(
                    symbol,
                    provider = self.provider.name(),
                    age_secs = entry.fetched_at.elapsed().as_secs(),
                    error = %error,
                    "Live price lookup failed, serving stale price"
                );
                Ok(PriceQuote {
                    symbol: symbol.to_string(),
                    price: entry.price,
                    is_stale: true,
                    fetched_at: entry.fetched_at_ms,
                })
            }
            None => {
                warn!(
                    symbol,
                    provider = self.provider.name(),
                    error = %error,
                    "Live price lookup failed with no cached price"
                );
                Err(PriceError::Unavailable {
                    symbol: symbol.to_string(),
                    reason: error.to_string(),
                })
            }
        }
    }
}

fn normalize(symbol: &str) -> String {
    symbol.trim().to_uppercase()
}
