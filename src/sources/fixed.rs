//! In-process quote provider with settable prices.
//!
//! Serves development deployments without a market data key (seeded from
//! `FIXED_PRICES`) and stands in for the live provider in tests.

use super::{QuoteError, QuoteProvider};
use async_trait::async_trait;
use dashmap::DashMap;
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tracing::trace;

/// Quote provider backed by a map of manually set prices.
#[derive(Default)]
pub struct FixedQuoteProvider {
    prices: DashMap<String, Decimal>,
    offline: AtomicBool,
    lookups: AtomicUsize,
}

impl FixedQuoteProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_prices<I, S>(prices: I) -> Self
    where
        I: IntoIterator<Item = (S, Decimal)>,
        S: Into<String>,
    {
        let provider = Self::new();
        for (symbol, price) in prices {
            provider.set_price(&symbol.into(), price);
        }
        provider
    }

    pub fn set_price(&self, symbol: &str, price: Decimal) {
        self.prices.insert(symbol.to_uppercase(), price);
    }

    /// Make every lookup fail until switched back.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Number of lookups served or attempted.
    #[cfg(test)]
    pub fn lookup_count(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl QuoteProvider for FixedQuoteProvider {
    fn name(&self) -> &'static str {
        "fixed"
    }

    async fn lookup(&self, symbol: &str) -> Result<Decimal, QuoteError> {
        let served = self.lookups.fetch_add(1, Ordering::SeqCst) + 1;
        trace!(symbol, served, "Fixed quote lookup");

        if self.offline.load(Ordering::SeqCst) {
            return Err(QuoteError::Unavailable("provider offline".to_string()));
        }

        self.prices
            .get(&symbol.to_uppercase())
            .map(|p| *p)
            .ok_or_else(|| QuoteError::UnknownSymbol(symbol.to_string()))
    }
}
