//! External price-quote providers.
//!
//! The trading core consumes quotes only through [`QuoteProvider`]; every
//! provider is treated as untrusted and is wrapped by the price oracle cache.

pub mod finnhub;
pub mod fixed;

pub use finnhub::FinnhubQuoteProvider;
pub use fixed::FixedQuoteProvider;

use async_trait::async_trait;
use rust_decimal::Decimal;
use thiserror::Error;

/// Failure of a live quote lookup.
#[derive(Debug, Error)]
pub enum QuoteError {
    #[error("No quote for {0}")]
    UnknownSymbol(String),

    #[error("Quote provider unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid quote for {symbol}: {reason}")]
    InvalidQuote { symbol: String, reason: String },

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

/// `lookup(symbol) -> price | failure`.
#[async_trait]
pub trait QuoteProvider: Send + Sync {
    /// Short provider name for logs.
    fn name(&self) -> &'static str;

    /// Fetch the current price for a symbol.
    async fn lookup(&self, symbol: &str) -> Result<Decimal, QuoteError>;
}
