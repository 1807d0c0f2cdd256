use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A price served by the oracle cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceQuote {
    pub symbol: String,
    pub price: Decimal,
    /// True when served from an expired entry after a failed live lookup.
    pub is_stale: bool,
    /// When the price was fetched from the provider (ms).
    pub fetched_at: i64,
}
