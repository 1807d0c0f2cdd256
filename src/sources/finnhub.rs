//! Finnhub REST quote provider for US stocks and ETFs.

use super::{QuoteError, QuoteProvider};
use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

const FINNHUB_URL: &str = "https://finnhub.io/api/v1";
const REQUEST_TIMEOUT_SECS: u64 = 5;

/// Finnhub quote response (only the fields the oracle needs).
#[derive(Debug, Clone, Deserialize)]
pub struct FinnhubQuote {
    /// Current price
    #[serde(rename = "c")]
    pub current: f64,
    /// Previous close price
    #[serde(rename = "pc")]
    pub previous_close: f64,
    /// Timestamp
    #[serde(rename = "t")]
    pub timestamp: i64,
}

impl FinnhubQuote {
    /// Convert to an exact decimal price.
    ///
    /// Finnhub answers unknown symbols with an all-zero quote rather than an
    /// error status, so a non-positive price is treated as a failed lookup.
    pub fn to_price(&self, symbol: &str) -> Result<Decimal, QuoteError> {
        if !self.current.is_finite() || self.current <= 0.0 {
            return Err(QuoteError::UnknownSymbol(symbol.to_string()));
        }
        Decimal::try_from(self.current)
            .map(|p| p.round_dp(4))
            .map_err(|e| QuoteError::InvalidQuote {
                symbol: symbol.to_string(),
                reason: e.to_string(),
            })
    }
}

/// Finnhub API client implementing [`QuoteProvider`].
pub struct FinnhubQuoteProvider {
    client: Client,
    api_key: String,
    base_url: String,
}

impl FinnhubQuoteProvider {
    pub fn new(api_key: String) -> Self {
        Self::with_base_url(api_key, FINNHUB_URL.to_string())
    }

    pub fn with_base_url(api_key: String, base_url: String) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            client,
            api_key,
            base_url,
        }
    }

    /// Get a raw quote for a symbol.
    pub async fn get_quote(&self, symbol: &str) -> Result<FinnhubQuote, QuoteError> {
        let url = format!("{}/quote", self.base_url);

        let response = self
            .client
            .get(&url)
            .query(&[("symbol", symbol), ("token", self.api_key.as_str())])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(QuoteError::Unavailable(format!(
                "API error: {}",
                response.status()
            )));
        }

        Ok(response.json::<FinnhubQuote>().await?)
    }
}

#[async_trait]
impl QuoteProvider for FinnhubQuoteProvider {
    fn name(&self) -> &'static str {
        "finnhub"
    }

    async fn lookup(&self, symbol: &str) -> Result<Decimal, QuoteError> {
        let quote = self.get_quote(symbol).await?;
        let price = quote.to_price(symbol)?;
        debug!("Finnhub quote for {}: {}", symbol, price);
        Ok(price)
    }
}
