//! Trading types: portfolios, holdings, transactions and trade requests.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The scope a portfolio belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TradingContext {
    /// A user's personal account.
    Personal { user_id: String },
    /// A user's membership in a specific league.
    League { league_id: String, user_id: String },
}

impl TradingContext {
    /// Build a context from a user and an optional league.
    pub fn for_user(user_id: impl Into<String>, league_id: Option<String>) -> Self {
        let user_id = user_id.into();
        match league_id {
            Some(league_id) => TradingContext::League { league_id, user_id },
            None => TradingContext::Personal { user_id },
        }
    }

    pub fn user_id(&self) -> &str {
        match self {
            TradingContext::Personal { user_id } => user_id,
            TradingContext::League { user_id, .. } => user_id,
        }
    }

    pub fn league_id(&self) -> Option<&str> {
        match self {
            TradingContext::Personal { .. } => None,
            TradingContext::League { league_id, .. } => Some(league_id),
        }
    }

    /// Stable storage key, e.g. `personal:alice` or `league:2:l1:alice`.
    ///
    /// The league id is length-prefixed so ids containing `:` cannot make two
    /// contexts share a key.
    pub fn key(&self) -> String {
        match self {
            TradingContext::Personal { user_id } => format!("personal:{}", user_id),
            TradingContext::League { league_id, user_id } => {
                format!("league:{}:{}:{}", league_id.len(), league_id, user_id)
            }
        }
    }
}

impl std::fmt::Display for TradingContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.key())
    }
}

/// Buy or sell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeSide {
    Buy,
    Sell,
}

impl std::fmt::Display for TradeSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TradeSide::Buy => write!(f, "buy"),
            TradeSide::Sell => write!(f, "sell"),
        }
    }
}

impl std::str::FromStr for TradeSide {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "buy" => Ok(TradeSide::Buy),
            "sell" => Ok(TradeSide::Sell),
            other => Err(format!("unknown trade side: {}", other)),
        }
    }
}

/// Shares held in one symbol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Holding {
    pub shares: u64,
    /// Weighted-average purchase price per share (fees excluded).
    pub average_cost: Decimal,
}

/// Cash and holdings for one trading context.
///
/// Invariants: `cash >= 0`, and a holding with zero shares is never present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Portfolio {
    pub context: TradingContext,
    pub cash: Decimal,
    /// Symbol -> holding. Ordered so serialized output is deterministic.
    pub holdings: BTreeMap<String, Holding>,
    /// When the portfolio was opened (ms). Doubles as league join time.
    pub created_at: i64,
}

impl Portfolio {
    pub fn new(context: TradingContext, cash: Decimal) -> Self {
        Self {
            context,
            cash,
            holdings: BTreeMap::new(),
            created_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Shares currently held for a symbol (0 if none).
    pub fn shares_of(&self, symbol: &str) -> u64 {
        self.holdings.get(symbol).map(|h| h.shares).unwrap_or(0)
    }
}

/// Immutable record of one committed trade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: String,
    /// Storage key of the owning portfolio.
    pub context_key: String,
    pub symbol: String,
    pub side: TradeSide,
    pub shares: u64,
    pub price: Decimal,
    pub fee: Decimal,
    /// Execution time (ms).
    pub executed_at: i64,
}

impl Transaction {
    pub fn new(
        context: &TradingContext,
        symbol: String,
        side: TradeSide,
        shares: u64,
        price: Decimal,
        fee: Decimal,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            context_key: context.key(),
            symbol,
            side,
            shares,
            price,
            fee,
            executed_at: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// Client order submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRequest {
    pub symbol: String,
    pub side: TradeSide,
    /// Signed so that zero and negative quantities reach validation
    /// instead of failing deserialization.
    pub shares: i64,
    pub context: TradingContext,
}

/// Successful trade response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeReceipt {
    pub transaction_id: String,
    pub symbol: String,
    pub side: TradeSide,
    pub shares: u64,
    pub price: Decimal,
    pub fee: Decimal,
    pub new_cash: Decimal,
    pub new_holding_shares: u64,
}

/// Portfolio value at current (possibly stale) prices.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortfolioValuation {
    pub context: TradingContext,
    pub cash: Decimal,
    pub holdings_value: Decimal,
    pub total_value: Decimal,
    /// At least one price came from an expired cache entry.
    pub stale: bool,
    /// Symbols with no price at all, valued at average cost instead.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub unpriced: Vec<String>,
}
