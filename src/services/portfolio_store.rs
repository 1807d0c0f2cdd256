//! Portfolio Store
//!
//! Owns cash and holdings for every trading context. Each portfolio sits
//! behind its own mutex; `apply_trade` holds it across validation, the SQLite
//! commit and the in-memory swap, so overlapping trades on one portfolio are
//! applied one at a time and a failed commit leaves nothing changed.

use crate::services::trade_executor::TradeError;
use crate::services::sqlite_store::{is_constraint_violation, SqliteStore};
use crate::types::{Holding, Portfolio, TradeSide, TradingContext, Transaction};
use dashmap::DashMap;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Rounding tolerance for every cash-sufficiency check (one cent).
pub const CASH_TOLERANCE: Decimal = dec!(0.01);

/// Decimal places kept on weighted-average cost.
const AVERAGE_COST_DP: u32 = 6;

/// Result of a committed trade.
#[derive(Debug, Clone)]
pub struct AppliedTrade {
    pub transaction: Transaction,
    pub new_cash: Decimal,
    pub new_holding_shares: u64,
}

/// In-memory portfolios backed by SQLite.
pub struct PortfolioStore {
    /// context key -> portfolio
    portfolios: DashMap<String, Arc<Mutex<Portfolio>>>,
    sqlite: Arc<SqliteStore>,
}

impl PortfolioStore {
    pub fn new(sqlite: Arc<SqliteStore>) -> Self {
        Self {
            portfolios: DashMap::new(),
            sqlite,
        }
    }

    /// Create a portfolio for a context (first deposit or league join).
    pub fn open_portfolio(
        &self,
        context: TradingContext,
        starting_cash: Decimal,
    ) -> Result<Portfolio, TradeError> {
        if starting_cash < Decimal::ZERO {
            return Err(TradeError::InvalidQuantity(format!(
                "starting cash must not be negative, got {}",
                starting_cash
            )));
        }
        if self.handle(&context)?.is_some() {
            return Err(TradeError::PortfolioExists(context.key()));
        }

        let portfolio = Portfolio::new(context, starting_cash);
        self.sqlite.insert_portfolio(&portfolio).map_err(|e| {
            if is_constraint_violation(&e) {
                TradeError::PortfolioExists(portfolio.context.key())
            } else {
                e.into()
            }
        })?;

        self.portfolios.insert(
            portfolio.context.key(),
            Arc::new(Mutex::new(portfolio.clone())),
        );
        info!(
            "Opened portfolio {} with {} cash",
            portfolio.context, portfolio.cash
        );
        Ok(portfolio)
    }

    /// Current state of a portfolio.
    pub fn get(&self, context: &TradingContext) -> Result<Portfolio, TradeError> {
        let handle = self.require(context)?;
        let portfolio = handle.lock().clone();
        Ok(portfolio)
    }

    pub fn exists(&self, context: &TradingContext) -> Result<bool, TradeError> {
        Ok(self.handle(context)?.is_some())
    }

    /// Credit cash to a portfolio.
    pub fn deposit(&self, context: &TradingContext, amount: Decimal) -> Result<Portfolio, TradeError> {
        if amount <= Decimal::ZERO {
            return Err(TradeError::InvalidQuantity(format!(
                "deposit amount must be positive, got {}",
                amount
            )));
        }

        let handle = self.require(context)?;
        let mut portfolio = handle.lock();
        let new_cash = portfolio
            .cash
            .checked_add(amount)
            .ok_or_else(|| TradeError::out_of_range("cash balance"))?;
        if let Err(e) = self.sqlite.update_cash(context, new_cash) {
            return Err(self.commit_error(context, &handle, e));
        }
        portfolio.cash = new_cash;

        debug!("Deposited {} into {}", amount, context);
        Ok(portfolio.clone())
    }

    /// Validate and commit one trade as a single atomic unit.
    ///
    /// On any error the portfolio is unchanged, in memory and on disk.
    pub fn apply_trade(
        &self,
        context: &TradingContext,
        symbol: &str,
        side: TradeSide,
        shares: i64,
        price: Decimal,
        fee: Decimal,
    ) -> Result<AppliedTrade, TradeError> {
        let shares = u64::try_from(shares)
            .ok()
            .filter(|s| *s > 0)
            .ok_or_else(|| {
                TradeError::InvalidQuantity(format!("shares must be positive, got {}", shares))
            })?;
        if price <= Decimal::ZERO {
            return Err(TradeError::InvalidQuantity(format!(
                "price must be positive, got {}",
                price
            )));
        }
        if fee < Decimal::ZERO {
            return Err(TradeError::InvalidQuantity(format!(
                "fee must not be negative, got {}",
                fee
            )));
        }

        let handle = self.require(context)?;
        let mut portfolio = handle.lock();

        let (new_cash, new_holding) = settle(&portfolio, symbol, side, shares, price, fee)?;
        let transaction = Transaction::new(context, symbol.to_string(), side, shares, price, fee);

        if let Err(e) =
            self.sqlite
                .commit_trade(context, new_cash, symbol, new_holding.as_ref(), &transaction)
        {
            error!("Failed to commit {} {} {} for {}: {}", side, shares, symbol, context, e);
            return Err(self.commit_error(context, &handle, e));
        }

        portfolio.cash = new_cash;
        let new_holding_shares = match new_holding {
            Some(holding) => {
                let shares = holding.shares;
                portfolio.holdings.insert(symbol.to_string(), holding);
                shares
            }
            None => {
                portfolio.holdings.remove(symbol);
                0
            }
        };

        Ok(AppliedTrade {
            transaction,
            new_cash,
            new_holding_shares,
        })
    }

    /// Member portfolios of a league, each copied under its own lock.
    pub fn league_portfolios(&self, league_id: &str) -> Result<Vec<Portfolio>, TradeError> {
        let contexts = self.sqlite.league_contexts(league_id)?;
        let mut members = Vec::with_capacity(contexts.len());
        for context in contexts {
            if let Some(handle) = self.handle(&context)? {
                members.push(handle.lock().clone());
            }
        }
        Ok(members)
    }

    /// Transaction history, newest first.
    pub fn transactions(
        &self,
        context: &TradingContext,
        limit: usize,
    ) -> Result<Vec<Transaction>, TradeError> {
        self.require(context)?;
        Ok(self.sqlite.transactions(context, limit)?)
    }

    /// Drop a portfolio (league or user removal). Its transactions are kept.
    pub fn remove_portfolio(&self, context: &TradingContext) -> Result<bool, TradeError> {
        let key = context.key();
        let removed = match self.portfolios.get(&key).map(|h| Arc::clone(h.value())) {
            Some(handle) => {
                let _guard = handle.lock();
                let removed = self.sqlite.delete_portfolio(context)?;
                self.portfolios.remove(&key);
                removed
            }
            None => self.sqlite.delete_portfolio(context)?,
        };
        if removed {
            info!("Removed portfolio {}", context);
        }
        Ok(removed)
    }

    /// Number of portfolios loaded in memory.
    pub fn loaded(&self) -> usize {
        self.portfolios.len()
    }

    /// A write that matched no portfolio row means the portfolio was removed
    /// underneath us; that is final, not a transient storage fault.
    fn commit_error(
        &self,
        context: &TradingContext,
        handle: &Arc<Mutex<Portfolio>>,
        e: rusqlite::Error,
    ) -> TradeError {
        match e {
            rusqlite::Error::QueryReturnedNoRows => {
                self.portfolios
                    .remove_if(&context.key(), |_, loaded| Arc::ptr_eq(loaded, handle));
                TradeError::PortfolioNotFound(context.key())
            }
            e => e.into(),
        }
    }

    fn require(&self, context: &TradingContext) -> Result<Arc<Mutex<Portfolio>>, TradeError> {
        self.handle(context)?
            .ok_or_else(|| TradeError::PortfolioNotFound(context.key()))
    }

    /// Shared handle, loading from SQLite on first access.
    fn handle(&self, context: &TradingContext) -> Result<Option<Arc<Mutex<Portfolio>>>, TradeError> {
        let key = context.key();
        if let Some(handle) = self.portfolios.get(&key) {
            return Ok(Some(Arc::clone(handle.value())));
        }

        let Some(portfolio) = self.sqlite.load_portfolio(context)? else {
            return Ok(None);
        };
        debug!("Loaded portfolio {} from SQLite", context);

        // Another caller may have loaded it meanwhile; keep whichever landed first.
        let handle = self
            .portfolios
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(portfolio)));
        Ok(Some(Arc::clone(handle.value())))
    }
}

/// Compute the post-trade cash and holding without mutating anything.
fn settle(
    portfolio: &Portfolio,
    symbol: &str,
    side: TradeSide,
    shares: u64,
    price: Decimal,
    fee: Decimal,
) -> Result<(Decimal, Option<Holding>), TradeError> {
    let notional = Decimal::from(shares)
        .checked_mul(price)
        .ok_or_else(|| TradeError::out_of_range("trade notional"))?;
    let current = portfolio.holdings.get(symbol);

    match side {
        TradeSide::Buy => {
            let cost = notional
                .checked_add(fee)
                .ok_or_else(|| TradeError::out_of_range("trade cost"))?;
            let new_cash = debit(portfolio.cash, cost)?;

            let (held, average) = current
                .map(|h| (h.shares, h.average_cost))
                .unwrap_or((0, Decimal::ZERO));
            let total_shares = held.checked_add(shares).ok_or_else(|| {
                TradeError::InvalidQuantity(format!("holding of {} would overflow", symbol))
            })?;
            let average_cost = Decimal::from(held)
                .checked_mul(average)
                .and_then(|held_cost| held_cost.checked_add(notional))
                .and_then(|total_cost| total_cost.checked_div(Decimal::from(total_shares)))
                .ok_or_else(|| TradeError::out_of_range("average cost"))?
                .round_dp(AVERAGE_COST_DP);

            Ok((
                new_cash,
                Some(Holding {
                    shares: total_shares,
                    average_cost,
                }),
            ))
        }
        TradeSide::Sell => {
            let held = current.map(|h| h.shares).unwrap_or(0);
            if held < shares {
                return Err(TradeError::InsufficientShares {
                    symbol: symbol.to_string(),
                    requested: shares,
                    held,
                });
            }

            // A fee larger than the proceeds is a debit like any other.
            let new_cash = if fee > notional {
                debit(portfolio.cash, fee - notional)?
            } else {
                portfolio
                    .cash
                    .checked_add(notional - fee)
                    .ok_or_else(|| TradeError::out_of_range("cash balance"))?
            };

            let remaining = held - shares;
            let holding = current
                .filter(|_| remaining > 0)
                .map(|h| Holding {
                    shares: remaining,
                    average_cost: h.average_cost,
                });
            Ok((new_cash, holding))
        }
    }
}

/// Subtract `amount` from `cash`, allowing a shortfall up to [`CASH_TOLERANCE`].
fn debit(cash: Decimal, amount: Decimal) -> Result<Decimal, TradeError> {
    if cash.saturating_add(CASH_TOLERANCE) < amount {
        return Err(TradeError::InsufficientFunds {
            needed: amount,
            available: cash,
        });
    }
    Ok((cash - amount).max(Decimal::ZERO))
}
