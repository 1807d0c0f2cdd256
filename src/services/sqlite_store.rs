//! SQLite persistence for portfolios, holdings, transactions and the last
//! leaderboard snapshot per league.
//!
//! A trade commit writes cash, the touched holding and the transaction row in
//! one SQLite transaction, so a failure never leaves partial state behind.

use crate::types::{
    Holding, LeaderboardEntry, LeaderboardSnapshot, Portfolio, TradeSide, TradingContext,
    Transaction,
};
use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use rust_decimal::Decimal;
use std::path::Path;
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{debug, info, warn};

/// SQLite store for durable trading state.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    /// Pending injected commit faults (operational drills and tests).
    injected_failures: AtomicU32,
}

impl SqliteStore {
    /// Create a new SQLite store at the given path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, rusqlite::Error> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        let store = Self::from_connection(conn)?;
        info!("SQLite store initialized");
        Ok(store)
    }

    /// Create an in-memory SQLite store (for testing).
    pub fn new_in_memory() -> Result<Self, rusqlite::Error> {
        let store = Self::from_connection(Connection::open_in_memory()?)?;
        debug!("In-memory SQLite store initialized");
        Ok(store)
    }

    /// Open `:memory:` or a file path.
    pub fn open(path: &str) -> Result<Self, rusqlite::Error> {
        if path == ":memory:" {
            Self::new_in_memory()
        } else {
            Self::new(path)
        }
    }

    fn from_connection(conn: Connection) -> Result<Self, rusqlite::Error> {
        let store = Self {
            conn: Mutex::new(conn),
            injected_failures: AtomicU32::new(0),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Initialize database schema.
    fn init_schema(&self) -> Result<(), rusqlite::Error> {
        let conn = self.conn.lock();

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS portfolios (
                context_key TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                league_id TEXT,
                cash TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_portfolios_league
                ON portfolios(league_id, created_at);

            CREATE TABLE IF NOT EXISTS holdings (
                context_key TEXT NOT NULL,
                symbol TEXT NOT NULL,
                shares INTEGER NOT NULL CHECK (shares > 0),
                average_cost TEXT NOT NULL,
                PRIMARY KEY (context_key, symbol)
            );

            CREATE TABLE IF NOT EXISTS transactions (
                id TEXT PRIMARY KEY,
                context_key TEXT NOT NULL,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                shares INTEGER NOT NULL,
                price TEXT NOT NULL,
                fee TEXT NOT NULL,
                executed_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_transactions_context
                ON transactions(context_key, executed_at DESC);

            CREATE TABLE IF NOT EXISTS leaderboard_snapshots (
                league_id TEXT PRIMARY KEY,
                computed_at INTEGER NOT NULL,
                entries_json TEXT NOT NULL
            );",
        )?;

        debug!("SQLite schema initialized");
        Ok(())
    }

    /// Make the next `count` trade commits fail with a busy error.
    pub fn inject_commit_failures(&self, count: u32) {
        self.injected_failures.store(count, Ordering::SeqCst);
    }

    fn take_injected_failure(&self) -> Option<rusqlite::Error> {
        self.injected_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .ok()
            .map(|_| {
                rusqlite::Error::SqliteFailure(
                    rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
                    Some("injected commit failure".to_string()),
                )
            })
    }

    // ========== Portfolio Methods ==========

    /// Insert a new, empty portfolio. Fails with a constraint error if it exists.
    pub fn insert_portfolio(&self, portfolio: &Portfolio) -> Result<(), rusqlite::Error> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO portfolios (context_key, user_id, league_id, cash, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                portfolio.context.key(),
                portfolio.context.user_id(),
                portfolio.context.league_id(),
                portfolio.cash.to_string(),
                portfolio.created_at,
            ],
        )?;
        Ok(())
    }

    /// Load a portfolio with its holdings.
    pub fn load_portfolio(
        &self,
        context: &TradingContext,
    ) -> Result<Option<Portfolio>, rusqlite::Error> {
        let conn = self.conn.lock();
        let key = context.key();

        let header = conn
            .query_row(
                "SELECT cash, created_at FROM portfolios WHERE context_key = ?1",
                params![key],
                |row| Ok((decimal_col(row, 0)?, row.get::<_, i64>(1)?)),
            )
            .optional()?;

        let Some((cash, created_at)) = header else {
            return Ok(None);
        };

        let mut stmt = conn.prepare(
            "SELECT symbol, shares, average_cost FROM holdings WHERE context_key = ?1",
        )?;
        let holdings = stmt
            .query_map(params![key], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    Holding {
                        shares: shares_col(row, 1)?,
                        average_cost: decimal_col(row, 2)?,
                    },
                ))
            })?
            .collect::<Result<_, _>>()?;

        Ok(Some(Portfolio {
            context: context.clone(),
            cash,
            holdings,
            created_at,
        }))
    }

    /// Persist the effect of one trade atomically.
    ///
    /// `holding` is the symbol's new state; `None` deletes the row.
    pub fn commit_trade(
        &self,
        context: &TradingContext,
        new_cash: Decimal,
        symbol: &str,
        holding: Option<&Holding>,
        transaction: &Transaction,
    ) -> Result<(), rusqlite::Error> {
        if let Some(e) = self.take_injected_failure() {
            warn!("Injected commit failure for {}", context);
            return Err(e);
        }

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let key = context.key();

        let updated = tx.execute(
            "UPDATE portfolios SET cash = ?1 WHERE context_key = ?2",
            params![new_cash.to_string(), key],
        )?;
        if updated != 1 {
            return Err(rusqlite::Error::QueryReturnedNoRows);
        }

        match holding {
            Some(h) => {
                tx.execute(
                    "INSERT INTO holdings (context_key, symbol, shares, average_cost)
                     VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(context_key, symbol)
                     DO UPDATE SET shares = excluded.shares, average_cost = excluded.average_cost",
                    params![key, symbol, shares_param(h.shares)?, h.average_cost.to_string()],
                )?;
            }
            None => {
                tx.execute(
                    "DELETE FROM holdings WHERE context_key = ?1 AND symbol = ?2",
                    params![key, symbol],
                )?;
            }
        }

        tx.execute(
            "INSERT INTO transactions (id, context_key, symbol, side, shares, price, fee, executed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                transaction.id,
                transaction.context_key,
                transaction.symbol,
                transaction.side.to_string(),
                shares_param(transaction.shares)?,
                transaction.price.to_string(),
                transaction.fee.to_string(),
                transaction.executed_at,
            ],
        )?;

        tx.commit()
    }

    /// Overwrite a portfolio's cash balance.
    pub fn update_cash(&self, context: &TradingContext, cash: Decimal) -> Result<(), rusqlite::Error> {
        let conn = self.conn.lock();
        let updated = conn.execute(
            "UPDATE portfolios SET cash = ?1 WHERE context_key = ?2",
            params![cash.to_string(), context.key()],
        )?;
        if updated != 1 {
            return Err(rusqlite::Error::QueryReturnedNoRows);
        }
        Ok(())
    }

    /// Remove a portfolio and its holdings. Transactions are kept.
    pub fn delete_portfolio(&self, context: &TradingContext) -> Result<bool, rusqlite::Error> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let key = context.key();
        tx.execute("DELETE FROM holdings WHERE context_key = ?1", params![key])?;
        let removed = tx.execute("DELETE FROM portfolios WHERE context_key = ?1", params![key])?;
        tx.commit()?;
        Ok(removed > 0)
    }

    /// League members as contexts, ordered by join time then user id.
    pub fn league_contexts(&self, league_id: &str) -> Result<Vec<TradingContext>, rusqlite::Error> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT user_id FROM portfolios WHERE league_id = ?1
             ORDER BY created_at ASC, user_id ASC",
        )?;
        let contexts = stmt
            .query_map(params![league_id], |row| {
                Ok(TradingContext::League {
                    league_id: league_id.to_string(),
                    user_id: row.get(0)?,
                })
            })?
            .collect();
        contexts
    }

    // ========== Transaction Methods ==========

    /// Transactions for a portfolio, newest first.
    pub fn transactions(
        &self,
        context: &TradingContext,
        limit: usize,
    ) -> Result<Vec<Transaction>, rusqlite::Error> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, context_key, symbol, side, shares, price, fee, executed_at
             FROM transactions WHERE context_key = ?1
             ORDER BY executed_at DESC, rowid DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![context.key(), limit as i64], |row| {
                let side: String = row.get(3)?;
                Ok(Transaction {
                    id: row.get(0)?,
                    context_key: row.get(1)?,
                    symbol: row.get(2)?,
                    side: TradeSide::from_str(&side).map_err(|e| conversion_error(3, e))?,
                    shares: shares_col(row, 4)?,
                    price: decimal_col(row, 5)?,
                    fee: decimal_col(row, 6)?,
                    executed_at: row.get(7)?,
                })
            })?
            .collect();
        rows
    }

    pub fn transaction_count(&self, context: &TradingContext) -> Result<usize, rusqlite::Error> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM transactions WHERE context_key = ?1",
            params![context.key()],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    // ========== Leaderboard Methods ==========

    /// Persist the latest snapshot for a league, replacing the previous one.
    pub fn save_snapshot(&self, snapshot: &LeaderboardSnapshot) -> Result<(), rusqlite::Error> {
        let entries_json = serde_json::to_string(&snapshot.entries)
            .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO leaderboard_snapshots (league_id, computed_at, entries_json)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(league_id)
             DO UPDATE SET computed_at = excluded.computed_at, entries_json = excluded.entries_json",
            params![snapshot.league_id, snapshot.computed_at, entries_json],
        )?;
        Ok(())
    }

    /// All persisted snapshots, for recovery at startup.
    pub fn load_snapshots(&self) -> Result<Vec<LeaderboardSnapshot>, rusqlite::Error> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT league_id, computed_at, entries_json FROM leaderboard_snapshots")?;
        let snapshots = stmt
            .query_map([], |row| {
                let entries_json: String = row.get(2)?;
                let entries: Vec<LeaderboardEntry> = serde_json::from_str(&entries_json)
                    .map_err(|e| {
                        rusqlite::Error::FromSqlConversionFailure(2, Type::Text, Box::new(e))
                    })?;
                Ok(LeaderboardSnapshot {
                    league_id: row.get(0)?,
                    computed_at: row.get(1)?,
                    entries,
                })
            })?
            .collect();
        snapshots
    }
}

/// True for primary-key / unique violations.
pub fn is_constraint_violation(error: &rusqlite::Error) -> bool {
    matches!(
        error,
        rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation
    )
}

fn conversion_error(idx: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, msg.into())
}

fn decimal_col(row: &Row<'_>, idx: usize) -> Result<Decimal, rusqlite::Error> {
    let raw: String = row.get(idx)?;
    Decimal::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn shares_col(row: &Row<'_>, idx: usize) -> Result<u64, rusqlite::Error> {
    let raw: i64 = row.get(idx)?;
    u64::try_from(raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Integer, Box::new(e)))
}

fn shares_param(shares: u64) -> Result<i64, rusqlite::Error> {
    i64::try_from(shares).map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn league_ctx(league: &str, user: &str) -> TradingContext {
        TradingContext::League {
            league_id: league.to_string(),
            user_id: user.to_string(),
        }
    }

    #[test]
    fn test_portfolio_roundtrip() {
        let store = SqliteStore::new_in_memory().unwrap();
        let ctx = TradingContext::Personal {
            user_id: "alice".to_string(),
        };
        let portfolio = Portfolio::new(ctx.clone(), dec!(10000));
        store.insert_portfolio(&portfolio).unwrap();

        let loaded = store.load_portfolio(&ctx).unwrap().unwrap();
        assert_eq!(loaded.cash, dec!(10000));
        assert!(loaded.holdings.is_empty());
        assert_eq!(loaded.created_at, portfolio.created_at);
    }

    #[test]
    fn test_duplicate_portfolio_is_constraint_violation() {
        let store = SqliteStore::new_in_memory().unwrap();
        let portfolio = Portfolio::new(league_ctx("l1", "alice"), dec!(10000));
        store.insert_portfolio(&portfolio).unwrap();

        let err = store.insert_portfolio(&portfolio).unwrap_err();
        assert!(is_constraint_violation(&err));
    }

    #[test]
    fn test_commit_trade_writes_all_rows() {
        let store = SqliteStore::new_in_memory().unwrap();
        let ctx = league_ctx("l1", "alice");
        store
            .insert_portfolio(&Portfolio::new(ctx.clone(), dec!(10000)))
            .unwrap();

        let holding = Holding {
            shares: 10,
            average_cost: dec!(150),
        };
        let tx = Transaction::new(&ctx, "AAPL".into(), TradeSide::Buy, 10, dec!(150), dec!(0));
        store
            .commit_trade(&ctx, dec!(8500), "AAPL", Some(&holding), &tx)
            .unwrap();

        let loaded = store.load_portfolio(&ctx).unwrap().unwrap();
        assert_eq!(loaded.cash, dec!(8500));
        assert_eq!(loaded.holdings.get("AAPL"), Some(&holding));

        let history = store.transactions(&ctx, 10).unwrap();
        assert_eq!(history, vec![tx]);

        // Selling out deletes the holding row.
        let sell = Transaction::new(&ctx, "AAPL".into(), TradeSide::Sell, 10, dec!(160), dec!(0));
        store.commit_trade(&ctx, dec!(10100), "AAPL", None, &sell).unwrap();
        let loaded = store.load_portfolio(&ctx).unwrap().unwrap();
        assert!(loaded.holdings.is_empty());
        assert_eq!(store.transaction_count(&ctx).unwrap(), 2);
    }

    #[test]
    fn test_commit_trade_missing_portfolio_rolls_back() {
        let store = SqliteStore::new_in_memory().unwrap();
        let ctx = league_ctx("l1", "ghost");
        let tx = Transaction::new(&ctx, "AAPL".into(), TradeSide::Buy, 1, dec!(1), dec!(0));

        assert!(store.commit_trade(&ctx, dec!(1), "AAPL", None, &tx).is_err());
        assert_eq!(store.transaction_count(&ctx).unwrap(), 0);
    }

    #[test]
    fn test_injected_failures_are_consumed() {
        let store = SqliteStore::new_in_memory().unwrap();
        let ctx = league_ctx("l1", "alice");
        store
            .insert_portfolio(&Portfolio::new(ctx.clone(), dec!(100)))
            .unwrap();
        store.inject_commit_failures(1);

        let tx = Transaction::new(&ctx, "AAPL".into(), TradeSide::Buy, 1, dec!(1), dec!(0));
        let holding = Holding {
            shares: 1,
            average_cost: dec!(1),
        };
        assert!(store
            .commit_trade(&ctx, dec!(99), "AAPL", Some(&holding), &tx)
            .is_err());
        assert!(store
            .commit_trade(&ctx, dec!(99), "AAPL", Some(&holding), &tx)
            .is_ok());
    }

    #[test]
    fn test_league_contexts_ordered_by_join_time() {
        let store = SqliteStore::new_in_memory().unwrap();
        let mut late = Portfolio::new(league_ctx("l1", "aaron"), dec!(100));
        late.created_at = 2_000;
        let mut early = Portfolio::new(league_ctx("l1", "zoe"), dec!(100));
        early.created_at = 1_000;
        store.insert_portfolio(&late).unwrap();
        store.insert_portfolio(&early).unwrap();
        store
            .insert_portfolio(&Portfolio::new(league_ctx("l2", "bob"), dec!(100)))
            .unwrap();

        let members = store.league_contexts("l1").unwrap();
        let users: Vec<&str> = members.iter().map(|c| c.user_id()).collect();
        assert_eq!(users, vec!["zoe", "aaron"]);
    }

    #[test]
    fn test_snapshot_persistence() {
        let store = SqliteStore::new_in_memory().unwrap();
        let snapshot = LeaderboardSnapshot {
            league_id: "l1".to_string(),
            entries: vec![LeaderboardEntry {
                user_id: "alice".to_string(),
                rank: 1,
                portfolio_value: dec!(10100.50),
            }],
            computed_at: 42,
        };
        store.save_snapshot(&snapshot).unwrap();
        store.save_snapshot(&snapshot).unwrap();

        let loaded = store.load_snapshots().unwrap();
        assert_eq!(loaded, vec![snapshot]);
    }
}
