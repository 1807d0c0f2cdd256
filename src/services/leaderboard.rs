//! Leaderboard Snapshot Engine
//!
//! Values every member of a league, ranks them, diffs the ranking against the
//! cached one and keeps a `current` / `previous` pair of immutable snapshots
//! per league. Recomputes run on a background worker that coalesces triggers,
//! so trade execution never waits on ranking or broadcast.

use crate::config::LeaderboardConfig;
use crate::services::portfolio_store::PortfolioStore;
use crate::services::price_cache::PriceCache;
use crate::services::sqlite_store::SqliteStore;
use crate::services::trade_executor::TradeError;
use crate::types::{
    ChangedEntry, LeaderboardDelta, LeaderboardEntry, LeaderboardSnapshot, Portfolio,
    PortfolioValuation, PriceQuote, ServerMessage,
};
use crate::websocket::RoomManager;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::future::join_all;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum LeaderboardError {
    #[error("Failed to load league {league_id}: {source}")]
    Members {
        league_id: String,
        #[source]
        source: TradeError,
    },

    #[error("Failed to restore snapshots: {0}")]
    Restore(#[from] rusqlite::Error),
}

/// Ranking input for one league member.
#[derive(Debug, Clone)]
pub struct Standing {
    pub user_id: String,
    /// League join time (ms), the first tie-breaker.
    pub joined_at: i64,
    pub value: Decimal,
}

/// Rank standings: value descending, then earliest join, then user id.
pub fn compute_snapshot(
    league_id: &str,
    mut standings: Vec<Standing>,
    computed_at: i64,
) -> LeaderboardSnapshot {
    standings.sort_by(|a, b| {
        b.value
            .cmp(&a.value)
            .then(a.joined_at.cmp(&b.joined_at))
            .then_with(|| a.user_id.cmp(&b.user_id))
    });

    let entries = standings
        .into_iter()
        .enumerate()
        .map(|(i, standing)| LeaderboardEntry {
            user_id: standing.user_id,
            rank: i as u32 + 1,
            portfolio_value: standing.value,
        })
        .collect();

    LeaderboardSnapshot {
        league_id: league_id.to_string(),
        entries,
        computed_at,
    }
}

/// Entries of `current` whose rank changed, whose value moved by more than
/// `epsilon`, or that are new, plus users that disappeared.
pub fn diff_snapshots(
    previous: Option<&LeaderboardSnapshot>,
    current: &LeaderboardSnapshot,
    epsilon: Decimal,
) -> LeaderboardDelta {
    let before: HashMap<&str, &LeaderboardEntry> = previous
        .map(|snapshot| {
            snapshot
                .entries
                .iter()
                .map(|e| (e.user_id.as_str(), e))
                .collect()
        })
        .unwrap_or_default();

    let changed_entries = current
        .entries
        .iter()
        .filter_map(|entry| match before.get(entry.user_id.as_str()) {
            None => Some(ChangedEntry {
                user_id: entry.user_id.clone(),
                rank: entry.rank,
                portfolio_value: entry.portfolio_value,
                previous_rank: None,
                previous_value: None,
                rank_changed: false,
                value_changed: false,
                new_entrant: true,
            }),
            Some(prev) => {
                let rank_changed = prev.rank != entry.rank;
                let value_changed = (entry.portfolio_value - prev.portfolio_value).abs() > epsilon;
                (rank_changed || value_changed).then(|| ChangedEntry {
                    user_id: entry.user_id.clone(),
                    rank: entry.rank,
                    portfolio_value: entry.portfolio_value,
                    previous_rank: Some(prev.rank),
                    previous_value: Some(prev.portfolio_value),
                    rank_changed,
                    value_changed,
                    new_entrant: false,
                })
            }
        })
        .collect();

    let removed = previous
        .map(|snapshot| {
            snapshot
                .entries
                .iter()
                .filter(|e| current.entry(&e.user_id).is_none())
                .map(|e| e.user_id.clone())
                .collect()
        })
        .unwrap_or_default();

    LeaderboardDelta {
        league_id: current.league_id.clone(),
        changed_entries,
        removed,
        computed_at: current.computed_at,
        degraded: None,
    }
}

#[derive(Default)]
struct BoardState {
    current: Option<Arc<LeaderboardSnapshot>>,
    previous: Option<Arc<LeaderboardSnapshot>>,
}

#[derive(Default)]
struct LeagueBoard {
    /// Serializes compute + swap for one league.
    recompute: Mutex<()>,
    state: RwLock<BoardState>,
}

/// Result of one recompute.
#[derive(Debug, Clone)]
pub struct Recomputed {
    pub snapshot: Arc<LeaderboardSnapshot>,
    pub delta: LeaderboardDelta,
    pub elapsed: Duration,
}

pub struct LeaderboardEngine {
    portfolios: Arc<PortfolioStore>,
    prices: Arc<PriceCache>,
    sqlite: Arc<SqliteStore>,
    boards: DashMap<String, Arc<LeagueBoard>>,
    config: LeaderboardConfig,
}

impl LeaderboardEngine {
    pub fn new(
        portfolios: Arc<PortfolioStore>,
        prices: Arc<PriceCache>,
        sqlite: Arc<SqliteStore>,
        config: LeaderboardConfig,
    ) -> Self {
        Self {
            portfolios,
            prices,
            sqlite,
            boards: DashMap::new(),
            config,
        }
    }

    fn board(&self, league_id: &str) -> Arc<LeagueBoard> {
        Arc::clone(self.boards.entry(league_id.to_string()).or_default().value())
    }

    /// Board for a league that has, or once had, members. Ids nobody joined
    /// get no board, so lookups of arbitrary ids leave no state behind.
    fn tracked_board(&self, league_id: &str) -> Result<Option<Arc<LeagueBoard>>, LeaderboardError> {
        if let Some(board) = self.boards.get(league_id) {
            return Ok(Some(Arc::clone(board.value())));
        }
        let members = self
            .sqlite
            .league_contexts(league_id)
            .map_err(|e| LeaderboardError::Members {
                league_id: league_id.to_string(),
                source: e.into(),
            })?;
        Ok((!members.is_empty()).then(|| self.board(league_id)))
    }

    /// Leagues with cached snapshots.
    pub fn league_count(&self) -> usize {
        self.boards.len()
    }

    pub fn current_snapshot(&self, league_id: &str) -> Option<Arc<LeaderboardSnapshot>> {
        let board = self.boards.get(league_id)?;
        let current = board.state.read().current.clone();
        current
    }

    pub fn previous_snapshot(&self, league_id: &str) -> Option<Arc<LeaderboardSnapshot>> {
        let board = self.boards.get(league_id)?;
        let previous = board.state.read().previous.clone();
        previous
    }

    /// Current snapshot, computing one if the league has none yet.
    pub async fn snapshot_or_compute(
        &self,
        league_id: &str,
    ) -> Result<Arc<LeaderboardSnapshot>, LeaderboardError> {
        if let Some(snapshot) = self.current_snapshot(league_id) {
            return Ok(snapshot);
        }
        Ok(self.recompute(league_id).await?.snapshot)
    }

    /// Install persisted snapshots as `current`. Called once at startup.
    pub fn restore_from_store(&self) -> Result<usize, LeaderboardError> {
        let snapshots = self.sqlite.load_snapshots()?;
        let count = snapshots.len();
        for snapshot in snapshots {
            let board = self.board(&snapshot.league_id);
            board.state.write().current = Some(Arc::new(snapshot));
        }
        info!("Restored {} leaderboard snapshots", count);
        Ok(count)
    }

    /// Recompute, diff and swap the snapshot for a league.
    ///
    /// A league without members yields an empty snapshot that is neither
    /// cached nor persisted.
    pub async fn recompute(&self, league_id: &str) -> Result<Recomputed, LeaderboardError> {
        let started = Instant::now();
        let Some(board) = self.tracked_board(league_id)? else {
            debug!("League {} has no members", league_id);
            let snapshot = Arc::new(compute_snapshot(
                league_id,
                Vec::new(),
                chrono::Utc::now().timestamp_millis(),
            ));
            let delta = diff_snapshots(None, &snapshot, self.config.value_epsilon);
            return Ok(Recomputed {
                snapshot,
                delta,
                elapsed: started.elapsed(),
            });
        };
        let _guard = board.recompute.lock().await;
        let started = Instant::now();

        let members = self
            .portfolios
            .league_portfolios(league_id)
            .map_err(|source| LeaderboardError::Members {
                league_id: league_id.to_string(),
                source,
            })?;

        let valuations = self.value_portfolios(&members).await;
        let unpriced: BTreeSet<String> = valuations
            .iter()
            .flat_map(|v| v.unpriced.iter().cloned())
            .collect();

        let standings = members
            .iter()
            .zip(&valuations)
            .map(|(portfolio, valuation)| Standing {
                user_id: portfolio.context.user_id().to_string(),
                joined_at: portfolio.created_at,
                value: valuation.total_value.round_dp(2),
            })
            .collect();

        let snapshot = Arc::new(compute_snapshot(
            league_id,
            standings,
            chrono::Utc::now().timestamp_millis(),
        ));

        let mut delta = {
            let mut state = board.state.write();
            let delta = diff_snapshots(
                state.current.as_deref(),
                &snapshot,
                self.config.value_epsilon,
            );
            state.previous = state.current.replace(Arc::clone(&snapshot));
            delta
        };

        if !unpriced.is_empty() {
            let symbols: Vec<String> = unpriced.into_iter().collect();
            delta.degraded = Some(format!(
                "valued at average cost, no price for {}",
                symbols.join(", ")
            ));
        }

        if let Err(e) = self.sqlite.save_snapshot(&snapshot) {
            warn!("Failed to persist leaderboard snapshot for {}: {}", league_id, e);
        }

        let elapsed = started.elapsed();
        if elapsed > Duration::from_millis(self.config.budget_ms) {
            warn!(
                "Leaderboard recompute for {} took {:?} ({} members, budget {}ms)",
                league_id,
                elapsed,
                snapshot.len(),
                self.config.budget_ms
            );
        } else {
            debug!(
                "Leaderboard {} recomputed in {:?}: {} members, {} changed",
                league_id,
                elapsed,
                snapshot.len(),
                delta.changed_entries.len()
            );
        }

        Ok(Recomputed {
            snapshot,
            delta,
            elapsed,
        })
    }

    /// Value a single portfolio at current (stale allowed) prices.
    pub async fn value_portfolio(&self, portfolio: &Portfolio) -> PortfolioValuation {
        let quotes = self.quotes_for(std::slice::from_ref(portfolio)).await;
        valuate(portfolio, &quotes)
    }

    async fn value_portfolios(&self, portfolios: &[Portfolio]) -> Vec<PortfolioValuation> {
        let quotes = self.quotes_for(portfolios).await;
        portfolios.iter().map(|p| valuate(p, &quotes)).collect()
    }

    /// One lookup per distinct symbol, issued concurrently.
    async fn quotes_for(&self, portfolios: &[Portfolio]) -> HashMap<String, PriceQuote> {
        let symbols: BTreeSet<&str> = portfolios
            .iter()
            .flat_map(|p| p.holdings.keys().map(String::as_str))
            .collect();

        let lookups = symbols.into_iter().map(|symbol| async move {
            let quote = self.prices.get_price(symbol).await;
            (symbol.to_string(), quote)
        });

        join_all(lookups)
            .await
            .into_iter()
            .filter_map(|(symbol, quote)| match quote {
                Ok(quote) => Some((symbol, quote)),
                Err(e) => {
                    debug!("No price for {} during valuation: {}", symbol, e);
                    None
                }
            })
            .collect()
    }
}

/// Cash plus holdings at the given quotes. Missing quotes fall back to
/// average cost and are listed in `unpriced`. Sums saturate at `Decimal::MAX`.
fn valuate(portfolio: &Portfolio, quotes: &HashMap<String, PriceQuote>) -> PortfolioValuation {
    let mut holdings_value = Decimal::ZERO;
    let mut stale = false;
    let mut unpriced = Vec::new();

    for (symbol, holding) in &portfolio.holdings {
        let shares = Decimal::from(holding.shares);
        match quotes.get(symbol) {
            Some(quote) => {
                stale |= quote.is_stale;
                holdings_value = holdings_value.saturating_add(shares.saturating_mul(quote.price));
            }
            None => {
                unpriced.push(symbol.clone());
                holdings_value =
                    holdings_value.saturating_add(shares.saturating_mul(holding.average_cost));
            }
        }
    }

    PortfolioValuation {
        context: portfolio.context.clone(),
        cash: portfolio.cash,
        holdings_value,
        total_value: portfolio.cash.saturating_add(holdings_value),
        stale,
        unpriced,
    }
}

// =============================================================================
// Recompute worker
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecomputeState {
    /// Queued, not started. Further triggers are absorbed.
    Pending,
    Running,
    /// Triggered again while running; run once more when done.
    Dirty,
}

/// What happened to a recompute trigger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerOutcome {
    Scheduled,
    /// Folded into a recompute that is queued or in flight.
    Coalesced,
    /// Could not be scheduled; the leaderboard may be stale.
    Degraded(String),
}

/// Cheap handle used by the trade path to request recomputes.
#[derive(Clone)]
pub struct LeaderboardTrigger {
    tx: mpsc::UnboundedSender<String>,
    states: Arc<DashMap<String, RecomputeState>>,
}

impl LeaderboardTrigger {
    pub fn trigger(&self, league_id: &str) -> TriggerOutcome {
        match self.states.entry(league_id.to_string()) {
            Entry::Occupied(mut entry) => {
                if *entry.get() == RecomputeState::Running {
                    entry.insert(RecomputeState::Dirty);
                }
                return TriggerOutcome::Coalesced;
            }
            Entry::Vacant(entry) => {
                entry.insert(RecomputeState::Pending);
            }
        }

        if self.tx.send(league_id.to_string()).is_err() {
            self.states.remove(league_id);
            return TriggerOutcome::Degraded("leaderboard worker is not running".to_string());
        }
        TriggerOutcome::Scheduled
    }
}

/// Background task turning triggers into recomputes and broadcasts.
pub struct LeaderboardWorker {
    rx: mpsc::UnboundedReceiver<String>,
    states: Arc<DashMap<String, RecomputeState>>,
    engine: Arc<LeaderboardEngine>,
    rooms: Arc<RoomManager>,
}

impl LeaderboardWorker {
    pub fn new(
        engine: Arc<LeaderboardEngine>,
        rooms: Arc<RoomManager>,
    ) -> (Self, LeaderboardTrigger) {
        let (tx, rx) = mpsc::unbounded_channel();
        let states = Arc::new(DashMap::new());
        let worker = Self {
            rx,
            states: Arc::clone(&states),
            engine,
            rooms,
        };
        (worker, LeaderboardTrigger { tx, states })
    }

    /// Run until every trigger handle is dropped.
    pub async fn run(mut self) {
        info!("Leaderboard worker started");
        while let Some(league_id) = self.rx.recv().await {
            let engine = Arc::clone(&self.engine);
            let rooms = Arc::clone(&self.rooms);
            let states = Arc::clone(&self.states);
            tokio::spawn(recompute_league(engine, rooms, states, league_id));
        }
        info!("Leaderboard worker stopped");
    }
}

async fn recompute_league(
    engine: Arc<LeaderboardEngine>,
    rooms: Arc<RoomManager>,
    states: Arc<DashMap<String, RecomputeState>>,
    league_id: String,
) {
    loop {
        if let Some(mut state) = states.get_mut(&league_id) {
            *state = RecomputeState::Running;
        }

        publish(&engine, &rooms, &league_id).await;

        if states
            .remove_if(&league_id, |_, state| *state == RecomputeState::Running)
            .is_some()
        {
            break;
        }
        debug!("League {} traded during recompute, running again", league_id);
    }
}

/// Recompute a league and push the delta to its subscribers.
pub async fn publish(engine: &LeaderboardEngine, rooms: &RoomManager, league_id: &str) {
    let recomputed = match engine.recompute(league_id).await {
        Ok(recomputed) => recomputed,
        Err(e) => {
            warn!("Leaderboard for {} may be stale: {}", league_id, e);
            return;
        }
    };

    if let Some(reason) = &recomputed.delta.degraded {
        warn!("Leaderboard for {} degraded: {}", league_id, reason);
    }
    if recomputed.delta.is_empty() {
        debug!("Leaderboard {} unchanged", league_id);
        return;
    }

    let message = ServerMessage::LeaderboardDelta {
        data: recomputed.delta,
    };
    if let Some(json) = message.to_json() {
        let report = rooms.broadcast(league_id, &json);
        debug!(
            "Leaderboard delta for {}: delivered {}, failed {}",
            league_id, report.delivered, report.failed
        );
    }
}
