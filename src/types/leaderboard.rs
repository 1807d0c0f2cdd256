//! Leaderboard snapshots and the deltas broadcast between them.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// One ranked row in a league snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaderboardEntry {
    pub user_id: String,
    /// 1-based rank.
    pub rank: u32,
    pub portfolio_value: Decimal,
}

/// Complete ranked view of a league at one point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaderboardSnapshot {
    pub league_id: String,
    /// Ordered by rank ascending.
    pub entries: Vec<LeaderboardEntry>,
    /// Computation time (ms).
    pub computed_at: i64,
}

impl LeaderboardSnapshot {
    pub fn entry(&self, user_id: &str) -> Option<&LeaderboardEntry> {
        self.entries.iter().find(|e| e.user_id == user_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A row that differs from the previous snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangedEntry {
    pub user_id: String,
    pub rank: u32,
    pub portfolio_value: Decimal,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub previous_rank: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub previous_value: Option<Decimal>,
    pub rank_changed: bool,
    pub value_changed: bool,
    pub new_entrant: bool,
}

/// Minimal set of changes between two consecutive snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaderboardDelta {
    pub league_id: String,
    pub changed_entries: Vec<ChangedEntry>,
    /// Users present before and absent now.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub removed: Vec<String>,
    pub computed_at: i64,
    /// Set when some valuations used fallback prices.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub degraded: Option<String>,
}

impl LeaderboardDelta {
    pub fn is_empty(&self) -> bool {
        self.changed_entries.is_empty() && self.removed.is_empty()
    }
}
