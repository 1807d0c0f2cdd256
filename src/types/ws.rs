use super::{LeaderboardDelta, LeaderboardSnapshot};
use serde::{Deserialize, Serialize};

/// Incoming WebSocket message from client.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Start receiving leaderboard events for a league.
    Subscribe { league_id: String },
    /// Stop receiving leaderboard events for a league.
    Unsubscribe { league_id: String },
}

/// Outgoing WebSocket message to client.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Subscribed {
        league_id: String,
    },
    Unsubscribed {
        league_id: String,
    },
    /// Full standings, sent once on subscribe.
    LeaderboardSnapshot {
        data: LeaderboardSnapshot,
    },
    /// Changed rows only, sent after each recompute.
    LeaderboardDelta {
        data: LeaderboardDelta,
    },
    Error {
        error: String,
    },
}

impl ServerMessage {
    /// Serialize for the wire. Serialization of these types cannot fail in
    /// practice; a failure yields `None` so callers can skip the send.
    pub fn to_json(&self) -> Option<String> {
        serde_json::to_string(self).ok()
    }
}
