use crate::AppState;
use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    /// Open WebSocket connections.
    connected_clients: usize,
    /// Leagues with at least one subscriber.
    active_leagues: usize,
    /// Leagues with a cached leaderboard.
    tracked_leaderboards: usize,
    cached_prices: usize,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        connected_clients: state.room_manager.client_count(),
        active_leagues: state.room_manager.room_count(),
        tracked_leaderboards: state.leaderboard.league_count(),
        cached_prices: state.prices.len(),
    })
}

pub fn router() -> Router<AppState> {
    Router::new().route("/api/health", get(health))
}
