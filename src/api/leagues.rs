use axum::{
    extract::{Path, State},
    routing::get,
    Json, Router,
};

use crate::api::ApiResponse;
use crate::error::{AppError, Result};
use crate::types::LeaderboardSnapshot;
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/api/leagues/:league_id/leaderboard", get(get_leaderboard))
}

/// GET /api/leagues/:league_id/leaderboard
///
/// Current snapshot, computed on demand if the league has none yet.
async fn get_leaderboard(
    State(state): State<AppState>,
    Path(league_id): Path<String>,
) -> Result<Json<ApiResponse<LeaderboardSnapshot>>> {
    let snapshot = state
        .leaderboard
        .snapshot_or_compute(&league_id)
        .await
        .map_err(|e| AppError::Unavailable(e.to_string()))?;

    Ok(Json(ApiResponse {
        data: (*snapshot).clone(),
    }))
}
