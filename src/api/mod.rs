pub mod health;
pub mod leagues;
pub mod portfolios;
pub mod prices;
pub mod trading;

use crate::AppState;
use axum::Router;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub data: T,
}

/// Create the API router.
pub fn router() -> Router<AppState> {
    Router::new()
        .merge(health::router())
        .merge(portfolios::router())
        .merge(trading::router())
        .merge(prices::router())
        .merge(leagues::router())
}
