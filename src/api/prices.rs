use axum::{
    extract::{Path, Query, State},
    routing::get,
    Json, Router,
};
use serde::Deserialize;

use crate::api::ApiResponse;
use crate::error::{AppError, Result};
use crate::services::{PriceError, RateCategory};
use crate::types::PriceQuote;
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/api/prices/:symbol", get(get_price))
}

#[derive(Debug, Deserialize)]
pub struct PriceQuery {
    pub user_id: String,
}

/// GET /api/prices/:symbol
///
/// May return a stale price (flagged) when the live lookup fails.
async fn get_price(
    State(state): State<AppState>,
    Path(symbol): Path<String>,
    Query(query): Query<PriceQuery>,
) -> Result<Json<ApiResponse<PriceQuote>>> {
    state
        .rate_limiter
        .check(&query.user_id, RateCategory::Lookup)?;

    let quote = state
        .prices
        .get_price(&symbol)
        .await
        .map_err(|e| match e {
            PriceError::Unavailable { .. } => AppError::Unavailable(e.to_string()),
            PriceError::StaleOnly { .. } => AppError::Internal(e.to_string()),
        })?;

    Ok(Json(ApiResponse { data: quote }))
}
