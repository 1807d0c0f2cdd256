//! Trading API
//!
//! - POST /api/trades - Submit a buy or sell order

use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        State,
    },
    http::{header, StatusCode},
    response::IntoResponse,
    routing::post,
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::api::ApiResponse;
use crate::services::{TradeError, TradeErrorKind};
use crate::types::{TradeReceipt, TradeRequest, TradeSide, TradingContext};
use crate::AppState;

/// Create trading router.
pub fn router() -> Router<AppState> {
    Router::new().route("/api/trades", post(submit_trade))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TradeErrorResponse {
    pub error_kind: TradeErrorKind,
    pub message: String,
    pub retryable: bool,
}

/// Convert TradeError to HTTP response.
impl IntoResponse for TradeError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self {
            TradeError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            TradeError::PriceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            TradeError::InvalidQuantity(_) | TradeError::InvalidRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            TradeError::InsufficientFunds { .. } | TradeError::InsufficientShares { .. } => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            TradeError::StorageFailure(_) => StatusCode::SERVICE_UNAVAILABLE,
            TradeError::PortfolioNotFound(_) => StatusCode::NOT_FOUND,
            TradeError::PortfolioExists(_) => StatusCode::CONFLICT,
        };

        let body = Json(TradeErrorResponse {
            error_kind: self.kind(),
            message: self.to_string(),
            retryable: self.is_retryable(),
        });

        match self {
            TradeError::RateLimited(limited) => (
                status,
                [(header::RETRY_AFTER, limited.retry_after_secs().to_string())],
                body,
            )
                .into_response(),
            _ => (status, body).into_response(),
        }
    }
}

/// Malformed bodies get the same error shape as rejected trades.
impl From<JsonRejection> for TradeError {
    fn from(rejection: JsonRejection) -> Self {
        TradeError::InvalidRequest(rejection.body_text())
    }
}

impl From<QueryRejection> for TradeError {
    fn from(rejection: QueryRejection) -> Self {
        TradeError::InvalidRequest(rejection.body_text())
    }
}

#[derive(Debug, Deserialize)]
pub struct SubmitTradeRequest {
    pub user_id: String,
    pub symbol: String,
    pub side: TradeSide,
    pub shares: i64,
    pub league_id: Option<String>,
}

/// POST /api/trades
async fn submit_trade(
    State(state): State<AppState>,
    payload: Result<Json<SubmitTradeRequest>, JsonRejection>,
) -> Result<Json<ApiResponse<TradeReceipt>>, TradeError> {
    let Json(request) = payload?;
    let receipt = state
        .executor
        .submit(TradeRequest {
            symbol: request.symbol,
            side: request.side,
            shares: request.shares,
            context: TradingContext::for_user(request.user_id, request.league_id),
        })
        .await?;

    Ok(Json(ApiResponse { data: receipt }))
}
