//! Portfolio API
//!
//! - POST /api/portfolios - Open a portfolio (personal or league)
//! - GET /api/portfolios - Get a portfolio
//! - GET /api/portfolios/valuation - Value a portfolio at current prices
//! - GET /api/portfolios/transactions - Transaction history, newest first
//! - POST /api/portfolios/deposit - Credit cash

use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Query, State,
    },
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use rust_decimal::Decimal;
use serde::Deserialize;

use crate::api::ApiResponse;
use crate::services::{RateCategory, TradeError};
use crate::types::{Portfolio, PortfolioValuation, TradingContext, Transaction};
use crate::AppState;

const DEFAULT_HISTORY_LIMIT: usize = 50;
const MAX_HISTORY_LIMIT: usize = 500;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/portfolios", post(open_portfolio).get(get_portfolio))
        .route("/api/portfolios/valuation", get(get_valuation))
        .route("/api/portfolios/transactions", get(list_transactions))
        .route("/api/portfolios/deposit", post(deposit))
}

// =============================================================================
// Request Types
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct OpenPortfolioRequest {
    pub user_id: String,
    pub league_id: Option<String>,
    pub starting_cash: Option<Decimal>,
}

#[derive(Debug, Deserialize)]
pub struct PortfolioQuery {
    pub user_id: String,
    pub league_id: Option<String>,
}

impl PortfolioQuery {
    fn context(&self) -> TradingContext {
        TradingContext::for_user(self.user_id.clone(), self.league_id.clone())
    }
}

#[derive(Debug, Deserialize)]
pub struct TransactionsQuery {
    pub user_id: String,
    pub league_id: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct DepositRequest {
    pub user_id: String,
    pub league_id: Option<String>,
    pub amount: Decimal,
}

// =============================================================================
// Handlers
// =============================================================================

/// POST /api/portfolios
async fn open_portfolio(
    State(state): State<AppState>,
    payload: Result<Json<OpenPortfolioRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<ApiResponse<Portfolio>>), TradeError> {
    let Json(request) = payload?;
    let context = TradingContext::for_user(request.user_id, request.league_id);
    let portfolio = state
        .executor
        .open_portfolio(context, request.starting_cash)?;
    Ok((StatusCode::CREATED, Json(ApiResponse { data: portfolio })))
}

/// GET /api/portfolios
async fn get_portfolio(
    State(state): State<AppState>,
    query: Result<Query<PortfolioQuery>, QueryRejection>,
) -> Result<Json<ApiResponse<Portfolio>>, TradeError> {
    let Query(query) = query?;
    state
        .rate_limiter
        .check(&query.user_id, RateCategory::Lookup)?;
    let portfolio = state.portfolios.get(&query.context())?;
    Ok(Json(ApiResponse { data: portfolio }))
}

/// GET /api/portfolios/valuation
///
/// Stale prices are accepted here; the response flags them.
async fn get_valuation(
    State(state): State<AppState>,
    query: Result<Query<PortfolioQuery>, QueryRejection>,
) -> Result<Json<ApiResponse<PortfolioValuation>>, TradeError> {
    let Query(query) = query?;
    state
        .rate_limiter
        .check(&query.user_id, RateCategory::Lookup)?;
    let portfolio = state.portfolios.get(&query.context())?;
    let valuation = state.leaderboard.value_portfolio(&portfolio).await;
    Ok(Json(ApiResponse { data: valuation }))
}

/// GET /api/portfolios/transactions
async fn list_transactions(
    State(state): State<AppState>,
    query: Result<Query<TransactionsQuery>, QueryRejection>,
) -> Result<Json<ApiResponse<Vec<Transaction>>>, TradeError> {
    let Query(query) = query?;
    state
        .rate_limiter
        .check(&query.user_id, RateCategory::Lookup)?;
    let context = TradingContext::for_user(query.user_id, query.league_id);
    let limit = query
        .limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .min(MAX_HISTORY_LIMIT);
    let transactions = state.portfolios.transactions(&context, limit)?;
    Ok(Json(ApiResponse { data: transactions }))
}

/// POST /api/portfolios/deposit
async fn deposit(
    State(state): State<AppState>,
    payload: Result<Json<DepositRequest>, JsonRejection>,
) -> Result<Json<ApiResponse<Portfolio>>, TradeError> {
    let Json(request) = payload?;
    let context = TradingContext::for_user(request.user_id, request.league_id);
    let portfolio = state.executor.deposit(&context, request.amount)?;
    Ok(Json(ApiResponse { data: portfolio }))
}
