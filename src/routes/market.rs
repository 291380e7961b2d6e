//! # routes::market
//!
//! Read endpoints.  Every handler projects straight from a tracking cache;
//! nothing here calls the exchange.

use axum::{
    extract::{Path, Query, State},
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use serde_json::json;

use crate::{error::AppError, models::AccountId, state::SharedState};

#[derive(Debug, Default, Deserialize)]
pub struct MarketFilter {
    pub market: Option<String>,
}

/// GET /api/accounts/:id/tickers
pub async fn get_tickers(
    State(state): State<SharedState>,
    Path(account_id): Path<AccountId>,
) -> Result<impl IntoResponse, AppError> {
    let tickers = state.tickers.get_tickers(account_id).await?;
    Ok(Json(json!({
        "ok":      true,
        "count":   tickers.len(),
        "tickers": tickers,
    })))
}

/// GET /api/accounts/:id/tickers/:market
pub async fn get_ticker(
    State(state): State<SharedState>,
    Path((account_id, market)): Path<(AccountId, String)>,
) -> Result<impl IntoResponse, AppError> {
    let ticker = state.tickers.get_ticker(account_id, &market).await?;
    let price = ticker.price();
    Ok(Json(json!({
        "ok":     true,
        "ticker": ticker,
        "price":  price,
    })))
}

/// GET /api/accounts/:id/orders?market=
pub async fn get_orders(
    State(state): State<SharedState>,
    Path(account_id): Path<AccountId>,
    Query(filter): Query<MarketFilter>,
) -> Result<impl IntoResponse, AppError> {
    let orders = match filter.market.as_deref() {
        Some(market) => state.orders.get_orders_for_market(account_id, market).await?,
        None => state.orders.get_orders(account_id).await?,
    };
    Ok(Json(json!({
        "ok":     true,
        "count":  orders.len(),
        "orders": orders,
    })))
}

/// GET /api/accounts/:id/positions
pub async fn get_positions(
    State(state): State<SharedState>,
    Path(account_id): Path<AccountId>,
) -> Result<impl IntoResponse, AppError> {
    let positions = state.positions.get_positions(account_id).await?;
    Ok(Json(json!({
        "ok":        true,
        "count":     positions.len(),
        "positions": positions,
    })))
}

/// GET /api/accounts/:id/wallet
pub async fn get_wallet(
    State(state): State<SharedState>,
    Path(account_id): Path<AccountId>,
) -> Result<impl IntoResponse, AppError> {
    let wallet = state.wallets.get_wallet(account_id).await?;
    Ok(Json(json!({ "ok": true, "wallet": wallet })))
}
