//! # routes::orders
//!
//! Manual order entry through the exchange service.  The caches pick the
//! results up from the push channel or the next refresh.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use crate::{
    error::AppError,
    models::{AccountId, OrderRequest, OrderSide},
    state::SharedState,
};

#[derive(Debug, Deserialize)]
pub struct CancelQuery {
    pub market: String,
}

#[derive(Debug, Deserialize)]
pub struct ClosePositionBody {
    pub market: String,
    /// Side of the position being closed.
    pub side:   OrderSide,
}

// ─── POST /api/accounts/:id/orders ────────────────────────────────────────────

pub async fn place_order(
    State(state): State<SharedState>,
    Path(account_id): Path<AccountId>,
    Json(request): Json<OrderRequest>,
) -> Result<impl IntoResponse, AppError> {
    if !(request.quantity.is_finite() && request.quantity > 0.0) {
        return Err(AppError::BadRequest("quantity must be strictly positive".into()));
    }
    let order = state.exchange.open_order(account_id, &request).await?;

    info!(
        account_id = %account_id,
        market = %order.market,
        order_id = %order.id,
        side = ?order.side,
        "📝 Manual order placed"
    );

    Ok((StatusCode::CREATED, Json(json!({ "ok": true, "order": order }))))
}

// ─── DELETE /api/accounts/:id/orders/:order_id?market= ────────────────────────

pub async fn cancel_order(
    State(state): State<SharedState>,
    Path((account_id, order_id)): Path<(AccountId, String)>,
    Query(query): Query<CancelQuery>,
) -> Result<impl IntoResponse, AppError> {
    state
        .exchange
        .cancel_order(account_id, &order_id, &query.market)
        .await?;
    Ok(Json(json!({ "ok": true, "order_id": order_id })))
}

// ─── POST /api/accounts/:id/positions/close ───────────────────────────────────

pub async fn close_position(
    State(state): State<SharedState>,
    Path(account_id): Path<AccountId>,
    Json(body): Json<ClosePositionBody>,
) -> Result<impl IntoResponse, AppError> {
    let order = state
        .exchange
        .close_position(account_id, &body.market, body.side)
        .await?;

    info!(account_id = %account_id, market = %body.market, "🏁 Position closed");

    Ok(Json(json!({ "ok": true, "order": order })))
}
