//! # routes::strategies
//!
//! DCA ladder strategies.
//!
//! | Method | Path                   | Description                             |
//! |--------|------------------------|-----------------------------------------|
//! | POST   | `/api/strategies`      | Validate, register and open first cycle |
//! | GET    | `/api/strategies`      | List (optionally `?account_id=`)        |
//! | GET    | `/api/strategies/:id`  | One strategy with its ledger            |
//! | DELETE | `/api/strategies/:id`  | Cancel live ladder orders and remove    |

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
    models::{AccountId, StrategyId, StrategyOptions},
    state::SharedState,
};

#[derive(Debug, Deserialize)]
pub struct CreateStrategyBody {
    pub account_id: AccountId,
    pub market:     String,
    #[serde(flatten)]
    pub options:    StrategyOptions,
}

#[derive(Debug, Default, Deserialize)]
pub struct StrategyFilter {
    pub account_id: Option<AccountId>,
}

pub async fn create_strategy(
    State(state): State<SharedState>,
    Json(body): Json<CreateStrategyBody>,
) -> Result<impl IntoResponse, AppError> {
    let strategy = state
        .create_strategy(body.account_id, &body.market, &body.options)
        .await?;

    info!(
        strategy_id = %strategy.id,
        account_id = %strategy.account_id,
        market = %strategy.market,
        "🪜 Strategy created"
    );

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "ok":          true,
            "strategy_id": strategy.id,
            "strategy":    strategy,
        })),
    ))
}

pub async fn list_strategies(
    State(state): State<SharedState>,
    Query(filter): Query<StrategyFilter>,
) -> impl IntoResponse {
    let strategies = state.engine.list_strategies(filter.account_id).await;
    Json(json!({
        "ok":         true,
        "count":      strategies.len(),
        "strategies": strategies,
    }))
}

pub async fn get_strategy(
    State(state): State<SharedState>,
    Path(id): Path<StrategyId>,
) -> Result<impl IntoResponse, AppError> {
    let strategy = state.engine.get_strategy(id).await?;
    Ok(Json(json!({ "ok": true, "strategy": strategy })))
}

pub async fn delete_strategy(
    State(state): State<SharedState>,
    Path(id): Path<StrategyId>,
) -> Result<impl IntoResponse, AppError> {
    let strategy = state.engine.remove_strategy(id).await?;
    Ok(Json(json!({
        "ok":       true,
        "strategy": strategy,
        "message":  "Strategy removed, ladder orders cancelled.",
    })))
}
