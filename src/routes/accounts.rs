//! # routes::accounts
//!
//! Account management and tracking control.
//!
//! | Method | Path                                     | Description                        |
//! |--------|------------------------------------------|------------------------------------|
//! | GET    | `/api/accounts`                          | Registered accounts + stream state |
//! | POST   | `/api/accounts`                          | Create or replace an account       |
//! | DELETE | `/api/accounts/:id`                      | Stop tracking and remove           |
//! | POST   | `/api/accounts/:id/track`                | Start tracking                     |
//! | DELETE | `/api/accounts/:id/track`                | Stop tracking                      |
//! | POST   | `/api/accounts/:id/markets/:market`      | Watch a market's ticker            |
//! | DELETE | `/api/accounts/:id/markets/:market`      | Stop watching it                   |

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use crate::{
    error::AppError,
    models::{Account, AccountId, Credentials, ExchangeKind},
    registry::{AccountRegistry, UpsertOutcome},
    state::SharedState,
};

#[derive(Debug, Deserialize)]
pub struct AccountBody {
    /// Omit to create a new account.
    pub id:          Option<AccountId>,
    pub name:        String,
    pub exchange:    String,
    pub credentials: Credentials,
}

// ─── GET /api/accounts ────────────────────────────────────────────────────────

pub async fn list_accounts(
    State(state): State<SharedState>,
) -> Result<impl IntoResponse, AppError> {
    let accounts = state.registry.get_all_accounts().await?;

    let mut rows = Vec::with_capacity(accounts.len());
    for account in accounts {
        let stream = state.streams.status(account.id).await;
        let initialized = state.exchange.is_initialized(account.id).await;
        rows.push(json!({
            "account":     account,
            "stream":      stream,
            "initialized": initialized,
        }));
    }

    Ok(Json(json!({
        "ok":       true,
        "count":    rows.len(),
        "accounts": rows,
    })))
}

// ─── POST /api/accounts ───────────────────────────────────────────────────────

pub async fn upsert_account(
    State(state): State<SharedState>,
    Json(body): Json<AccountBody>,
) -> Result<impl IntoResponse, AppError> {
    let exchange: ExchangeKind = body.exchange.parse()?;
    let mut account = Account::new(body.name, exchange, body.credentials);
    if let Some(id) = body.id {
        account.id = id;
    }
    let account_id = account.id;

    let outcome = state.upsert_account(account.clone()).await?;
    let status = match outcome {
        UpsertOutcome::Created => StatusCode::CREATED,
        UpsertOutcome::Updated { .. } => StatusCode::OK,
    };

    info!(account_id = %account_id, exchange = %exchange, ?outcome, "👤 Account saved");

    Ok((
        status,
        Json(json!({
            "ok":      true,
            "account": account,
            "created": outcome == UpsertOutcome::Created,
        })),
    ))
}

// ─── DELETE /api/accounts/:id ─────────────────────────────────────────────────

pub async fn delete_account(
    State(state): State<SharedState>,
    Path(account_id): Path<AccountId>,
) -> Result<impl IntoResponse, AppError> {
    let account = state.remove_account(account_id).await?;
    Ok(Json(json!({ "ok": true, "account": account })))
}

// ─── Tracking ─────────────────────────────────────────────────────────────────

pub async fn start_tracking(
    State(state): State<SharedState>,
    Path(account_id): Path<AccountId>,
) -> Result<impl IntoResponse, AppError> {
    state.registry.get_account_by_id(account_id).await?;
    state.start_tracking_account(account_id).await?;
    Ok(Json(json!({
        "ok":     true,
        "stream": state.streams.status(account_id).await,
    })))
}

pub async fn stop_tracking(
    State(state): State<SharedState>,
    Path(account_id): Path<AccountId>,
) -> Result<impl IntoResponse, AppError> {
    state.registry.get_account_by_id(account_id).await?;
    state.stop_tracking_account(account_id).await;
    Ok(Json(json!({
        "ok":     true,
        "stream": state.streams.status(account_id).await,
    })))
}

pub async fn track_market(
    State(state): State<SharedState>,
    Path((account_id, market)): Path<(AccountId, String)>,
) -> Result<impl IntoResponse, AppError> {
    state.track_market(account_id, &market).await?;
    let markets = state.tickers.tracked_markets(account_id).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "ok": true, "markets": markets })),
    ))
}

pub async fn untrack_market(
    State(state): State<SharedState>,
    Path((account_id, market)): Path<(AccountId, String)>,
) -> Result<impl IntoResponse, AppError> {
    state.untrack_market(account_id, &market).await?;
    let markets = state.tickers.tracked_markets(account_id).await?;
    Ok(Json(json!({ "ok": true, "markets": markets })))
}
