//! # routes
//!
//! Thin Axum layer over [`AppState`](crate::state::AppState).  Handlers take
//! requests as-is, call one state or component method and wrap the result in
//! the usual `{ "ok": true, … }` body; failures go through
//! [`AppError`](crate::error::AppError)'s `IntoResponse`.

pub mod accounts;
pub mod market;
pub mod monitor;
pub mod orders;
pub mod strategies;

use axum::{
    extract::State,
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use serde_json::json;

use crate::{registry::AccountRegistry, state::SharedState};

/// GET /api/health
pub async fn health_check(State(state): State<SharedState>) -> impl IntoResponse {
    let accounts = state
        .registry
        .get_all_accounts()
        .await
        .map(|a| a.len())
        .unwrap_or_default();
    let strategies = state.engine.list_strategies(None).await.len();

    Json(json!({
        "ok":         true,
        "service":    "perpdesk",
        "version":    env!("CARGO_PKG_VERSION"),
        "accounts":   accounts,
        "strategies": strategies,
    }))
}

/// Every route, bound to `state`.  Middleware is added by the caller.
pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/api/health", get(health_check))
        // ── Accounts ──────────────────────────────────────────────────────────
        .route("/api/accounts", get(accounts::list_accounts).post(accounts::upsert_account))
        .route("/api/accounts/:id", delete(accounts::delete_account))
        .route(
            "/api/accounts/:id/track",
            post(accounts::start_tracking).delete(accounts::stop_tracking),
        )
        .route(
            "/api/accounts/:id/markets/:market",
            post(accounts::track_market).delete(accounts::untrack_market),
        )
        // ── Cached reads ──────────────────────────────────────────────────────
        .route("/api/accounts/:id/tickers", get(market::get_tickers))
        .route("/api/accounts/:id/tickers/:market", get(market::get_ticker))
        .route(
            "/api/accounts/:id/orders",
            get(market::get_orders).post(orders::place_order),
        )
        .route("/api/accounts/:id/positions", get(market::get_positions))
        .route("/api/accounts/:id/wallet", get(market::get_wallet))
        // ── Order entry ───────────────────────────────────────────────────────
        .route("/api/accounts/:id/orders/:order_id", delete(orders::cancel_order))
        .route("/api/accounts/:id/positions/close", post(orders::close_position))
        // ── Strategies ────────────────────────────────────────────────────────
        .route(
            "/api/strategies",
            get(strategies::list_strategies).post(strategies::create_strategy),
        )
        .route(
            "/api/strategies/:id",
            get(strategies::get_strategy).delete(strategies::delete_strategy),
        )
        // ── Monitor ───────────────────────────────────────────────────────────
        .route("/ws/monitor", get(monitor::ws_monitor))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use axum::{
        body::{to_bytes, Body},
        http::{Method, Request, StatusCode},
    };
    use serde_json::Value;
    use tower::ServiceExt;

    use super::*;
    use crate::exchange::paper::PAPER_STARTING_BALANCE;
    use crate::testkit::{paper_account, paper_state};

    const MARKET: &str = "BTCUSDT";

    async fn send(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => request
                .header("content-type", "application/json")
                .body(Body::from(body.to_string())),
            None => request.body(Body::empty()),
        }
        .unwrap();

        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, json)
    }

    fn ladder(account_id: impl ToString) -> Value {
        serde_json::json!({
            "account_id":         account_id.to_string(),
            "market":             MARKET,
            "currency_mode":      "base",
            "base_order_size":    1.0,
            "safety_order_size":  1.0,
            "initial_offset_pct": 1.0,
            "step_scale":         1.5,
            "volume_scale":       2.0,
            "take_profit_pct":    1.0,
            "max_safety_orders":  3,
        })
    }

    #[tokio::test]
    async fn test_health() {
        let app = router(paper_state());
        let (status, body) = send(&app, Method::GET, "/api/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ok"], true);
        assert_eq!(body["accounts"], 0);
    }

    #[tokio::test]
    async fn test_account_upsert_and_list() {
        let app = router(paper_state());
        let payload = serde_json::json!({
            "name": "desk-1",
            "exchange": "paper",
            "credentials": { "api_key": "k", "api_secret": "s" },
        });

        let (status, body) = send(&app, Method::POST, "/api/accounts", Some(payload.clone())).await;
        assert_eq!(status, StatusCode::CREATED);
        assert!(body["account"].get("credentials").is_none());

        let mut again = payload;
        again["id"] = body["account"]["id"].clone();
        let (status, body) = send(&app, Method::POST, "/api/accounts", Some(again)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["created"], false);

        let (_, body) = send(&app, Method::GET, "/api/accounts", None).await;
        assert_eq!(body["count"], 1);
        assert_eq!(body["accounts"][0]["stream"], "untracked");
    }

    #[tokio::test]
    async fn test_unknown_exchange_is_bad_request() {
        let app = router(paper_state());
        let payload = serde_json::json!({
            "name": "x",
            "exchange": "kraken",
            "credentials": { "api_key": "k", "api_secret": "s" },
        });
        let (status, body) = send(&app, Method::POST, "/api/accounts", Some(payload)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["ok"], false);
    }

    #[tokio::test]
    async fn test_reads_require_tracking() {
        let state = paper_state();
        let account = paper_account("a");
        let id = account.id;
        state.upsert_account(account).await.unwrap();
        let app = router(state);

        let wallet = format!("/api/accounts/{id}/wallet");
        let (status, _) = send(&app, Method::GET, &wallet, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = send(&app, Method::POST, &format!("/api/accounts/{id}/track"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["stream"], "tracking");

        let (status, body) = send(&app, Method::GET, &wallet, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ok"], true);
        assert!(body["wallet"].to_string().contains(&PAPER_STARTING_BALANCE.to_string()));

        let (status, _) = send(&app, Method::GET, &format!("/api/accounts/{id}/tickers/{MARKET}"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_manual_order_entry() {
        let state = paper_state();
        state.venue.set_quote(MARKET, Some(99.0), Some(101.0));
        let account = paper_account("a");
        let id = account.id;
        state.upsert_account(account).await.unwrap();
        let app = router(state.clone());

        let orders = format!("/api/accounts/{id}/orders");
        let bad = serde_json::json!({
            "market": MARKET, "order_type": "limit", "side": "buy", "quantity": 0.0, "price": 90.0,
        });
        let (status, _) = send(&app, Method::POST, &orders, Some(bad)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(state.venue.calls().is_empty());

        let limit = serde_json::json!({
            "market": MARKET, "order_type": "limit", "side": "buy", "quantity": 1.0, "price": 90.0,
        });
        let (status, body) = send(&app, Method::POST, &orders, Some(limit)).await;
        assert_eq!(status, StatusCode::CREATED);
        let order_id = body["order"]["id"].as_str().unwrap().to_string();

        let cancel = format!("/api/accounts/{id}/orders/{order_id}?market={MARKET}");
        let (status, _) = send(&app, Method::DELETE, &cancel, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(state.venue.call_count(id, "cancelOrder"), 1);
    }

    #[tokio::test]
    async fn test_strategy_lifecycle() {
        let state = paper_state();
        state.venue.set_quote(MARKET, Some(99.0), Some(101.0));
        let account = paper_account("a");
        let id = account.id;
        state.upsert_account(account).await.unwrap();
        state.start_tracking_account(id).await.unwrap();
        let app = router(state.clone());

        let mut invalid = ladder(id);
        invalid["step_scale"] = serde_json::json!(-1.0);
        let (status, _) = send(&app, Method::POST, "/api/strategies", Some(invalid)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(state.venue.call_count(id, "openOrder"), 0);

        let (status, body) = send(&app, Method::POST, "/api/strategies", Some(ladder(id))).await;
        assert_eq!(status, StatusCode::CREATED);
        let strategy_id = body["strategy_id"].as_str().unwrap().to_string();
        // base + take-profit + three rungs
        assert_eq!(state.venue.call_count(id, "openOrder"), 5);

        let (_, body) = send(&app, Method::GET, &format!("/api/strategies?account_id={id}"), None).await;
        assert_eq!(body["count"], 1);

        let path = format!("/api/strategies/{strategy_id}");
        let (status, body) = send(&app, Method::GET, &path, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["strategy"]["cycles"], 1);

        let (status, _) = send(&app, Method::DELETE, &path, None).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = send(&app, Method::GET, &path, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
