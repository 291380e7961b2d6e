//! # routes::monitor
//!
//! `GET /ws/monitor`: live event feed.
//!
//! On connect the client receives one `SNAPSHOT` frame (accounts with their
//! stream status, strategy summaries), then every bus event as a JSON text
//! frame.  `?account_id=` narrows the feed to one account.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use crate::{models::AccountId, registry::AccountRegistry, state::SharedState};

#[derive(Debug, Default, Deserialize)]
pub struct MonitorFilter {
    pub account_id: Option<AccountId>,
}

pub async fn ws_monitor(
    ws: WebSocketUpgrade,
    State(state): State<SharedState>,
    Query(filter): Query<MonitorFilter>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, filter.account_id))
}

async fn snapshot(state: &SharedState, only: Option<AccountId>) -> String {
    let accounts = match state.registry.get_all_accounts().await {
        Ok(accounts) => accounts,
        Err(err) => {
            warn!(error = %err, "Snapshot could not list accounts");
            Vec::new()
        }
    };

    let mut rows = Vec::new();
    for account in accounts
        .into_iter()
        .filter(|a| only.map_or(true, |id| a.id == id))
    {
        let stream = state.streams.status(account.id).await;
        rows.push(json!({ "account": account, "stream": stream }));
    }
    let strategies = state.engine.list_strategies(only).await;

    json!({
        "event":      "SNAPSHOT",
        "accounts":   rows,
        "strategies": strategies,
    })
    .to_string()
}

async fn handle_socket(socket: WebSocket, state: SharedState, only: Option<AccountId>) {
    let mut rx = state.bus.subscribe();
    let (mut sender, mut receiver) = socket.split();

    info!(account_id = ?only, "🔌 Monitor client connected");

    // ── Snapshot first ────────────────────────────────────────────────────────
    let frame = snapshot(&state, only).await;
    if sender.send(Message::Text(frame)).await.is_err() {
        return;
    }

    // ── Event loop ────────────────────────────────────────────────────────────
    loop {
        tokio::select! {
            result = rx.recv() => {
                match result {
                    Ok(event) => {
                        if only.is_some_and(|id| id != event.account_id()) {
                            continue;
                        }
                        if sender.send(Message::Text(event.to_json())).await.is_err() {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(n)) => {
                        debug!("Monitor client lagged, skipped {n} events");
                    }
                    Err(RecvError::Closed) => break,
                }
            }

            result = receiver.next() => {
                match result {
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    Some(Ok(Message::Ping(data))) => {
                        let _ = sender.send(Message::Pong(data)).await;
                    }
                    _ => {}
                }
            }
        }
    }

    info!("🔌 Monitor client disconnected");
}
