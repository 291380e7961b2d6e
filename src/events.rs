//! # events
//!
//! Defines [`Event`], every message that travels over the in-process event
//! bus, and [`EventBus`], a thin wrapper over `tokio::sync::broadcast`.
//!
//! Delivery is best-effort: at most once per subscriber, no replay, and a
//! subscriber that lags behind the channel capacity loses the oldest events.
//! Nothing is ordered across accounts or across producers.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::models::{AccountId, Execution, Order, Position, Ticker, Wallet};

/// Every event carried by the bus.  Each one names its account.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Event {
    // ── Exchange lifecycle ────────────────────────────────────────────────────
    ExchangeInitialized { account_id: AccountId },
    ExchangeTerminated { account_id: AccountId },

    // ── Cache change events (published only on a real change) ─────────────────
    TickerUpdated {
        account_id: AccountId,
        ticker: Ticker,
        /// Mid price; always present (single-sided quotes are not published).
        price: f64,
    },
    OrdersUpdated {
        account_id: AccountId,
        orders: Vec<Order>,
    },
    PositionsUpdated {
        account_id: AccountId,
        positions: Vec<Position>,
    },
    WalletUpdated {
        account_id: AccountId,
        wallet: Box<Wallet>,
    },

    // ── Push-channel demultiplexing ──────────────────────────────────────────
    ExecutionReceived {
        account_id: AccountId,
        execution: Execution,
    },
    OrdersPushed {
        account_id: AccountId,
        orders: Vec<Order>,
    },
    PositionsPushed {
        account_id: AccountId,
        positions: Vec<Position>,
    },
    WalletPushed {
        account_id: AccountId,
        wallet: Box<Wallet>,
    },
    TickerPushed {
        account_id: AccountId,
        market: String,
        bid: Option<f64>,
        ask: Option<f64>,
    },
}

impl Event {
    /// Dotted event name, as used in logs and by the monitor feed.
    pub fn name(&self) -> &'static str {
        match self {
            Event::ExchangeInitialized { .. } => "exchange.initialized",
            Event::ExchangeTerminated { .. } => "exchange.terminated",
            Event::TickerUpdated { .. } => "ticker.updated",
            Event::OrdersUpdated { .. } => "orders.updated",
            Event::PositionsUpdated { .. } => "positions.updated",
            Event::WalletUpdated { .. } => "wallet.updated",
            Event::ExecutionReceived { .. } => "execution.received",
            Event::OrdersPushed { .. } => "orders.pushed",
            Event::PositionsPushed { .. } => "positions.pushed",
            Event::WalletPushed { .. } => "wallet.pushed",
            Event::TickerPushed { .. } => "ticker.pushed",
        }
    }

    pub fn account_id(&self) -> AccountId {
        match self {
            Event::ExchangeInitialized { account_id }
            | Event::ExchangeTerminated { account_id }
            | Event::TickerUpdated { account_id, .. }
            | Event::OrdersUpdated { account_id, .. }
            | Event::PositionsUpdated { account_id, .. }
            | Event::WalletUpdated { account_id, .. }
            | Event::ExecutionReceived { account_id, .. }
            | Event::OrdersPushed { account_id, .. }
            | Event::PositionsPushed { account_id, .. }
            | Event::WalletPushed { account_id, .. }
            | Event::TickerPushed { account_id, .. } => *account_id,
        }
    }

    /// Serialise for the websocket monitor.
    #[inline]
    pub fn to_json(&self) -> String {
        serde_json::to_string(self)
            .unwrap_or_else(|_| r#"{"event":"SERIALIZATION_ERROR"}"#.to_string())
    }
}

// ─── EventBus ─────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Fire-and-forget.  Having no subscriber is not an error.
    pub fn emit(&self, event: Event) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
