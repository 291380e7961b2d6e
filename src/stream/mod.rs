//! # stream — per-account push channels
//!
//! ```text
//!  StreamManager ──▶ PushConnector (per ExchangeKind) ──connect──▶ Connection
//!        │                                                     ├─ channel: Box<dyn PushChannel>  (subscribe / unsubscribe / close)
//!        │                                                     └─ inbound: RawMessage receiver
//!        └── handler task: inbound ─▶ connector.decode() ─▶ StreamEvent ─▶ EventBus
//! ```
//!
//! A [`Topic`] is exchange-neutral; each connector maps it to its own wire
//! name and maps inbound wire topics back to a [`TopicKind`] through a static
//! table.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::exchange::AdapterResult;
use crate::models::{Account, ExchangeKind, Execution, Order, Position, Wallet};

pub mod binance;
pub mod bybit;
pub mod manager;
pub mod paper;
mod ws;

pub use manager::{StreamManager, TrackingStatus};

// ─── Messages ─────────────────────────────────────────────────────────────────

/// One inbound push message: the wire topic it arrived on and its payload.
#[derive(Debug, Clone, PartialEq)]
pub struct RawMessage {
    pub topic: String,
    pub data: Value,
}

impl RawMessage {
    pub fn new(topic: impl Into<String>, data: Value) -> Self {
        Self {
            topic: topic.into(),
            data,
        }
    }
}

// ─── Topics ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "market")]
pub enum Topic {
    Orders,
    Executions,
    Positions,
    Wallet,
    /// Best bid/ask for one market.
    Ticker(String),
}

impl Topic {
    pub fn ticker(market: impl Into<String>) -> Self {
        Topic::Ticker(market.into())
    }

    /// The private topics every account subscribes when tracking starts.
    pub fn private_defaults() -> Vec<Topic> {
        vec![Topic::Orders, Topic::Executions, Topic::Positions, Topic::Wallet]
    }

    pub fn is_private(&self) -> bool {
        !matches!(self, Topic::Ticker(_))
    }

    /// Bybit v5 topic name; the paper venue uses the same names.
    pub fn wire_name(&self) -> String {
        match self {
            Topic::Orders => "order".into(),
            Topic::Executions => "execution".into(),
            Topic::Positions => "position".into(),
            Topic::Wallet => "wallet".into(),
            Topic::Ticker(market) => format!("tickers.{market}"),
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.wire_name())
    }
}

/// What an inbound message carries, independent of exchange naming.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicKind {
    OrderUpdate,
    Execution,
    Position,
    Wallet,
    Ticker,
}

impl TopicKind {
    /// Routing table for [`Topic::wire_name`] style topics.
    pub fn from_wire_name(topic: &str) -> Option<TopicKind> {
        match topic {
            "order" => Some(TopicKind::OrderUpdate),
            "execution" => Some(TopicKind::Execution),
            "position" => Some(TopicKind::Position),
            "wallet" => Some(TopicKind::Wallet),
            t if t.starts_with("tickers.") => Some(TopicKind::Ticker),
            _ => None,
        }
    }
}

/// Typed payload decoded from one [`RawMessage`].
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Orders(Vec<Order>),
    Executions(Vec<Execution>),
    /// Size-zero entries mark positions that closed.
    Positions(Vec<Position>),
    Wallet(Wallet),
    Ticker {
        market: String,
        bid: Option<f64>,
        ask: Option<f64>,
    },
}

// ─── Connector / channel contracts ────────────────────────────────────────────

/// An open push connection.  `inbound` ends when the connection is gone.
pub struct Connection {
    pub channel: Box<dyn PushChannel>,
    pub inbound: mpsc::UnboundedReceiver<RawMessage>,
}

#[async_trait]
pub trait PushChannel: Send {
    /// Subscribe every topic in one exchange call.
    async fn subscribe(&mut self, topics: &[Topic]) -> AdapterResult<()>;

    async fn unsubscribe(&mut self, topic: &Topic) -> AdapterResult<()>;

    async fn close(&mut self);
}

#[async_trait]
pub trait PushConnector: Send + Sync {
    fn kind(&self) -> ExchangeKind;

    fn default_topics(&self) -> Vec<Topic> {
        Topic::private_defaults()
    }

    async fn connect(&self, account: &Account) -> AdapterResult<Connection>;

    /// Decode one message.  Unknown topics decode to nothing.
    fn decode(&self, message: &RawMessage) -> AdapterResult<Vec<StreamEvent>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_names() {
        assert_eq!(Topic::Orders.wire_name(), "order");
        assert_eq!(Topic::ticker("BTCUSDT").wire_name(), "tickers.BTCUSDT");
        assert!(!Topic::ticker("BTCUSDT").is_private());
    }

    #[test]
    fn test_topic_serialises_with_market() {
        let json = serde_json::to_value(Topic::ticker("ETHUSDT")).unwrap();
        assert_eq!(json, serde_json::json!({ "kind": "ticker", "market": "ETHUSDT" }));
        let back: Topic = serde_json::from_value(serde_json::json!({ "kind": "wallet" })).unwrap();
        assert_eq!(back, Topic::Wallet);
    }
}
