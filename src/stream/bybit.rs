//! # stream::bybit
//!
//! Bybit v5 push channel.  Private topics (order / execution / position /
//! wallet) live on the authenticated `/v5/private` socket; tickers need the
//! public `/v5/public/linear` socket, opened on the first ticker subscription.
//! If either socket drops, the other is closed too so the manager sees one
//! disconnect and resubscribes everything.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use super::ws::{Heartbeat, Socket};
use super::{Connection, PushChannel, PushConnector, RawMessage, StreamEvent, Topic, TopicKind};
use crate::config::Endpoints;
use crate::exchange::bybit::{
    execution_from_item, order_from_item, parse_opt, position_updates_from_item, wallet_from_items,
    ExecutionItem, OrderItem, PositionItem, TickerItem, WalletItem,
};
use crate::exchange::signing::sign_hex;
use crate::exchange::{AdapterError, AdapterResult};
use crate::models::{Account, ExchangeKind};

const AUTH_TIMEOUT: Duration = Duration::from_secs(10);
const AUTH_EXPIRY_MS: i64 = 10_000;

fn heartbeat() -> Heartbeat {
    Heartbeat {
        every: Duration::from_secs(20),
        payload: Some(json!({ "op": "ping" }).to_string()),
    }
}

pub struct BybitConnector {
    endpoints: Endpoints,
}

impl BybitConnector {
    pub fn new(endpoints: Endpoints) -> Self {
        Self { endpoints }
    }
}

#[async_trait]
impl PushConnector for BybitConnector {
    fn kind(&self) -> ExchangeKind {
        ExchangeKind::Bybit
    }

    async fn connect(&self, account: &Account) -> AdapterResult<Connection> {
        let base = self.endpoints.ws(account.credentials.testnet).trim_end_matches('/').to_string();
        let (private, mut frames) = Socket::connect(&format!("{base}/v5/private"), heartbeat()).await?;

        let expires = Utc::now().timestamp_millis() + AUTH_EXPIRY_MS;
        let signature = sign_hex(&account.credentials.api_secret, &format!("GET/realtime{expires}"))?;
        private
            .send(json!({ "op": "auth", "args": [account.credentials.api_key, expires, signature] }).to_string())
            .await?;

        let authenticated = timeout(AUTH_TIMEOUT, async {
            while let Some(text) = frames.recv().await {
                let Ok(frame) = serde_json::from_str::<Value>(&text) else { continue };
                if frame["op"] != "auth" {
                    continue;
                }
                if frame["success"].as_bool() == Some(true) {
                    return Ok(());
                }
                let reason = frame["ret_msg"].as_str().unwrap_or("auth rejected");
                return Err(AdapterError::Authentication(reason.to_string()));
            }
            Err(AdapterError::Transport("socket closed during auth".into()))
        })
        .await;
        match authenticated {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                private.close();
                return Err(err);
            }
            Err(_) => {
                private.close();
                return Err(AdapterError::Transport("auth timed out".into()));
            }
        }
        debug!(account_id = %account.id, "bybit private stream authenticated");

        let (inbound_tx, inbound) = mpsc::unbounded_channel();
        let sockets = Arc::new(Mutex::new(vec![private.clone()]));
        spawn_forwarder(frames, inbound_tx.clone(), sockets.clone());

        let channel = BybitChannel {
            public_url: format!("{base}/v5/public/linear"),
            private,
            public: None,
            inbound: inbound_tx.downgrade(),
            sockets,
        };
        Ok(Connection {
            channel: Box::new(channel),
            inbound,
        })
    }

    fn decode(&self, message: &RawMessage) -> AdapterResult<Vec<StreamEvent>> {
        decode(message)
    }
}

pub(crate) fn decode(message: &RawMessage) -> AdapterResult<Vec<StreamEvent>> {
    let Some(kind) = TopicKind::from_wire_name(&message.topic) else {
        trace!(topic = %message.topic, "unrouted bybit topic");
        return Ok(Vec::new());
    };
    let data = message.data.clone();
    let event = match kind {
        TopicKind::OrderUpdate => {
            let items: Vec<OrderItem> = serde_json::from_value(data).map_err(AdapterError::serialization)?;
            StreamEvent::Orders(items.into_iter().map(order_from_item).collect())
        }
        TopicKind::Execution => {
            let items: Vec<ExecutionItem> = serde_json::from_value(data).map_err(AdapterError::serialization)?;
            StreamEvent::Executions(items.into_iter().filter_map(execution_from_item).collect())
        }
        TopicKind::Position => {
            let items: Vec<PositionItem> = serde_json::from_value(data).map_err(AdapterError::serialization)?;
            StreamEvent::Positions(items.into_iter().flat_map(position_updates_from_item).collect())
        }
        TopicKind::Wallet => {
            let items: Vec<WalletItem> = serde_json::from_value(data).map_err(AdapterError::serialization)?;
            StreamEvent::Wallet(wallet_from_items(&items))
        }
        TopicKind::Ticker => {
            let item: TickerItem = serde_json::from_value(data).map_err(AdapterError::serialization)?;
            let market = item
                .symbol
                .unwrap_or_else(|| message.topic.trim_start_matches("tickers.").to_string());
            StreamEvent::Ticker {
                market,
                bid: parse_opt(item.bid1_price.as_deref()),
                ask: parse_opt(item.ask1_price.as_deref()),
            }
        }
    };
    Ok(vec![event])
}

/// Turn socket frames into [`RawMessage`]s.  Op acknowledgements are logged
/// and dropped.
fn spawn_forwarder(
    mut frames: mpsc::UnboundedReceiver<String>,
    inbound: mpsc::UnboundedSender<RawMessage>,
    sockets: Arc<Mutex<Vec<Socket>>>,
) {
    tokio::spawn(async move {
        while let Some(text) = frames.recv().await {
            let frame: Value = match serde_json::from_str(&text) {
                Ok(v) => v,
                Err(err) => {
                    warn!(error = %err, "undecodable bybit frame");
                    continue;
                }
            };
            if let Some(topic) = frame["topic"].as_str() {
                let message = RawMessage::new(topic, frame["data"].clone());
                if inbound.send(message).is_err() {
                    break;
                }
            } else if frame["success"] == false {
                warn!(op = %frame["op"], ret_msg = %frame["ret_msg"], "bybit request rejected");
            }
        }
        let sockets = sockets.lock().unwrap_or_else(|p| p.into_inner());
        for socket in sockets.iter() {
            socket.close();
        }
    });
}

struct BybitChannel {
    public_url: String,
    private: Socket,
    public: Option<Socket>,
    inbound: mpsc::WeakUnboundedSender<RawMessage>,
    sockets: Arc<Mutex<Vec<Socket>>>,
}

impl BybitChannel {
    async fn public_socket(&mut self) -> AdapterResult<Socket> {
        if let Some(socket) = &self.public {
            return Ok(socket.clone());
        }
        let inbound = self
            .inbound
            .upgrade()
            .ok_or_else(|| AdapterError::Transport("push channel closed".into()))?;
        let (socket, frames) = Socket::connect(&self.public_url, heartbeat()).await?;
        self.sockets
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(socket.clone());
        spawn_forwarder(frames, inbound, self.sockets.clone());
        self.public = Some(socket.clone());
        Ok(socket)
    }

    async fn send_op(&mut self, op: &str, topics: &[Topic]) -> AdapterResult<()> {
        let (private, public): (Vec<&Topic>, Vec<&Topic>) = topics.iter().partition(|t| t.is_private());
        if !private.is_empty() {
            let args: Vec<String> = private.iter().map(|t| t.wire_name()).collect();
            self.private
                .send(json!({ "op": op, "args": args }).to_string())
                .await?;
        }
        if !public.is_empty() {
            let args: Vec<String> = public.iter().map(|t| t.wire_name()).collect();
            let socket = self.public_socket().await?;
            socket.send(json!({ "op": op, "args": args }).to_string()).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl PushChannel for BybitChannel {
    async fn subscribe(&mut self, topics: &[Topic]) -> AdapterResult<()> {
        self.send_op("subscribe", topics).await
    }

    async fn unsubscribe(&mut self, topic: &Topic) -> AdapterResult<()> {
        self.send_op("unsubscribe", std::slice::from_ref(topic)).await
    }

    async fn close(&mut self) {
        let sockets = self.sockets.lock().unwrap_or_else(|p| p.into_inner());
        for socket in sockets.iter() {
            socket.close();
        }
    }
}
