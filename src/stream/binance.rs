//! # stream::binance
//!
//! Binance USDⓈ-M futures push channel: one socket on the user-data stream
//! (`/ws/<listenKey>`).  Private data arrives unrequested, so private topics
//! need no wire call; book tickers are added to the same socket with
//! `SUBSCRIBE` / `UNSUBSCRIBE`.
//!
//! Binance does not separate executions from order updates: every
//! `ORDER_TRADE_UPDATE` yields an order update, plus an execution when the
//! last-filled quantity `l` is nonzero.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, info, trace, warn};

use super::ws::{Heartbeat, Socket};
use super::{Connection, PushChannel, PushConnector, RawMessage, StreamEvent, Topic, TopicKind};
use crate::config::Endpoints;
use crate::exchange::binance::{
    map_order_status, map_order_type, millis_to_datetime, parse_f64, parse_opt, parse_side,
    wallet_from_account_update, BinanceExchange,
};
use crate::exchange::{AdapterError, AdapterResult};
use crate::models::{Account, ExchangeKind, Execution, Order, OrderSide, OrderStatus, OrderType, Position};

const LISTEN_KEY_KEEPALIVE: Duration = Duration::from_secs(30 * 60);

/// Wire topic → payload kinds.
fn topic_kinds(topic: &str) -> &'static [TopicKind] {
    match topic {
        "ORDER_TRADE_UPDATE" => &[TopicKind::OrderUpdate, TopicKind::Execution],
        "ACCOUNT_UPDATE" => &[TopicKind::Position, TopicKind::Wallet],
        "bookTicker" => &[TopicKind::Ticker],
        _ => &[],
    }
}

fn stream_name(market: &str) -> String {
    format!("{}@bookTicker", market.to_ascii_lowercase())
}

pub struct BinanceConnector {
    endpoints: Endpoints,
}

impl BinanceConnector {
    pub fn new(endpoints: Endpoints) -> Self {
        Self { endpoints }
    }
}

#[async_trait]
impl PushConnector for BinanceConnector {
    fn kind(&self) -> ExchangeKind {
        ExchangeKind::Binance
    }

    async fn connect(&self, account: &Account) -> AdapterResult<Connection> {
        let rest = Arc::new(BinanceExchange::new(account, &self.endpoints)?);
        let listen_key = rest.create_listen_key().await?;
        let base = self.endpoints.ws(account.credentials.testnet).trim_end_matches('/');
        let heartbeat = Heartbeat {
            every: Duration::from_secs(180),
            payload: None,
        };
        let (socket, frames) = Socket::connect(&format!("{base}/ws/{listen_key}"), heartbeat).await?;

        let keepalive = {
            let rest = rest.clone();
            let socket = socket.clone();
            let listen_key = listen_key.clone();
            tokio::spawn(async move {
                let mut every = tokio::time::interval(LISTEN_KEY_KEEPALIVE);
                every.tick().await;
                loop {
                    every.tick().await;
                    if let Err(err) = rest.keepalive_listen_key(&listen_key).await {
                        warn!(error = %err, "listen key keepalive failed; dropping user stream");
                        socket.close();
                        return;
                    }
                    trace!("listen key kept alive");
                }
            })
            .abort_handle()
        };

        let (inbound_tx, inbound) = mpsc::unbounded_channel();
        spawn_forwarder(frames, inbound_tx, socket.clone(), keepalive.clone());
        debug!(account_id = %account.id, "binance user stream connected");

        Ok(Connection {
            channel: Box::new(BinanceChannel {
                rest,
                socket,
                listen_key,
                keepalive,
                next_id: 0,
            }),
            inbound,
        })
    }

    fn decode(&self, message: &RawMessage) -> AdapterResult<Vec<StreamEvent>> {
        decode(message)
    }
}

fn spawn_forwarder(
    mut frames: mpsc::UnboundedReceiver<String>,
    inbound: mpsc::UnboundedSender<RawMessage>,
    socket: Socket,
    keepalive: AbortHandle,
) {
    tokio::spawn(async move {
        while let Some(text) = frames.recv().await {
            let frame: Value = match serde_json::from_str(&text) {
                Ok(v) => v,
                Err(err) => {
                    warn!(error = %err, "undecodable binance frame");
                    continue;
                }
            };
            match frame["e"].as_str() {
                Some("listenKeyExpired") => {
                    info!("listen key expired; dropping user stream");
                    socket.close();
                    break;
                }
                Some(topic) => {
                    if inbound.send(RawMessage::new(topic, frame.clone())).is_err() {
                        break;
                    }
                }
                None if !frame["error"].is_null() => {
                    warn!(error = %frame["error"], "binance request rejected");
                }
                None => {}
            }
        }
        keepalive.abort();
    });
}

struct BinanceChannel {
    rest: Arc<BinanceExchange>,
    socket: Socket,
    listen_key: String,
    keepalive: AbortHandle,
    next_id: u64,
}

impl BinanceChannel {
    async fn send_method(&mut self, method: &str, topics: &[Topic]) -> AdapterResult<()> {
        let params: Vec<String> = topics
            .iter()
            .filter_map(|t| match t {
                Topic::Ticker(market) => Some(stream_name(market)),
                _ => None,
            })
            .collect();
        if params.is_empty() {
            return Ok(());
        }
        self.next_id += 1;
        self.socket
            .send(json!({ "method": method, "params": params, "id": self.next_id }).to_string())
            .await
    }
}

#[async_trait]
impl PushChannel for BinanceChannel {
    async fn subscribe(&mut self, topics: &[Topic]) -> AdapterResult<()> {
        self.send_method("SUBSCRIBE", topics).await
    }

    async fn unsubscribe(&mut self, topic: &Topic) -> AdapterResult<()> {
        self.send_method("UNSUBSCRIBE", std::slice::from_ref(topic)).await
    }

    async fn close(&mut self) {
        self.keepalive.abort();
        self.socket.close();
        if let Err(err) = self.rest.close_listen_key(&self.listen_key).await {
            debug!(error = %err, "listen key close failed");
        }
    }
}

// ─── Decoding ─────────────────────────────────────────────────────────────────

pub(crate) fn decode(message: &RawMessage) -> AdapterResult<Vec<StreamEvent>> {
    let kinds = topic_kinds(&message.topic);
    if kinds.is_empty() {
        trace!(topic = %message.topic, "unrouted binance event");
        return Ok(Vec::new());
    }
    match message.topic.as_str() {
        "ORDER_TRADE_UPDATE" => {
            let update: OrderTradeUpdate =
                serde_json::from_value(message.data.clone()).map_err(AdapterError::serialization)?;
            Ok(decode_order_trade(update.order))
        }
        "ACCOUNT_UPDATE" => {
            let update: AccountUpdate =
                serde_json::from_value(message.data.clone()).map_err(AdapterError::serialization)?;
            Ok(decode_account(update.account, millis_to_datetime(update.event_time)))
        }
        _ => {
            let book: BookTickerEvent =
                serde_json::from_value(message.data.clone()).map_err(AdapterError::serialization)?;
            Ok(vec![StreamEvent::Ticker {
                market: book.symbol,
                bid: parse_opt(Some(&book.bid)),
                ask: parse_opt(Some(&book.ask)),
            }])
        }
    }
}

fn decode_order_trade(o: OrderPayload) -> Vec<StreamEvent> {
    let quantity = parse_f64(&o.quantity);
    let remaining = (quantity - parse_f64(&o.cumulative_filled)).max(0.0);
    let order_type = map_order_type(&o.order_type);
    let mut status = map_order_status(&o.status);
    if order_type == OrderType::StopMarket && status == OrderStatus::New {
        status = OrderStatus::Untriggered;
    }
    let link_id = Some(o.client_order_id).filter(|v| !v.is_empty());
    let updated_at = millis_to_datetime(o.trade_time);
    let order = Order {
        id: o.order_id.to_string(),
        link_id: link_id.clone(),
        market: o.symbol.clone(),
        side: parse_side(&o.side),
        order_type,
        price: parse_opt(Some(&o.price)),
        trigger_price: parse_opt(Some(&o.stop_price)),
        quantity,
        remaining,
        status,
        reduce_only: o.reduce_only,
        updated_at,
    };
    let last_filled = parse_f64(&o.last_filled);
    let mut events = Vec::with_capacity(2);
    if last_filled > 0.0 {
        events.push(StreamEvent::Executions(vec![Execution {
            order_id: order.id.clone(),
            link_id,
            market: order.market.clone(),
            side: order.side,
            price: parse_f64(&o.last_price),
            quantity: last_filled,
            remaining,
            executed_at: updated_at,
        }]));
    }
    events.insert(0, StreamEvent::Orders(vec![order]));
    events
}

fn decode_account(account: AccountPayload, at: chrono::DateTime<chrono::Utc>) -> Vec<StreamEvent> {
    let mut positions = Vec::new();
    let mut upnl = 0.0;
    for p in account.positions {
        let amount = parse_f64(&p.amount);
        upnl += parse_f64(&p.unrealized_pnl);
        let sides: &[OrderSide] = match (p.position_side.as_str(), amount) {
            ("LONG", _) => &[OrderSide::Buy],
            ("SHORT", _) => &[OrderSide::Sell],
            (_, a) if a > 0.0 => &[OrderSide::Buy],
            (_, a) if a < 0.0 => &[OrderSide::Sell],
            // flat one-way position: clear both sides
            _ => &[OrderSide::Buy, OrderSide::Sell],
        };
        for side in sides {
            positions.push(Position {
                market: p.symbol.clone(),
                side: *side,
                entry_price: parse_f64(&p.entry_price),
                // ACCOUNT_UPDATE carries no mark price
                mark_price: 0.0,
                size: amount.abs(),
                leverage: 0.0,
                unrealized_pnl: parse_f64(&p.unrealized_pnl),
                updated_at: at,
            });
        }
    }
    let balances: Vec<(String, f64, f64)> = account
        .balances
        .iter()
        .map(|b| (b.asset.clone(), parse_f64(&b.wallet_balance), parse_f64(&b.cross_wallet)))
        .collect();

    let mut events = Vec::new();
    if !positions.is_empty() {
        events.push(StreamEvent::Positions(positions));
    }
    if !balances.is_empty() {
        events.push(StreamEvent::Wallet(wallet_from_account_update(&balances, upnl)));
    }
    events
}

// ─── Wire types ───────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct OrderTradeUpdate {
    #[serde(rename = "o")]
    order: OrderPayload,
}

#[derive(Deserialize)]
struct OrderPayload {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "c", default)]
    client_order_id: String,
    #[serde(rename = "S")]
    side: String,
    #[serde(rename = "o")]
    order_type: String,
    #[serde(rename = "q")]
    quantity: String,
    #[serde(rename = "p")]
    price: String,
    #[serde(rename = "sp", default)]
    stop_price: String,
    #[serde(rename = "X")]
    status: String,
    #[serde(rename = "i")]
    order_id: i64,
    #[serde(rename = "l")]
    last_filled: String,
    #[serde(rename = "z")]
    cumulative_filled: String,
    #[serde(rename = "L")]
    last_price: String,
    #[serde(rename = "T")]
    trade_time: i64,
    #[serde(rename = "R", default)]
    reduce_only: bool,
}

#[derive(Deserialize)]
struct AccountUpdate {
    #[serde(rename = "E", default)]
    event_time: i64,
    #[serde(rename = "a")]
    account: AccountPayload,
}

#[derive(Deserialize)]
struct AccountPayload {
    #[serde(rename = "B", default)]
    balances: Vec<BalancePayload>,
    #[serde(rename = "P", default)]
    positions: Vec<PositionPayload>,
}

#[derive(Deserialize)]
struct BalancePayload {
    #[serde(rename = "a")]
    asset: String,
    #[serde(rename = "wb")]
    wallet_balance: String,
    #[serde(rename = "cw")]
    cross_wallet: String,
}

#[derive(Deserialize)]
struct PositionPayload {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "pa")]
    amount: String,
    #[serde(rename = "ep")]
    entry_price: String,
    #[serde(rename = "up")]
    unrealized_pnl: String,
    #[serde(rename = "ps", default)]
    position_side: String,
}

#[derive(Deserialize)]
struct BookTickerEvent {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "b")]
    bid: String,
    #[serde(rename = "a")]
    ask: String,
}
