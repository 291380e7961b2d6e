//! # exchange::paper
//!
//! In-process simulated venue.  [`PaperVenue`] holds the book state for every
//! paper account and fans push messages out to connected channels;
//! [`PaperExchange`] is the adapter view of one account.
//!
//! Matching is deliberately simple:
//! * market orders fill immediately at the touch (ask for buys, bid for sells)
//! * limit orders rest until the quote crosses them
//! * stop-market orders arm and fire as market orders once triggered
//!
//! Every call is logged (`calls`) and any operation can be made to fail for an
//! account (`fail`), which makes the venue the deterministic exchange used by
//! the test suites.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::debug;

use super::{AdapterError, AdapterResult, ExchangeAdapter};
use crate::models::{
    AccountId, Balance, ExchangeKind, Execution, Market, Order, OrderRequest, OrderSide,
    OrderStatus, OrderType, OrderUpdate, Position, Ticker, Wallet,
};
use crate::stream::RawMessage;

pub const PAPER_STARTING_BALANCE: f64 = 10_000.0;
const PAPER_LEVERAGE: f64 = 1.0;

// ─── Venue state ──────────────────────────────────────────────────────────────

/// One recorded call against the venue.
#[derive(Debug, Clone, PartialEq)]
pub struct VenueCall {
    pub account_id: AccountId,
    pub operation: &'static str,
    pub detail: String,
}

struct PaperAccount {
    orders: Vec<Order>,
    positions: Vec<Position>,
    balance: f64,
}

impl PaperAccount {
    fn new() -> Self {
        Self {
            orders: Vec::new(),
            positions: Vec::new(),
            balance: PAPER_STARTING_BALANCE,
        }
    }
}

struct ChannelSink {
    tx: mpsc::UnboundedSender<RawMessage>,
    topics: HashSet<String>,
}

/// Injected failure; the first `skip` calls still succeed.
struct Failure {
    error: AdapterError,
    skip:  usize,
}

#[derive(Default)]
struct VenueState {
    accounts: HashMap<AccountId, PaperAccount>,
    quotes: HashMap<String, (Option<f64>, Option<f64>)>,
    calls: Vec<VenueCall>,
    failures: HashMap<(AccountId, &'static str), Failure>,
    rejected_keys: HashSet<String>,
    channels: HashMap<AccountId, ChannelSink>,
    next_order_id: u64,
}

/// Shared simulated exchange.
#[derive(Default)]
pub struct PaperVenue {
    state: Mutex<VenueState>,
}

impl PaperVenue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn state(&self) -> MutexGuard<'_, VenueState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ── Test / operator controls ─────────────────────────────────────────────

    /// Make `operation` fail for `account_id` until [`PaperVenue::heal`] is called.
    pub fn fail(&self, account_id: AccountId, operation: &'static str, error: AdapterError) {
        self.fail_after(account_id, operation, 0, error);
    }

    /// Let the next `skip` calls of `operation` through, then fail every one
    /// until healed.
    pub fn fail_after(&self, account_id: AccountId, operation: &'static str, skip: usize, error: AdapterError) {
        self.state()
            .failures
            .insert((account_id, operation), Failure { error, skip });
    }

    pub fn heal(&self, account_id: AccountId, operation: &'static str) {
        self.state().failures.remove(&(account_id, operation));
    }

    /// API keys in this set fail `initialize` with an authentication error.
    pub fn reject_api_key(&self, api_key: impl Into<String>) {
        self.state().rejected_keys.insert(api_key.into());
    }

    pub fn calls(&self) -> Vec<VenueCall> {
        self.state().calls.clone()
    }

    /// Details of every recorded `operation` call for one account.
    pub fn calls_for(&self, account_id: AccountId, operation: &str) -> Vec<String> {
        self.state()
            .calls
            .iter()
            .filter(|c| c.account_id == account_id && c.operation == operation)
            .map(|c| c.detail.clone())
            .collect()
    }

    pub fn call_count(&self, account_id: AccountId, operation: &str) -> usize {
        self.calls_for(account_id, operation).len()
    }

    /// Move the quote for `market`, match resting orders and push the
    /// ticker to subscribed channels.
    pub fn set_quote(&self, market: &str, bid: Option<f64>, ask: Option<f64>) {
        let mut state = self.state();
        let quote = state.quotes.entry(market.to_string()).or_insert((None, None));
        if bid.is_some() {
            quote.0 = bid;
        }
        if ask.is_some() {
            quote.1 = ask;
        }
        let payload = serde_json::json!({ "symbol": market, "bid": bid, "ask": ask });
        let topic = format!("tickers.{market}");
        for sink in state.channels.values() {
            if sink.topics.contains(&topic) {
                let _ = sink.tx.send(RawMessage::new(topic.clone(), payload.clone()));
            }
        }
        let ids: Vec<AccountId> = state.accounts.keys().copied().collect();
        for account_id in ids {
            state.match_resting(account_id, market);
        }
    }

    /// Fill `quantity` of a resting order at `price`, as if a counterparty hit it.
    pub fn fill_order(&self, account_id: AccountId, order_id: &str, quantity: f64, price: f64) {
        let mut state = self.state();
        state.fill(account_id, order_id, quantity, price);
    }

    /// Close the push channel from the venue side (simulates a dropped socket).
    pub fn drop_connection(&self, account_id: AccountId) {
        self.state().channels.remove(&account_id);
    }

    pub fn is_connected(&self, account_id: AccountId) -> bool {
        self.state().channels.contains_key(&account_id)
    }

    pub fn subscribed_topics(&self, account_id: AccountId) -> HashSet<String> {
        self.state()
            .channels
            .get(&account_id)
            .map(|sink| sink.topics.clone())
            .unwrap_or_default()
    }

    /// Push an arbitrary message to one account's channel (bypasses the topic filter).
    pub fn push_raw(&self, account_id: AccountId, message: RawMessage) {
        if let Some(sink) = self.state().channels.get(&account_id) {
            let _ = sink.tx.send(message);
        }
    }

    pub fn orders(&self, account_id: AccountId) -> Vec<Order> {
        self.state()
            .accounts
            .get(&account_id)
            .map(|a| a.orders.clone())
            .unwrap_or_default()
    }

    // ── Channel plumbing (used by the paper push connector) ──────────────────

    pub(crate) fn record(
        &self,
        account_id: AccountId,
        operation: &'static str,
        detail: impl Into<String>,
    ) -> AdapterResult<()> {
        self.state().record(account_id, operation, detail.into())
    }

    pub(crate) fn open_channel(
        &self,
        account_id: AccountId,
    ) -> AdapterResult<mpsc::UnboundedReceiver<RawMessage>> {
        let mut state = self.state();
        state.record(account_id, "connect", String::new())?;
        let (tx, rx) = mpsc::unbounded_channel();
        state.channels.insert(
            account_id,
            ChannelSink {
                tx,
                topics: HashSet::new(),
            },
        );
        Ok(rx)
    }

    pub(crate) fn set_channel_topics(
        &self,
        account_id: AccountId,
        operation: &'static str,
        topics: &[String],
    ) -> AdapterResult<()> {
        let mut sorted = topics.to_vec();
        sorted.sort();
        let mut state = self.state();
        state.record(account_id, operation, sorted.join(","))?;
        let sink = state
            .channels
            .get_mut(&account_id)
            .ok_or_else(|| AdapterError::Transport("channel closed".into()))?;
        for topic in topics {
            if operation == "subscribe" {
                sink.topics.insert(topic.clone());
            } else {
                sink.topics.remove(topic);
            }
        }
        Ok(())
    }

    pub(crate) fn close_channel(&self, account_id: AccountId) {
        let mut state = self.state();
        let _ = state.record(account_id, "close", String::new());
        state.channels.remove(&account_id);
    }
}

impl VenueState {
    fn record(
        &mut self,
        account_id: AccountId,
        operation: &'static str,
        detail: String,
    ) -> AdapterResult<()> {
        self.calls.push(VenueCall {
            account_id,
            operation,
            detail,
        });
        match self.failures.get_mut(&(account_id, operation)) {
            Some(failure) if failure.skip > 0 => {
                failure.skip -= 1;
                Ok(())
            }
            Some(failure) => Err(failure.error.clone()),
            None => Ok(()),
        }
    }

    fn account(&mut self, account_id: AccountId) -> &mut PaperAccount {
        self.accounts.entry(account_id).or_insert_with(PaperAccount::new)
    }

    fn push<T: Serialize>(&self, account_id: AccountId, topic: &str, data: &T) {
        let Some(sink) = self.channels.get(&account_id) else {
            return;
        };
        if !sink.topics.contains(topic) {
            return;
        }
        match serde_json::to_value(data) {
            Ok(value) => {
                let _ = sink.tx.send(RawMessage::new(topic, value));
            }
            Err(err) => debug!(error = %err, topic, "paper push serialisation failed"),
        }
    }

    fn next_id(&mut self) -> String {
        self.next_order_id += 1;
        format!("paper-{}", self.next_order_id)
    }

    fn touch(&self, market: &str, side: OrderSide) -> Option<f64> {
        let (bid, ask) = self.quotes.get(market).copied().unwrap_or((None, None));
        match side {
            OrderSide::Buy => ask.or(bid),
            OrderSide::Sell => bid.or(ask),
        }
    }

    /// Fill resting limit orders crossed by the current quote and fire
    /// triggered stops.
    fn match_resting(&mut self, account_id: AccountId, market: &str) {
        let (bid, ask) = self.quotes.get(market).copied().unwrap_or((None, None));
        let Some(account) = self.accounts.get(&account_id) else {
            return;
        };
        let mut fills = Vec::new();
        for order in account.orders.iter().filter(|o| o.market == market && o.status.is_open()) {
            match order.order_type {
                OrderType::Limit => {
                    let Some(limit) = order.price else { continue };
                    let crossed = match order.side {
                        OrderSide::Buy => ask.is_some_and(|a| a <= limit),
                        OrderSide::Sell => bid.is_some_and(|b| b >= limit),
                    };
                    if crossed {
                        fills.push((order.id.clone(), order.remaining, limit));
                    }
                }
                OrderType::StopMarket => {
                    let Some(trigger) = order.trigger_price else { continue };
                    let fired = match order.side {
                        OrderSide::Sell => bid.is_some_and(|b| b <= trigger),
                        OrderSide::Buy => ask.is_some_and(|a| a >= trigger),
                    };
                    let touch = match order.side {
                        OrderSide::Sell => bid,
                        OrderSide::Buy => ask,
                    };
                    if let (true, Some(price)) = (fired, touch) {
                        fills.push((order.id.clone(), order.remaining, price));
                    }
                }
                OrderType::Market => {}
            }
        }
        for (order_id, quantity, price) in fills {
            self.fill(account_id, &order_id, quantity, price);
        }
    }

    fn fill(&mut self, account_id: AccountId, order_id: &str, quantity: f64, price: f64) {
        let account = self.account(account_id);
        let Some(order) = account
            .orders
            .iter_mut()
            .find(|o| o.id == order_id && o.status.is_open())
        else {
            return;
        };
        let quantity = quantity.min(order.remaining);
        if quantity <= 0.0 {
            return;
        }
        order.remaining -= quantity;
        if order.remaining <= f64::EPSILON {
            order.remaining = 0.0;
            order.status = OrderStatus::Filled;
        } else {
            order.status = OrderStatus::PartiallyFilled;
        }
        order.updated_at = Utc::now();
        let order = order.clone();
        let execution = Execution {
            order_id: order.id.clone(),
            link_id: order.link_id.clone(),
            market: order.market.clone(),
            side: order.side,
            price,
            quantity,
            remaining: order.remaining,
            executed_at: Utc::now(),
        };
        let position = apply_fill(account, &order.market, order.side, quantity, price);
        let wallet = wallet_of(account);

        self.push(account_id, "execution", &vec![execution]);
        self.push(account_id, "order", &vec![order]);
        self.push(account_id, "position", &vec![position]);
        self.push(account_id, "wallet", &wallet);
    }
}

/// Net a fill into the account's positions (one-way mode) and return the
/// touched position.  A position that closed comes back with size zero.
fn apply_fill(
    account: &mut PaperAccount,
    market: &str,
    side: OrderSide,
    quantity: f64,
    price: f64,
) -> Position {
    let now = Utc::now();
    if let Some(pos) = account.positions.iter_mut().find(|p| p.market == market) {
        if pos.side == side {
            let size = pos.size + quantity;
            pos.entry_price = (pos.entry_price * pos.size + price * quantity) / size;
            pos.size = size;
        } else {
            let closed = quantity.min(pos.size);
            let pnl_per_unit = match pos.side {
                OrderSide::Buy => price - pos.entry_price,
                OrderSide::Sell => pos.entry_price - price,
            };
            account.balance += pnl_per_unit * closed;
            pos.size -= closed;
        }
        pos.mark_price = price;
        pos.unrealized_pnl = match pos.side {
            OrderSide::Buy => (price - pos.entry_price) * pos.size,
            OrderSide::Sell => (pos.entry_price - price) * pos.size,
        };
        pos.updated_at = now;
        let touched = pos.clone();
        account.positions.retain(|p| !p.is_flat());
        touched
    } else {
        let position = Position {
            market: market.to_string(),
            side,
            entry_price: price,
            mark_price: price,
            size: quantity,
            leverage: PAPER_LEVERAGE,
            unrealized_pnl: 0.0,
            updated_at: now,
        };
        account.positions.push(position.clone());
        position
    }
}

fn wallet_of(account: &PaperAccount) -> Wallet {
    let upnl: f64 = account.positions.iter().map(|p| p.unrealized_pnl).sum();
    let mut wallet = Wallet::empty();
    wallet.equity = account.balance + upnl;
    wallet.balances.insert(
        wallet.quote_currency.clone(),
        Balance {
            free: account.balance,
            used: 0.0,
            total: account.balance,
            debt: 0.0,
        },
    );
    wallet
}

// ─── Adapter ──────────────────────────────────────────────────────────────────

pub struct PaperExchange {
    account_id: AccountId,
    api_key: String,
    venue: Arc<PaperVenue>,
}

impl PaperExchange {
    pub fn new(account_id: AccountId, api_key: impl Into<String>, venue: Arc<PaperVenue>) -> Self {
        Self {
            account_id,
            api_key: api_key.into(),
            venue,
        }
    }

    fn record(&self, operation: &'static str, detail: impl Into<String>) -> AdapterResult<()> {
        self.venue.record(self.account_id, operation, detail)
    }
}

#[async_trait]
impl ExchangeAdapter for PaperExchange {
    fn kind(&self) -> ExchangeKind {
        ExchangeKind::Paper
    }

    async fn initialize(&self) -> AdapterResult<()> {
        self.record("initialize", "")?;
        let mut state = self.venue.state();
        if state.rejected_keys.contains(&self.api_key) {
            return Err(AdapterError::Authentication("API key rejected".into()));
        }
        state.account(self.account_id);
        Ok(())
    }

    async fn get_balances(&self) -> AdapterResult<Wallet> {
        self.record("getBalances", "")?;
        let mut state = self.venue.state();
        Ok(wallet_of(state.account(self.account_id)))
    }

    async fn get_markets(&self) -> AdapterResult<Vec<Market>> {
        self.record("getMarkets", "")?;
        let state = self.venue.state();
        let mut markets: Vec<Market> = state
            .quotes
            .keys()
            .map(|symbol| Market {
                symbol: symbol.clone(),
                base: symbol.trim_end_matches("USDT").to_string(),
                quote: "USDT".into(),
                tick_size: 0.01,
                qty_step: 0.001,
                min_qty: 0.001,
            })
            .collect();
        markets.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        Ok(markets)
    }

    async fn get_ticker(&self, market: &str) -> AdapterResult<Ticker> {
        self.record("getTicker", market)?;
        let state = self.venue.state();
        let (bid, ask) = state
            .quotes
            .get(market)
            .copied()
            .ok_or_else(|| AdapterError::InvalidRequest(format!("unknown market {market}")))?;
        Ok(Ticker::new(market, bid, ask))
    }

    async fn get_open_orders(&self, market: Option<&str>) -> AdapterResult<Vec<Order>> {
        self.record("getOpenOrders", market.unwrap_or(""))?;
        let mut state = self.venue.state();
        Ok(state
            .account(self.account_id)
            .orders
            .iter()
            .filter(|o| o.status.is_open() && market.map_or(true, |m| o.market == m))
            .cloned()
            .collect())
    }

    async fn get_orders(&self, market: Option<&str>) -> AdapterResult<Vec<Order>> {
        self.record("getOrders", market.unwrap_or(""))?;
        let mut state = self.venue.state();
        Ok(state
            .account(self.account_id)
            .orders
            .iter()
            .filter(|o| market.map_or(true, |m| o.market == m))
            .cloned()
            .collect())
    }

    async fn get_order(&self, id: &str, market: &str) -> AdapterResult<Order> {
        self.record("getOrder", id)?;
        let mut state = self.venue.state();
        state
            .account(self.account_id)
            .orders
            .iter()
            .find(|o| o.id == id && o.market == market)
            .cloned()
            .ok_or_else(|| AdapterError::Exchange(format!("order {id} not found")))
    }

    async fn get_open_positions(&self) -> AdapterResult<Vec<Position>> {
        self.record("getOpenPositions", "")?;
        let mut state = self.venue.state();
        Ok(state.account(self.account_id).positions.clone())
    }

    async fn open_order(&self, request: &OrderRequest) -> AdapterResult<Order> {
        self.record(
            "openOrder",
            format!("{:?} {:?} {} {}", request.order_type, request.side, request.quantity, request.market),
        )?;
        if request.quantity <= 0.0 {
            return Err(AdapterError::InvalidRequest("quantity must be positive".into()));
        }
        let mut state = self.venue.state();
        let id = state.next_id();
        let (status, trigger_price) = match request.order_type {
            OrderType::Limit if request.price.is_none() => {
                return Err(AdapterError::InvalidRequest("limit order requires a price".into()))
            }
            OrderType::StopMarket => {
                let trigger = request.params.trigger_price.ok_or_else(|| {
                    AdapterError::InvalidRequest("stop order requires a trigger price".into())
                })?;
                (OrderStatus::Untriggered, Some(trigger))
            }
            _ => (OrderStatus::New, None),
        };
        let market_fill = if request.order_type == OrderType::Market {
            Some(state.touch(&request.market, request.side).ok_or_else(|| {
                AdapterError::Exchange(format!("no liquidity on {}", request.market))
            })?)
        } else {
            None
        };
        let order = Order {
            id: id.clone(),
            link_id: request.params.link_id.clone(),
            market: request.market.clone(),
            side: request.side,
            order_type: request.order_type,
            price: request.price,
            trigger_price,
            quantity: request.quantity,
            remaining: request.quantity,
            status,
            reduce_only: request.params.reduce_only,
            updated_at: Utc::now(),
        };
        state.account(self.account_id).orders.push(order.clone());
        state.push(self.account_id, "order", &vec![order.clone()]);

        if let Some(price) = market_fill {
            state.fill(self.account_id, &id, request.quantity, price);
        } else {
            state.match_resting(self.account_id, &request.market);
        }
        let account = state.account(self.account_id);
        Ok(account
            .orders
            .iter()
            .find(|o| o.id == id)
            .cloned()
            .unwrap_or(order))
    }

    async fn update_order(&self, update: &OrderUpdate) -> AdapterResult<Order> {
        self.record("updateOrder", update.id.as_str())?;
        let mut state = self.venue.state();
        let account = state.account(self.account_id);
        let order = account
            .orders
            .iter_mut()
            .find(|o| o.id == update.id && o.status.is_open())
            .ok_or_else(|| AdapterError::Exchange(format!("order {} not open", update.id)))?;
        if let Some(price) = update.price {
            order.price = Some(price);
        }
        if let Some(quantity) = update.quantity {
            let filled = order.filled();
            if quantity <= filled {
                return Err(AdapterError::InvalidRequest(
                    "quantity below filled amount".into(),
                ));
            }
            order.quantity = quantity;
            order.remaining = quantity - filled;
        }
        order.updated_at = Utc::now();
        let order = order.clone();
        state.push(self.account_id, "order", &vec![order.clone()]);
        Ok(order)
    }

    async fn cancel_order(&self, id: &str, market: &str) -> AdapterResult<()> {
        self.record("cancelOrder", id)?;
        let mut state = self.venue.state();
        let account = state.account(self.account_id);
        let order = account
            .orders
            .iter_mut()
            .find(|o| o.id == id && o.market == market && o.status.is_open())
            .ok_or_else(|| AdapterError::Exchange(format!("order {id} not open")))?;
        order.status = OrderStatus::Cancelled;
        order.updated_at = Utc::now();
        let order = order.clone();
        state.push(self.account_id, "order", &vec![order]);
        Ok(())
    }

    async fn cancel_orders(&self, market: &str) -> AdapterResult<()> {
        self.record("cancelOrders", market)?;
        let mut state = self.venue.state();
        let account = state.account(self.account_id);
        let mut cancelled = Vec::new();
        for order in account
            .orders
            .iter_mut()
            .filter(|o| o.market == market && o.status.is_open())
        {
            order.status = OrderStatus::Cancelled;
            order.updated_at = Utc::now();
            cancelled.push(order.clone());
        }
        if !cancelled.is_empty() {
            state.push(self.account_id, "order", &cancelled);
        }
        Ok(())
    }

    async fn clean(&self) -> AdapterResult<()> {
        self.record("clean", "")
    }
}
