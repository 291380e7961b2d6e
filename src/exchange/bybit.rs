//! # exchange::bybit
//!
//! Bybit v5 REST adapter (linear USDT perpetuals).
//!
//! Signing: `X-BAPI-SIGN = hex(hmac_sha256(secret, timestamp + api_key + recv_window + payload))`
//! where `payload` is the query string for GET and the JSON body otherwise.
//!
//! The wire structs at the bottom are shared with the private websocket
//! decoder in `stream::bybit`: Bybit uses the same field names on both.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, Method};
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::signing::sign_hex;
use super::{AdapterError, AdapterResult, ExchangeAdapter};
use crate::config::Endpoints;
use crate::models::{
    Account, Balance, Credentials, ExchangeKind, Execution, Market, Order, OrderRequest, OrderSide,
    OrderStatus, OrderType, OrderUpdate, Position, Ticker, Wallet,
};

const CATEGORY: &str = "linear";
const SETTLE_COIN: &str = "USDT";
const RECV_WINDOW: u64 = 5_000;

/// retCodes Bybit uses for bad, expired or under-privileged keys.
const AUTH_RET_CODES: &[i64] = &[10003, 10004, 10005, 10007, 33004];

pub struct BybitExchange {
    http: Client,
    base_url: String,
    credentials: Credentials,
}

impl BybitExchange {
    pub fn new(account: &Account, endpoints: &Endpoints) -> AdapterResult<Self> {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(AdapterError::transport)?;
        Ok(Self {
            http,
            base_url: endpoints.rest(account.credentials.testnet).trim_end_matches('/').to_string(),
            credentials: account.credentials.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn public_get<T>(&self, path: &str, query: &[(&str, String)]) -> AdapterResult<T>
    where
        T: DeserializeOwned,
    {
        let resp: ApiResponse<T> = self
            .http
            .get(self.url(path))
            .query(query)
            .send()
            .await
            .map_err(AdapterError::transport)?
            .json()
            .await
            .map_err(AdapterError::serialization)?;
        resp.into_result()
    }

    async fn signed<T>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Value,
    ) -> AdapterResult<T>
    where
        T: DeserializeOwned,
    {
        let timestamp = Utc::now().timestamp_millis();
        let query_string = serde_urlencoded::to_string(query).map_err(AdapterError::serialization)?;
        let payload = if method == Method::GET {
            query_string.clone()
        } else {
            body.to_string()
        };
        let signature = sign_hex(
            &self.credentials.api_secret,
            &format!("{timestamp}{}{RECV_WINDOW}{payload}", self.credentials.api_key),
        )?;
        let url = if query_string.is_empty() {
            self.url(path)
        } else {
            format!("{}?{}", self.url(path), query_string)
        };
        let mut request = self
            .http
            .request(method.clone(), url)
            .header("X-BAPI-API-KEY", &self.credentials.api_key)
            .header("X-BAPI-TIMESTAMP", timestamp.to_string())
            .header("X-BAPI-SIGN", signature)
            .header("X-BAPI-RECV-WINDOW", RECV_WINDOW.to_string())
            .header("Content-Type", "application/json");
        if method != Method::GET {
            request = request.body(payload);
        }
        let response = request.send().await.map_err(AdapterError::transport)?;
        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Err(AdapterError::Authentication("HTTP 401 from Bybit".into()));
        }
        let resp: ApiResponse<T> = response.json().await.map_err(AdapterError::serialization)?;
        resp.into_result()
    }

    async fn query_orders(&self, path: &str, extra: Vec<(&str, String)>) -> AdapterResult<Vec<Order>> {
        let mut query = vec![("category", CATEGORY.to_string())];
        query.extend(extra);
        let result: ListResult<OrderItem> = self.signed(Method::GET, path, &query, Value::Null).await?;
        Ok(result.list.into_iter().map(order_from_item).collect())
    }
}

#[async_trait]
impl ExchangeAdapter for BybitExchange {
    fn kind(&self) -> ExchangeKind {
        ExchangeKind::Bybit
    }

    async fn initialize(&self) -> AdapterResult<()> {
        let _: Value = self
            .signed(Method::GET, "/v5/user/query-api", &[], Value::Null)
            .await?;
        debug!("bybit API key verified");
        Ok(())
    }

    async fn get_balances(&self) -> AdapterResult<Wallet> {
        let query = [("accountType", "UNIFIED".to_string())];
        let result: ListResult<WalletItem> = self
            .signed(Method::GET, "/v5/account/wallet-balance", &query, Value::Null)
            .await?;
        Ok(wallet_from_items(&result.list))
    }

    async fn get_markets(&self) -> AdapterResult<Vec<Market>> {
        let query = [("category", CATEGORY.to_string())];
        let result: ListResult<InstrumentItem> = self
            .public_get("/v5/market/instruments-info", &query)
            .await?;
        Ok(result
            .list
            .into_iter()
            .map(|item| Market {
                symbol: item.symbol,
                base: item.base_coin,
                quote: item.quote_coin,
                tick_size: parse_f64(&item.price_filter.tick_size),
                qty_step: parse_f64(&item.lot_size_filter.qty_step),
                min_qty: parse_f64(&item.lot_size_filter.min_order_qty),
            })
            .collect())
    }

    async fn get_ticker(&self, market: &str) -> AdapterResult<Ticker> {
        let query = [("category", CATEGORY.to_string()), ("symbol", market.to_string())];
        let result: ListResult<TickerItem> = self.public_get("/v5/market/tickers", &query).await?;
        let item = result
            .list
            .into_iter()
            .next()
            .ok_or_else(|| AdapterError::Exchange(format!("no ticker for {market}")))?;
        Ok(Ticker::new(
            market,
            parse_opt(item.bid1_price.as_deref()),
            parse_opt(item.ask1_price.as_deref()),
        ))
    }

    async fn get_open_orders(&self, market: Option<&str>) -> AdapterResult<Vec<Order>> {
        let mut extra = vec![("openOnly", "0".to_string())];
        extra.push(match market {
            Some(m) => ("symbol", m.to_string()),
            None => ("settleCoin", SETTLE_COIN.to_string()),
        });
        self.query_orders("/v5/order/realtime", extra).await
    }

    async fn get_orders(&self, market: Option<&str>) -> AdapterResult<Vec<Order>> {
        let extra = match market {
            Some(m) => vec![("symbol", m.to_string())],
            None => vec![("settleCoin", SETTLE_COIN.to_string())],
        };
        self.query_orders("/v5/order/history", extra).await
    }

    async fn get_order(&self, id: &str, market: &str) -> AdapterResult<Order> {
        let extra = vec![("symbol", market.to_string()), ("orderId", id.to_string())];
        if let Some(order) = self.query_orders("/v5/order/realtime", extra.clone()).await?.pop() {
            return Ok(order);
        }
        self.query_orders("/v5/order/history", extra)
            .await?
            .pop()
            .ok_or_else(|| AdapterError::Exchange(format!("order {id} not found")))
    }

    async fn get_open_positions(&self) -> AdapterResult<Vec<Position>> {
        let query = [
            ("category", CATEGORY.to_string()),
            ("settleCoin", SETTLE_COIN.to_string()),
        ];
        let result: ListResult<PositionItem> = self
            .signed(Method::GET, "/v5/position/list", &query, Value::Null)
            .await?;
        Ok(result.list.into_iter().filter_map(position_from_item).collect())
    }

    async fn open_order(&self, request: &OrderRequest) -> AdapterResult<Order> {
        let mut payload = json!({
            "category": CATEGORY,
            "symbol": request.market,
            "side": side_str(request.side),
            "qty": request.quantity.to_string(),
            "reduceOnly": request.params.reduce_only,
        });
        match request.order_type {
            OrderType::Market => payload["orderType"] = json!("Market"),
            OrderType::Limit => {
                let price = request.price.ok_or_else(|| {
                    AdapterError::InvalidRequest("limit order requires a price".into())
                })?;
                payload["orderType"] = json!("Limit");
                payload["price"] = json!(price.to_string());
                payload["timeInForce"] = json!("GTC");
            }
            OrderType::StopMarket => {
                let trigger = request.params.trigger_price.ok_or_else(|| {
                    AdapterError::InvalidRequest("stop order requires a trigger price".into())
                })?;
                payload["orderType"] = json!("Market");
                payload["triggerPrice"] = json!(trigger.to_string());
                // 1: rise to trigger, 2: fall to trigger
                payload["triggerDirection"] = json!(match request.side {
                    OrderSide::Buy => 1,
                    OrderSide::Sell => 2,
                });
            }
        }
        if let Some(tp) = request.take_profit {
            payload["takeProfit"] = json!(tp.to_string());
        }
        if let Some(sl) = request.stop_loss {
            payload["stopLoss"] = json!(sl.to_string());
        }
        if let Some(link_id) = &request.params.link_id {
            payload["orderLinkId"] = json!(link_id);
        }
        let created: CreateOrderResult = self
            .signed(Method::POST, "/v5/order/create", &[], payload)
            .await?;
        Ok(Order {
            id: created.order_id,
            link_id: request.params.link_id.clone(),
            market: request.market.clone(),
            side: request.side,
            order_type: request.order_type,
            price: request.price,
            trigger_price: request.params.trigger_price,
            quantity: request.quantity,
            remaining: request.quantity,
            status: if request.order_type == OrderType::StopMarket {
                OrderStatus::Untriggered
            } else {
                OrderStatus::New
            },
            reduce_only: request.params.reduce_only,
            updated_at: Utc::now(),
        })
    }

    async fn update_order(&self, update: &OrderUpdate) -> AdapterResult<Order> {
        let mut payload = json!({
            "category": CATEGORY,
            "symbol": update.market,
            "orderId": update.id,
        });
        if let Some(price) = update.price {
            payload["price"] = json!(price.to_string());
        }
        if let Some(qty) = update.quantity {
            payload["qty"] = json!(qty.to_string());
        }
        if let Some(tp) = update.take_profit {
            payload["takeProfit"] = json!(tp.to_string());
        }
        if let Some(sl) = update.stop_loss {
            payload["stopLoss"] = json!(sl.to_string());
        }
        let _: CreateOrderResult = self
            .signed(Method::POST, "/v5/order/amend", &[], payload)
            .await?;
        self.get_order(&update.id, &update.market).await
    }

    async fn cancel_order(&self, id: &str, market: &str) -> AdapterResult<()> {
        let payload = json!({ "category": CATEGORY, "symbol": market, "orderId": id });
        let _: Value = self
            .signed(Method::POST, "/v5/order/cancel", &[], payload)
            .await?;
        Ok(())
    }

    async fn cancel_orders(&self, market: &str) -> AdapterResult<()> {
        let payload = json!({ "category": CATEGORY, "symbol": market });
        let _: Value = self
            .signed(Method::POST, "/v5/order/cancel-all", &[], payload)
            .await?;
        Ok(())
    }

    async fn clean(&self) -> AdapterResult<()> {
        Ok(())
    }
}

// ─── Mapping ──────────────────────────────────────────────────────────────────

fn side_str(side: OrderSide) -> &'static str {
    match side {
        OrderSide::Buy => "Buy",
        OrderSide::Sell => "Sell",
    }
}

fn parse_side(value: &str) -> Option<OrderSide> {
    match value {
        "Buy" => Some(OrderSide::Buy),
        "Sell" => Some(OrderSide::Sell),
        _ => None,
    }
}

pub(crate) fn parse_f64(value: &str) -> f64 {
    value.parse().unwrap_or(0.0)
}

/// Bybit sends `""` or `"0"` for absent prices.
pub(crate) fn parse_opt(value: Option<&str>) -> Option<f64> {
    value
        .and_then(|v| v.parse::<f64>().ok())
        .filter(|v| *v != 0.0)
}

fn millis_to_datetime(value: &str) -> DateTime<Utc> {
    value
        .parse::<i64>()
        .ok()
        .and_then(DateTime::<Utc>::from_timestamp_millis)
        .unwrap_or_else(Utc::now)
}

pub(crate) fn map_order_status(status: &str) -> OrderStatus {
    match status {
        "New" | "Created" | "Active" => OrderStatus::New,
        "Untriggered" => OrderStatus::Untriggered,
        "PartiallyFilled" => OrderStatus::PartiallyFilled,
        "Filled" => OrderStatus::Filled,
        "Cancelled" | "PartiallyFilledCanceled" | "Deactivated" | "Triggered" => {
            OrderStatus::Cancelled
        }
        "Rejected" => OrderStatus::Rejected,
        other => {
            warn!(status = other, "unhandled Bybit order status");
            OrderStatus::New
        }
    }
}

pub(crate) fn order_from_item(item: OrderItem) -> Order {
    let trigger_price = parse_opt(item.trigger_price.as_deref());
    let order_type = if trigger_price.is_some() {
        OrderType::StopMarket
    } else if item.order_type == "Market" {
        OrderType::Market
    } else {
        OrderType::Limit
    };
    Order {
        id: item.order_id,
        link_id: item.order_link_id.filter(|v| !v.is_empty()),
        market: item.symbol,
        side: parse_side(&item.side).unwrap_or(OrderSide::Buy),
        order_type,
        price: parse_opt(item.price.as_deref()),
        trigger_price,
        quantity: parse_f64(&item.qty),
        remaining: parse_f64(&item.leaves_qty),
        status: map_order_status(&item.order_status),
        reduce_only: item.reduce_only.unwrap_or(false),
        updated_at: millis_to_datetime(&item.updated_time),
    }
}

pub(crate) fn position_from_item(item: PositionItem) -> Option<Position> {
    let size = parse_f64(&item.size);
    let side = parse_side(&item.side)?;
    if size.abs() <= f64::EPSILON {
        return None;
    }
    Some(Position {
        market: item.symbol,
        side,
        entry_price: parse_f64(&item.avg_price),
        mark_price: parse_f64(&item.mark_price),
        size,
        leverage: parse_f64(&item.leverage),
        unrealized_pnl: parse_f64(&item.unrealised_pnl),
        updated_at: millis_to_datetime(&item.updated_time),
    })
}

/// Push variant of [`position_from_item`]: flat positions are kept (size
/// zero) so the cache can drop them.  One-way mode reports a flat position
/// with an empty side, which clears both sides of the market.
pub(crate) fn position_updates_from_item(item: PositionItem) -> Vec<Position> {
    let template = Position {
        market: item.symbol.clone(),
        side: OrderSide::Buy,
        entry_price: parse_f64(&item.avg_price),
        mark_price: parse_f64(&item.mark_price),
        size: parse_f64(&item.size),
        leverage: parse_f64(&item.leverage),
        unrealized_pnl: parse_f64(&item.unrealised_pnl),
        updated_at: millis_to_datetime(&item.updated_time),
    };
    match parse_side(&item.side) {
        Some(side) => vec![Position { side, ..template }],
        None => vec![
            Position { size: 0.0, ..template.clone() },
            Position { side: OrderSide::Sell, size: 0.0, ..template },
        ],
    }
}

/// Trade executions only; funding and settlement records are skipped.
pub(crate) fn execution_from_item(item: ExecutionItem) -> Option<Execution> {
    if item.exec_type.as_deref().is_some_and(|t| t != "Trade") {
        return None;
    }
    Some(Execution {
        order_id: item.order_id,
        link_id: item.order_link_id.filter(|v| !v.is_empty()),
        market: item.symbol,
        side: parse_side(&item.side)?,
        price: parse_f64(&item.exec_price),
        quantity: parse_f64(&item.exec_qty),
        remaining: parse_f64(&item.leaves_qty),
        executed_at: millis_to_datetime(&item.exec_time),
    })
}

pub(crate) fn wallet_from_items(items: &[WalletItem]) -> Wallet {
    let mut wallet = Wallet::empty();
    for account in items {
        wallet.equity += parse_f64(&account.total_equity);
        for coin in &account.coin {
            let total = parse_f64(&coin.wallet_balance);
            let used = parse_f64(coin.locked.as_deref().unwrap_or("0"))
                + parse_f64(coin.total_position_im.as_deref().unwrap_or("0"))
                + parse_f64(coin.total_order_im.as_deref().unwrap_or("0"));
            wallet.balances.insert(
                coin.coin.clone(),
                Balance {
                    free: (total - used).max(0.0),
                    used,
                    total,
                    debt: parse_f64(coin.borrow_amount.as_deref().unwrap_or("0")),
                },
            );
        }
    }
    wallet
}

// ─── Wire types ───────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct ApiResponse<T> {
    #[serde(rename = "retCode")]
    ret_code: i64,
    #[serde(rename = "retMsg")]
    ret_msg: String,
    result: Option<T>,
}

impl<T> ApiResponse<T> {
    fn into_result(self) -> AdapterResult<T> {
        if AUTH_RET_CODES.contains(&self.ret_code) {
            return Err(AdapterError::Authentication(format!(
                "{} (code {})",
                self.ret_msg, self.ret_code
            )));
        }
        if self.ret_code != 0 {
            return Err(AdapterError::Exchange(format!(
                "{} (code {})",
                self.ret_msg, self.ret_code
            )));
        }
        self.result
            .ok_or_else(|| AdapterError::Serialization("missing result".into()))
    }
}

#[derive(Deserialize)]
struct ListResult<T> {
    list: Vec<T>,
}

#[derive(Deserialize)]
struct CreateOrderResult {
    #[serde(rename = "orderId")]
    order_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct InstrumentItem {
    symbol: String,
    base_coin: String,
    quote_coin: String,
    price_filter: PriceFilter,
    lot_size_filter: LotSizeFilter,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PriceFilter {
    tick_size: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LotSizeFilter {
    qty_step: String,
    min_order_qty: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct TickerItem {
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(default)]
    pub bid1_price: Option<String>,
    #[serde(default)]
    pub ask1_price: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct OrderItem {
    order_id: String,
    #[serde(default)]
    order_link_id: Option<String>,
    symbol: String,
    #[serde(default)]
    price: Option<String>,
    qty: String,
    side: String,
    order_status: String,
    order_type: String,
    #[serde(default)]
    trigger_price: Option<String>,
    leaves_qty: String,
    #[serde(default)]
    reduce_only: Option<bool>,
    updated_time: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct PositionItem {
    symbol: String,
    side: String,
    size: String,
    #[serde(alias = "entryPrice")]
    avg_price: String,
    #[serde(default)]
    mark_price: String,
    #[serde(default)]
    leverage: String,
    #[serde(default)]
    unrealised_pnl: String,
    #[serde(default)]
    updated_time: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ExecutionItem {
    #[serde(default)]
    exec_type: Option<String>,
    order_id: String,
    #[serde(default)]
    order_link_id: Option<String>,
    symbol: String,
    side: String,
    exec_price: String,
    exec_qty: String,
    leaves_qty: String,
    exec_time: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct WalletItem {
    #[serde(default)]
    total_equity: String,
    #[serde(default)]
    coin: Vec<CoinItem>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CoinItem {
    coin: String,
    wallet_balance: String,
    #[serde(default)]
    locked: Option<String>,
    #[serde(default, rename = "totalPositionIM")]
    total_position_im: Option<String>,
    #[serde(default, rename = "totalOrderIM")]
    total_order_im: Option<String>,
    #[serde(default)]
    borrow_amount: Option<String>,
}
