//! # exchange::binance
//!
//! Binance USDⓈ-M futures REST adapter.
//!
//! Signed endpoints take `timestamp` + `recvWindow` in the query and a
//! trailing `signature = hex(hmac_sha256(secret, query))`; the key travels in
//! `X-MBX-APIKEY`.  The listen-key calls at the end back the user-data
//! stream in `stream::binance`.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, Method, StatusCode};
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::Value;
use tracing::{debug, warn};

use super::signing::sign_hex;
use super::{AdapterError, AdapterResult, ExchangeAdapter};
use crate::config::Endpoints;
use crate::models::{
    Account, Balance, Credentials, ExchangeKind, Market, Order, OrderRequest, OrderSide,
    OrderStatus, OrderType, OrderUpdate, Position, Ticker, Wallet, DEFAULT_QUOTE_CURRENCY,
};

const RECV_WINDOW: u64 = 5_000;

/// Error codes for malformed, unknown or unauthorised keys and bad signatures.
const AUTH_ERROR_CODES: &[i64] = &[-2014, -2015, -1022];

pub struct BinanceExchange {
    http: Client,
    base_url: String,
    credentials: Credentials,
}

impl BinanceExchange {
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

    async fn send<T>(&self, request: reqwest::RequestBuilder) -> AdapterResult<T>
    where
        T: DeserializeOwned,
    {
        let response = request.send().await.map_err(AdapterError::transport)?;
        let status = response.status();
        let body = response.text().await.map_err(AdapterError::transport)?;
        if status.is_success() {
            return serde_json::from_str(&body).map_err(AdapterError::serialization);
        }
        Err(match serde_json::from_str::<ApiError>(&body) {
            Ok(err) => err.into(),
            Err(_) if status == StatusCode::UNAUTHORIZED => {
                AdapterError::Authentication(format!("HTTP {status}"))
            }
            Err(_) => AdapterError::Exchange(format!("HTTP {status}: {body}")),
        })
    }

    async fn public_get<T>(&self, path: &str, query: &[(&str, String)]) -> AdapterResult<T>
    where
        T: DeserializeOwned,
    {
        self.send(self.http.get(self.url(path)).query(query)).await
    }

    async fn signed<T>(&self, method: Method, path: &str, params: &[(&str, String)]) -> AdapterResult<T>
    where
        T: DeserializeOwned,
    {
        let mut query = params.to_vec();
        query.push(("recvWindow", RECV_WINDOW.to_string()));
        query.push(("timestamp", Utc::now().timestamp_millis().to_string()));
        let query_string = serde_urlencoded::to_string(&query).map_err(AdapterError::serialization)?;
        let signature = sign_hex(&self.credentials.api_secret, &query_string)?;
        let url = format!("{}?{}&signature={}", self.url(path), query_string, signature);
        self.send(
            self.http
                .request(method, url)
                .header("X-MBX-APIKEY", &self.credentials.api_key),
        )
        .await
    }

    /// API-key-only call (listen-key management needs no signature).
    async fn keyed<T>(&self, method: Method, path: &str, query: &[(&str, String)]) -> AdapterResult<T>
    where
        T: DeserializeOwned,
    {
        self.send(
            self.http
                .request(method, self.url(path))
                .query(query)
                .header("X-MBX-APIKEY", &self.credentials.api_key),
        )
        .await
    }

    // ── User-data stream ────────────────────────────────────────────────────

    pub(crate) async fn create_listen_key(&self) -> AdapterResult<String> {
        let resp: ListenKeyResponse = self.keyed(Method::POST, "/fapi/v1/listenKey", &[]).await?;
        Ok(resp.listen_key)
    }

    /// Listen keys expire after 60 minutes without a keepalive.
    pub(crate) async fn keepalive_listen_key(&self, listen_key: &str) -> AdapterResult<()> {
        let _: Value = self
            .keyed(Method::PUT, "/fapi/v1/listenKey", &[("listenKey", listen_key.to_string())])
            .await?;
        Ok(())
    }

    pub(crate) async fn close_listen_key(&self, listen_key: &str) -> AdapterResult<()> {
        let _: Value = self
            .keyed(Method::DELETE, "/fapi/v1/listenKey", &[("listenKey", listen_key.to_string())])
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ExchangeAdapter for BinanceExchange {
    fn kind(&self) -> ExchangeKind {
        ExchangeKind::Binance
    }

    async fn initialize(&self) -> AdapterResult<()> {
        let _: Value = self.signed(Method::GET, "/fapi/v2/account", &[]).await?;
        debug!("binance API key verified");
        Ok(())
    }

    async fn get_balances(&self) -> AdapterResult<Wallet> {
        let account: AccountInfo = self.signed(Method::GET, "/fapi/v2/account", &[]).await?;
        let mut wallet = Wallet::empty();
        wallet.equity = parse_f64(&account.total_margin_balance);
        for asset in account.assets {
            let total = parse_f64(&asset.wallet_balance);
            let free = parse_f64(&asset.available_balance);
            wallet.balances.insert(
                asset.asset,
                Balance {
                    free,
                    used: (total - free).max(0.0),
                    total,
                    debt: 0.0,
                },
            );
        }
        Ok(wallet)
    }

    async fn get_markets(&self) -> AdapterResult<Vec<Market>> {
        let info: ExchangeInfo = self.public_get("/fapi/v1/exchangeInfo", &[]).await?;
        Ok(info
            .symbols
            .into_iter()
            .map(|symbol| {
                let mut market = Market {
                    symbol: symbol.symbol,
                    base: symbol.base_asset,
                    quote: symbol.quote_asset,
                    tick_size: 0.0,
                    qty_step: 0.0,
                    min_qty: 0.0,
                };
                for filter in symbol.filters {
                    match filter.filter_type.as_str() {
                        "PRICE_FILTER" => {
                            market.tick_size = parse_f64(filter.tick_size.as_deref().unwrap_or("0"))
                        }
                        "LOT_SIZE" => {
                            market.qty_step = parse_f64(filter.step_size.as_deref().unwrap_or("0"));
                            market.min_qty = parse_f64(filter.min_qty.as_deref().unwrap_or("0"));
                        }
                        _ => {}
                    }
                }
                market
            })
            .collect())
    }

    async fn get_ticker(&self, market: &str) -> AdapterResult<Ticker> {
        let book: BookTicker = self
            .public_get("/fapi/v1/ticker/bookTicker", &[("symbol", market.to_string())])
            .await?;
        Ok(Ticker::new(
            market,
            parse_opt(Some(&book.bid_price)),
            parse_opt(Some(&book.ask_price)),
        ))
    }

    async fn get_open_orders(&self, market: Option<&str>) -> AdapterResult<Vec<Order>> {
        let query: Vec<(&str, String)> = market.map(|m| ("symbol", m.to_string())).into_iter().collect();
        let orders: Vec<OrderResponse> = self.signed(Method::GET, "/fapi/v1/openOrders", &query).await?;
        Ok(orders.into_iter().map(order_from_response).collect())
    }

    /// `allOrders` is per symbol only; without a market this degrades to the
    /// open orders across all symbols.
    async fn get_orders(&self, market: Option<&str>) -> AdapterResult<Vec<Order>> {
        let Some(market) = market else {
            return self.get_open_orders(None).await;
        };
        let orders: Vec<OrderResponse> = self
            .signed(Method::GET, "/fapi/v1/allOrders", &[("symbol", market.to_string())])
            .await?;
        Ok(orders.into_iter().map(order_from_response).collect())
    }

    async fn get_order(&self, id: &str, market: &str) -> AdapterResult<Order> {
        let order: OrderResponse = self
            .signed(
                Method::GET,
                "/fapi/v1/order",
                &[("symbol", market.to_string()), ("orderId", id.to_string())],
            )
            .await?;
        Ok(order_from_response(order))
    }

    async fn get_open_positions(&self) -> AdapterResult<Vec<Position>> {
        let risks: Vec<PositionRisk> = self.signed(Method::GET, "/fapi/v2/positionRisk", &[]).await?;
        Ok(risks.into_iter().filter_map(position_from_risk).collect())
    }

    async fn open_order(&self, request: &OrderRequest) -> AdapterResult<Order> {
        if request.take_profit.is_some() || request.stop_loss.is_some() {
            return Err(AdapterError::InvalidRequest(
                "binance does not attach take-profit/stop-loss to an order; place them separately".into(),
            ));
        }
        let mut params = vec![
            ("symbol", request.market.clone()),
            ("side", side_str(request.side).to_string()),
            ("quantity", request.quantity.to_string()),
        ];
        match request.order_type {
            OrderType::Market => params.push(("type", "MARKET".into())),
            OrderType::Limit => {
                let price = request.price.ok_or_else(|| {
                    AdapterError::InvalidRequest("limit order requires a price".into())
                })?;
                params.push(("type", "LIMIT".into()));
                params.push(("price", price.to_string()));
                params.push(("timeInForce", "GTC".into()));
            }
            OrderType::StopMarket => {
                let trigger = request.params.trigger_price.ok_or_else(|| {
                    AdapterError::InvalidRequest("stop order requires a trigger price".into())
                })?;
                params.push(("type", "STOP_MARKET".into()));
                params.push(("stopPrice", trigger.to_string()));
            }
        }
        if request.params.reduce_only {
            params.push(("reduceOnly", "true".into()));
        }
        if let Some(link_id) = &request.params.link_id {
            params.push(("newClientOrderId", link_id.clone()));
        }
        let order: OrderResponse = self.signed(Method::POST, "/fapi/v1/order", &params).await?;
        Ok(order_from_response(order))
    }

    /// `PUT /fapi/v1/order` requires side, quantity and price together, so the
    /// current order fills in whatever the update leaves out.
    async fn update_order(&self, update: &OrderUpdate) -> AdapterResult<Order> {
        if update.take_profit.is_some() || update.stop_loss.is_some() {
            return Err(AdapterError::InvalidRequest(
                "binance cannot amend take-profit/stop-loss on an order".into(),
            ));
        }
        let current = self.get_order(&update.id, &update.market).await?;
        let price = update
            .price
            .or(current.price)
            .ok_or_else(|| AdapterError::InvalidRequest("only limit orders can be amended".into()))?;
        let params = [
            ("symbol", update.market.clone()),
            ("orderId", update.id.clone()),
            ("side", side_str(current.side).to_string()),
            ("quantity", update.quantity.unwrap_or(current.quantity).to_string()),
            ("price", price.to_string()),
        ];
        let order: OrderResponse = self.signed(Method::PUT, "/fapi/v1/order", &params).await?;
        Ok(order_from_response(order))
    }

    async fn cancel_order(&self, id: &str, market: &str) -> AdapterResult<()> {
        let _: Value = self
            .signed(
                Method::DELETE,
                "/fapi/v1/order",
                &[("symbol", market.to_string()), ("orderId", id.to_string())],
            )
            .await?;
        Ok(())
    }

    async fn cancel_orders(&self, market: &str) -> AdapterResult<()> {
        let _: Value = self
            .signed(Method::DELETE, "/fapi/v1/allOpenOrders", &[("symbol", market.to_string())])
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
        OrderSide::Buy => "BUY",
        OrderSide::Sell => "SELL",
    }
}

pub(crate) fn parse_side(value: &str) -> OrderSide {
    if value.eq_ignore_ascii_case("SELL") {
        OrderSide::Sell
    } else {
        OrderSide::Buy
    }
}

pub(crate) fn parse_f64(value: &str) -> f64 {
    value.parse().unwrap_or(0.0)
}

pub(crate) fn parse_opt(value: Option<&str>) -> Option<f64> {
    value
        .and_then(|v| v.parse::<f64>().ok())
        .filter(|v| *v != 0.0)
}

pub(crate) fn millis_to_datetime(millis: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(millis).unwrap_or_else(Utc::now)
}

pub(crate) fn map_order_status(status: &str) -> OrderStatus {
    match status {
        "NEW" => OrderStatus::New,
        "PARTIALLY_FILLED" => OrderStatus::PartiallyFilled,
        "FILLED" => OrderStatus::Filled,
        "CANCELED" | "EXPIRED" | "EXPIRED_IN_MATCH" => OrderStatus::Cancelled,
        "REJECTED" => OrderStatus::Rejected,
        other => {
            warn!(status = other, "unhandled Binance order status");
            OrderStatus::New
        }
    }
}

pub(crate) fn map_order_type(value: &str) -> OrderType {
    match value {
        "MARKET" => OrderType::Market,
        "STOP_MARKET" | "STOP" | "TAKE_PROFIT_MARKET" => OrderType::StopMarket,
        _ => OrderType::Limit,
    }
}

fn order_from_response(order: OrderResponse) -> Order {
    let quantity = parse_f64(&order.orig_qty);
    let order_type = map_order_type(&order.order_type);
    let mut status = map_order_status(&order.status);
    if order_type == OrderType::StopMarket && status == OrderStatus::New {
        status = OrderStatus::Untriggered;
    }
    Order {
        id: order.order_id.to_string(),
        link_id: Some(order.client_order_id).filter(|v| !v.is_empty()),
        market: order.symbol,
        side: parse_side(&order.side),
        order_type,
        price: parse_opt(Some(&order.price)),
        trigger_price: parse_opt(order.stop_price.as_deref()),
        quantity,
        remaining: (quantity - parse_f64(&order.executed_qty)).max(0.0),
        status,
        reduce_only: order.reduce_only,
        updated_at: millis_to_datetime(order.update_time),
    }
}

fn position_from_risk(risk: PositionRisk) -> Option<Position> {
    let amount = parse_f64(&risk.position_amt);
    if amount.abs() <= f64::EPSILON {
        return None;
    }
    Some(Position {
        market: risk.symbol,
        side: if amount > 0.0 { OrderSide::Buy } else { OrderSide::Sell },
        entry_price: parse_f64(&risk.entry_price),
        mark_price: parse_f64(&risk.mark_price),
        size: amount.abs(),
        leverage: parse_f64(&risk.leverage),
        unrealized_pnl: parse_f64(&risk.un_realized_profit),
        updated_at: millis_to_datetime(risk.update_time),
    })
}

// ─── Wire types ───────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct ApiError {
    code: i64,
    msg: String,
}

impl From<ApiError> for AdapterError {
    fn from(err: ApiError) -> Self {
        let text = format!("{} (code {})", err.msg, err.code);
        if AUTH_ERROR_CODES.contains(&err.code) {
            AdapterError::Authentication(text)
        } else {
            AdapterError::Exchange(text)
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListenKeyResponse {
    listen_key: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AccountInfo {
    total_margin_balance: String,
    assets: Vec<AssetInfo>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AssetInfo {
    asset: String,
    wallet_balance: String,
    available_balance: String,
}

#[derive(Deserialize)]
struct ExchangeInfo {
    symbols: Vec<SymbolInfo>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SymbolInfo {
    symbol: String,
    base_asset: String,
    quote_asset: String,
    filters: Vec<SymbolFilter>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SymbolFilter {
    filter_type: String,
    #[serde(default)]
    tick_size: Option<String>,
    #[serde(default)]
    step_size: Option<String>,
    #[serde(default)]
    min_qty: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BookTicker {
    bid_price: String,
    ask_price: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderResponse {
    order_id: i64,
    #[serde(default)]
    client_order_id: String,
    symbol: String,
    status: String,
    price: String,
    orig_qty: String,
    executed_qty: String,
    #[serde(rename = "type")]
    order_type: String,
    side: String,
    #[serde(default)]
    stop_price: Option<String>,
    #[serde(default)]
    reduce_only: bool,
    update_time: i64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PositionRisk {
    symbol: String,
    position_amt: String,
    entry_price: String,
    mark_price: String,
    leverage: String,
    un_realized_profit: String,
    #[serde(default)]
    update_time: i64,
}

/// Builds the quote-currency equity from an `ACCOUNT_UPDATE` push, which only
/// carries wallet balances and per-position unrealised PnL.
pub(crate) fn wallet_from_account_update(balances: &[(String, f64, f64)], upnl: f64) -> Wallet {
    let mut wallet = Wallet::empty();
    for (asset, wallet_balance, cross_wallet) in balances {
        if asset == DEFAULT_QUOTE_CURRENCY {
            wallet.equity = wallet_balance + upnl;
        }
        wallet.balances.insert(
            asset.clone(),
            Balance {
                free: *cross_wallet,
                used: (wallet_balance - cross_wallet).max(0.0),
                total: *wallet_balance,
                debt: 0.0,
            },
        );
    }
    wallet
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_auth_codes_map_to_authentication() {
        let err: AdapterError = ApiError {
            code: -2015,
            msg: "Invalid API-key, IP, or permissions for action.".into(),
        }
        .into();
        assert!(matches!(err, AdapterError::Authentication(_)));

        let err: AdapterError = ApiError {
            code: -2019,
            msg: "Margin is insufficient.".into(),
        }
        .into();
        assert!(matches!(err, AdapterError::Exchange(_)));
    }

    #[test]
    fn test_order_response_mapping() {
        let raw: OrderResponse = serde_json::from_value(json!({
            "orderId": 22542179, "clientOrderId": "dca-1", "symbol": "BTCUSDT",
            "status": "PARTIALLY_FILLED", "price": "29000", "origQty": "0.010",
            "executedQty": "0.004", "type": "LIMIT", "side": "BUY",
            "stopPrice": "0", "reduceOnly": false, "updateTime": 1700000000000i64
        }))
        .unwrap();
        let order = order_from_response(raw);
        assert_eq!(order.id, "22542179");
        assert_eq!(order.link_id.as_deref(), Some("dca-1"));
        assert_eq!(order.trigger_price, None);
        assert_eq!(order.status, OrderStatus::PartiallyFilled);
        assert!((order.remaining - 0.006).abs() < 1e-12);
    }

    #[test]
    fn test_stop_market_new_is_untriggered() {
        let raw: OrderResponse = serde_json::from_value(json!({
            "orderId": 7, "symbol": "ETHUSDT", "status": "NEW", "price": "0",
            "origQty": "1", "executedQty": "0", "type": "STOP_MARKET", "side": "SELL",
            "stopPrice": "1800", "reduceOnly": true, "updateTime": 0
        }))
        .unwrap();
        let order = order_from_response(raw);
        assert_eq!(order.status, OrderStatus::Untriggered);
        assert_eq!(order.trigger_price, Some(1800.0));
        assert_eq!(order.price, None);
    }

    #[test]
    fn test_short_position_from_negative_amount() {
        let risk: PositionRisk = serde_json::from_value(json!({
            "symbol": "BTCUSDT", "positionAmt": "-0.5", "entryPrice": "30000",
            "markPrice": "29500", "leverage": "10", "unRealizedProfit": "250"
        }))
        .unwrap();
        let position = position_from_risk(risk).unwrap();
        assert_eq!(position.side, OrderSide::Sell);
        assert_eq!(position.size, 0.5);
    }

    #[test]
    fn test_account_update_wallet() {
        let wallet = wallet_from_account_update(&[("USDT".into(), 1000.0, 900.0)], 25.0);
        assert_eq!(wallet.equity, 1025.0);
        assert_eq!(wallet.balances["USDT"].used, 100.0);
    }
}
