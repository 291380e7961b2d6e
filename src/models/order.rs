//! # models::order
//!
//! Orders, order requests and executions (fills), normalised across exchanges.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ─── Enums ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn opposite(self) -> Self {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    Market,
    Limit,
    /// Market order armed by a trigger price.
    StopMarket,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    New,
    /// Conditional order waiting for its trigger.
    Untriggered,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
}

impl OrderStatus {
    /// Still working on the book (or armed).
    pub fn is_open(self) -> bool {
        matches!(
            self,
            OrderStatus::New | OrderStatus::Untriggered | OrderStatus::PartiallyFilled
        )
    }
}

// ─── Order ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    /// Exchange order id.
    pub id: String,
    /// Client-side link id (`orderLinkId` / `clientOrderId`).
    #[serde(default)]
    pub link_id: Option<String>,
    pub market: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub trigger_price: Option<f64>,
    pub quantity: f64,
    /// Quantity not yet filled.
    pub remaining: f64,
    pub status: OrderStatus,
    #[serde(default)]
    pub reduce_only: bool,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    pub fn filled(&self) -> f64 {
        (self.quantity - self.remaining).max(0.0)
    }

    /// Compare on the fields that matter for change detection.
    pub fn same_state(&self, other: &Order) -> bool {
        self.id == other.id
            && self.status == other.status
            && self.remaining == other.remaining
            && self.quantity == other.quantity
            && self.price == other.price
            && self.trigger_price == other.trigger_price
    }
}

/// List comparison used by the order cache: same length, same key fields in
/// the same order.
pub fn same_orders(a: &[Order], b: &[Order]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.same_state(y))
}

// ─── Requests ─────────────────────────────────────────────────────────────────

/// Exchange-specific extras for a new order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrderParams {
    #[serde(default)]
    pub reduce_only: bool,
    #[serde(default)]
    pub trigger_price: Option<f64>,
    #[serde(default)]
    pub link_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub market: String,
    pub order_type: OrderType,
    pub side: OrderSide,
    pub quantity: f64,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub take_profit: Option<f64>,
    #[serde(default)]
    pub stop_loss: Option<f64>,
    #[serde(default)]
    pub params: OrderParams,
}

impl OrderRequest {
    pub fn market(market: impl Into<String>, side: OrderSide, quantity: f64) -> Self {
        Self {
            market: market.into(),
            order_type: OrderType::Market,
            side,
            quantity,
            price: None,
            take_profit: None,
            stop_loss: None,
            params: OrderParams::default(),
        }
    }

    pub fn limit(market: impl Into<String>, side: OrderSide, quantity: f64, price: f64) -> Self {
        Self {
            order_type: OrderType::Limit,
            price: Some(price),
            ..Self::market(market, side, quantity)
        }
    }

    /// Market order armed at `trigger`.
    pub fn stop_market(market: impl Into<String>, side: OrderSide, quantity: f64, trigger: f64) -> Self {
        let mut request = Self {
            order_type: OrderType::StopMarket,
            ..Self::market(market, side, quantity)
        };
        request.params.trigger_price = Some(trigger);
        request
    }

    pub fn reduce_only(mut self) -> Self {
        self.params.reduce_only = true;
        self
    }
}

/// Amendment of a resting order.  `None` fields are left untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderUpdate {
    pub id: String,
    pub market: String,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub quantity: Option<f64>,
    #[serde(default)]
    pub take_profit: Option<f64>,
    #[serde(default)]
    pub stop_loss: Option<f64>,
}

// ─── Execution ────────────────────────────────────────────────────────────────

/// A single fill against one of our orders.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub order_id: String,
    #[serde(default)]
    pub link_id: Option<String>,
    pub market: String,
    pub side: OrderSide,
    /// Fill price.
    pub price: f64,
    /// Filled quantity in this execution.
    pub quantity: f64,
    /// Quantity left on the order after this execution.
    pub remaining: f64,
    pub executed_at: DateTime<Utc>,
}

impl Execution {
    /// The order has nothing left to fill.
    pub fn completes_order(&self) -> bool {
        self.remaining <= f64::EPSILON
    }
}
