//! # models::position
//!
//! Open derivative positions.  One entry per (market, side) so hedge-mode
//! accounts can hold both sides of the same market.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::OrderSide;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub market: String,
    pub side: OrderSide,
    pub entry_price: f64,
    pub mark_price: f64,
    /// Absolute contract size.
    pub size: f64,
    pub leverage: f64,
    pub unrealized_pnl: f64,
    pub updated_at: DateTime<Utc>,
}

impl Position {
    pub fn key(&self) -> (&str, OrderSide) {
        (self.market.as_str(), self.side)
    }

    pub fn is_flat(&self) -> bool {
        self.size.abs() <= f64::EPSILON
    }

    pub fn same_state(&self, other: &Position) -> bool {
        self.market == other.market
            && self.side == other.side
            && self.size == other.size
            && self.entry_price == other.entry_price
            && self.mark_price == other.mark_price
            && self.leverage == other.leverage
            && self.unrealized_pnl == other.unrealized_pnl
    }
}

pub fn same_positions(a: &[Position], b: &[Position]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.same_state(y))
}
