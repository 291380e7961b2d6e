//! # models::market
//!
//! Instrument metadata returned by `get_markets`.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Market {
    /// Exchange symbol, e.g. `"BTCUSDT"`.
    pub symbol: String,
    pub base: String,
    pub quote: String,
    pub tick_size: f64,
    pub qty_step: f64,
    pub min_qty: f64,
}
